// ── Transport client ──
//
// A connection spawns two tasks: the send task encodes and writes outgoing
// frames (and keepalives), the recv task reads incoming frames and routes
// them to the per-stream channels registered in a shared map. Dropping the
// last client handle aborts both tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Fault};
use crate::transport::{handshake, read_frame, write_frame, ClientFrame, Message, ServerFrame, KEEPALIVE_INTERVAL};

use super::ClientTls;

/// Per-stream buffer depth; a full buffer backpressures the whole
/// connection, which is what we want for large query results.
const STREAM_BUFFER: usize = 256;

enum StreamEvent<Resp> {
    Item(Resp),
    End,
    Fault(Fault),
}

type StreamMap<Resp> = Arc<DashMap<u64, mpsc::Sender<StreamEvent<Resp>>>>;

/// A multiplexing client for one transport connection.
///
/// Cheaply cloneable; all clones share the underlying connection.
pub struct RpcClient<Req, Resp> {
    inner: Arc<ClientInner<Req, Resp>>,
}

impl<Req, Resp> Clone for RpcClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct ClientInner<Req, Resp> {
    out_tx: mpsc::UnboundedSender<ClientFrame<Req>>,
    cancel_tx: mpsc::UnboundedSender<u64>,
    streams: StreamMap<Resp>,
    next_stream: AtomicU64,
    /// Set by the recv task on its way out, so a stream opened after the
    /// connection died fails instead of waiting for items forever.
    dead: Arc<AtomicBool>,
    error_rx: watch::Receiver<Option<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<Req, Resp> Drop for ClientInner<Req, Resp> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl<Req: Message, Resp: Message> RpcClient<Req, Resp> {
    /// Dial `address` (a `host:port` string), perform the handshake, and
    /// spawn the connection tasks.
    pub async fn connect(address: &str, tls: &ClientTls, connect_timeout: Duration) -> Result<Self, Error> {
        let dial = TcpStream::connect(address);
        let tcp = tokio::time::timeout(connect_timeout, dial)
            .await
            .map_err(|_| Error::Timeout { seconds: connect_timeout.as_secs() })?
            .map_err(|source| Error::Connect { address: address.to_owned(), source })?;
        tcp.set_nodelay(true)?;

        match tls {
            ClientTls::Plaintext => Self::start(tcp).await,
            tls => {
                let stream = tls.wrap(address, tcp).await?;
                Self::start(stream).await
            }
        }
    }

    /// Wrap an already-established byte stream.
    pub async fn start<S>(socket: S) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(socket);
        handshake(&mut reader, &mut writer).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let streams: StreamMap<Resp> = Arc::new(DashMap::new());
        let dead = Arc::new(AtomicBool::new(false));
        // Holds the first transport error; `None` until something breaks.
        let (error_tx, error_rx) = watch::channel(None);

        let send_task = tokio::spawn(run_send_task(writer, out_rx, cancel_rx, error_tx.clone()));
        let recv_task = tokio::spawn(run_recv_task(
            reader,
            Arc::clone(&streams),
            Arc::clone(&dead),
            error_tx,
        ));

        Ok(Self {
            inner: Arc::new(ClientInner {
                out_tx,
                cancel_tx,
                streams,
                next_stream: AtomicU64::new(1),
                dead,
                error_rx,
                tasks: vec![send_task, recv_task],
            }),
        })
    }

    /// Open a stream: send the request and return a handle for the
    /// server's response items.
    pub fn open(&self, request: Req) -> Result<RpcStream<Resp>, Error> {
        let stream_id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.inner.streams.insert(stream_id, tx);

        let frame = ClientFrame::Open { stream: stream_id, request };
        if self.inner.out_tx.send(frame).is_err() || self.inner.dead.load(Ordering::SeqCst) {
            self.inner.streams.remove(&stream_id);
            return Err(Error::Disconnected { reason: self.error_reason() });
        }

        Ok(RpcStream {
            stream_id,
            rx,
            streams: Arc::clone(&self.inner.streams),
            cancel_tx: self.inner.cancel_tx.clone(),
            error_rx: self.inner.error_rx.clone(),
            done: false,
        })
    }

    /// Unary call: open a stream and expect exactly one item.
    pub async fn call(&self, request: Req) -> Result<Resp, Error> {
        let mut stream = self.open(request)?;
        match stream.recv().await? {
            Some(item) => Ok(item),
            None => Err(Error::Protocol("server closed the stream without a response".into())),
        }
    }

    fn error_reason(&self) -> String {
        self.inner
            .error_rx
            .borrow()
            .clone()
            .unwrap_or_else(|| "connection closed".to_owned())
    }
}

// ── Connection tasks ────────────────────────────────────────────────

async fn run_send_task<W, Req>(
    mut writer: WriteHalf<W>,
    mut out_rx: mpsc::UnboundedReceiver<ClientFrame<Req>>,
    mut cancel_rx: mpsc::UnboundedReceiver<u64>,
    error_tx: watch::Sender<Option<String>>,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
    Req: Message,
{
    loop {
        let msg: Option<ClientFrame<Req>> = tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => Some(frame),
                None => break,
            },
            cancelled = cancel_rx.recv() => match cancelled {
                Some(stream) => Some(ClientFrame::Cancel { stream }),
                None => break,
            },
            _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => None,
        };

        if let Err(error) = write_frame(&mut writer, msg.as_ref()).await {
            debug!(%error, "transport send failed");
            let _ = error_tx.send(Some(error.to_string()));
            break;
        }
        if let Some(msg) = &msg {
            trace!(?msg, "sent frame");
        }
    }
}

async fn run_recv_task<R, Resp>(
    mut reader: ReadHalf<R>,
    streams: StreamMap<Resp>,
    dead: Arc<AtomicBool>,
    error_tx: watch::Sender<Option<String>>,
) where
    R: AsyncRead + AsyncWrite + Send + 'static,
    Resp: Message,
{
    loop {
        let frame: ServerFrame<Resp> = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = error_tx.send(Some("connection closed by peer".to_owned()));
                break;
            }
            Err(error) => {
                debug!(%error, "transport recv failed");
                let _ = error_tx.send(Some(error.to_string()));
                break;
            }
        };

        match frame {
            ServerFrame::Item { stream, item } => {
                // Clone the sender out of the map so no shard lock is held
                // across the (possibly backpressuring) send.
                let tx = streams.get(&stream).map(|entry| entry.value().clone());
                if let Some(tx) = tx {
                    if tx.send(StreamEvent::Item(item)).await.is_err() {
                        streams.remove(&stream);
                    }
                } else {
                    trace!(stream, "item for unknown stream, dropping");
                }
            }
            ServerFrame::End { stream } => {
                if let Some((_, tx)) = streams.remove(&stream) {
                    let _ = tx.send(StreamEvent::End).await;
                }
            }
            ServerFrame::Fault { stream, fault } => {
                if let Some((_, tx)) = streams.remove(&stream) {
                    let _ = tx.send(StreamEvent::Fault(fault)).await;
                }
            }
        }
    }

    // Mark the connection dead before waking pending streams, so `open`
    // cannot register a stream nobody will ever complete.
    dead.store(true, Ordering::SeqCst);
    streams.clear();
}

// ── Stream handle ───────────────────────────────────────────────────

/// Receiving side of one open stream.
///
/// `recv` yields items until `Ok(None)` (normal end of stream) or an error
/// (remote fault or broken connection). Dropping the handle cancels the
/// stream on the server.
pub struct RpcStream<Resp> {
    stream_id: u64,
    rx: mpsc::Receiver<StreamEvent<Resp>>,
    streams: StreamMap<Resp>,
    cancel_tx: mpsc::UnboundedSender<u64>,
    error_rx: watch::Receiver<Option<String>>,
    done: bool,
}

impl<Resp> RpcStream<Resp> {
    pub async fn recv(&mut self) -> Result<Option<Resp>, Error> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamEvent::Item(item)) => Ok(Some(item)),
            Some(StreamEvent::End) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamEvent::Fault(fault)) => {
                self.done = true;
                Err(fault.into())
            }
            None => {
                self.done = true;
                let reason = self
                    .error_rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| "connection closed".to_owned());
                Err(Error::Disconnected { reason })
            }
        }
    }
}

impl<Resp> Drop for RpcStream<Resp> {
    fn drop(&mut self) {
        if !self.done {
            self.streams.remove(&self.stream_id);
            let _ = self.cancel_tx.send(self.stream_id);
        }
    }
}
