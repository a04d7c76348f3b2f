// ── Transport server ──
//
// Accepts any number of concurrent client connections. Each connection gets
// a writer task plus a read loop; each opened stream runs the handler in its
// own task with a cancellation token that fires when the client sends
// `Cancel` or the connection goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Fault};
use crate::transport::{handshake, read_frame, write_frame, ClientFrame, Message, ServerFrame, KEEPALIVE_INTERVAL};

use super::ServerTls;

/// Server-side request handler.
///
/// `handle` sends zero or more items through `reply` and returns. `Ok` ends
/// the stream normally; `Err` delivers the fault to the client. Long-lived
/// handlers (watches, subscriptions) must select on `reply.cancelled()` so
/// they stop when the client goes away.
#[async_trait]
pub trait Handler<Req: Message, Resp: Message>: Send + Sync + 'static {
    async fn handle(&self, request: Req, reply: Reply<Resp>) -> Result<(), Fault>;
}

/// Sending side of one open stream, handed to the handler.
pub struct Reply<Resp> {
    stream: u64,
    out: mpsc::UnboundedSender<ServerFrame<Resp>>,
    cancel: CancellationToken,
}

impl<Resp> Reply<Resp> {
    /// Queue one item for the client. Fails once the connection is gone.
    pub fn send(&self, item: Resp) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Disconnected { reason: "stream cancelled".into() });
        }
        self.out
            .send(ServerFrame::Item { stream: self.stream, item })
            .map_err(|_| Error::Disconnected { reason: "client connection closed".into() })
    }

    /// Resolves when the client cancels the stream or disconnects.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Serve connections accepted from `listener` until `cancel` fires.
pub async fn serve<Req, Resp, H>(
    listener: TcpListener,
    tls: Option<ServerTls>,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    Req: Message,
    Resp: Message,
    H: Handler<Req, Resp>,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "transport: listening");
    }

    loop {
        let (tcp, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        debug!(%peer, "transport: accepted connection");

        let handler = Arc::clone(&handler);
        let tls = tls.clone();
        let conn_cancel = cancel.child_token();
        tokio::spawn(async move {
            let result = match tls {
                None => serve_connection(tcp, handler, conn_cancel).await,
                Some(tls) => match tls.accept(tcp).await {
                    Ok(stream) => serve_connection(stream, handler, conn_cancel).await,
                    Err(error) => Err(error),
                },
            };
            if let Err(error) = result {
                debug!(%peer, %error, "transport: connection ended");
            }
        });
    }
}

async fn serve_connection<S, Req, Resp, H>(
    socket: S,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    Req: Message,
    Resp: Message,
    H: Handler<Req, Resp>,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    handshake(&mut reader, &mut writer).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame<Resp>>();

    // Writer task: drains outgoing frames, emits keepalives when idle.
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let msg: Option<ServerFrame<Resp>> = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = out_rx.recv() => match frame {
                    Some(frame) => Some(frame),
                    None => break,
                },
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => None,
            };
            if let Err(error) = write_frame(&mut writer, msg.as_ref()).await {
                trace!(%error, "transport: write failed");
                break;
            }
        }
    });

    // One cancellation token per live stream, fired on client Cancel.
    let live: Arc<Mutex<HashMap<u64, CancellationToken>>> = Arc::new(Mutex::new(HashMap::new()));

    let result = loop {
        let frame: Option<ClientFrame<Req>> = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = read_frame(&mut reader) => match frame {
                Ok(frame) => frame,
                Err(error) => break Err(error),
            },
        };
        let Some(frame) = frame else { break Ok(()) };

        match frame {
            ClientFrame::Open { stream, request } => {
                let stream_cancel = cancel.child_token();
                live.lock().expect("lock poisoned").insert(stream, stream_cancel.clone());

                let handler = Arc::clone(&handler);
                let out = out_tx.clone();
                let live = Arc::clone(&live);
                tokio::spawn(async move {
                    let reply = Reply { stream, out: out.clone(), cancel: stream_cancel.clone() };
                    let outcome = handler.handle(request, reply).await;
                    live.lock().expect("lock poisoned").remove(&stream);
                    // A cancelled stream gets no terminal frame; the client
                    // already forgot it.
                    if stream_cancel.is_cancelled() {
                        return;
                    }
                    let frame = match outcome {
                        Ok(()) => ServerFrame::End { stream },
                        Err(fault) => {
                            warn!(stream, %fault, "handler fault");
                            ServerFrame::Fault { stream, fault }
                        }
                    };
                    let _ = out.send(frame);
                });
            }
            ClientFrame::Cancel { stream } => {
                if let Some(token) = live.lock().expect("lock poisoned").remove(&stream) {
                    token.cancel();
                }
            }
        }
    };

    // Tear down the writer and every in-flight stream handler.
    cancel.cancel();
    let _ = writer_task.await;
    result
}
