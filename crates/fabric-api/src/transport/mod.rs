// ── Framed binary RPC transport ──
//
// Runs on top of a reliable bidirectional byte stream (TCP, optionally TLS)
// and adds message framing, a magic/version handshake, keepalives, and
// stream multiplexing. Messages are encoded with bincode and sent with a
// length prefix; an empty frame is a keepalive and is skipped on read.
//
// Every exchange happens on a client-allocated stream: the client sends
// `Open(request)` and the server answers with any number of `Item` frames
// followed by `End` (normal completion) or `Fault` (classified failure).
// A unary call is a stream with exactly one item.

mod client;
mod server;
mod tls;

use std::fmt::Debug;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Fault};

pub use client::{RpcClient, RpcStream};
pub use server::{serve, Handler, Reply};
pub use tls::{ClientTls, ServerTls};

/// Trait for messages that can travel over the transport.
pub trait Message: Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}
impl<T: Debug + Send + Sync + Serialize + DeserializeOwned + 'static> Message for T {}

/// Randomly chosen magic number identifying transport connections.
const MAGIC: u64 = 0x4641_4252_4943_0001;

/// Bumped on incompatible frame-format changes.
const PROTOCOL_VERSION: u32 = 1;

/// Interval between keepalive frames on an otherwise idle connection.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single frame; larger frames fail decoding outright.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

// ── Frames ──────────────────────────────────────────────────────────

/// Frames sent from client to server.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ClientFrame<Req> {
    Open { stream: u64, request: Req },
    Cancel { stream: u64 },
}

/// Frames sent from server to client.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ServerFrame<Resp> {
    Item { stream: u64, item: Resp },
    End { stream: u64 },
    Fault { stream: u64, fault: Fault },
}

/// Compatibility information exchanged during the handshake.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: u32,
}

// ── Handshake ───────────────────────────────────────────────────────

/// Both endpoints send the magic number and a `Hello`, then validate what
/// the peer sent. Runs symmetrically on client and server.
pub(crate) async fn handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_u64(MAGIC).await?;
    write_frame(writer, Some(&Hello { version: PROTOCOL_VERSION })).await?;

    let peer_magic = reader.read_u64().await?;
    if peer_magic != MAGIC {
        return Err(Error::Handshake(format!("invalid protocol magic {peer_magic:#x}")));
    }
    let hello: Hello = match read_frame(reader).await? {
        Some(hello) => hello,
        None => return Err(Error::Handshake("peer closed during handshake".into())),
    };
    if hello.version != PROTOCOL_VERSION {
        return Err(Error::Handshake(format!(
            "protocol version mismatch: peer {} != ours {PROTOCOL_VERSION}",
            hello.version
        )));
    }
    Ok(())
}

// ── Framing ─────────────────────────────────────────────────────────

/// Write one message, or an empty keepalive frame when `msg` is `None`.
pub(crate) async fn write_frame<W, M>(writer: &mut W, msg: Option<&M>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let bytes = match msg {
        Some(msg) => wire_encode(msg)?,
        None => Vec::new(),
    };
    writer.write_u64(bytes.len() as u64).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message, skipping keepalives. `Ok(None)` signals a clean close
/// at a frame boundary.
pub(crate) async fn read_frame<R, M>(reader: &mut R) -> Result<Option<M>, Error>
where
    R: AsyncRead + Unpin,
    M: Message,
{
    let mut len = 0;
    while len == 0 {
        len = match reader.read_u64().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
    }
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
    }

    let mut bytes = vec![0; len as usize];
    reader.read_exact(&mut bytes).await?;
    wire_decode(&bytes).map(Some)
}

fn wire_encode<M: Message>(msg: &M) -> Result<Vec<u8>, Error> {
    use bincode::Options;
    Ok(bincode::DefaultOptions::new().serialize(msg)?)
}

fn wire_decode<M: Message>(bytes: &[u8]) -> Result<M, Error> {
    use bincode::Options;
    Ok(bincode::DefaultOptions::new().deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        let frame = ClientFrame::Open { stream: 7, request: "hello".to_owned() };
        write_frame(&mut buf, Some(&frame)).await.unwrap();
        // A keepalive in the middle must be transparent to the reader.
        write_frame::<_, ClientFrame<String>>(&mut buf, None).await.unwrap();
        write_frame(&mut buf, Some(&ClientFrame::<String>::Cancel { stream: 7 })).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: ClientFrame<String> = read_frame(&mut cursor).await.unwrap().unwrap();
        match first {
            ClientFrame::Open { stream, request } => {
                assert_eq!(stream, 7);
                assert_eq!(request, "hello");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        let second: ClientFrame<String> = read_frame(&mut cursor).await.unwrap().unwrap();
        assert!(matches!(second, ClientFrame::Cancel { stream: 7 }));
        // EOF at a frame boundary reads as a clean close.
        assert!(read_frame::<_, ClientFrame<String>>(&mut cursor).await.unwrap().is_none());
    }
}
