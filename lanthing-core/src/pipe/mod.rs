//! IPC pipe between the service and the per-session worker.
//!
//! Messages are [`ControlMessage`]s framed by [`LtCodec`]: length-prefixed,
//! tagged with a 32-bit type id, checksummed. The endpoint is a named pipe
//! (`\\.\pipe\<name>`) on Windows and a Unix socket elsewhere; both carry
//! the same framing, so the protocol layer above never knows the
//! difference.

mod codec;

pub use codec::{LtCodec, WireMessage, HEADER_LEN, MAX_PAYLOAD_LEN};

use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::LtError;
use crate::message::ControlMessage;

/// Delay between connection attempts while the service side is not up yet.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);
const CONNECT_ATTEMPTS: u32 = 25;

/// Resolve a pipe name to the platform endpoint path.
pub fn endpoint_path(name: &str) -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    }
    #[cfg(not(windows))]
    {
        std::env::temp_dir().join(format!("{name}.sock"))
    }
}

// ── PipeConnection ───────────────────────────────────────────────

/// Sender half of a pipe connection, cheaply cloneable.
pub type PipeSender = mpsc::Sender<ControlMessage>;

/// A framed, bidirectional message connection.
///
/// Internally splits the stream into two background tasks communicating
/// over mpsc channels, so no borrow is held across await points and
/// back-pressure falls out of the bounded channels.
#[derive(Debug)]
pub struct PipeConnection {
    tx: mpsc::Sender<ControlMessage>,
    rx: mpsc::Receiver<ControlMessage>,
}

impl PipeConnection {
    /// Wrap an already-connected byte stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut net_writer, mut net_reader) = Framed::new(stream, LtCodec).split();

        let (user_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(128);
        let (inbound_tx, user_rx) = mpsc::channel::<ControlMessage>(128);

        // Writer task.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let wire = match WireMessage::from_control(&msg) {
                    Ok(w) => w,
                    Err(e) => {
                        warn!("dropping unencodable message: {e}");
                        continue;
                    }
                };
                if let Err(e) = net_writer.send(wire).await {
                    warn!("pipe write error: {e}");
                    break;
                }
            }
        });

        // Reader task.
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(wire) => match wire.to_control() {
                        Ok(msg) => {
                            if inbound_tx.send(msg).await.is_err() {
                                break; // receiver dropped
                            }
                        }
                        Err(e) => {
                            // Malformed payload for a known id: discard.
                            warn!("discarding malformed message {:#06x}: {e}", wire.type_id);
                        }
                    },
                    Err(e) => {
                        warn!("pipe read error: {e}");
                        break;
                    }
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
        }
    }

    /// Send a message to the peer.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), LtError> {
        self.tx.send(msg).await.map_err(|_| LtError::ChannelClosed)
    }

    /// Receive the next message, or `None` once the peer disconnected.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.rx.recv().await
    }

    /// Cloneable sender handle for use in spawned tasks.
    pub fn sender(&self) -> PipeSender {
        self.tx.clone()
    }
}

// ── PipeServer ───────────────────────────────────────────────────

/// Listening side of the pipe (owned by the service).
pub struct PipeServer {
    #[cfg(not(windows))]
    listener: tokio::net::UnixListener,
    #[cfg(not(windows))]
    path: PathBuf,
    #[cfg(windows)]
    name: String,
    #[cfg(windows)]
    next: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

#[cfg(not(windows))]
impl PipeServer {
    /// Bind the endpoint for `name`, replacing a stale socket file.
    pub fn bind(name: &str) -> Result<Self, LtError> {
        let path = endpoint_path(name);
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)
            .map_err(|e| LtError::Init(format!("pipe bind {}: {e}", path.display())))?;
        debug!("pipe server listening on {}", path.display());
        Ok(Self { listener, path })
    }

    /// Accept the next worker connection.
    pub async fn accept(&mut self) -> Result<PipeConnection, LtError> {
        let (stream, _) = self.listener.accept().await?;
        Ok(PipeConnection::new(stream))
    }
}

#[cfg(not(windows))]
impl Drop for PipeServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
impl PipeServer {
    pub fn bind(name: &str) -> Result<Self, LtError> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let addr = endpoint_path(name).display().to_string();
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&addr)
            .map_err(|e| LtError::Init(format!("pipe bind {addr}: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            next: Some(first),
        })
    }

    pub async fn accept(&mut self) -> Result<PipeConnection, LtError> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let addr = endpoint_path(&self.name).display().to_string();
        let server = match self.next.take() {
            Some(s) => s,
            None => ServerOptions::new()
                .create(&addr)
                .map_err(|e| LtError::Init(format!("pipe instance {addr}: {e}")))?,
        };
        server.connect().await?;
        // Pre-create the next instance so a new worker can connect while
        // this connection is live.
        self.next = ServerOptions::new().create(&addr).ok();
        Ok(PipeConnection::new(server))
    }
}

// ── PipeClient ───────────────────────────────────────────────────

/// Connect to the service's pipe endpoint, retrying while it comes up.
pub async fn connect(name: &str) -> Result<PipeConnection, LtError> {
    connect_with_retries(name, CONNECT_ATTEMPTS).await
}

/// [`connect`] with an explicit retry budget.
pub async fn connect_with_retries(name: &str, attempts: u32) -> Result<PipeConnection, LtError> {
    let path = endpoint_path(name);
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..attempts {
        match try_connect(&path).await {
            Ok(conn) => {
                debug!("pipe connected to {} (attempt {attempt})", path.display());
                return Ok(conn);
            }
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
    Err(LtError::Init(format!(
        "pipe connect {} failed: {}",
        path.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(not(windows))]
async fn try_connect(path: &std::path::Path) -> Result<PipeConnection, std::io::Error> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(PipeConnection::new(stream))
}

#[cfg(windows)]
async fn try_connect(path: &std::path::Path) -> Result<PipeConnection, std::io::Error> {
    use tokio::net::windows::named_pipe::ClientOptions;
    let stream = ClientOptions::new().open(path.display().to_string())?;
    Ok(PipeConnection::new(stream))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CaptureVideoFrame, ControlMessage};

    fn unique_name(tag: &str) -> String {
        format!("lanthing-test-{tag}-{}", std::process::id())
    }

    #[tokio::test]
    async fn pipe_message_roundtrip() {
        let name = unique_name("roundtrip");
        let mut server = PipeServer::bind(&name).unwrap();

        let client_task = tokio::spawn({
            let name = name.clone();
            async move { connect(&name).await.unwrap() }
        });
        let mut server_conn = server.accept().await.unwrap();
        let client_conn = client_task.await.unwrap();

        let msg = ControlMessage::CaptureVideoFrame(CaptureVideoFrame {
            name: "slot-0".into(),
            picture_id: 7,
            capture_ts_us: 1_000,
            width: 1280,
            height: 720,
        });
        client_conn.send(msg.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), server_conn.recv())
            .await
            .expect("timeout")
            .expect("pipe closed");
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn messages_are_fifo_per_sender() {
        let name = unique_name("fifo");
        let mut server = PipeServer::bind(&name).unwrap();
        let client_task = tokio::spawn({
            let name = name.clone();
            async move { connect(&name).await.unwrap() }
        });
        let mut server_conn = server.accept().await.unwrap();
        let client_conn = client_task.await.unwrap();

        for i in 0..10u32 {
            client_conn
                .send(ControlMessage::FileChunkAck(crate::message::FileChunkAck {
                    request_id: 1,
                    chunk_index: i,
                }))
                .await
                .unwrap();
        }
        for i in 0..10u32 {
            let msg = tokio::time::timeout(Duration::from_secs(5), server_conn.recv())
                .await
                .expect("timeout")
                .expect("pipe closed");
            match msg {
                ControlMessage::FileChunkAck(ack) => assert_eq!(ack.chunk_index, i),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_surfaces_as_none() {
        let name = unique_name("disconnect");
        let mut server = PipeServer::bind(&name).unwrap();
        let client_task = tokio::spawn({
            let name = name.clone();
            async move { connect(&name).await.unwrap() }
        });
        let mut server_conn = server.accept().await.unwrap();
        let client_conn = client_task.await.unwrap();

        drop(client_conn);
        let received = tokio::time::timeout(Duration::from_secs(5), server_conn.recv())
            .await
            .expect("timeout");
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn connect_without_server_fails() {
        let err = connect_with_retries(&unique_name("nobody-home"), 2).await;
        assert!(matches!(err, Err(LtError::Init(_))));
    }
}
