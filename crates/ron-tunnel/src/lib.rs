//! Tunnel engine: concurrent TCP port-forwards over one trunked stream.
//!
//! One engine per RON session. Each accepted connection becomes a stream
//! keyed by a random 32-bit transaction ID; frames are self-describing
//! records on the trunk. A reverse tunnel is a remotely-invoked forward.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use ron_proto::{Decoder, ProtoError, Sender};

/// Read size per socket read.
const READ_CHUNK: usize = 32 * 1024;

/// Frames buffered per stream before a slow reader aborts it.
const STREAM_QUEUE: usize = 1024;

/// Transport suitable for carrying a tunnel (usually a trunk pipe).
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

type BoxedStream = Box<dyn Stream>;
type FrameSender = Sender<WriteHalf<BoxedStream>>;

// ── Frames ─────────────────────────────────────────────────────────────

/// Protocol frames inside the trunked channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Handshake {
        ack: bool,
    },
    /// Forward initiator asks the peer to dial host:port for stream `tid`.
    Connect {
        tid: u32,
        host: String,
        port: u16,
    },
    Data {
        tid: u32,
        data: Vec<u8>,
    },
    /// Stream is done; `error` carries dial or overflow failures.
    Closed {
        tid: u32,
        error: Option<String>,
    },
    /// Reverse-tunnel request: invoke `forward` on the receiving side.
    Forward {
        tid: u32,
        source_port: u16,
        host: String,
        port: u16,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("handshake failed")]
    Handshake,

    #[error("remote rejected: {0}")]
    Remote(String),

    #[error("tunnel closed")]
    Closed,
}

// ── Engine ─────────────────────────────────────────────────────────────

struct Inner {
    sender: FrameSender,
    streams: Mutex<HashMap<u32, mpsc::Sender<Frame>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: watch::Sender<bool>,
}

/// One tunnel engine, owning every forward and stream on its session.
pub struct Tunnel {
    inner: Arc<Inner>,
    mux: JoinHandle<()>,
}

impl Tunnel {
    /// Dial side of the setup handshake.
    pub async fn dial<S: Stream + 'static>(transport: S) -> Result<Self, TunnelError> {
        let boxed: BoxedStream = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);
        let mut decoder = Decoder::new(read_half);
        let sender = Sender::new(write_half);

        sender.send(&Frame::Handshake { ack: false }).await?;
        match decoder.decode::<Frame>().await? {
            Frame::Handshake { ack: true } => {}
            _ => return Err(TunnelError::Handshake),
        }
        Ok(Self::start(decoder, sender))
    }

    /// Accept side of the setup handshake.
    pub async fn accept<S: Stream + 'static>(transport: S) -> Result<Self, TunnelError> {
        let boxed: BoxedStream = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);
        let mut decoder = Decoder::new(read_half);
        let sender = Sender::new(write_half);

        match decoder.decode::<Frame>().await? {
            Frame::Handshake { ack: false } => {}
            _ => return Err(TunnelError::Handshake),
        }
        sender.send(&Frame::Handshake { ack: true }).await?;
        Ok(Self::start(decoder, sender))
    }

    fn start(decoder: Decoder<ReadHalf<BoxedStream>>, sender: FrameSender) -> Self {
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            sender,
            streams: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            closed,
        });
        let mux = tokio::spawn(mux_loop(inner.clone(), decoder));
        Self { inner, mux }
    }

    /// Forward a local listening port to `host:port` on the peer side.
    /// Returns the bound local port (useful when `source_port` is 0).
    pub async fn forward(
        &self,
        source_port: u16,
        host: impl Into<String>,
        port: u16,
    ) -> Result<u16, TunnelError> {
        forward(self.inner.clone(), source_port, host.into(), port).await
    }

    /// Ask the peer to forward `source_port` on its side back to
    /// `host:port` reachable from here. Blocks until the peer acks.
    pub async fn reverse(
        &self,
        source_port: u16,
        host: impl Into<String>,
        port: u16,
    ) -> Result<(), TunnelError> {
        let tid = rand::random::<u32>();
        let (tx, mut rx) = mpsc::channel(4);
        self.inner.streams.lock().await.insert(tid, tx);
        let sent = self
            .inner
            .sender
            .send(&Frame::Forward {
                tid,
                source_port,
                host: host.into(),
                port,
            })
            .await;
        if let Err(e) = sent {
            self.inner.streams.lock().await.remove(&tid);
            return Err(e.into());
        }

        let reply = rx.recv().await;
        self.inner.streams.lock().await.remove(&tid);
        match reply {
            Some(Frame::Data { .. }) => Ok(()),
            Some(Frame::Closed { error, .. }) => {
                Err(TunnelError::Remote(error.unwrap_or_default()))
            }
            _ => Err(TunnelError::Closed),
        }
    }

    /// Close every forward listener and stream; the engine goes inert.
    /// Every task blocked on a stream channel observes the close and
    /// exits.
    pub async fn shutdown(&self) {
        let _ = self.inner.closed.send(true);
        for listener in self.inner.listeners.lock().await.drain(..) {
            listener.abort();
        }
        self.inner.streams.lock().await.clear();
        self.inner.sender.close().await;
    }

    /// Shut down and stop the mux.
    pub async fn close(self) {
        self.shutdown().await;
        self.mux.abort();
    }

    /// Run until the underlying transport closes.
    pub async fn join(self) {
        let _ = self.mux.await;
    }
}

async fn forward(
    inner: Arc<Inner>,
    source_port: u16,
    host: String,
    port: u16,
) -> Result<u16, TunnelError> {
    let listener = TcpListener::bind(("0.0.0.0", source_port))
        .await
        .map_err(TunnelError::Bind)?;
    let bound = listener
        .local_addr()
        .map_err(TunnelError::Bind)?
        .port();

    let closed_rx = inner.closed.subscribe();
    let task = tokio::spawn(accept_loop(inner.clone(), listener, host, port, closed_rx));
    inner.listeners.lock().await.push(task);
    Ok(bound)
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    host: String,
    port: u16,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = closed_rx.changed() => break,
            accepted = listener.accept() => {
                let Ok((socket, _)) = accepted else { break };
                let tid = rand::random::<u32>();
                let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                inner.streams.lock().await.insert(tid, tx);
                let connect = Frame::Connect { tid, host: host.clone(), port };
                if inner.sender.send(&connect).await.is_err() {
                    break;
                }
                tokio::spawn(pump_stream(inner.clone(), tid, socket, rx));
            }
        }
    }
}

// ── Mux ────────────────────────────────────────────────────────────────

async fn mux_loop(inner: Arc<Inner>, mut decoder: Decoder<ReadHalf<BoxedStream>>) {
    let mut closed_rx = inner.closed.subscribe();
    loop {
        let frame = tokio::select! {
            _ = closed_rx.changed() => break,
            frame = decoder.decode::<Frame>() => frame,
        };
        match frame {
            Ok(frame) => handle_frame(&inner, frame).await,
            Err(ProtoError::Eof) => break,
            Err(e) => {
                tracing::debug!("tunnel mux: {e}");
                break;
            }
        }
    }
    inner.streams.lock().await.clear();
}

async fn handle_frame(inner: &Arc<Inner>, frame: Frame) {
    match frame {
        Frame::Handshake { .. } => {}
        Frame::Connect { tid, host, port } => {
            let inner = inner.clone();
            tokio::spawn(async move {
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(socket) => {
                        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                        inner.streams.lock().await.insert(tid, tx);
                        pump_stream(inner.clone(), tid, socket, rx).await;
                    }
                    Err(e) => {
                        let closed = Frame::Closed {
                            tid,
                            error: Some(e.to_string()),
                        };
                        let _ = inner.sender.send(&closed).await;
                    }
                }
            });
        }
        Frame::Data { tid, data } => {
            deliver(inner, tid, Frame::Data { tid, data }).await;
        }
        Frame::Closed { tid, error } => {
            let sent = {
                let mut streams = inner.streams.lock().await;
                let delivered = match streams.get(&tid) {
                    Some(tx) => tx.try_send(Frame::Closed { tid, error }).is_ok(),
                    None => false,
                };
                streams.remove(&tid);
                delivered
            };
            let _ = sent;
        }
        Frame::Forward {
            tid,
            source_port,
            host,
            port,
        } => {
            let reply = match forward(inner.clone(), source_port, host, port).await {
                Ok(_) => Frame::Data {
                    tid,
                    data: b"ack".to_vec(),
                },
                Err(e) => Frame::Closed {
                    tid,
                    error: Some(e.to_string()),
                },
            };
            let _ = inner.sender.send(&reply).await;
        }
    }
}

/// Route a frame into its stream queue. Unknown TIDs are dropped; a full
/// queue aborts the stream.
async fn deliver(inner: &Arc<Inner>, tid: u32, frame: Frame) {
    let overflow = {
        let mut streams = inner.streams.lock().await;
        let Some(tx) = streams.get(&tid) else { return };
        match tx.try_send(frame) {
            Ok(()) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                streams.remove(&tid);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                streams.remove(&tid);
                false
            }
        }
    };
    if overflow {
        tracing::warn!(tid, "stream queue overflow, aborting");
        let closed = Frame::Closed {
            tid,
            error: Some("stream queue overflow".into()),
        };
        let _ = inner.sender.send(&closed).await;
    }
}

/// Shuttle bytes between one TCP socket and the tunnel until either side
/// closes. Exits when the stream channel closes (tunnel teardown).
async fn pump_stream(
    inner: Arc<Inner>,
    tid: u32,
    socket: TcpStream,
    mut rx: mpsc::Receiver<Frame>,
) {
    let (mut sock_read, mut sock_write) = socket.into_split();

    let sender = inner.sender.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = sender.send(&Frame::Closed { tid, error: None }).await;
                    break;
                }
                Ok(n) => {
                    let data = Frame::Data {
                        tid,
                        data: buf[..n].to_vec(),
                    };
                    if sender.send(&data).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Data { data, .. } => {
                if sock_write.write_all(&data).await.is_err() {
                    break;
                }
            }
            Frame::Closed { .. } => break,
            _ => {}
        }
    }

    reader.abort();
    let _ = sock_write.shutdown().await;
    inner.streams.lock().await.remove(&tid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ron_proto::to_record;

    #[test]
    fn frame_roundtrip() {
        let frames = [
            Frame::Handshake { ack: true },
            Frame::Connect {
                tid: 7,
                host: "localhost".into(),
                port: 4445,
            },
            Frame::Data {
                tid: 7,
                data: b"hello".to_vec(),
            },
            Frame::Closed {
                tid: 7,
                error: Some("refused".into()),
            },
            Frame::Forward {
                tid: 8,
                source_port: 4444,
                host: "localhost".into(),
                port: 4445,
            },
        ];
        for frame in &frames {
            let bytes = to_record(frame).unwrap();
            let decoded: Frame = ron_proto::from_record(&bytes).unwrap();
            assert_eq!(&decoded, frame);
        }
    }
}
