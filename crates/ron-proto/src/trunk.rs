/// Trunked subchannels: carry an opaque byte stream inside a RON session.
///
/// A trunk pairs an in-memory duplex pipe with the session's outbound
/// message channel. Whatever the stacked component writes into its half is
/// read in chunks, wrapped as a caller-chosen payload variant, and sent;
/// incoming payloads of that variant are written back into the pipe so the
/// component reads them as a plain byte stream. Any component that speaks
/// `AsyncRead + AsyncWrite` stacks on a session without its own transport.
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ProtoError;
use crate::message::{Message, Payload};

/// Read size per chunk pulled off the component side.
pub const TRUNK_CHUNK: usize = 32 * 1024;

/// The session-side half of a trunked subchannel.
pub struct Trunk {
    writer: WriteHalf<DuplexStream>,
    pump: JoinHandle<()>,
}

impl Trunk {
    /// Create a trunk for `uuid`. Bytes written by the component come back
    /// through `outbound` wrapped by `wrap`; the returned [`DuplexStream`]
    /// is the component's transport.
    pub fn new(
        uuid: impl Into<String>,
        outbound: mpsc::Sender<Message>,
        wrap: fn(Vec<u8>) -> Payload,
    ) -> (Self, DuplexStream) {
        let (local, remote) = tokio::io::duplex(TRUNK_CHUNK * 2);
        let (read_half, writer) = tokio::io::split(local);
        let pump = tokio::spawn(pump_outbound(uuid.into(), read_half, outbound, wrap));
        (Self { writer, pump }, remote)
    }

    /// Deliver the payload of an incoming trunked message to the component.
    pub async fn deliver(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        self.writer
            .write_all(data)
            .await
            .map_err(|_| ProtoError::TrunkClosed)
    }

    /// Close the trunk. The component observes EOF on its half.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        self.pump.abort();
    }
}

async fn pump_outbound(
    uuid: String,
    mut reader: ReadHalf<DuplexStream>,
    outbound: mpsc::Sender<Message>,
    wrap: fn(Vec<u8>) -> Payload,
) {
    let mut buf = vec![0u8; TRUNK_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let message = Message::new(uuid.clone(), wrap(buf[..n].to_vec()));
                if outbound.send(message).await.is_err() {
                    tracing::debug!(uuid, "trunk outbound channel closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn component_writes_become_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_trunk, mut component) = Trunk::new("aaaa", tx, Payload::Tunnel);

        component.write_all(b"ping").await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.uuid, "aaaa");
        match message.payload {
            Payload::Tunnel(data) => assert_eq!(data, b"ping"),
            other => panic!("expected Tunnel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivered_bytes_reach_component() {
        let (tx, _rx) = mpsc::channel(8);
        let (mut trunk, mut component) = Trunk::new("aaaa", tx, Payload::Tunnel);

        trunk.deliver(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        component.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_surfaces_as_eof() {
        let (tx, _rx) = mpsc::channel(8);
        let (trunk, mut component) = Trunk::new("aaaa", tx, Payload::Tunnel);

        trunk.close().await;
        let mut buf = [0u8; 1];
        assert_eq!(component.read(&mut buf).await.unwrap(), 0);
    }
}
