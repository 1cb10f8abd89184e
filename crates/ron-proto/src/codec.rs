/// Framed codec for RON sessions.
///
/// Records are MessagePack-encoded with field names on the wire, so the
/// stream is self-delimiting: no length prefix, the decoder consumes
/// exactly one record per call. Both peers exchange the ASCII magic `RON`
/// before the first record.
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ProtoError;

/// Magic bytes exchanged before any record.
pub const MAGIC: &[u8; 3] = b"RON";

/// Dial-side handshake: write the magic, then read the peer's echo.
pub async fn handshake_dial<S>(stream: &mut S) -> Result<(), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(MAGIC).await?;
    stream.flush().await?;

    let mut echo = [0u8; 3];
    stream.read_exact(&mut echo).await?;
    if &echo != MAGIC {
        return Err(ProtoError::BadMagic);
    }
    Ok(())
}

/// Accept-side handshake: scan a shifting 3-byte window until the magic
/// appears (tolerates line noise on serial links), then write the magic back.
pub async fn handshake_accept<S>(stream: &mut S) -> Result<(), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut window = [0u8; 3];
    stream.read_exact(&mut window).await?;
    while &window != MAGIC {
        let mut next = [0u8; 1];
        if stream.read(&mut next).await? == 0 {
            return Err(ProtoError::Eof);
        }
        window[0] = window[1];
        window[1] = window[2];
        window[2] = next[0];
    }
    stream.write_all(MAGIC).await?;
    stream.flush().await?;
    Ok(())
}

/// Encode a value as one wire record.
pub fn to_record<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    rmp_serde::to_vec_named(value).map_err(Into::into)
}

/// Decode a single record from a complete byte slice.
pub fn from_record<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtoError> {
    rmp_serde::from_slice(data).map_err(Into::into)
}

// ── Decoder ────────────────────────────────────────────────────────────

/// Incremental record decoder over any byte stream.
///
/// Reads may block indefinitely; callers that want an upper bound use
/// [`Decoder::decode_timeout`]. The two failure modes are distinct:
/// `ProtoError::Eof` for a closed stream, `ProtoError::Timeout` for a
/// supervisor deadline.
pub struct Decoder<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Decode the next record, reading more bytes as needed.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T, ProtoError> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(&self.buf[..]);
                let mut de = rmp_serde::Deserializer::new(&mut cursor);
                match T::deserialize(&mut de) {
                    Ok(value) => {
                        let consumed = cursor.position() as usize;
                        self.buf.advance(consumed);
                        return Ok(value);
                    }
                    Err(e) if record_incomplete(&e) => {} // need more bytes
                    Err(e) => return Err(e.into()),
                }
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(ProtoError::Eof);
            }
        }
    }

    /// Decode with an upper deadline. Timeouts surface as
    /// `ProtoError::Timeout`, never as EOF.
    pub async fn decode_timeout<T: DeserializeOwned>(
        &mut self,
        limit: Duration,
    ) -> Result<T, ProtoError> {
        match tokio::time::timeout(limit, self.decode()).await {
            Ok(result) => result,
            Err(_) => Err(ProtoError::Timeout(limit)),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Surrender the stream plus any bytes already buffered past the
    /// last decoded record (for protocols that switch framing mid-stream).
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

/// A decode error that only means "the record is not all here yet".
fn record_incomplete(e: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error::{InvalidDataRead, InvalidMarkerRead};
    match e {
        InvalidMarkerRead(io) | InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

// ── Sender ─────────────────────────────────────────────────────────────

/// Record writer with a per-connection send lock.
///
/// A record write is atomic against concurrent senders: the full encoded
/// record goes out under one lock acquisition. Cheap to clone.
pub struct Sender<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for Sender<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin> Sender<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub async fn send<T: Serialize>(&self, value: &T) -> Result<(), ProtoError> {
        let record = to_record(value)?;
        self.send_raw(&record).await
    }

    /// Write pre-encoded bytes under the same send lock.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), ProtoError> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the underlying writer.
    pub async fn close(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        seq: u64,
        data: Vec<u8>,
    }

    fn record(seq: u64) -> Record {
        Record {
            name: "probe".into(),
            seq,
            data: vec![0xAB; 17],
        }
    }

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let sender = Sender::new(client);
        let mut decoder = Decoder::new(server);

        sender.send(&record(1)).await.unwrap();
        sender.send(&record(2)).await.unwrap();

        let first: Record = decoder.decode().await.unwrap();
        let second: Record = decoder.decode().await.unwrap();
        assert_eq!(first, record(1));
        assert_eq!(second, record(2));
    }

    #[tokio::test]
    async fn decode_across_split_writes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut decoder = Decoder::new(server);

        let bytes = to_record(&record(7)).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        let head = head.to_vec();
        let tail = tail.to_vec();
        let writer = tokio::spawn(async move {
            client.write_all(&head).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(&tail).await.unwrap();
            client
        });

        let decoded: Record = decoder.decode().await.unwrap();
        assert_eq!(decoded, record(7));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_is_distinct_from_timeout() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut decoder = Decoder::new(server);
        let result: Result<Record, _> = decoder.decode().await;
        assert!(matches!(result, Err(ProtoError::Eof)));

        let (_client, server) = tokio::io::duplex(64);
        let mut decoder = Decoder::new(server);
        let result: Result<Record, _> = decoder
            .decode_timeout(Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ProtoError::Timeout(_))));
    }

    #[tokio::test]
    async fn handshake_both_sides() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let accept = tokio::spawn(async move {
            handshake_accept(&mut server).await.unwrap();
            server
        });
        handshake_dial(&mut client).await.unwrap();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn accept_scans_past_garbage() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let accept = tokio::spawn(async move {
            handshake_accept(&mut server).await.unwrap();
            server
        });
        // Noise before the magic, as a flaky serial link would produce.
        client.write_all(b"\x00\xffRRON").await.unwrap();
        let mut echo = [0u8; 3];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, MAGIC);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn dial_rejects_bad_magic() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            let mut sink = [0u8; 3];
            server.read_exact(&mut sink).await.unwrap();
            server.write_all(b"NOP").await.unwrap();
            server
        });
        let result = handshake_dial(&mut client).await;
        assert!(matches!(result, Err(ProtoError::BadMagic)));
        feeder.await.unwrap();
    }
}
