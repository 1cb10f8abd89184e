//! Local control socket at `<base>/miniccc`.
//!
//! A connecting client sends one integer mode record, then either a
//! (key, value) string pair (tag) or a pipe name followed by
//! newline-delimited pipe data in both directions.

use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use ron_proto::{Decoder, PipeOp, Sender};

use crate::{Agent, AgentError};

pub const MODE_TAG: u32 = 0;
pub const MODE_PIPE: u32 = 1;

pub(crate) async fn serve(agent: Arc<Agent>) {
    let path = agent.config.base.join("miniccc");
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(path = %path.display(), "control socket bind: {e}");
            return;
        }
    };
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            break;
        };
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(agent, stream).await {
                tracing::debug!("control connection: {e}");
            }
        });
    }
}

async fn handle(agent: Arc<Agent>, stream: UnixStream) -> Result<(), AgentError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut decoder = Decoder::new(read_half);

    let mode: u32 = decoder.decode().await?;
    match mode {
        MODE_TAG => {
            let key: String = decoder.decode().await?;
            let value: String = decoder.decode().await?;
            tracing::info!(key, value, "tag set via control socket");
            agent.set_tag(key, value);
        }
        MODE_PIPE => {
            let pipe: String = decoder.decode().await?;
            agent.send_pipe(PipeOp::NewReader, &pipe, "").await;
            let mut reader = agent.plumber.reader(&pipe);
            let (raw, leftover) = decoder.into_parts();

            // Socket lines become pipe writes.
            let writer_agent = agent.clone();
            let writer_pipe = pipe.clone();
            let ingest = tokio::spawn(async move {
                let mut lines = BufReader::new(PrefixedRead::new(leftover, raw)).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    writer_agent.send_pipe(PipeOp::Data, &writer_pipe, &line).await;
                }
            });

            // Pipe values become socket lines.
            while let Some(value) = reader.rx.recv().await {
                let line = format!("{value}\n");
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            ingest.abort();
            agent.plumber.unregister(&pipe, reader.id);
        }
        other => {
            tracing::warn!(mode = other, "unknown control mode");
        }
    }
    Ok(())
}

/// A reader that yields buffered bytes before the underlying stream.
struct PrefixedRead<R> {
    prefix: BytesMut,
    inner: R,
}

impl<R> PrefixedRead<R> {
    fn new(prefix: BytesMut, inner: R) -> Self {
        Self { prefix, inner }
    }
}

impl<R: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for PrefixedRead<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let take = self.prefix.len().min(buf.remaining());
            let head = self.prefix.split_to(take);
            buf.put_slice(&head);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

// ── Client helpers (used by the miniccc CLI) ───────────────────────────

/// Set a tag on an already-running agent.
pub async fn send_tag(base: &Path, key: &str, value: &str) -> Result<(), AgentError> {
    let stream = UnixStream::connect(base.join("miniccc")).await?;
    let sender = Sender::new(stream);
    sender.send(&MODE_TAG).await?;
    sender.send(&key.to_string()).await?;
    sender.send(&value.to_string()).await?;
    Ok(())
}

/// Attach stdin/stdout to a named pipe through a running agent.
pub async fn pipe_client(base: &Path, pipe: &str) -> Result<(), AgentError> {
    let stream = UnixStream::connect(base.join("miniccc")).await?;
    let (read_half, write_half) = stream.into_split();
    let sender = Sender::new(write_half);
    sender.send(&MODE_PIPE).await?;
    sender.send(&pipe.to_string()).await?;

    // Socket → stdout.
    let mut socket_lines = BufReader::new(read_half).lines();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Ok(Some(line)) = socket_lines.next_line().await {
            let line = format!("{line}\n");
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Stdin → socket.
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = stdin_lines.next_line().await {
        let line = format!("{line}\n");
        sender.send_raw(line.as_bytes()).await?;
    }
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentConfig;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn prefixed_read_yields_buffer_first() {
        let (client, server) = tokio::io::duplex(64);
        let mut prefix = BytesMut::new();
        prefix.extend_from_slice(b"head ");
        let mut reader = PrefixedRead::new(prefix, server);

        let mut client = client;
        client.write_all(b"tail").await.unwrap();
        drop(client);

        let mut collected = String::new();
        reader.read_to_string(&mut collected).await.unwrap();
        assert_eq!(collected, "head tail");
    }

    #[tokio::test]
    async fn tag_flows_into_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let agent =
            Agent::new(AgentConfig::new("localhost", 9002).base(dir.path())).unwrap();
        tokio::spawn(serve(agent.clone()));

        // Wait for the socket to exist.
        let path = agent.config.base.join("miniccc");
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        send_tag(&agent.config.base, "role", "edge").await.unwrap();

        for _ in 0..100 {
            // Drain via the heartbeat path to observe buffered tags.
            let snapshot = agent.heartbeat_snapshot();
            if snapshot.tags.get("role").map(String::as_str) == Some("edge") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tag never arrived");
    }
}
