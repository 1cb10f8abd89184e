//! Command dispatch: the agent applies commands strictly in ID order,
//! one at a time.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};

use ron_proto::{
    Command, ConnTest, FileChunk, Message, Payload, PipeOp, Response, SendFile, PART_SIZE,
};

use crate::{Agent, AgentError};

/// Deadline for each requested file chunk.
const FILE_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn dispatch(
    agent: Arc<Agent>,
    mut cmd_rx: mpsc::Receiver<BTreeMap<u64, Command>>,
    mut file_rx: mpsc::Receiver<FileChunk>,
    out_tx: mpsc::Sender<Message>,
    mut reset_rx: watch::Receiver<bool>,
) {
    loop {
        let batch = tokio::select! {
            _ = reset_rx.changed() => break,
            batch = cmd_rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            }
        };

        // BTreeMap iteration is already ID-sorted.
        for (_, command) in batch {
            if !agent.claim_command(command.id) {
                continue;
            }
            tracing::debug!(id = command.id, "processing command");
            let response = process(&agent, &command, &mut file_rx, &out_tx).await;
            agent.push_response(response);
        }
    }
}

async fn process(
    agent: &Arc<Agent>,
    command: &Command,
    file_rx: &mut mpsc::Receiver<FileChunk>,
    out_tx: &mpsc::Sender<Message>,
) -> Response {
    let mut response = Response {
        id: command.id,
        ..Default::default()
    };

    for file in &command.files_send {
        if let Err(e) = fetch_file(agent, command.id, file, file_rx, out_tx).await {
            tracing::warn!(file = %file.name, "file fetch: {e}");
        }
    }

    if let Some(pid) = command.pid {
        agent.kill(pid);
    }
    if let Some(needle) = &command.kill_all {
        agent.kill_matching(needle);
    }
    if let Some(level) = command.level {
        agent.reload_level(level);
    }

    if !command.exec.is_empty() {
        run_exec(agent, command, &mut response).await;
    }
    if let Some(test) = &command.conn_test {
        run_conn_test(test, &mut response).await;
    }
    if !command.files_recv.is_empty() {
        send_files(agent, command, out_tx).await;
    }

    response
}

// ── File pull (controller → agent) ─────────────────────────────────────

/// Request one file and write its chunks into `<base>/files/`, skipping
/// paths already present.
async fn fetch_file(
    agent: &Arc<Agent>,
    id: u64,
    file: &SendFile,
    file_rx: &mut mpsc::Receiver<FileChunk>,
    out_tx: &mpsc::Sender<Message>,
) -> Result<(), AgentError> {
    let relative: PathBuf = file.name.split('/').filter(|c| !c.is_empty() && *c != "..").collect();
    let dest = agent.config.base.join("files").join(relative);
    if dest.exists() {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let request = Message::new(
        agent.uuid(),
        Payload::File(FileChunk::request(&file.name, id)),
    );
    out_tx
        .send(request)
        .await
        .map_err(|_| AgentError::Reset)?;

    let mut out = tokio::fs::File::create(&dest).await?;
    let mut perm = file.perm;
    loop {
        let chunk = tokio::time::timeout(FILE_CHUNK_TIMEOUT, file_rx.recv())
            .await
            .map_err(|_| AgentError::FileTransfer(format!("{}: chunk timeout", file.name)))?
            .ok_or(AgentError::Reset)?;
        if !chunk.error.is_empty() {
            drop(out);
            let _ = std::fs::remove_file(&dest);
            return Err(AgentError::FileTransfer(chunk.error));
        }
        out.write_all(&chunk.data).await?;
        if chunk.perm != 0 {
            perm = chunk.perm;
        }
        if chunk.eof {
            break;
        }
    }
    out.flush().await?;
    drop(out);
    set_perm(&dest, perm);
    Ok(())
}

#[cfg(unix)]
fn set_perm(path: &std::path::Path, perm: u32) {
    use std::os::unix::fs::PermissionsExt;
    if perm != 0 {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(perm));
    }
}

#[cfg(not(unix))]
fn set_perm(_path: &std::path::Path, _perm: u32) {}

// ── Exec ───────────────────────────────────────────────────────────────

async fn run_exec(agent: &Arc<Agent>, command: &Command, response: &mut Response) {
    response.record_exit_code = !command.background;

    let Some(program) = resolve(agent, &command.exec[0]) else {
        response.stderr = format!("{}: no such command", command.exec[0]);
        response.exit_code = -1;
        return;
    };

    let mut child_cmd = tokio::process::Command::new(&program);
    child_cmd
        .args(&command.exec[1..])
        .current_dir(agent.config.base.join("files"))
        .stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        // A handle is piped only when something will drain it: a pipe
        // bridge, or foreground capture.
        .stdout(if command.stdout.is_some() || !command.background {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if command.stderr.is_some() || !command.background {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = match child_cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            response.stderr = e.to_string();
            response.exit_code = -1;
            response.record_exit_code = !command.background;
            return;
        }
    };

    wire_stdio(agent, command, &mut child).await;

    if command.background {
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        let (kill_tx, kill_rx) = oneshot::channel();
        agent.track_process(pid, command.exec.clone(), kill_tx);
        let agent = agent.clone();
        // Waiter removes the table entry when the child exits or is killed.
        tokio::spawn(async move {
            tokio::select! {
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                _ = child.wait() => {}
            }
            agent.untrack_process(pid);
        });
        return;
    }

    // Foreground: wait and capture whatever was not plumbed.
    let captured = capture(&mut child, command).await;
    match child.wait().await {
        Ok(status) => {
            response.exit_code = status.code().unwrap_or(-1);
        }
        Err(e) => {
            response.stderr = e.to_string();
            response.exit_code = -1;
        }
    }
    response.stdout = captured.0;
    if response.stderr.is_empty() {
        response.stderr = captured.1;
    }
}

/// Bridge configured stdio pipe names through the plumbing fabric.
async fn wire_stdio(agent: &Arc<Agent>, command: &Command, child: &mut tokio::process::Child) {
    if let Some(pipe) = &command.stdin {
        agent.send_pipe(PipeOp::NewReader, pipe, "").await;
        let mut reader = agent.plumber.reader(pipe);
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(value) = reader.rx.recv().await {
                    let line = format!("{value}\n");
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
    if let Some(pipe) = &command.stdout {
        agent.send_pipe(PipeOp::NewWriter, pipe, "").await;
        if let Some(stdout) = child.stdout.take() {
            spawn_pipe_writer(agent.clone(), pipe.clone(), stdout);
        }
    }
    if let Some(pipe) = &command.stderr {
        agent.send_pipe(PipeOp::NewWriter, pipe, "").await;
        if let Some(stderr) = child.stderr.take() {
            spawn_pipe_writer(agent.clone(), pipe.clone(), stderr);
        }
    }
}

fn spawn_pipe_writer<R>(agent: Arc<Agent>, pipe: String, stream: R)
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            agent.send_pipe(PipeOp::Data, &pipe, &line).await;
        }
    });
}

/// Capture whatever stdio was left piped and not plumbed.
async fn capture(
    child: &mut tokio::process::Child,
    command: &Command,
) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    if command.stdout.is_none() {
        if let Some(mut out) = child.stdout.take() {
            use tokio::io::AsyncReadExt;
            let _ = out.read_to_string(&mut stdout).await;
        }
    }
    if command.stderr.is_none() {
        if let Some(mut err) = child.stderr.take() {
            use tokio::io::AsyncReadExt;
            let _ = err.read_to_string(&mut stderr).await;
        }
    }
    (stdout, stderr)
}

/// Resolve argv[0] against `$PATH`, then against `<base>/files/`.
fn resolve(agent: &Arc<Agent>, name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.exists().then_some(path);
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    let local = agent.config.base.join("files").join(name);
    local.is_file().then_some(local)
}

// ── Connectivity probe ─────────────────────────────────────────────────

async fn run_conn_test(test: &ConnTest, response: &mut Response) {
    if probe(test).await {
        response.stdout = "pass".to_string();
    } else {
        response.stderr = "fail".to_string();
        response.exit_code = 1;
    }
    response.record_exit_code = true;
}

async fn probe(test: &ConnTest) -> bool {
    let Some((scheme, address)) = test.endpoint.split_once("://") else {
        return false;
    };
    match scheme {
        "tcp" => tokio::time::timeout(test.wait, TcpStream::connect(address))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false),
        "udp" => {
            let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
                return false;
            };
            let connected = tokio::time::timeout(test.wait, socket.connect(address)).await;
            if !matches!(connected, Ok(Ok(()))) {
                return false;
            }
            if test.packet.is_empty() {
                return true;
            }
            if socket.send(&test.packet).await.is_err() {
                return false;
            }
            let mut buf = [0u8; 1500];
            matches!(
                tokio::time::timeout(Duration::from_millis(500), socket.recv(&mut buf)).await,
                Ok(Ok(_))
            )
        }
        _ => false,
    }
}

// ── File push (agent → controller) ─────────────────────────────────────

/// Stream each matching local file back in ≤ PART_SIZE chunks.
async fn send_files(agent: &Arc<Agent>, command: &Command, out_tx: &mpsc::Sender<Message>) {
    let base = agent.config.base.clone();
    for pattern in &command.files_recv {
        let matches = expand(&base, pattern);
        if matches.is_empty() {
            let mut chunk = FileChunk::request(pattern, command.id);
            chunk.error = format!("{pattern}: no such file");
            let _ = out_tx
                .send(Message::new(agent.uuid(), Payload::File(chunk)))
                .await;
            continue;
        }
        for relative in matches {
            if let Err(e) = stream_file(agent, command.id, &base, &relative, out_tx).await {
                tracing::warn!(file = %relative, "file send: {e}");
            }
        }
    }
}

/// Base-relative matches for a literal path or glob pattern.
fn expand(base: &std::path::Path, pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim_start_matches('/');
    if !trimmed.contains(['*', '?', '[']) {
        let full = base.join(trimmed);
        return if full.is_file() {
            vec![trimmed.to_string()]
        } else {
            Vec::new()
        };
    }
    let Ok(glob) = globset::Glob::new(trimmed) else {
        return Vec::new();
    };
    let matcher = glob.compile_matcher();
    let mut found = Vec::new();
    let mut stack = vec![base.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(base) {
                let joined = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if matcher.is_match(&joined) {
                    found.push(joined);
                }
            }
        }
    }
    found.sort();
    found
}

async fn stream_file(
    agent: &Arc<Agent>,
    id: u64,
    base: &std::path::Path,
    relative: &str,
    out_tx: &mpsc::Sender<Message>,
) -> Result<(), AgentError> {
    use tokio::io::AsyncReadExt;

    let full = base.join(relative);
    let metadata = std::fs::metadata(&full)?;
    let perm = permission_bits(&metadata);
    let mut file = tokio::fs::File::open(&full).await?;
    let mut offset = 0u64;
    let size = metadata.len();

    loop {
        let remaining = (size - offset).min(PART_SIZE as u64) as usize;
        let mut data = vec![0u8; remaining];
        if remaining > 0 {
            file.read_exact(&mut data).await?;
        }
        let eof = offset + remaining as u64 >= size;
        let chunk = FileChunk {
            name: relative.to_string(),
            offset,
            data,
            perm,
            eof,
            id,
            error: String::new(),
        };
        out_tx
            .send(Message::new(agent.uuid(), Payload::File(chunk)))
            .await
            .map_err(|_| AgentError::Reset)?;
        offset += remaining as u64;
        if eof {
            break;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}
