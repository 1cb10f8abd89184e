//! Named-pipe plumbing fabric.
//!
//! Pipes are identified by string and carry newline-less string values.
//! Delivery follows the pipe's mode: every reader, round-robin, or a
//! uniformly random reader. A pipe may run writes through a `via`
//! program pinned to one node; other nodes forward writes there first.
//! Pipelines compose external processes and pipes left to right under a
//! shared cancel.

pub mod error;
pub mod message;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use ron_mesh::Node;
use ron_proto::{from_record, to_record};

pub use error::PlumbError;
pub use message::{PlumbKind, PlumbMessage, CHANNEL};

// ── Pipes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeMode {
    /// Every reader gets every value.
    #[default]
    All,
    /// One winner per write: smallest reader ID strictly greater than
    /// the previous recipient, wrapping to the smallest.
    RoundRobin,
    /// Uniform over known readers.
    Random,
}

#[derive(Default)]
struct Pipe {
    mode: PipeMode,
    readers: BTreeMap<u64, mpsc::Sender<String>>,
    last_recipient: u64,
    via: Option<Vec<String>>,
    via_host: Option<String>,
}

/// A registered pipe reader. Unregister through the plumber when done.
pub struct PipeReader {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

/// One stage of a pipeline.
#[derive(Debug, Clone)]
pub enum Stage {
    /// External process; stdout feeds the next stage.
    Command(Vec<String>),
    /// Named pipe; upstream values are written into it, and its values
    /// feed the next stage.
    Pipe(String),
}

// ── Plumber ────────────────────────────────────────────────────────────

/// The plumbing fabric for one node (or a purely local pipe table).
pub struct Plumber {
    node: Option<Node>,
    name: String,
    pipes: Mutex<HashMap<String, Pipe>>,
    tids: Mutex<HashMap<i64, mpsc::Sender<PlumbMessage>>>,
    next_reader_id: AtomicU64,
    rpc_timeout: Duration,
}

impl Plumber {
    /// A pipe table with no cross-node fabric (agent side).
    pub fn local(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node: None,
            name: name.into(),
            pipes: Mutex::new(HashMap::new()),
            tids: Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new((rand::random::<u32>() as u64) << 32),
            rpc_timeout: Duration::from_secs(10),
        })
    }

    /// Attach the fabric to a mesh node and start serving cross-node
    /// plumbing messages.
    pub fn start(node: Node) -> Arc<Self> {
        let pump = node.listen(CHANNEL);
        let plumber = Arc::new(Self {
            name: node.name().to_string(),
            node: Some(node),
            pipes: Mutex::new(HashMap::new()),
            tids: Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new((rand::random::<u32>() as u64) << 32),
            rpc_timeout: Duration::from_secs(10),
        });
        tokio::spawn(serve(plumber.clone(), pump));
        plumber
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a reader on a pipe.
    pub fn reader(&self, pipe: &str) -> PipeReader {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(1024);
        self.pipes
            .lock()
            .unwrap()
            .entry(pipe.to_string())
            .or_default()
            .readers
            .insert(id, tx);
        PipeReader { id, rx }
    }

    /// Remove a reader; its channel closes.
    pub fn unregister(&self, pipe: &str, id: u64) {
        if let Some(p) = self.pipes.lock().unwrap().get_mut(pipe) {
            p.readers.remove(&id);
        }
    }

    pub fn set_mode(&self, pipe: &str, mode: PipeMode) {
        self.pipes
            .lock()
            .unwrap()
            .entry(pipe.to_string())
            .or_default()
            .mode = mode;
    }

    /// Configure a via program for a pipe, pinned to this node. Other
    /// nodes learn the pin and forward their writes here.
    pub async fn set_via(self: &Arc<Self>, pipe: &str, argv: Vec<String>) -> Result<(), PlumbError> {
        if argv.is_empty() {
            return Err(PlumbError::EmptyStage);
        }
        {
            let mut pipes = self.pipes.lock().unwrap();
            let entry = pipes.entry(pipe.to_string()).or_default();
            entry.via = Some(argv.clone());
            entry.via_host = Some(self.name.clone());
        }
        if self.node.is_some() {
            let mut message = PlumbMessage::new(PlumbKind::ViaHost, &self.name, pipe);
            message.via = argv;
            message.host = self.name.clone();
            self.broadcast(&message).await?;
        }
        Ok(())
    }

    /// Close a pipe: every reader's channel closes.
    pub fn close_pipe(&self, pipe: &str) {
        self.pipes.lock().unwrap().remove(pipe);
    }

    /// Write a value to a pipe, honoring via and mode.
    pub async fn write(self: &Arc<Self>, pipe: &str, value: &str) -> Result<(), PlumbError> {
        let (via, via_host, mode) = {
            let pipes = self.pipes.lock().unwrap();
            match pipes.get(pipe) {
                Some(p) => (p.via.clone(), p.via_host.clone(), p.mode),
                None => (None, None, PipeMode::All),
            }
        };

        if via.is_some() {
            if let Some(host) = &via_host {
                if host != &self.name {
                    // The via runs elsewhere; hand the write over.
                    let mut message = PlumbMessage::new(PlumbKind::ViaWrite, &self.name, pipe);
                    message.value = value.to_string();
                    return self.send(&[host.clone()], &message).await;
                }
            }
        }

        let value = match via {
            Some(argv) => run_via(pipe, &argv, value).await?,
            None => value.to_string(),
        };
        self.schedule(pipe, &value, mode).await
    }

    // ── Scheduling ─────────────────────────────────────────────────────

    async fn schedule(
        self: &Arc<Self>,
        pipe: &str,
        value: &str,
        mode: PipeMode,
    ) -> Result<(), PlumbError> {
        match mode {
            PipeMode::All => {
                self.deliver_local(pipe, value, 0).await;
                if self.node.is_some() {
                    let mut message = PlumbMessage::new(PlumbKind::Forward, &self.name, pipe);
                    message.value = value.to_string();
                    self.broadcast(&message).await?;
                }
                Ok(())
            }
            PipeMode::RoundRobin | PipeMode::Random => {
                let mut owners: BTreeMap<u64, Option<String>> = self
                    .local_reader_ids(pipe)
                    .into_iter()
                    .map(|id| (id, None))
                    .collect();
                for (node, ids) in self.query_readers(pipe).await? {
                    for id in ids {
                        owners.entry(id).or_insert(Some(node.clone()));
                    }
                }
                if owners.is_empty() {
                    return Err(PlumbError::NoReaders(pipe.to_string()));
                }
                let ids: Vec<u64> = owners.keys().copied().collect();

                let winner = match mode {
                    PipeMode::RoundRobin => {
                        let mut pipes = self.pipes.lock().unwrap();
                        let entry = pipes.entry(pipe.to_string()).or_default();
                        let picked = pick_round_robin(&ids, entry.last_recipient)
                            .ok_or_else(|| PlumbError::NoReaders(pipe.to_string()))?;
                        entry.last_recipient = picked;
                        picked
                    }
                    _ => ids[rand::rng().random_range(0..ids.len())],
                };

                match &owners[&winner] {
                    None => {
                        self.deliver_local(pipe, value, winner).await;
                        Ok(())
                    }
                    Some(owner) => {
                        let mut message =
                            PlumbMessage::new(PlumbKind::Forward, &self.name, pipe);
                        message.value = value.to_string();
                        message.reader = winner;
                        self.send(&[owner.clone()], &message).await
                    }
                }
            }
        }
    }

    /// Deliver to local readers; `reader` 0 addresses all of them.
    async fn deliver_local(&self, pipe: &str, value: &str, reader: u64) {
        let targets: Vec<mpsc::Sender<String>> = {
            let pipes = self.pipes.lock().unwrap();
            match pipes.get(pipe) {
                Some(p) => p
                    .readers
                    .iter()
                    .filter(|(id, _)| reader == 0 || **id == reader)
                    .map(|(_, tx)| tx.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        for tx in targets {
            let _ = tx.send(value.to_string()).await;
        }
    }

    fn local_reader_ids(&self, pipe: &str) -> Vec<u64> {
        self.pipes
            .lock()
            .unwrap()
            .get(pipe)
            .map(|p| p.readers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Collect reader IDs from every node, with a per-node timeout.
    async fn query_readers(
        &self,
        pipe: &str,
    ) -> Result<Vec<(String, Vec<u64>)>, PlumbError> {
        let Some(node) = &self.node else {
            return Ok(Vec::new());
        };
        let recipients: HashSet<String> = node.effective_nodes().into_iter().collect();
        if recipients.is_empty() {
            return Ok(Vec::new());
        }

        let tid = rand::rng().random_range(0..i64::MAX);
        let (tx, mut rx) = mpsc::channel(64);
        self.tids.lock().unwrap().insert(tid, tx);

        let mut query = PlumbMessage::new(PlumbKind::Query, &self.name, pipe);
        query.tid = tid;
        let sent = self.broadcast(&query).await;
        if let Err(e) = sent {
            self.tids.lock().unwrap().remove(&tid);
            return Err(e);
        }

        let mut pending = recipients;
        let mut gathered = Vec::new();
        while !pending.is_empty() {
            match tokio::time::timeout(self.rpc_timeout, rx.recv()).await {
                Ok(Some(response)) => {
                    pending.remove(&response.from);
                    if !response.readers.is_empty() {
                        gathered.push((response.from, response.readers));
                    }
                }
                _ => break,
            }
        }
        self.tids.lock().unwrap().remove(&tid);
        Ok(gathered)
    }

    // ── Pipelines ──────────────────────────────────────────────────────

    /// Run a left-to-right pipeline of processes and pipes. Any stage
    /// failure trips the shared cancel and fails the pipeline.
    pub async fn pipeline(self: &Arc<Self>, stages: Vec<Stage>) -> Result<(), PlumbError> {
        let (cancel, _) = watch::channel(false);
        let mut upstream: Option<mpsc::Receiver<String>> = None;
        let mut workers: Vec<JoinHandle<Result<(), PlumbError>>> = Vec::new();

        for stage in stages {
            match stage {
                Stage::Command(argv) => {
                    upstream =
                        Some(self.command_stage(argv, upstream, &cancel, &mut workers)?);
                }
                Stage::Pipe(name) => {
                    upstream = Some(self.pipe_stage(name, upstream, &cancel, &mut workers));
                }
            }
        }

        // Drain whatever the last stage emits.
        if let Some(mut tail) = upstream {
            tokio::spawn(async move { while tail.recv().await.is_some() {} });
        }

        let mut failure = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    let _ = cancel.send(true);
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(PlumbError::Stage(e.to_string()));
                    }
                    let _ = cancel.send(true);
                }
            }
        }
        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn command_stage(
        &self,
        argv: Vec<String>,
        upstream: Option<mpsc::Receiver<String>>,
        cancel: &watch::Sender<bool>,
        workers: &mut Vec<JoinHandle<Result<(), PlumbError>>>,
    ) -> Result<mpsc::Receiver<String>, PlumbError> {
        let program = argv.first().ok_or(PlumbError::EmptyStage)?.clone();
        let mut command = tokio::process::Command::new(&program);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(if upstream.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = command
            .spawn()
            .map_err(|e| PlumbError::Stage(format!("{program}: {e}")))?;

        if let Some(mut rx) = upstream {
            if let Some(mut stdin) = child.stdin.take() {
                let mut cancel_rx = cancel.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel_rx.changed() => break,
                            value = rx.recv() => match value {
                                Some(value) => {
                                    let line = format!("{value}\n");
                                    if stdin.write_all(line.as_bytes()).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                });
            }
        }

        let (tx, next) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            let mut cancel_rx = cancel.subscribe();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        _ = cancel_rx.changed() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                if tx.send(line).await.is_err() {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                }
            });
        }

        let mut cancel_rx = cancel.subscribe();
        workers.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    let _ = child.kill().await;
                    Err(PlumbError::Stage(format!("{program}: cancelled")))
                }
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(PlumbError::Stage(format!("{program} exited {status}"))),
                    Err(e) => Err(PlumbError::Stage(e.to_string())),
                }
            }
        }));

        Ok(next)
    }

    fn pipe_stage(
        self: &Arc<Self>,
        name: String,
        upstream: Option<mpsc::Receiver<String>>,
        cancel: &watch::Sender<bool>,
        workers: &mut Vec<JoinHandle<Result<(), PlumbError>>>,
    ) -> mpsc::Receiver<String> {
        if let Some(mut rx) = upstream {
            let plumber = self.clone();
            let pipe = name.clone();
            let mut cancel_rx = cancel.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel_rx.changed() => break,
                        value = rx.recv() => match value {
                            Some(value) => plumber.write(&pipe, &value).await?,
                            None => break,
                        }
                    }
                }
                Ok(())
            }));
        }

        let mut reader = self.reader(&name);
        let (tx, next) = mpsc::channel(64);
        let plumber = self.clone();
        let mut cancel_rx = cancel.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    value = reader.rx.recv() => match value {
                        Some(value) => {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            plumber.unregister(&name, reader.id);
        });
        next
    }

    // ── Mesh plumbing ──────────────────────────────────────────────────

    async fn send(&self, to: &[String], message: &PlumbMessage) -> Result<(), PlumbError> {
        match &self.node {
            Some(node) => {
                node.send(to, CHANNEL, to_record(message)?).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn broadcast(&self, message: &PlumbMessage) -> Result<(), PlumbError> {
        match &self.node {
            Some(node) => {
                node.broadcast(CHANNEL, to_record(message)?).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Smallest ID strictly greater than `last`, wrapping to the smallest.
/// `ids` must be sorted ascending.
pub fn pick_round_robin(ids: &[u64], last: u64) -> Option<u64> {
    ids.iter()
        .copied()
        .find(|id| *id > last)
        .or_else(|| ids.first().copied())
}

/// Pipe one value through a via program's stdin and take its stdout.
async fn run_via(pipe: &str, argv: &[String], value: &str) -> Result<String, PlumbError> {
    let program = argv.first().ok_or(PlumbError::EmptyStage)?;
    let mut child = tokio::process::Command::new(program)
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| PlumbError::Via {
            pipe: pipe.to_string(),
            reason: e.to_string(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let line = format!("{value}\n");
        let _ = stdin.write_all(line.as_bytes()).await;
    }
    let output = child.wait_with_output().await.map_err(|e| PlumbError::Via {
        pipe: pipe.to_string(),
        reason: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(PlumbError::Via {
            pipe: pipe.to_string(),
            reason: format!("exited {}", output.status),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .trim_end_matches('\n')
        .to_string())
}

// ── Mesh message handler ───────────────────────────────────────────────

async fn serve(plumber: Arc<Plumber>, mut pump: mpsc::Receiver<ron_mesh::Delivery>) {
    while let Some(delivery) = pump.recv().await {
        let message: PlumbMessage = match from_record(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("plumb: undecodable message from {}: {e}", delivery.source);
                continue;
            }
        };
        match message.kind {
            PlumbKind::Forward => {
                plumber
                    .deliver_local(&message.pipe, &message.value, message.reader)
                    .await;
            }
            PlumbKind::Query => {
                let mut response =
                    PlumbMessage::new(PlumbKind::QueryResponse, plumber.name(), &message.pipe);
                response.tid = message.tid;
                response.readers = plumber.local_reader_ids(&message.pipe);
                if let Err(e) = plumber.send(&[message.from.clone()], &response).await {
                    tracing::debug!("plumb query response: {e}");
                }
            }
            PlumbKind::QueryResponse => {
                let waiter = plumber.tids.lock().unwrap().get(&message.tid).cloned();
                if let Some(tx) = waiter {
                    let _ = tx.send(message).await;
                }
            }
            PlumbKind::ViaWrite => {
                let plumber = plumber.clone();
                tokio::spawn(async move {
                    if let Err(e) = plumber.write(&message.pipe, &message.value).await {
                        tracing::warn!(pipe = %message.pipe, "via write: {e}");
                    }
                });
            }
            PlumbKind::ViaHost => {
                let mut pipes = plumber.pipes.lock().unwrap();
                let entry = pipes.entry(message.pipe.clone()).or_default();
                entry.via = Some(message.via);
                entry.via_host = Some(message.host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_picks_next_greater_then_wraps() {
        let ids = [3, 7, 12];
        assert_eq!(pick_round_robin(&ids, 0), Some(3));
        assert_eq!(pick_round_robin(&ids, 3), Some(7));
        assert_eq!(pick_round_robin(&ids, 7), Some(12));
        assert_eq!(pick_round_robin(&ids, 12), Some(3));
        assert_eq!(pick_round_robin(&[], 5), None);
    }

    #[tokio::test]
    async fn all_mode_reaches_every_local_reader() {
        let plumber = Plumber::local("solo");
        let mut first = plumber.reader("events");
        let mut second = plumber.reader("events");

        plumber.write("events", "boot").await.unwrap();

        assert_eq!(first.rx.recv().await.unwrap(), "boot");
        assert_eq!(second.rx.recv().await.unwrap(), "boot");
    }

    #[tokio::test]
    async fn round_robin_alternates_readers() {
        let plumber = Plumber::local("solo");
        plumber.set_mode("jobs", PipeMode::RoundRobin);
        let mut first = plumber.reader("jobs");
        let mut second = plumber.reader("jobs");

        plumber.write("jobs", "one").await.unwrap();
        plumber.write("jobs", "two").await.unwrap();

        // IDs are allocated in order, so delivery alternates.
        assert_eq!(first.rx.recv().await.unwrap(), "one");
        assert_eq!(second.rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn round_robin_without_readers_errors() {
        let plumber = Plumber::local("solo");
        plumber.set_mode("empty", PipeMode::RoundRobin);
        assert!(matches!(
            plumber.write("empty", "lost").await,
            Err(PlumbError::NoReaders(_))
        ));
    }

    #[tokio::test]
    async fn close_pipe_closes_reader_channels() {
        let plumber = Plumber::local("solo");
        let mut reader = plumber.reader("doomed");
        plumber.close_pipe("doomed");
        assert!(reader.rx.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn via_transforms_values() {
        let plumber = Plumber::local("solo");
        let mut reader = plumber.reader("shout");
        plumber
            .set_via("shout", vec!["tr".into(), "a-z".into(), "A-Z".into()])
            .await
            .unwrap();

        plumber.write("shout", "quiet").await.unwrap();
        assert_eq!(reader.rx.recv().await.unwrap(), "QUIET");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipeline_feeds_commands_into_pipes() {
        let plumber = Plumber::local("solo");
        let mut sink = plumber.reader("sink");

        plumber
            .pipeline(vec![
                Stage::Command(vec!["echo".into(), "hello".into()]),
                Stage::Pipe("sink".into()),
            ])
            .await
            .unwrap();

        assert_eq!(sink.rx.recv().await.unwrap(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipeline_failure_is_reported() {
        let plumber = Plumber::local("solo");
        let result = plumber
            .pipeline(vec![Stage::Command(vec!["false".into()])])
            .await;
        assert!(matches!(result, Err(PlumbError::Stage(_))));
    }
}
