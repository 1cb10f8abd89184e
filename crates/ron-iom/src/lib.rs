//! IOM: content-addressed file distribution over the mesh.
//!
//! Every node exposes a base directory; files are addressable by relative
//! path. Discovery (INFO), part location (WHOHAS), and chunked pulls
//! (XFER) flow over the mesh as TID-correlated request/response pairs.
//! Relayed parts are snooped opportunistically when hashing is on.

pub mod error;
pub mod message;
pub mod transfer;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, RwLock, Semaphore};

use ron_mesh::Node;
use ron_proto::{from_record, to_record, PART_SIZE};

pub use error::IomError;
pub use message::{FileInfo, IomKind, IomMessage, CHANNEL};
pub use transfer::{select_version, Transfer, NO_PART};

// ── Configuration ──────────────────────────────────────────────────────

/// File fabric configuration. Builder pattern; defaults match a
/// well-provisioned cluster node.
#[derive(Debug, Clone)]
pub struct IomConfig {
    /// Base directory this node serves and fetches into.
    pub base: PathBuf,
    /// Concurrent transfers per node.
    pub transfer_queue: usize,
    /// Content hashing; disabling it also disables snooping.
    pub hashing: bool,
    /// Preferred source whenever its version differs from local.
    pub head_node: Option<String>,
    /// Per-RPC deadline.
    pub rpc_timeout: Duration,
    /// Attempts per part before the pull fails.
    pub attempts: usize,
}

impl IomConfig {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            transfer_queue: 3,
            hashing: true,
            head_node: None,
            rpc_timeout: Duration::from_secs(30),
            attempts: 3,
        }
    }

    pub fn transfer_queue(mut self, depth: usize) -> Self {
        self.transfer_queue = depth;
        self
    }

    pub fn hashing(mut self, enabled: bool) -> Self {
        self.hashing = enabled;
        self
    }

    pub fn head_node(mut self, node: impl Into<String>) -> Self {
        self.head_node = Some(node.into());
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

// ── Fabric ─────────────────────────────────────────────────────────────

/// One node's view of the file fabric.
pub struct Iom {
    node: Node,
    config: IomConfig,
    tids: Mutex<HashMap<i64, mpsc::Sender<IomMessage>>>,
    transfers: Mutex<HashMap<String, Transfer>>,
    queue: Semaphore,
    /// Snoop writers hold this shared; assembly and cleanup exclusive.
    drain: RwLock<()>,
}

impl Iom {
    /// Attach the fabric to a mesh node and start serving.
    pub fn start(node: Node, config: IomConfig) -> Result<Arc<Self>, IomError> {
        std::fs::create_dir_all(&config.base)?;
        std::fs::create_dir_all(config.base.join(".transfers"))?;

        let pump = node.listen(CHANNEL);
        let iom = Arc::new(Self {
            queue: Semaphore::new(config.transfer_queue),
            node,
            config,
            tids: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            drain: RwLock::new(()),
        });

        if iom.config.hashing {
            iom.node.set_relay_hook(snoop_hook(Arc::downgrade(&iom)));
        }
        tokio::spawn(serve(iom.clone(), pump));
        Ok(iom)
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn base(&self) -> &Path {
        &self.config.base
    }

    // ── Info ───────────────────────────────────────────────────────────

    /// Broadcast an INFO query and gather what each node advertises.
    pub async fn info(&self, path: &str) -> Result<Vec<FileInfo>, IomError> {
        let (files, _) = self.query_info(path).await?;
        Ok(files)
    }

    async fn query_info(
        &self,
        path: &str,
    ) -> Result<(Vec<FileInfo>, BTreeSet<String>), IomError> {
        let recipients: HashSet<String> = self.node.effective_nodes().into_iter().collect();
        if recipients.is_empty() {
            return Ok((Vec::new(), BTreeSet::new()));
        }

        let tid = new_tid();
        let mut rx = self.register_tid(tid);
        let mut query = IomMessage::new(IomKind::Info, self.name(), tid);
        query.filename = path.to_string();
        self.node.broadcast(CHANNEL, to_record(&query)?).await?;

        let mut pending = recipients;
        let mut files = Vec::new();
        let mut matches = BTreeSet::new();
        while !pending.is_empty() {
            match tokio::time::timeout(self.config.rpc_timeout, rx.recv()).await {
                Ok(Some(response)) => {
                    pending.remove(&response.from);
                    if !response.ack {
                        continue;
                    }
                    if response.glob.is_empty() {
                        files.push(FileInfo {
                            name: response.filename,
                            size: response.size,
                            parts: response.parts,
                            perm: response.perm,
                            modtime: response.modtime,
                            hash: response.hash,
                            from: response.from,
                        });
                    } else {
                        matches.extend(response.glob);
                    }
                }
                // A silent responder; the rest would be just as late.
                _ => break,
            }
        }
        self.unregister_tid(tid);
        Ok((files, matches))
    }

    // ── Get ────────────────────────────────────────────────────────────

    /// Fetch a file (or glob, or directory) from the fabric into the
    /// local base directory.
    pub async fn get(self: &Arc<Self>, path: &str) -> Result<(), IomError> {
        let (files, matches) = self.query_info(path).await?;
        if files.is_empty() && matches.is_empty() {
            return Err(IomError::NotFound(path.to_string()));
        }

        for matched in &matches {
            Box::pin(self.get(matched)).await?;
        }

        let mut by_name: BTreeMap<String, Vec<FileInfo>> = BTreeMap::new();
        for file in files {
            by_name.entry(file.name.clone()).or_default().push(file);
        }

        for (name, candidates) in by_name {
            let local_hash = if self.config.hashing {
                local_hash(&self.config.base, &name)
            } else {
                None
            };
            let picked = select_version(
                &candidates,
                self.config.head_node.as_deref(),
                self.config.hashing,
                local_hash.as_deref(),
            );
            let Some(picked) = picked else { continue };
            if self.config.hashing && local_hash.as_deref() == Some(picked.hash.as_str()) {
                continue; // already current
            }
            self.fetch(picked).await?;
        }
        Ok(())
    }

    /// Pull one advertised version into place.
    async fn fetch(self: &Arc<Self>, info: FileInfo) -> Result<(), IomError> {
        let filename = info.name.clone();
        let dir = self
            .config
            .base
            .join(".transfers")
            .join(format!("{:016x}", rand::random::<u64>()));
        {
            let mut transfers = self.transfers.lock().unwrap();
            if transfers.contains_key(&filename) {
                return Ok(()); // someone is already pulling it
            }
            transfers.insert(filename.clone(), Transfer::new(dir.clone(), info.parts));
        }
        if let Err(e) = std::fs::create_dir_all(&dir) {
            self.transfers.lock().unwrap().remove(&filename);
            return Err(e.into());
        }

        let result = async {
            let _permit = self
                .queue
                .acquire()
                .await
                .map_err(|_| IomError::Shutdown)?;
            if let Some(transfer) = self.transfers.lock().unwrap().get_mut(&filename) {
                transfer.queued = false;
            }
            self.pull(&info, &dir).await
        }
        .await;

        // Cleanup under the write-drain lock so snoop writers can't race.
        let _guard = self.drain.write().await;
        self.transfers.lock().unwrap().remove(&filename);
        let _ = std::fs::remove_dir_all(&dir);
        result
    }

    async fn pull(self: &Arc<Self>, info: &FileInfo, dir: &Path) -> Result<(), IomError> {
        let destination = self
            .clean(&info.name)
            .ok_or_else(|| IomError::InvalidPath(info.name.clone()))?;

        if info.parts == 0 {
            // Zero-byte file with the advertised permission.
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&destination, b"")?;
            set_perm(&destination, info.perm)?;
            return Ok(());
        }

        let mut order: Vec<i64> = (0..info.parts).collect();
        {
            use rand::seq::SliceRandom;
            order.shuffle(&mut rand::rng());
        }

        let basename = basename(&info.name);
        for part in order {
            let snooped = {
                let mut transfers = self.transfers.lock().unwrap();
                let transfer = transfers.get_mut(&info.name);
                match transfer {
                    Some(t) if t.completed.contains(&part) => true,
                    Some(t) => {
                        t.inflight = part;
                        false
                    }
                    None => false,
                }
            };
            if snooped {
                continue;
            }

            let mut fetched = false;
            for attempt in 1..=self.config.attempts {
                match self.fetch_part(&info.name, part, &info.hash).await {
                    Ok(data) => {
                        let _shared = self.drain.read().await;
                        let path = dir.join(format!("{basename}.part_{part}"));
                        std::fs::write(&path, &data)?;
                        if let Some(t) = self.transfers.lock().unwrap().get_mut(&info.name) {
                            t.completed.insert(part);
                            t.inflight = NO_PART;
                        }
                        fetched = true;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(file = %info.name, part, attempt, "part pull failed: {e}");
                    }
                }
            }
            if !fetched {
                if let Some(t) = self.transfers.lock().unwrap().get_mut(&info.name) {
                    t.inflight = NO_PART;
                }
                return Err(IomError::PartFailed {
                    file: info.name.clone(),
                    part,
                });
            }
        }

        // Quiesce snoop writers before touching the part files.
        drop(self.drain.write().await);
        self.assemble(info, dir, &destination).await
    }

    /// Concatenate completed parts and move the file into place.
    /// Permission bits are set last.
    async fn assemble(
        &self,
        info: &FileInfo,
        dir: &Path,
        destination: &Path,
    ) -> Result<(), IomError> {
        let staging = dir.join("assembled");
        let basename = basename(&info.name);
        let dir = dir.to_path_buf();
        let parts = info.parts;
        let staging_clone = staging.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut out = std::fs::File::create(&staging_clone)?;
            for part in 0..parts {
                let path = dir.join(format!("{basename}.part_{part}"));
                let mut input = std::fs::File::open(&path)?;
                std::io::copy(&mut input, &mut out)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| IomError::Io(std::io::Error::other(e)))??;

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&staging, destination)?;
        set_perm(destination, info.perm)?;
        Ok(())
    }

    /// Locate and pull one part: WHOHAS to everyone (pinned to the
    /// selected version's hash), XFER from the first acker.
    async fn fetch_part(
        &self,
        filename: &str,
        part: i64,
        hash: &str,
    ) -> Result<Vec<u8>, IomError> {
        let tid = new_tid();
        let mut rx = self.register_tid(tid);
        let mut query = IomMessage::new(IomKind::WhoHas, self.name(), tid);
        query.filename = filename.to_string();
        query.part = part;
        query.hash = hash.to_string();
        let sent = self.node.broadcast(CHANNEL, to_record(&query)?).await;
        if let Err(e) = sent {
            self.unregister_tid(tid);
            return Err(e.into());
        }

        let source = loop {
            match tokio::time::timeout(self.config.rpc_timeout, rx.recv()).await {
                Ok(Some(response)) if response.ack => break Some(response.from),
                Ok(Some(_)) => continue, // a NACK; keep listening
                _ => break None,
            }
        };
        self.unregister_tid(tid);
        let source = source.ok_or_else(|| IomError::NoSource {
            file: filename.to_string(),
            part,
        })?;

        let tid = new_tid();
        let mut rx = self.register_tid(tid);
        let mut request = IomMessage::new(IomKind::Xfer, self.name(), tid);
        request.filename = filename.to_string();
        request.part = part;
        let sent = self
            .node
            .send(&[source.clone()], CHANNEL, to_record(&request)?)
            .await;
        if let Err(e) = sent {
            self.unregister_tid(tid);
            return Err(e.into());
        }

        let reply = tokio::time::timeout(self.config.rpc_timeout, rx.recv()).await;
        self.unregister_tid(tid);
        match reply {
            Ok(Some(response)) if response.ack => Ok(response.data),
            // The source lost the file mid-pull; fail the part silently.
            _ => Err(IomError::NoSource {
                file: filename.to_string(),
                part,
            }),
        }
    }

    // ── Stream ─────────────────────────────────────────────────────────

    /// Read a single file part-by-part in order, without touching disk.
    pub async fn stream(
        self: &Arc<Self>,
        path: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, IomError> {
        let (files, _) = self.query_info(path).await?;
        let local_hash = if self.config.hashing {
            local_hash(&self.config.base, path)
        } else {
            None
        };
        let picked = select_version(
            &files,
            self.config.head_node.as_deref(),
            self.config.hashing,
            local_hash.as_deref(),
        )
        .ok_or_else(|| IomError::NotFound(path.to_string()))?;

        let (tx, rx) = mpsc::channel(4);
        let iom = self.clone();
        tokio::spawn(async move {
            for part in 0..picked.parts {
                match iom.fetch_part(&picked.name, part, &picked.hash).await {
                    Ok(data) => {
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(file = %picked.name, part, "stream: {e}");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    // ── Delete ─────────────────────────────────────────────────────────

    /// Delete a path under the base. A request naming the base itself
    /// empties its contents instead of removing the root.
    pub async fn delete(&self, path: &str) -> Result<(), IomError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() || trimmed == "." {
            for entry in std::fs::read_dir(&self.config.base)? {
                let entry = entry?;
                if entry.file_name() == ".transfers" {
                    continue;
                }
                let target = entry.path();
                if target.is_dir() {
                    std::fs::remove_dir_all(&target)?;
                } else {
                    std::fs::remove_file(&target)?;
                }
            }
            return Ok(());
        }
        let full = self
            .clean(trimmed)
            .ok_or_else(|| IomError::InvalidPath(path.to_string()))?;
        if full.is_dir() {
            std::fs::remove_dir_all(&full)?;
        } else {
            std::fs::remove_file(&full)?;
        }
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn clean(&self, name: &str) -> Option<PathBuf> {
        clean_relative(name).map(|rel| self.config.base.join(rel))
    }

    fn register_tid(&self, tid: i64) -> mpsc::Receiver<IomMessage> {
        let (tx, rx) = mpsc::channel(64);
        self.tids.lock().unwrap().insert(tid, tx);
        rx
    }

    fn unregister_tid(&self, tid: i64) {
        self.tids.lock().unwrap().remove(&tid);
    }
}

/// 63-bit random transaction ID.
fn new_tid() -> i64 {
    rand::rng().random_range(0..i64::MAX)
}

// ── Responder ──────────────────────────────────────────────────────────

async fn serve(iom: Arc<Iom>, mut pump: mpsc::Receiver<ron_mesh::Delivery>) {
    while let Some(delivery) = pump.recv().await {
        let message: IomMessage = match from_record(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("iom: undecodable message from {}: {e}", delivery.source);
                continue;
            }
        };
        match message.kind {
            IomKind::Info => respond_info(&iom, message).await,
            IomKind::WhoHas => respond_whohas(&iom, message).await,
            IomKind::Xfer => respond_xfer(&iom, message).await,
            IomKind::Response => {
                let waiter = iom.tids.lock().unwrap().get(&message.tid).cloned();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message).await;
                    }
                    None => {} // unknown TID: drop silently
                }
            }
        }
    }
}

async fn reply(iom: &Arc<Iom>, to: &str, message: IomMessage) {
    let Ok(body) = to_record(&message) else { return };
    if let Err(e) = iom.node.send(&[to.to_string()], CHANNEL, body).await {
        tracing::debug!(to, "iom reply failed: {e}");
    }
}

async fn respond_info(iom: &Arc<Iom>, query: IomMessage) {
    let iom_clone = iom.clone();
    let filename = query.filename.clone();
    let tid = query.tid;
    let built = tokio::task::spawn_blocking(move || {
        build_info_response(&iom_clone.config, iom_clone.name(), tid, &filename)
    })
    .await;
    let response = match built {
        Ok(response) => response,
        Err(_) => IomMessage::nack(iom.name(), query.tid, query.filename),
    };
    reply(iom, &query.from, response).await;
}

fn build_info_response(config: &IomConfig, name: &str, tid: i64, filename: &str) -> IomMessage {
    let Some(rel) = clean_relative(filename) else {
        return IomMessage::nack(name, tid, filename);
    };
    let full = config.base.join(&rel);

    if full.is_file() {
        return match file_info(config, &full, filename) {
            Some(info) => info_response(name, tid, info),
            None => IomMessage::nack(name, tid, filename),
        };
    }

    if full.is_dir() {
        let matches = walk_relative(&config.base, Some(&rel));
        if matches.is_empty() {
            return IomMessage::nack(name, tid, filename);
        }
        let mut response = IomMessage::new(IomKind::Response, name, tid);
        response.filename = filename.to_string();
        response.glob = matches;
        response.ack = true;
        return response;
    }

    if filename.contains(['*', '?', '[']) {
        if let Ok(glob) = globset::Glob::new(filename) {
            let matcher = glob.compile_matcher();
            let matches: Vec<String> = walk_relative(&config.base, None)
                .into_iter()
                .filter(|candidate| matcher.is_match(candidate))
                .collect();
            if !matches.is_empty() {
                let mut response = IomMessage::new(IomKind::Response, name, tid);
                response.filename = filename.to_string();
                response.glob = matches;
                response.ack = true;
                return response;
            }
        }
    }

    IomMessage::nack(name, tid, filename)
}

fn info_response(name: &str, tid: i64, info: FileInfo) -> IomMessage {
    let mut response = IomMessage::new(IomKind::Response, name, tid);
    response.filename = info.name;
    response.parts = info.parts;
    response.size = info.size;
    response.perm = info.perm;
    response.modtime = info.modtime;
    response.hash = info.hash;
    response.ack = true;
    response
}

async fn respond_whohas(iom: &Arc<Iom>, query: IomMessage) {
    let Some(full) = iom.clean(&query.filename) else {
        reply(iom, &query.from.clone(), IomMessage::nack(iom.name(), query.tid, query.filename)).await;
        return;
    };

    // When the query pins a hash, only a matching version answers.
    let version_matches = query.hash.is_empty()
        || !iom.config.hashing
        || hash_file(&full).map(|h| h == query.hash).unwrap_or(false);
    let have_whole_file = full.is_file() && part_in_range(&full, query.part) && version_matches;
    let have_part = have_whole_file || {
        let transfers = iom.transfers.lock().unwrap();
        transfers
            .get(&query.filename)
            .map(|t| t.completed.contains(&query.part))
            .unwrap_or(false)
    };

    let mut response = IomMessage::new(IomKind::Response, iom.name(), query.tid);
    response.filename = query.filename;
    response.part = query.part;
    response.ack = have_part;
    reply(iom, &query.from, response).await;
}

async fn respond_xfer(iom: &Arc<Iom>, query: IomMessage) {
    let data = match iom.clean(&query.filename) {
        Some(full) if full.is_file() => {
            let part = query.part;
            tokio::task::spawn_blocking(move || read_part(&full, part))
                .await
                .ok()
                .and_then(|r| r.ok())
        }
        _ => {
            // Maybe a transfer we hold parts of.
            let staged = {
                let transfers = iom.transfers.lock().unwrap();
                transfers.get(&query.filename).and_then(|t| {
                    t.completed.contains(&query.part).then(|| {
                        t.dir
                            .join(format!("{}.part_{}", basename(&query.filename), query.part))
                    })
                })
            };
            match staged {
                Some(path) => tokio::fs::read(path).await.ok(),
                None => None,
            }
        }
    };

    let mut response = IomMessage::new(IomKind::Response, iom.name(), query.tid);
    response.filename = query.filename;
    response.part = query.part;
    match data {
        Some(data) => {
            response.data = data;
            response.ack = true;
        }
        None => response.ack = false,
    }
    reply(iom, &query.from, response).await;
}

// ── Snooping ───────────────────────────────────────────────────────────

/// Observe relayed RESPONSE parts for our own in-flight transfers.
/// Pure optimization; correctness never depends on it.
fn snoop_hook(iom: Weak<Iom>) -> ron_mesh::RelayHook {
    Arc::new(move |_source: &str, channel: &str, body: &[u8]| {
        if channel != CHANNEL {
            return;
        }
        let Some(iom) = iom.upgrade() else { return };
        let Ok(message) = from_record::<IomMessage>(body) else {
            return;
        };
        if message.kind != IomKind::Response || message.data.is_empty() {
            return;
        }

        let claimed = {
            let mut transfers = iom.transfers.lock().unwrap();
            match transfers.get_mut(&message.filename) {
                Some(transfer) => {
                    if transfer.claim_snoop(message.part) {
                        Some(transfer.dir.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        let Some(dir) = claimed else { return };

        tokio::spawn(async move {
            let _shared = iom.drain.read().await;
            let path = dir.join(format!(
                "{}.part_{}",
                basename(&message.filename),
                message.part
            ));
            if let Err(e) = tokio::fs::write(&path, &message.data).await {
                tracing::debug!(file = %message.filename, part = message.part, "snoop write: {e}");
                if let Some(t) = iom.transfers.lock().unwrap().get_mut(&message.filename) {
                    t.unclaim(message.part);
                }
            } else {
                tracing::debug!(file = %message.filename, part = message.part, "snooped part");
            }
        });
    })
}

// ── Filesystem helpers ─────────────────────────────────────────────────

/// Normalize a wire path to a safe base-relative path.
fn clean_relative(name: &str) -> Option<PathBuf> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let mut cleaned = PathBuf::new();
    for component in trimmed.split('/') {
        match component {
            "" | "." => {}
            ".." => return None,
            part => cleaned.push(part),
        }
    }
    Some(cleaned)
}

fn basename(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

/// All regular files under the base (or a subdirectory of it), as
/// forward-slash base-relative paths. Transfer staging stays hidden.
fn walk_relative(base: &Path, under: Option<&Path>) -> Vec<String> {
    let root = match under {
        Some(sub) => base.join(sub),
        None => base.to_path_buf(),
    };
    let mut found = Vec::new();
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            if hidden {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(base) {
                let joined = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                found.push(joined);
            }
        }
    }
    found.sort();
    found
}

fn file_info(config: &IomConfig, full: &Path, wire_name: &str) -> Option<FileInfo> {
    let metadata = std::fs::metadata(full).ok()?;
    let size = metadata.len();
    let modtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let hash = if config.hashing {
        hash_file(full).unwrap_or_default()
    } else {
        String::new()
    };
    Some(FileInfo {
        name: wire_name.to_string(),
        size,
        parts: part_count(size),
        perm: permission_bits(&metadata),
        modtime,
        hash,
        from: String::new(),
    })
}

pub fn part_count(size: u64) -> i64 {
    size.div_ceil(PART_SIZE as u64) as i64
}

fn part_in_range(path: &Path, part: i64) -> bool {
    match std::fs::metadata(path) {
        Ok(metadata) => part >= 0 && part < part_count(metadata.len()),
        Err(_) => false,
    }
}

fn read_part(path: &Path, part: i64) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(part as u64 * PART_SIZE as u64))?;
    let mut data = vec![0u8; PART_SIZE];
    let mut filled = 0;
    while filled < data.len() {
        let n = file.read(&mut data[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

/// SHA-256 of a file, hex encoded.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    use sha2::{Digest, Sha256};
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn local_hash(base: &Path, name: &str) -> Option<String> {
    let rel = clean_relative(name)?;
    let full = base.join(rel);
    full.is_file().then(|| hash_file(&full).ok()).flatten()
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

#[cfg(unix)]
fn set_perm(path: &Path, perm: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(perm))
}

#[cfg(not(unix))]
fn set_perm(_path: &Path, _perm: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_rejects_traversal() {
        assert!(clean_relative("../etc/passwd").is_none());
        assert!(clean_relative("a/../../b").is_none());
        assert!(clean_relative("").is_none());
        assert_eq!(
            clean_relative("/images//disk.qcow2"),
            Some(PathBuf::from("images/disk.qcow2"))
        );
    }

    #[test]
    fn part_counting() {
        assert_eq!(part_count(0), 0);
        assert_eq!(part_count(1), 1);
        assert_eq!(part_count(PART_SIZE as u64), 1);
        assert_eq!(part_count(PART_SIZE as u64 + 1), 2);
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("a/b/c.bin"), "c.bin");
        assert_eq!(basename("plain"), "plain");
    }

    #[test]
    fn tids_are_non_negative() {
        for _ in 0..64 {
            assert!(new_tid() >= 0);
        }
    }
}
