//! Controller core: listens for agents, fans out filtered commands,
//! collects responses, serves files, and trunks tunnels, pipes, and the
//! file-server relay over each session.

pub mod error;
pub mod files;
pub mod registry;
mod responses;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use ron_plumb::Plumber;
use ron_proto::{
    handshake_accept, mangle_uuid, normalize_uuid, ClientSnapshot, Command, Decoder, Message,
    Payload, PipeFrame, PipeOp, ProtoError, Sender, Trunk, UfsFrame, UfsOp, VERSION,
};
use ron_tunnel::Tunnel;

pub use error::ControllerError;
pub use registry::CommandRegistry;

/// Byte stream from an agent.
pub trait ClientStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ClientStream for T {}
type BoxedConn = Box<dyn ClientStream>;

// ── VM catalog collaborator ────────────────────────────────────────────

/// What the controller knows about a registered VM.
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub uuid: String,
    pub namespace: String,
}

/// The opaque VM-runtime collaborator: UUID verification at handshake
/// and tag push-back from heartbeats.
pub trait VmCatalog: Send + Sync {
    fn lookup(&self, uuid: &str) -> Option<VmInfo>;
    fn set_tag(&self, _uuid: &str, _key: &str, _value: &str) {}
}

/// Accepts any agent into the default namespace.
pub struct PermissiveCatalog;

impl VmCatalog for PermissiveCatalog {
    fn lookup(&self, uuid: &str) -> Option<VmInfo> {
        Some(VmInfo {
            uuid: uuid.to_string(),
            namespace: String::new(),
        })
    }
}

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Base directory for served files and response fan-in.
    pub base: PathBuf,
    /// HEARTBEAT send period per client.
    pub heartbeat_period: Duration,
    /// Reaper wake period.
    pub reap_period: Duration,
    /// A client silent longer than this is purged.
    pub client_timeout: Duration,
}

impl ControllerConfig {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            heartbeat_period: Duration::from_secs(5),
            reap_period: Duration::from_secs(30),
            client_timeout: Duration::from_secs(30),
        }
    }

    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn reaper(mut self, period: Duration, timeout: Duration) -> Self {
        self.reap_period = period;
        self.client_timeout = timeout;
        self
    }
}

// ── Connection entry ───────────────────────────────────────────────────

struct ClientEntry {
    uuid: String,
    namespace: String,
    /// The wire carried the byte-swapped UUID form.
    mangled: bool,
    version: String,
    out: mpsc::Sender<Message>,
    max_command_id: u64,
    last_checkin: Instant,
    cancel: watch::Sender<bool>,
    snapshot: ClientSnapshot,
    /// Feeder into the tunnel trunk, once a tunnel exists.
    tunnel_in: Option<mpsc::Sender<Vec<u8>>>,
    tunnel: Option<Arc<Tunnel>>,
    tunnel_tasks: Vec<JoinHandle<()>>,
    /// Feeder into the UFS listener's accepted socket.
    ufs_in: Option<mpsc::Sender<Vec<u8>>>,
    ufs_task: Option<JoinHandle<()>>,
    /// pipe name → (plumber reader id, forwarder task).
    pipe_readers: HashMap<String, (u64, JoinHandle<()>)>,
}

// ── Controller ─────────────────────────────────────────────────────────

pub struct Controller {
    config: ControllerConfig,
    catalog: Arc<dyn VmCatalog>,
    plumber: Arc<Plumber>,
    clients: Mutex<HashMap<String, ClientEntry>>,
    commands: Mutex<CommandRegistry>,
    responses_tx: Mutex<Option<mpsc::Sender<responses::CheckIn>>>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes tunnel creation per controller.
    tunnel_init: AsyncMutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Controller {
    pub fn start(
        config: ControllerConfig,
        catalog: Arc<dyn VmCatalog>,
        plumber: Arc<Plumber>,
    ) -> Result<Arc<Self>, ControllerError> {
        std::fs::create_dir_all(&config.base)?;
        let (responses_tx, responses_rx) = mpsc::channel(1024);
        let (shutdown, _) = watch::channel(false);

        let controller = Arc::new(Self {
            config,
            catalog,
            plumber,
            clients: Mutex::new(HashMap::new()),
            commands: Mutex::new(CommandRegistry::new()),
            responses_tx: Mutex::new(Some(responses_tx)),
            listener_tasks: Mutex::new(Vec::new()),
            conn_tasks: Mutex::new(Vec::new()),
            tunnel_init: AsyncMutex::new(()),
            shutdown,
        });

        tokio::spawn(responses::drain(controller.clone(), responses_rx));
        tokio::spawn(reaper(controller.clone()));
        Ok(controller)
    }

    // ── Listeners ──────────────────────────────────────────────────────

    /// Accept agents over TCP. Returns the bound port.
    pub async fn listen_tcp(self: &Arc<Self>, port: u16) -> Result<u16, ControllerError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound = listener.local_addr()?.port();
        let controller = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { break };
                controller.spawn_conn(Box::new(stream));
            }
        });
        self.listener_tasks.lock().unwrap().push(task);
        Ok(bound)
    }

    /// Accept agents over a unix socket.
    pub async fn listen_unix(self: &Arc<Self>, path: PathBuf) -> Result<(), ControllerError> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        let controller = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { break };
                controller.spawn_conn(Box::new(stream));
            }
        });
        self.listener_tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Keep dialing a serial device, serving each session as it comes up.
    pub fn dial_serial(self: &Arc<Self>, device: PathBuf) {
        let controller = self.clone();
        let task = tokio::spawn(async move {
            let mut shutdown_rx = controller.shutdown.subscribe();
            loop {
                if *controller.shutdown.borrow() {
                    break;
                }
                match tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&device)
                    .await
                {
                    Ok(file) => {
                        serve_conn(controller.clone(), Box::new(file)).await;
                    }
                    Err(e) => tracing::debug!(device = %device.display(), "serial open: {e}"),
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        });
        self.listener_tasks.lock().unwrap().push(task);
    }

    fn spawn_conn(self: &Arc<Self>, stream: BoxedConn) {
        let controller = self.clone();
        let task = tokio::spawn(async move {
            serve_conn(controller, stream).await;
        });
        self.conn_tasks.lock().unwrap().push(task);
    }

    // ── Commands ───────────────────────────────────────────────────────

    /// Register a command and fan it out to every matching client.
    pub async fn new_command(&self, command: Command) -> u64 {
        let id = self.commands.lock().unwrap().insert(command);
        self.fan_out(None).await;
        id
    }

    pub fn delete_command(&self, id: u64) -> bool {
        self.commands.lock().unwrap().delete(id)
    }

    /// Drop every command and reset each client's high-water mark.
    pub fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
        for entry in self.clients.lock().unwrap().values_mut() {
            entry.max_command_id = 0;
        }
    }

    pub fn command(&self, id: u64) -> Option<Command> {
        self.commands.lock().unwrap().get(id).cloned()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().commands().cloned().collect()
    }

    /// Current snapshots of every connected client.
    pub fn clients(&self) -> Vec<ClientSnapshot> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect()
    }

    /// Build per-client views and send them. `only` limits the fan-out
    /// to one client (a fresh connection).
    async fn fan_out(&self, only: Option<&str>) {
        let sends: Vec<(mpsc::Sender<Message>, Message)> = {
            let mut commands = self.commands.lock().unwrap();
            let mut clients = self.clients.lock().unwrap();
            clients
                .values_mut()
                .filter(|entry| only.is_none_or(|uuid| entry.uuid == uuid))
                .filter_map(|entry| {
                    let view = commands.view_for(&entry.snapshot, &mut entry.max_command_id);
                    if view.is_empty() {
                        return None;
                    }
                    let message = Message::new(&entry.uuid, Payload::Commands(view));
                    Some((entry.out.clone(), message))
                })
                .collect()
        };
        for (out, message) in sends {
            let _ = out.send(message).await;
        }
    }

    /// Post a no-op command and wait until every connected client acks it.
    pub async fn checkpoint(&self, deadline: Duration) -> Result<(), ControllerError> {
        let expected: HashSet<String> = self.clients.lock().unwrap().keys().cloned().collect();
        let id = self.new_command(Command::default()).await;
        let start = Instant::now();
        loop {
            let acked: HashSet<String> = self
                .command(id)
                .map(|c| c.checked_in.into_iter().collect())
                .unwrap_or_default();
            let missing = expected.difference(&acked).count();
            if missing == 0 {
                return Ok(());
            }
            if start.elapsed() > deadline {
                return Err(ControllerError::Checkpoint(missing));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // ── Tunnels ────────────────────────────────────────────────────────

    /// Forward a controller-side port to `host:port` as seen by the
    /// agent. Returns the bound local port.
    pub async fn tunnel_forward(
        self: &Arc<Self>,
        uuid: &str,
        source_port: u16,
        host: &str,
        port: u16,
    ) -> Result<u16, ControllerError> {
        let tunnel = self.ensure_tunnel(uuid).await?;
        Ok(tunnel.forward(source_port, host, port).await?)
    }

    /// Ask the agent to listen on `source_port` and forward back to
    /// `host:port` as seen from here.
    pub async fn tunnel_reverse(
        self: &Arc<Self>,
        uuid: &str,
        source_port: u16,
        host: &str,
        port: u16,
    ) -> Result<(), ControllerError> {
        let tunnel = self.ensure_tunnel(uuid).await?;
        Ok(tunnel.reverse(source_port, host, port).await?)
    }

    async fn ensure_tunnel(self: &Arc<Self>, uuid: &str) -> Result<Arc<Tunnel>, ControllerError> {
        let _guard = self.tunnel_init.lock().await;
        let (out, existing) = {
            let clients = self.clients.lock().unwrap();
            let entry = clients
                .get(uuid)
                .ok_or_else(|| ControllerError::NoSuchClient(uuid.to_string()))?;
            (entry.out.clone(), entry.tunnel.clone())
        };
        if let Some(tunnel) = existing {
            return Ok(tunnel);
        }

        let (trunk, transport) = Trunk::new(uuid, out, Payload::Tunnel);
        let (tunnel_in, mut feed_rx) = mpsc::channel::<Vec<u8>>(1024);
        let feeder = tokio::spawn(async move {
            let mut trunk = trunk;
            while let Some(bytes) = feed_rx.recv().await {
                if trunk.deliver(&bytes).await.is_err() {
                    break;
                }
            }
            trunk.close().await;
        });
        {
            let mut clients = self.clients.lock().unwrap();
            let entry = clients
                .get_mut(uuid)
                .ok_or_else(|| ControllerError::NoSuchClient(uuid.to_string()))?;
            entry.tunnel_in = Some(tunnel_in);
            entry.tunnel_tasks.push(feeder);
        }

        let tunnel = Arc::new(Tunnel::dial(transport).await?);
        let mut clients = self.clients.lock().unwrap();
        let entry = clients
            .get_mut(uuid)
            .ok_or_else(|| ControllerError::NoSuchClient(uuid.to_string()))?;
        entry.tunnel = Some(tunnel.clone());
        Ok(tunnel)
    }

    // ── UFS relay ──────────────────────────────────────────────────────

    /// Listen locally and relay the accepted connection's bytes over the
    /// client's UFS channel. One connection at a time.
    pub async fn ufs_listen(
        self: &Arc<Self>,
        uuid: &str,
        port: u16,
    ) -> Result<u16, ControllerError> {
        let out = {
            let clients = self.clients.lock().unwrap();
            clients
                .get(uuid)
                .map(|entry| entry.out.clone())
                .ok_or_else(|| ControllerError::NoSuchClient(uuid.to_string()))?
        };
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let bound = listener.local_addr()?.port();
        let controller = self.clone();
        let uuid = uuid.to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                relay_ufs(&controller, &uuid, socket, &out).await;
            }
        });
        self.listener_tasks.lock().unwrap().push(task);
        Ok(bound)
    }

    /// (uuid, protocol version, mangled-uuid flag) per connection.
    pub fn connection_info(&self) -> Vec<(String, String, bool)> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .map(|entry| (entry.uuid.clone(), entry.version.clone(), entry.mangled))
            .collect()
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Close one client by UUID.
    pub async fn drop_client(&self, uuid: &str) {
        let entry = self.clients.lock().unwrap().remove(uuid);
        let Some(mut entry) = entry else { return };
        let _ = entry.cancel.send(true);
        for (pipe, (id, task)) in entry.pipe_readers.drain() {
            self.plumber.unregister(&pipe, id);
            task.abort();
        }
        if let Some(tunnel) = entry.tunnel.take() {
            tunnel.shutdown().await;
        }
        for task in entry.tunnel_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = entry.ufs_task.take() {
            task.abort();
        }
        tracing::info!(uuid, "client dropped");
    }

    /// Cooperative shutdown: close listeners, drain every client task,
    /// then close the response channel.
    pub async fn destroy(&self) {
        let _ = self.shutdown.send(true);
        for task in self.listener_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let uuids: Vec<String> = self.clients.lock().unwrap().keys().cloned().collect();
        for uuid in uuids {
            self.drop_client(&uuid).await;
        }
        let tasks: Vec<JoinHandle<()>> = self.conn_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.responses_tx.lock().unwrap().take();
    }

    fn responses_sender(&self) -> Option<mpsc::Sender<responses::CheckIn>> {
        self.responses_tx.lock().unwrap().clone()
    }
}

// ── Per-connection serving ─────────────────────────────────────────────

async fn serve_conn(controller: Arc<Controller>, conn: BoxedConn) {
    if let Err(e) = serve_conn_inner(controller, conn).await {
        tracing::debug!("connection: {e}");
    }
}

async fn serve_conn_inner(
    controller: Arc<Controller>,
    mut conn: BoxedConn,
) -> Result<(), ControllerError> {
    handshake_accept(&mut conn).await?;
    let (read_half, write_half) = tokio::io::split(conn);
    let mut decoder: Decoder<ReadHalf<BoxedConn>> = Decoder::new(read_half);
    let sender: Sender<WriteHalf<BoxedConn>> = Sender::new(write_half);

    let first: Message = decoder.decode_timeout(Duration::from_secs(30)).await?;
    let client_version = first.version.clone();
    let Payload::Client(snapshot) = first.payload else {
        return Err(ControllerError::Handshake);
    };
    let mut snapshot = *snapshot;

    // Verify the UUID against the catalog, trying the mangled form too.
    let canonical = normalize_uuid(&snapshot.uuid)?;
    let (uuid, namespace, mangled) = match controller.catalog.lookup(&canonical) {
        Some(vm) => (canonical, vm.namespace, false),
        None => {
            let swapped = mangle_uuid(&canonical);
            match controller.catalog.lookup(&swapped) {
                Some(vm) => (swapped, vm.namespace, true),
                None => return Err(ControllerError::UnknownAgent(canonical)),
            }
        }
    };
    if client_version.is_empty() {
        tracing::warn!(uuid, "agent reports no protocol version");
    }
    snapshot.uuid = uuid.clone();
    snapshot.namespace = namespace.clone();

    // Echo the snapshot back as the handshake ACK.
    sender
        .send(&Message {
            version: VERSION.to_string(),
            uuid: uuid.clone(),
            payload: Payload::Client(Box::new(snapshot.clone())),
        })
        .await?;

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(1024);
    let (cancel, _) = watch::channel(false);
    {
        let mut clients = controller.clients.lock().unwrap();
        if let Some(old) = clients.remove(&uuid) {
            let _ = old.cancel.send(true);
        }
        clients.insert(
            uuid.clone(),
            ClientEntry {
                uuid: uuid.clone(),
                namespace: namespace.clone(),
                mangled,
                version: client_version.clone(),
                out: out_tx.clone(),
                max_command_id: 0,
                last_checkin: Instant::now(),
                cancel: cancel.clone(),
                snapshot,
                tunnel_in: None,
                tunnel: None,
                tunnel_tasks: Vec::new(),
                ufs_in: None,
                ufs_task: None,
                pipe_readers: HashMap::new(),
            },
        );
    }
    tracing::info!(uuid, mangled, "agent connected");

    // Writer: sole consumer of the outbound queue.
    let writer_sender = sender.clone();
    let mut writer_cancel = cancel.subscribe();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.changed() => break,
                message = out_rx.recv() => match message {
                    Some(message) => {
                        if writer_sender.send(&message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    // Heartbeat pinger, skipped for pre-versioned agents.
    if !client_version.is_empty() {
        let hb_out = out_tx.clone();
        let hb_uuid = uuid.clone();
        let mut hb_cancel = cancel.subscribe();
        let period = controller.config.heartbeat_period;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = hb_cancel.changed() => break,
                    _ = tick.tick() => {}
                }
                let beat = Message::new(&hb_uuid, Payload::Heartbeat);
                if hb_out.send(beat).await.is_err() {
                    break;
                }
            }
        });
    }

    // A fresh client gets the current command set immediately.
    controller.fan_out(Some(&uuid)).await;

    let mut cancel_rx = cancel.subscribe();
    loop {
        let message = tokio::select! {
            _ = cancel_rx.changed() => break,
            message = decoder.decode::<Message>() => message,
        };
        match message {
            Ok(message) => {
                handle_client_message(&controller, &uuid, &namespace, message, &out_tx).await;
            }
            Err(ProtoError::Eof) => break,
            Err(e) => {
                tracing::debug!(uuid, "client read: {e}");
                break;
            }
        }
    }

    controller.drop_client(&uuid).await;
    writer.abort();
    sender.close().await;
    Ok(())
}

async fn handle_client_message(
    controller: &Arc<Controller>,
    uuid: &str,
    namespace: &str,
    message: Message,
    out_tx: &mpsc::Sender<Message>,
) {
    if let Some(entry) = controller.clients.lock().unwrap().get_mut(uuid) {
        entry.last_checkin = Instant::now();
    }

    match message.payload {
        Payload::Client(snapshot) => {
            let mut snapshot = *snapshot;
            snapshot.uuid = uuid.to_string();
            snapshot.namespace = namespace.to_string();
            // Tags accumulate; the wire carries only updates.
            if let Some(entry) = controller.clients.lock().unwrap().get_mut(uuid) {
                let mut merged = entry.snapshot.tags.clone();
                merged.extend(snapshot.tags.clone());
                entry.snapshot = snapshot.clone();
                entry.snapshot.tags = merged.clone();
                entry.snapshot.responses.clear();
                snapshot.tags = merged;
            }
            if let Some(tx) = controller.responses_sender() {
                let _ = tx
                    .send((uuid.to_string(), namespace.to_string(), snapshot))
                    .await;
            }
        }
        Payload::File(chunk) => {
            if !chunk.error.is_empty() {
                tracing::warn!(uuid, file = %chunk.name, "agent file error: {}", chunk.error);
            } else if chunk.data.is_empty() && chunk.offset == 0 && !chunk.eof {
                // A request: stream the file back.
                tokio::spawn(files::serve_request(
                    controller.config.base.clone(),
                    namespace.to_string(),
                    uuid.to_string(),
                    chunk,
                    out_tx.clone(),
                ));
            } else if let Err(e) =
                files::write_client_chunk(&controller.config.base, namespace, uuid, &chunk)
            {
                tracing::warn!(uuid, file = %chunk.name, "chunk write: {e}");
            }
        }
        Payload::Tunnel(bytes) => {
            let feeder = controller
                .clients
                .lock()
                .unwrap()
                .get(uuid)
                .and_then(|entry| entry.tunnel_in.clone());
            match feeder {
                Some(feeder) => {
                    let _ = feeder.send(bytes).await;
                }
                None => tracing::debug!(uuid, "tunnel bytes with no tunnel"),
            }
        }
        Payload::Pipe(frame) => handle_pipe_frame(controller, uuid, frame, out_tx).await,
        Payload::Ufs(frame) => handle_ufs_frame(controller, uuid, frame).await,
        Payload::Heartbeat => {}
        Payload::Commands(_) => {}
    }
}

/// Bridge agent pipe frames into the plumbing fabric.
async fn handle_pipe_frame(
    controller: &Arc<Controller>,
    uuid: &str,
    frame: PipeFrame,
    out_tx: &mpsc::Sender<Message>,
) {
    match frame.op {
        PipeOp::NewReader => {
            let already = controller
                .clients
                .lock()
                .unwrap()
                .get(uuid)
                .map(|entry| entry.pipe_readers.contains_key(&frame.name))
                .unwrap_or(true);
            if already {
                return;
            }
            let mut reader = controller.plumber.reader(&frame.name);
            let reader_id = reader.id;
            let pipe = frame.name.clone();
            let forward_uuid = uuid.to_string();
            let forward_out = out_tx.clone();
            let task = tokio::spawn(async move {
                while let Some(value) = reader.rx.recv().await {
                    let message = Message::new(
                        &forward_uuid,
                        Payload::Pipe(PipeFrame {
                            name: pipe.clone(),
                            op: PipeOp::Data,
                            value,
                        }),
                    );
                    if forward_out.send(message).await.is_err() {
                        break;
                    }
                }
            });
            if let Some(entry) = controller.clients.lock().unwrap().get_mut(uuid) {
                entry
                    .pipe_readers
                    .insert(frame.name.clone(), (reader_id, task));
            }
        }
        PipeOp::NewWriter => {}
        PipeOp::Data => {
            if let Err(e) = controller.plumber.write(&frame.name, &frame.value).await {
                tracing::debug!(pipe = %frame.name, "agent pipe write: {e}");
            }
        }
        PipeOp::Close => {
            let removed = controller
                .clients
                .lock()
                .unwrap()
                .get_mut(uuid)
                .and_then(|entry| entry.pipe_readers.remove(&frame.name));
            if let Some((id, task)) = removed {
                controller.plumber.unregister(&frame.name, id);
                task.abort();
            }
        }
    }
}

async fn handle_ufs_frame(controller: &Arc<Controller>, uuid: &str, frame: UfsFrame) {
    match frame.op {
        UfsOp::Data => {
            let feeder = controller
                .clients
                .lock()
                .unwrap()
                .get(uuid)
                .and_then(|entry| entry.ufs_in.clone());
            if let Some(feeder) = feeder {
                let _ = feeder.send(frame.data).await;
            }
        }
        UfsOp::Close => {
            if let Some(entry) = controller.clients.lock().unwrap().get_mut(uuid) {
                entry.ufs_in = None;
            }
        }
        UfsOp::Open => {}
    }
}

/// Pump one accepted UFS connection over the client's UFS channel.
async fn relay_ufs(
    controller: &Arc<Controller>,
    uuid: &str,
    socket: TcpStream,
    out: &mpsc::Sender<Message>,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let open = Message::new(
        uuid,
        Payload::Ufs(UfsFrame {
            op: UfsOp::Open,
            data: Vec::new(),
        }),
    );
    if out.send(open).await.is_err() {
        return;
    }

    let (to_socket, mut from_agent) = mpsc::channel::<Vec<u8>>(64);
    if let Some(entry) = controller.clients.lock().unwrap().get_mut(uuid) {
        entry.ufs_in = Some(to_socket);
    }

    let (mut read_half, mut write_half) = socket.into_split();
    let reader_uuid = uuid.to_string();
    let reader_out = out.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let close = Message::new(
                        &reader_uuid,
                        Payload::Ufs(UfsFrame {
                            op: UfsOp::Close,
                            data: Vec::new(),
                        }),
                    );
                    let _ = reader_out.send(close).await;
                    break;
                }
                Ok(n) => {
                    let data = Message::new(
                        &reader_uuid,
                        Payload::Ufs(UfsFrame {
                            op: UfsOp::Data,
                            data: buf[..n].to_vec(),
                        }),
                    );
                    if reader_out.send(data).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(data) = from_agent.recv().await {
        if write_half.write_all(&data).await.is_err() {
            break;
        }
    }
    reader.abort();
    if let Some(entry) = controller.clients.lock().unwrap().get_mut(uuid) {
        entry.ufs_in = None;
    }
}

// ── Reaper ─────────────────────────────────────────────────────────────

/// Purge clients whose last check-in exceeds the timeout.
async fn reaper(controller: Arc<Controller>) {
    let mut shutdown_rx = controller.shutdown.subscribe();
    let mut tick = tokio::time::interval(controller.config.reap_period);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {}
        }
        let expired: Vec<String> = controller
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.last_checkin.elapsed() > controller.config.client_timeout)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in expired {
            tracing::warn!(uuid, "reaping silent client");
            controller.drop_client(&uuid).await;
        }
    }
}
