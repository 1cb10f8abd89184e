//! Agent core: the long-lived process that dials its controller,
//! heartbeats, and executes commands on behalf of it.

pub mod commands;
pub mod control;
pub mod error;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};

use ron_plumb::Plumber;
use ron_proto::{
    handshake_dial, normalize_uuid, ClientSnapshot, Decoder, FileChunk, LogLevel, Message,
    Payload, PipeFrame, PipeOp, ProcessInfo, Response, Sender, UfsFrame, UfsOp,
};
use ron_tunnel::Tunnel;

pub use error::AgentError;

/// Transport family for the controller dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Tcp,
    Unix,
    Serial,
}

/// Byte stream to the controller.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}
type BoxedConn = Box<dyn Conn>;

type LevelReload = Box<dyn Fn(LogLevel) + Send + Sync>;

// ── Configuration ──────────────────────────────────────────────────────

/// Agent configuration. Builder pattern; defaults mirror the CLI.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub uuid: Option<String>,
    pub parent: String,
    pub port: u16,
    pub family: Family,
    /// Serial device path; implies `Family::Serial`.
    pub serial: Option<PathBuf>,
    /// Base directory for files, responses, pidfile, control socket.
    pub base: PathBuf,
    pub heartbeat_rate: Duration,
    pub dial_retries: u32,
    pub dial_wait: Duration,
    /// Per-attempt dial deadline; catches hung serial ports.
    pub dial_timeout: Duration,
    /// Local endpoint the UFS relay connects to, if any.
    pub ufs_target: Option<String>,
    /// Software version string reported to the controller.
    pub version: String,
}

impl AgentConfig {
    pub fn new(parent: impl Into<String>, port: u16) -> Self {
        Self {
            uuid: None,
            parent: parent.into(),
            port,
            family: Family::Tcp,
            serial: None,
            base: PathBuf::from("/tmp/miniccc"),
            heartbeat_rate: Duration::from_secs(5),
            dial_retries: 480,
            dial_wait: Duration::from_secs(15),
            dial_timeout: Duration::from_secs(5),
            ufs_target: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn serial(mut self, device: impl Into<PathBuf>) -> Self {
        self.serial = Some(device.into());
        self.family = Family::Serial;
        self
    }

    pub fn base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = base.into();
        self
    }

    pub fn heartbeat_rate(mut self, rate: Duration) -> Self {
        self.heartbeat_rate = rate;
        self
    }

    pub fn dial_budget(mut self, retries: u32, wait: Duration) -> Self {
        self.dial_retries = retries;
        self.dial_wait = wait;
        self
    }
}

// ── Agent ──────────────────────────────────────────────────────────────

struct AgentState {
    snapshot: ClientSnapshot,
    responses: Vec<Response>,
    tags: HashMap<String, String>,
    command_counter: u64,
    last_heartbeat: Instant,
}

/// The agent. One per process; owns the process table, response buffer,
/// and tag store, all behind its own lock.
pub struct Agent {
    pub(crate) config: AgentConfig,
    state: Mutex<AgentState>,
    /// Kill switches for tracked child processes.
    kills: Mutex<HashMap<i32, oneshot::Sender<()>>>,
    /// Local pipe table; values bridge to the controller's plumber.
    pub(crate) plumber: Arc<Plumber>,
    /// Outbound message channel of the current session, when connected.
    out: Mutex<Option<mpsc::Sender<Message>>>,
    level_reload: Mutex<Option<LevelReload>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>, AgentError> {
        let uuid = match &config.uuid {
            Some(raw) => normalize_uuid(raw)?,
            None => detect_uuid(),
        };
        let mut snapshot = ClientSnapshot::new(uuid);
        snapshot.version = config.version.clone();
        refresh_facts(&mut snapshot);

        Ok(Arc::new(Self {
            plumber: Plumber::local(&snapshot.uuid),
            state: Mutex::new(AgentState {
                snapshot,
                responses: Vec::new(),
                tags: HashMap::new(),
                command_counter: 0,
                last_heartbeat: Instant::now(),
            }),
            kills: Mutex::new(HashMap::new()),
            out: Mutex::new(None),
            level_reload: Mutex::new(None),
            config,
        }))
    }

    pub fn uuid(&self) -> String {
        self.state.lock().unwrap().snapshot.uuid.clone()
    }

    /// Install the callback that reconfigures the global log filter.
    pub fn set_level_reload(&self, reload: LevelReload) {
        *self.level_reload.lock().unwrap() = Some(reload);
    }

    /// Buffer a tag update for the next heartbeat.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .tags
            .insert(key.into(), value.into());
    }

    /// Dial, serve, and re-dial forever. Returns only on fatal errors.
    pub async fn run(self: Arc<Self>) -> Result<(), AgentError> {
        write_pidfile(&self.config.base)?;
        std::fs::create_dir_all(self.config.base.join("files"))?;
        tokio::spawn(control::serve(self.clone()));

        loop {
            match self.session().await {
                Ok(()) => tracing::info!("session reset, redialing"),
                Err(e @ (AgentError::DialBudget | AgentError::PidfileAlive(_))) => {
                    return Err(e);
                }
                Err(e) => tracing::warn!("session: {e}"),
            }
            // Reopening a failed serial port is only safe on Linux; elsewhere
            // the service supervisor restarts us.
            if self.config.family == Family::Serial && !cfg!(target_os = "linux") {
                return Err(AgentError::SerialUnsafe);
            }
        }
    }

    // ── Session ────────────────────────────────────────────────────────

    async fn session(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut conn = self.dial().await?;
        handshake_dial(&mut conn).await?;
        let (read_half, write_half) = tokio::io::split(conn);
        let mut decoder: Decoder<ReadHalf<BoxedConn>> = Decoder::new(read_half);
        let sender: Sender<WriteHalf<BoxedConn>> = Sender::new(write_half);

        // CLIENT handshake: send the full snapshot, read the echo ACK.
        let uuid = self.uuid();
        let hello = {
            let mut state = self.state.lock().unwrap();
            refresh_facts(&mut state.snapshot);
            state.snapshot.clone()
        };
        sender
            .send(&Message::new(&uuid, Payload::Client(Box::new(hello))))
            .await?;
        let ack: Message = decoder.decode_timeout(Duration::from_secs(30)).await?;
        match ack.payload {
            Payload::Client(echo) => {
                // The controller assigns our namespace at handshake.
                self.state.lock().unwrap().snapshot.namespace = echo.namespace;
            }
            _ => return Err(AgentError::Handshake),
        }
        tracing::info!(uuid = %uuid, "connected");

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(1024);
        *self.out.lock().unwrap() = Some(out_tx.clone());
        let (reset, _) = watch::channel(false);

        // Writer: the single consumer of the outbound queue.
        let writer_sender = sender.clone();
        let mut writer_reset = reset.subscribe();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_reset.changed() => break,
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

        tokio::spawn(heartbeat_loop(
            self.clone(),
            out_tx.clone(),
            reset.subscribe(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (file_tx, file_rx) = mpsc::channel(1024);
        tokio::spawn(commands::dispatch(
            self.clone(),
            cmd_rx,
            file_rx,
            out_tx.clone(),
            reset.subscribe(),
        ));

        let mut session = SessionState::default();
        let deadline = self.config.heartbeat_rate.mul_f64(2.5);
        let result = loop {
            match decoder.decode_timeout::<Message>(deadline).await {
                Ok(message) => {
                    self.route(message, &cmd_tx, &file_tx, &out_tx, &mut session)
                        .await;
                }
                Err(ron_proto::ProtoError::Eof) => break Ok(()),
                Err(ron_proto::ProtoError::Timeout(_)) => {
                    tracing::warn!("controller went silent, resetting");
                    break Ok(());
                }
                Err(e) => break Err(AgentError::from(e)),
            }
        };

        let _ = reset.send(true);
        *self.out.lock().unwrap() = None;
        sender.close().await;
        writer.abort();
        session.teardown().await;
        result
    }

    async fn route(
        self: &Arc<Self>,
        message: Message,
        cmd_tx: &mpsc::Sender<std::collections::BTreeMap<u64, ron_proto::Command>>,
        file_tx: &mpsc::Sender<FileChunk>,
        out_tx: &mpsc::Sender<Message>,
        session: &mut SessionState,
    ) {
        match message.payload {
            Payload::Commands(batch) => {
                let _ = cmd_tx.send(batch).await;
            }
            Payload::File(chunk) => {
                let _ = file_tx.send(chunk).await;
            }
            Payload::Tunnel(bytes) => {
                let trunk = session.tunnel_trunk(&self.uuid(), out_tx);
                if trunk.deliver(&bytes).await.is_err() {
                    tracing::debug!("tunnel trunk closed");
                }
            }
            Payload::Pipe(frame) => self.handle_pipe(frame).await,
            Payload::Ufs(frame) => session.handle_ufs(self, frame, out_tx).await,
            Payload::Heartbeat => {}
            Payload::Client(_) => {}
        }
    }

    async fn handle_pipe(self: &Arc<Self>, frame: PipeFrame) {
        match frame.op {
            PipeOp::Data => {
                if let Err(e) = self.plumber.write(&frame.name, &frame.value).await {
                    tracing::debug!(pipe = %frame.name, "pipe deliver: {e}");
                }
            }
            PipeOp::Close => self.plumber.close_pipe(&frame.name),
            // Registration ops flow agent → controller only.
            PipeOp::NewReader | PipeOp::NewWriter => {}
        }
    }

    /// Send a pipe frame to the controller, if connected.
    pub(crate) async fn send_pipe(&self, op: PipeOp, name: &str, value: &str) {
        let message = Message::new(
            self.uuid(),
            Payload::Pipe(PipeFrame {
                name: name.to_string(),
                op,
                value: value.to_string(),
            }),
        );
        self.send_message(message).await;
    }

    pub(crate) async fn send_message(&self, message: Message) {
        let out = self.out.lock().unwrap().clone();
        if let Some(out) = out {
            let _ = out.send(message).await;
        }
    }

    // ── Dialing ────────────────────────────────────────────────────────

    async fn dial(&self) -> Result<BoxedConn, AgentError> {
        for attempt in 1..=self.config.dial_retries {
            match tokio::time::timeout(self.config.dial_timeout, self.connect()).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => tracing::debug!(attempt, "dial: {e}"),
                Err(_) => tracing::debug!(attempt, "dial timed out"),
            }
            tokio::time::sleep(self.config.dial_wait).await;
        }
        Err(AgentError::DialBudget)
    }

    async fn connect(&self) -> std::io::Result<BoxedConn> {
        match self.config.family {
            Family::Tcp => {
                let stream =
                    TcpStream::connect((self.config.parent.as_str(), self.config.port)).await?;
                Ok(Box::new(stream))
            }
            Family::Unix => {
                let stream = UnixStream::connect(&self.config.parent).await?;
                Ok(Box::new(stream))
            }
            Family::Serial => {
                let device = self
                    .config
                    .serial
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(&self.config.parent));
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(device)
                    .await?;
                Ok(Box::new(file))
            }
        }
    }

    // ── Process table ──────────────────────────────────────────────────

    pub(crate) fn track_process(
        self: &Arc<Self>,
        pid: i32,
        argv: Vec<String>,
        kill: oneshot::Sender<()>,
    ) {
        self.state.lock().unwrap().snapshot.processes.insert(
            pid,
            ProcessInfo {
                pid,
                command: argv,
            },
        );
        self.kills.lock().unwrap().insert(pid, kill);
    }

    pub(crate) fn untrack_process(&self, pid: i32) {
        self.state.lock().unwrap().snapshot.processes.remove(&pid);
        self.kills.lock().unwrap().remove(&pid);
    }

    /// Kill one tracked process, or all of them when `pid` is -1.
    pub(crate) fn kill(&self, pid: i32) {
        let mut kills = self.kills.lock().unwrap();
        if pid == -1 {
            for (_, kill) in kills.drain() {
                let _ = kill.send(());
            }
            return;
        }
        if let Some(kill) = kills.remove(&pid) {
            let _ = kill.send(());
        }
    }

    /// Kill every tracked process whose joined argv contains `needle`.
    pub(crate) fn kill_matching(&self, needle: &str) {
        let matching: Vec<i32> = {
            let state = self.state.lock().unwrap();
            state
                .snapshot
                .processes
                .values()
                .filter(|p| p.command.join(" ").contains(needle))
                .map(|p| p.pid)
                .collect()
        };
        let mut kills = self.kills.lock().unwrap();
        for pid in matching {
            if let Some(kill) = kills.remove(&pid) {
                let _ = kill.send(());
            }
        }
    }

    pub(crate) fn reload_level(&self, level: LogLevel) {
        if let Some(reload) = self.level_reload.lock().unwrap().as_ref() {
            reload(level);
            tracing::info!(level = level.as_directive(), "log level changed");
        }
    }

    // ── Command bookkeeping ────────────────────────────────────────────

    /// Claim a command ID; false when it was already processed.
    pub(crate) fn claim_command(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if id <= state.command_counter {
            return false;
        }
        state.command_counter = id;
        true
    }

    pub(crate) fn push_response(&self, response: Response) {
        self.state.lock().unwrap().responses.push(response);
    }

    /// Snapshot for a heartbeat: refreshed host facts plus the drained
    /// response and tag buffers.
    fn heartbeat_snapshot(&self) -> ClientSnapshot {
        let mut state = self.state.lock().unwrap();
        refresh_facts(&mut state.snapshot);
        let mut snapshot = state.snapshot.clone();
        snapshot.responses = std::mem::take(&mut state.responses);
        snapshot.tags = std::mem::take(&mut state.tags);
        snapshot
    }
}

// ── Session-local relays ───────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    tunnel: Option<ron_proto::Trunk>,
    ufs: Option<UfsRelay>,
}

struct UfsRelay {
    to_socket: mpsc::Sender<Vec<u8>>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionState {
    /// The tunnel trunk, created lazily on the first TUNNEL message.
    fn tunnel_trunk(
        &mut self,
        uuid: &str,
        out_tx: &mpsc::Sender<Message>,
    ) -> &mut ron_proto::Trunk {
        if self.tunnel.is_none() {
            let (trunk, transport) =
                ron_proto::Trunk::new(uuid, out_tx.clone(), Payload::Tunnel);
            tokio::spawn(async move {
                match Tunnel::accept(transport).await {
                    Ok(tunnel) => tunnel.join().await,
                    Err(e) => tracing::debug!("tunnel accept: {e}"),
                }
            });
            self.tunnel = Some(trunk);
        }
        self.tunnel.as_mut().expect("tunnel trunk just created")
    }

    async fn handle_ufs(&mut self, agent: &Arc<Agent>, frame: UfsFrame, out_tx: &mpsc::Sender<Message>) {
        match frame.op {
            UfsOp::Open => {
                let Some(target) = agent.config.ufs_target.clone() else {
                    let close = Message::new(
                        agent.uuid(),
                        Payload::Ufs(UfsFrame {
                            op: UfsOp::Close,
                            data: Vec::new(),
                        }),
                    );
                    let _ = out_tx.send(close).await;
                    return;
                };
                match TcpStream::connect(&target).await {
                    Ok(socket) => {
                        self.ufs = Some(spawn_ufs_relay(agent.uuid(), socket, out_tx.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(target, "ufs dial: {e}");
                        let close = Message::new(
                            agent.uuid(),
                            Payload::Ufs(UfsFrame {
                                op: UfsOp::Close,
                                data: Vec::new(),
                            }),
                        );
                        let _ = out_tx.send(close).await;
                    }
                }
            }
            UfsOp::Data => {
                if let Some(relay) = &self.ufs {
                    let _ = relay.to_socket.send(frame.data).await;
                }
            }
            UfsOp::Close => {
                if let Some(relay) = self.ufs.take() {
                    relay.task.abort();
                }
            }
        }
    }

    async fn teardown(self) {
        if let Some(trunk) = self.tunnel {
            trunk.close().await;
        }
        if let Some(relay) = self.ufs {
            relay.task.abort();
        }
    }
}

fn spawn_ufs_relay(
    uuid: String,
    socket: TcpStream,
    out_tx: mpsc::Sender<Message>,
) -> UfsRelay {
    let (to_socket, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let task = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let (mut read_half, mut write_half) = socket.into_split();
        let reader_uuid = uuid.clone();
        let reader_out = out_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let close = Message::new(
                            reader_uuid.clone(),
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
                            reader_uuid.clone(),
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
        while let Some(data) = rx.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        reader.abort();
    });
    UfsRelay { to_socket, task }
}

// ── Heartbeat ──────────────────────────────────────────────────────────

async fn heartbeat_loop(
    agent: Arc<Agent>,
    out_tx: mpsc::Sender<Message>,
    mut reset_rx: watch::Receiver<bool>,
) {
    let period = agent.config.heartbeat_rate.min(Duration::from_secs(5));
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = reset_rx.changed() => break,
            _ = tick.tick() => {}
        }
        let due = {
            let state = agent.state.lock().unwrap();
            state.last_heartbeat.elapsed() > agent.config.heartbeat_rate
        };
        if !due {
            continue;
        }
        let snapshot = agent.heartbeat_snapshot();
        let message = Message::new(snapshot.uuid.clone(), Payload::Client(Box::new(snapshot)));
        if out_tx.send(message).await.is_err() {
            break;
        }
        agent.state.lock().unwrap().last_heartbeat = Instant::now();
    }
}

// ── Host facts ─────────────────────────────────────────────────────────

/// Refresh hostname, interface addresses, and MACs in place.
fn refresh_facts(snapshot: &mut ClientSnapshot) {
    snapshot.hostname = gethostname::gethostname().to_string_lossy().into_owned();

    let mut ips = Vec::new();
    let mut macs = Vec::new();
    for iface in netdev::get_interfaces() {
        if let Some(mac) = &iface.mac_addr {
            let mac = mac.to_string();
            if mac != "00:00:00:00:00:00" && !macs.contains(&mac) {
                macs.push(mac);
            }
        }
        for net in &iface.ipv4 {
            let ip = net.addr();
            if !ip.is_loopback() {
                ips.push(ip.to_string());
            }
        }
        for net in &iface.ipv6 {
            let ip = net.addr();
            if !ip.is_loopback() {
                ips.push(ip.to_string());
            }
        }
    }
    snapshot.ips = ips;
    snapshot.macs = macs;
}

/// The VM firmware UUID when available, a random one otherwise.
fn detect_uuid() -> String {
    if let Ok(raw) = std::fs::read_to_string("/sys/class/dmi/id/product_uuid") {
        if let Ok(uuid) = normalize_uuid(&raw) {
            return uuid;
        }
    }
    uuid::Uuid::new_v4().as_hyphenated().to_string()
}

/// Refuse to start while a previous agent instance is still alive.
fn write_pidfile(base: &Path) -> Result<(), AgentError> {
    std::fs::create_dir_all(base)?;
    let path = base.join("miniccc.pid");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if Path::new(&format!("/proc/{pid}")).exists() {
                return Err(AgentError::PidfileAlive(pid));
            }
        }
    }
    std::fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(())
}
