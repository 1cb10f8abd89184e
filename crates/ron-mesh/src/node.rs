/// The mesh node runtime: peer links, link-state flooding, routing,
/// reliable unicast, and degree maintenance.
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};

use ron_proto::{Decoder, ProtoError, Sender};

use crate::discovery::{parse_solicitation, solicitation, Backoff};
use crate::error::MeshError;
use crate::message::{MeshMessage, MeshPayload};
use crate::sequence::{SequenceSource, SequenceTracker};
use crate::topology::Topology;

/// Deadline for the handshake snapshot exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Observer for message bodies this node relays on behalf of others:
/// `(source, channel, body)`.
pub type RelayHook = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;

// ── Configuration ──────────────────────────────────────────────────────

/// Mesh node configuration. Builder pattern; all fields default sensibly.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub name: String,
    /// Minimum connected-peer count the node tries to hold.
    pub degree: usize,
    /// TCP port for peer links. 0 binds an ephemeral port.
    pub mesh_port: u16,
    /// UDP port for broadcast solicitations. 0 disables discovery.
    pub solicit_port: u16,
    /// MSA broadcast period; peer read deadline is twice this.
    pub msa_period: Duration,
    /// Reliable-send ACK timeout.
    pub send_timeout: Duration,
    /// Message pump capacity.
    pub pump_capacity: usize,
}

impl MeshConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            degree: 2,
            mesh_port: 0,
            solicit_port: 0,
            msa_period: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            pump_capacity: 1024,
        }
    }

    pub fn degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    pub fn mesh_port(mut self, port: u16) -> Self {
        self.mesh_port = port;
        self
    }

    pub fn solicit_port(mut self, port: u16) -> Self {
        self.solicit_port = port;
        self
    }

    pub fn msa_period(mut self, period: Duration) -> Self {
        self.msa_period = period;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

// ── Node ───────────────────────────────────────────────────────────────

/// A message delivered to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: String,
    pub body: Vec<u8>,
}

type PeerSender = Sender<OwnedWriteHalf>;

#[derive(Clone)]
struct Peer {
    sender: PeerSender,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct RouteState {
    topology: Topology,
    effective: Topology,
    routes: HashMap<String, String>,
}

struct Shared {
    config: MeshConfig,
    mesh_addr: SocketAddr,
    instance: u64,
    next_id: AtomicU64,
    msa_seq: Mutex<SequenceSource>,
    sequences: Mutex<SequenceTracker>,
    peers: Mutex<HashMap<String, Peer>>,
    state: Mutex<RouteState>,
    acks: Mutex<HashMap<(String, u64), oneshot::Sender<()>>>,
    pumps: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
    relay_hook: RwLock<Option<RelayHook>>,
    shutdown: watch::Sender<bool>,
}

/// One mesh node. Cheap to clone; `destroy` tears everything down.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    /// Bind the mesh listener and start discovery and maintenance.
    pub async fn start(config: MeshConfig) -> Result<Self, MeshError> {
        let listener = TcpListener::bind(("0.0.0.0", config.mesh_port)).await?;
        let mesh_addr = listener.local_addr()?;

        let (shutdown, _) = watch::channel(false);

        let mut state = RouteState::default();
        state.topology.set_neighbors(&config.name, Vec::new());

        let shared = Arc::new(Shared {
            mesh_addr,
            instance: rand::random::<u64>(),
            next_id: AtomicU64::new(0),
            msa_seq: Mutex::new(SequenceSource::new()),
            sequences: Mutex::new(SequenceTracker::new()),
            peers: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            acks: Mutex::new(HashMap::new()),
            pumps: Mutex::new(HashMap::new()),
            relay_hook: RwLock::new(None),
            shutdown,
            config,
        });

        tokio::spawn(accept_loop(shared.clone(), listener));
        if shared.config.solicit_port != 0 {
            tokio::spawn(solicit_listener(shared.clone()));
            tokio::spawn(solicitor(shared.clone()));
        }
        tokio::spawn(msa_ticker(shared.clone()));

        Ok(Self { shared })
    }

    /// Register the message pump for a named subsystem channel.
    /// Messages for channels nobody listens on are dropped.
    pub fn listen(&self, channel: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(self.shared.config.pump_capacity);
        self.shared
            .pumps
            .lock()
            .unwrap()
            .insert(channel.to_string(), tx);
        rx
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Actual bound address of the mesh listener.
    pub fn mesh_addr(&self) -> SocketAddr {
        self.shared.mesh_addr
    }

    /// Dial a peer. `solicited` marks a dial made in response to a
    /// broadcast solicitation.
    pub async fn dial(&self, addr: SocketAddr, solicited: bool) -> Result<(), MeshError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut decoder = Decoder::new(read_half);
        let sender = Sender::new(write_half);

        let offer = decoder
            .decode_timeout::<MeshMessage>(HANDSHAKE_TIMEOUT)
            .await?;
        let MeshPayload::Handshake {
            solicited: peer_below_degree,
            topology: remote_topology,
        } = offer.payload
        else {
            return Err(MeshError::Declined);
        };

        let peer_name = offer.source;
        if peer_name == self.shared.config.name {
            return Err(MeshError::SelfDial);
        }
        if self.shared.peers.lock().unwrap().contains_key(&peer_name) {
            return Err(MeshError::DuplicatePeer(peer_name));
        }
        // They are already at degree and we only called because they
        // broadcast earlier; they don't need us.
        if solicited && !peer_below_degree {
            return Err(MeshError::Declined);
        }

        let snapshot = self.shared.state.lock().unwrap().topology.clone();
        sender
            .send(&handshake(&self.shared, false, snapshot))
            .await?;

        finish_link(&self.shared, peer_name, remote_topology, decoder, sender).await;
        Ok(())
    }

    /// Reliable unicast to a set of recipients, grouped by next hop.
    pub async fn send(
        &self,
        recipients: &[String],
        channel: &str,
        body: Vec<u8>,
    ) -> Result<(), MeshError> {
        route_send(
            &self.shared,
            self.shared.config.name.clone(),
            recipients.to_vec(),
            vec![self.shared.config.name.clone()],
            channel.to_string(),
            body,
        )
        .await
    }

    /// Unicast to every effective node except self.
    pub async fn broadcast(&self, channel: &str, body: Vec<u8>) -> Result<(), MeshError> {
        let recipients = self.effective_nodes();
        if recipients.is_empty() {
            return Ok(());
        }
        self.send(&recipients, channel, body).await
    }

    /// Every node in the effective topology except self.
    pub fn effective_nodes(&self) -> Vec<String> {
        let state = self.shared.state.lock().unwrap();
        state
            .effective
            .nodes()
            .filter(|n| *n != &self.shared.config.name)
            .cloned()
            .collect()
    }

    pub fn routes(&self) -> HashMap<String, String> {
        self.shared.state.lock().unwrap().routes.clone()
    }

    pub fn peers(&self) -> Vec<String> {
        self.shared.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Observe bodies this node forwards for other destinations.
    pub fn set_relay_hook(&self, hook: RelayHook) {
        *self.shared.relay_hook.write().unwrap() = Some(hook);
    }

    /// Close one peer link.
    pub async fn hangup(&self, peer: &str) {
        let removed = self.shared.peers.lock().unwrap().remove(peer);
        if let Some(peer) = removed {
            let _ = peer.cancel.send(true);
            peer.sender.close().await;
        }
        after_peer_change(&self.shared).await;
    }

    /// Close every peer and stop background tasks.
    pub async fn destroy(&self) {
        let _ = self.shared.shutdown.send(true);
        let drained: Vec<Peer> = self.shared.peers.lock().unwrap().drain().map(|(_, p)| p).collect();
        for peer in drained {
            let _ = peer.cancel.send(true);
            peer.sender.close().await;
        }
        self.shared.acks.lock().unwrap().clear();
    }
}

fn handshake(shared: &Shared, solicited: bool, topology: Topology) -> MeshMessage {
    MeshMessage {
        source: shared.config.name.clone(),
        instance: shared.instance,
        id: 0,
        recipients: Vec::new(),
        current_route: Vec::new(),
        payload: MeshPayload::Handshake {
            solicited,
            topology,
        },
    }
}

// ── Link setup ─────────────────────────────────────────────────────────

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let Ok((stream, _)) = accepted else { break };
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_peer(shared, stream).await {
                tracing::debug!("mesh accept: {e}");
            }
        });
    }
}

async fn accept_peer(shared: Arc<Shared>, stream: TcpStream) -> Result<(), MeshError> {
    let (read_half, write_half) = stream.into_split();
    let mut decoder = Decoder::new(read_half);
    let sender = Sender::new(write_half);

    let below_degree = shared.peers.lock().unwrap().len() < shared.config.degree;
    let snapshot = shared.state.lock().unwrap().topology.clone();
    sender
        .send(&handshake(&shared, below_degree, snapshot))
        .await?;

    let reply = decoder
        .decode_timeout::<MeshMessage>(HANDSHAKE_TIMEOUT)
        .await?;
    let MeshPayload::Handshake {
        topology: remote_topology,
        ..
    } = reply.payload
    else {
        return Err(MeshError::Declined);
    };

    let peer_name = reply.source;
    if peer_name == shared.config.name {
        return Err(MeshError::SelfDial);
    }
    if shared.peers.lock().unwrap().contains_key(&peer_name) {
        return Err(MeshError::DuplicatePeer(peer_name));
    }

    finish_link(&shared, peer_name, remote_topology, decoder, sender).await;
    Ok(())
}

async fn finish_link(
    shared: &Arc<Shared>,
    peer_name: String,
    remote_topology: Topology,
    decoder: Decoder<OwnedReadHalf>,
    sender: PeerSender,
) {
    let (cancel, cancel_rx) = watch::channel(false);
    shared.peers.lock().unwrap().insert(
        peer_name.clone(),
        Peer {
            sender,
            cancel,
        },
    );

    {
        let names: Vec<String> = shared.peers.lock().unwrap().keys().cloned().collect();
        let mut state = shared.state.lock().unwrap();
        state.topology.merge(&remote_topology);
        state.topology.set_neighbors(&shared.config.name, names);
        recompute(&mut state, &shared.config.name);
    }

    tokio::spawn(peer_reader(shared.clone(), peer_name, decoder, cancel_rx));
    flood_msa(shared).await;
}

// ── Peer reader ────────────────────────────────────────────────────────

async fn peer_reader(
    shared: Arc<Shared>,
    peer_name: String,
    mut decoder: Decoder<OwnedReadHalf>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    // A silent peer is a dead peer.
    let deadline = shared.config.msa_period * 2;
    loop {
        let message = tokio::select! {
            _ = cancel_rx.changed() => break,
            message = decoder.decode_timeout::<MeshMessage>(deadline) => message,
        };
        match message {
            Ok(message) => handle_message(&shared, &peer_name, message).await,
            Err(ProtoError::Eof) => break,
            Err(ProtoError::Timeout(_)) => {
                tracing::info!(peer = %peer_name, "peer went silent");
                break;
            }
            Err(e) => {
                tracing::debug!(peer = %peer_name, "peer read: {e}");
                break;
            }
        }
    }

    let removed = shared.peers.lock().unwrap().remove(&peer_name);
    if let Some(peer) = removed {
        peer.sender.close().await;
    }
    after_peer_change(&shared).await;
}

/// Re-announce adjacency and rebuild routes after a link change.
async fn after_peer_change(shared: &Arc<Shared>) {
    {
        let names: Vec<String> = shared.peers.lock().unwrap().keys().cloned().collect();
        let mut state = shared.state.lock().unwrap();
        state.topology.set_neighbors(&shared.config.name, names);
        recompute(&mut state, &shared.config.name);
    }
    if !*shared.shutdown.borrow() {
        flood_msa(shared).await;
    }
}

/// Effective network, unreachable pruning, next-hop routes.
fn recompute(state: &mut RouteState, name: &str) {
    loop {
        state.effective = state.topology.effective();
        let reachable = state.effective.reachable_from(name);
        let unreachable: Vec<String> = state
            .effective
            .nodes()
            .filter(|n| !reachable.contains(*n))
            .cloned()
            .collect();
        if unreachable.is_empty() {
            break;
        }
        for node in unreachable {
            state.topology.remove_node(&node);
        }
    }
    state.routes = state.effective.routes_from(name);
}

// ── Message handling ───────────────────────────────────────────────────

async fn handle_message(shared: &Arc<Shared>, from_peer: &str, message: MeshMessage) {
    match message.payload {
        MeshPayload::Handshake { .. } => {}
        MeshPayload::Ack => {
            let waiter = shared
                .acks
                .lock()
                .unwrap()
                .remove(&(from_peer.to_string(), message.id));
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
        }
        MeshPayload::Msa { neighbors } => {
            let fresh = shared
                .sequences
                .lock()
                .unwrap()
                .accept(message.instance, message.id);
            if !fresh {
                return;
            }
            {
                let mut state = shared.state.lock().unwrap();
                state.topology.set_neighbors(&message.source, neighbors.clone());
                recompute(&mut state, &shared.config.name);
            }
            let mut relayed = MeshMessage {
                source: message.source,
                instance: message.instance,
                id: message.id,
                recipients: Vec::new(),
                current_route: message.current_route,
                payload: MeshPayload::Msa { neighbors },
            };
            relayed.current_route.push(shared.config.name.clone());
            flood(shared, &relayed).await;
        }
        MeshPayload::Data { channel, body } => {
            // Hop acknowledgement goes straight back to the sender.
            let ack_to = shared.peers.lock().unwrap().get(from_peer).cloned();
            if let Some(peer) = ack_to {
                let ack = MeshMessage {
                    source: shared.config.name.clone(),
                    instance: shared.instance,
                    id: message.id,
                    recipients: Vec::new(),
                    current_route: Vec::new(),
                    payload: MeshPayload::Ack,
                };
                let _ = peer.sender.send(&ack).await;
            }

            let mine = message
                .recipients
                .iter()
                .any(|r| r == &shared.config.name);
            let others: Vec<String> = message
                .recipients
                .iter()
                .filter(|r| *r != &shared.config.name)
                .cloned()
                .collect();

            if !others.is_empty() {
                if let Some(hook) = shared.relay_hook.read().unwrap().clone() {
                    hook(&message.source, &channel, &body);
                }
                let shared = shared.clone();
                let source = message.source.clone();
                let mut route = message.current_route.clone();
                route.push(shared.config.name.clone());
                let channel = channel.clone();
                let forwarded = body.clone();
                tokio::spawn(async move {
                    let relayed =
                        route_send(&shared, source, others, route, channel, forwarded).await;
                    if let Err(e) = relayed {
                        tracing::debug!("mesh forward: {e}");
                    }
                });
            }

            if mine {
                let pump = shared.pumps.lock().unwrap().get(&channel).cloned();
                match pump {
                    Some(pump) => {
                        let delivery = Delivery {
                            source: message.source,
                            body,
                        };
                        let _ = pump.send(delivery).await;
                    }
                    None => tracing::debug!(channel, "no listener, dropping"),
                }
            }
        }
    }
}

/// Send to recipients grouped by next hop, awaiting the per-hop ACK.
/// A timeout hangs up the slow peer.
async fn route_send(
    shared: &Arc<Shared>,
    source: String,
    recipients: Vec<String>,
    current_route: Vec<String>,
    channel: String,
    body: Vec<u8>,
) -> Result<(), MeshError> {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    {
        let state = shared.state.lock().unwrap();
        for recipient in recipients {
            if recipient == shared.config.name {
                continue;
            }
            let hop = state
                .routes
                .get(&recipient)
                .ok_or_else(|| MeshError::NoRoute(recipient.clone()))?;
            groups.entry(hop.clone()).or_default().push(recipient);
        }
    }

    for (hop, subset) in groups {
        let peer = shared
            .peers
            .lock()
            .unwrap()
            .get(&hop)
            .cloned()
            .ok_or_else(|| MeshError::NoRoute(hop.clone()))?;

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (ack_tx, ack_rx) = oneshot::channel();
        shared
            .acks
            .lock()
            .unwrap()
            .insert((hop.clone(), id), ack_tx);

        let message = MeshMessage {
            source: source.clone(),
            instance: shared.instance,
            id,
            recipients: subset,
            current_route: current_route.clone(),
            payload: MeshPayload::Data {
                channel: channel.clone(),
                body: body.clone(),
            },
        };
        if let Err(e) = peer.sender.send(&message).await {
            shared.acks.lock().unwrap().remove(&(hop.clone(), id));
            return Err(e.into());
        }

        match tokio::time::timeout(shared.config.send_timeout, ack_rx).await {
            Ok(Ok(())) => {}
            _ => {
                shared.acks.lock().unwrap().remove(&(hop.clone(), id));
                tracing::warn!(peer = %hop, "ack timeout, hanging up");
                hangup_peer(shared, &hop).await;
                return Err(MeshError::AckTimeout { peer: hop });
            }
        }
    }
    Ok(())
}

async fn hangup_peer(shared: &Arc<Shared>, name: &str) {
    let removed = shared.peers.lock().unwrap().remove(name);
    if let Some(peer) = removed {
        let _ = peer.cancel.send(true);
        peer.sender.close().await;
    }
    after_peer_change(shared).await;
}

// ── Flooding ───────────────────────────────────────────────────────────

/// Announce our adjacency list to every direct peer.
async fn flood_msa(shared: &Arc<Shared>) {
    let neighbors: Vec<String> = shared.peers.lock().unwrap().keys().cloned().collect();
    let id = shared.msa_seq.lock().unwrap().next();
    let message = MeshMessage {
        source: shared.config.name.clone(),
        instance: shared.instance,
        id,
        recipients: Vec::new(),
        current_route: vec![shared.config.name.clone()],
        payload: MeshPayload::Msa { neighbors },
    };
    flood(shared, &message).await;
}

/// Relay to every direct peer not already on the message's route.
async fn flood(shared: &Arc<Shared>, message: &MeshMessage) {
    let targets: Vec<(String, Peer)> = shared
        .peers
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| !message.current_route.contains(name))
        .map(|(name, peer)| (name.clone(), peer.clone()))
        .collect();
    for (name, peer) in targets {
        if peer.sender.send(message).await.is_err() {
            tracing::debug!(peer = %name, "flood send failed");
        }
    }
}

// ── Discovery & maintenance ────────────────────────────────────────────

async fn solicit_listener(shared: Arc<Shared>) {
    let socket = match UdpSocket::bind(("0.0.0.0", shared.config.solicit_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("solicit listener bind: {e}");
            return;
        }
    };
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut buf = [0u8; 512];
    loop {
        let received = tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let Ok((len, addr)) = received else { break };
        let Some(name) = parse_solicitation(&buf[..len]) else {
            continue;
        };
        if name == shared.config.name {
            continue;
        }
        let below = {
            let peers = shared.peers.lock().unwrap();
            peers.len() < shared.config.degree && !peers.contains_key(&name)
        };
        if !below {
            continue;
        }
        let node = Node {
            shared: shared.clone(),
        };
        let target = SocketAddr::new(addr.ip(), shared.config.mesh_port);
        if let Err(e) = node.dial(target, true).await {
            tracing::debug!(peer = %name, "solicited dial: {e}");
        }
    }
}

/// Emit solicitations while below degree, with jittered backoff.
async fn solicitor(shared: Arc<Shared>) {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("solicitor bind: {e}");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        tracing::warn!("solicitor broadcast: {e}");
        return;
    }

    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut backoff = Backoff::new();
    loop {
        if *shared.shutdown.borrow() {
            break;
        }
        let below = shared.peers.lock().unwrap().len() < shared.config.degree;
        let delay = if below {
            let datagram = solicitation(&shared.config.name);
            let target = (Ipv4Addr::BROADCAST, shared.config.solicit_port);
            if let Err(e) = socket.send_to(&datagram, target).await {
                tracing::debug!("solicitation send: {e}");
            }
            backoff.next_delay()
        } else {
            backoff.reset();
            Duration::from_secs(1)
        };
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Periodic MSA broadcast keeps silent links alive and heals topology.
async fn msa_ticker(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut tick = tokio::time::interval(shared.config.msa_period);
    tick.tick().await; // skip the immediate first tick
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => flood_msa(&shared).await,
        }
    }
}
