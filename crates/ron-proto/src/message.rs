/// The RON message envelope and its tagged payload variants.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::client::ClientSnapshot;
use crate::command::Command;

/// Current protocol version string.
pub const VERSION: &str = "v1";

/// Fixed chunk size for file transfer, shared with the IOM part size.
pub const PART_SIZE: usize = 10 << 20;

/// One RON message. Every message carries the UUID of the agent endpoint
/// and the protocol version of the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub version: String,
    pub uuid: String,
    pub payload: Payload,
}

impl Message {
    pub fn new(uuid: impl Into<String>, payload: Payload) -> Self {
        Self {
            version: VERSION.to_string(),
            uuid: uuid.into(),
            payload,
        }
    }
}

/// Tagged payload. Unused arms cost nothing on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Full agent snapshot (handshake and heartbeat).
    Client(Box<ClientSnapshot>),
    /// Command fan-out, keyed by command ID.
    Commands(BTreeMap<u64, Command>),
    /// File-transfer chunk or request.
    File(FileChunk),
    /// Opaque bytes for the tunnel engine.
    Tunnel(Vec<u8>),
    /// Named-pipe plumbing frame.
    Pipe(PipeFrame),
    /// File-server relay frame.
    Ufs(UfsFrame),
    /// Keepalive, empty by design.
    Heartbeat,
}

/// A chunk of a file in flight, or a request for one when `data` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileChunk {
    /// Relative path, forward-slash separated regardless of host OS.
    pub name: String,
    /// Byte offset of this chunk.
    pub offset: u64,
    pub data: Vec<u8>,
    /// POSIX mode bits.
    pub perm: u32,
    /// Set on the final chunk of a stream.
    pub eof: bool,
    /// The command ID on whose behalf the file moves.
    pub id: u64,
    /// Non-empty when the transfer failed (e.g. file not found).
    pub error: String,
}

impl FileChunk {
    /// A request for `name`: no data, offset zero.
    pub fn request(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
            ..Default::default()
        }
    }
}

/// Plumbing frame: pipe traffic and reader/writer registration between
/// an agent and its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipeOp {
    /// The agent registers a reader; the controller forwards pipe values.
    NewReader,
    /// The agent registers a writer (bookkeeping only).
    NewWriter,
    Data,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeFrame {
    pub name: String,
    pub op: PipeOp,
    pub value: String,
}

/// File-server relay frame carried over the UFS trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UfsOp {
    Open,
    Data,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UfsFrame {
    pub op: UfsOp,
    pub data: Vec<u8>,
}
