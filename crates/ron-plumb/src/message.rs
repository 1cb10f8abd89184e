/// Cross-node plumbing messages, carried as mesh bodies.
use serde::{Deserialize, Serialize};

/// Mesh channel the plumbing fabric listens on.
pub const CHANNEL: &str = "plumb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlumbKind {
    /// Deliver a value to a pipe (all readers, or one annotated reader).
    Forward,
    /// Enumerate readers of a pipe.
    Query,
    QueryResponse,
    /// Run this write through the pipe's via program on its pinned host.
    ViaWrite,
    /// Announce where a pipe's via program runs.
    ViaHost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlumbMessage {
    pub kind: PlumbKind,
    pub from: String,
    pub tid: i64,
    pub pipe: String,
    pub value: String,
    /// Reader IDs on the responding node (QueryResponse).
    pub readers: Vec<u64>,
    /// Target reader of an annotated Forward; 0 addresses all readers.
    pub reader: u64,
    /// Via program argv (ViaHost announcement).
    pub via: Vec<String>,
    pub host: String,
}

impl PlumbMessage {
    pub fn new(kind: PlumbKind, from: impl Into<String>, pipe: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            tid: 0,
            pipe: pipe.into(),
            value: String::new(),
            readers: Vec::new(),
            reader: 0,
            via: Vec::new(),
            host: String::new(),
        }
    }
}
