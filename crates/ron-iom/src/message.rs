/// Messages of the file fabric, carried as mesh unicast/broadcast bodies.
use serde::{Deserialize, Serialize};

/// Mesh channel the fabric listens on.
pub const CHANNEL: &str = "iom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IomKind {
    /// Who has any version of this file (or glob)?
    Info,
    /// Who has this specific part?
    WhoHas,
    /// Send me this part.
    Xfer,
    /// Answer to any of the above, correlated by TID.
    Response,
}

/// One fabric message. Unused fields stay empty; `tid` correlates a
/// response to its query and unknown TIDs are dropped silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IomMessage {
    pub kind: IomKind,
    pub from: String,
    pub tid: i64,
    pub filename: String,
    pub part: i64,
    /// Total part count, in info responses.
    pub parts: i64,
    pub size: u64,
    pub data: Vec<u8>,
    pub perm: u32,
    /// Modification time, Unix seconds.
    pub modtime: i64,
    pub hash: String,
    /// Glob-expansion matches, base-relative forward-slash paths.
    pub glob: Vec<String>,
    pub ack: bool,
}

impl IomMessage {
    pub fn new(kind: IomKind, from: impl Into<String>, tid: i64) -> Self {
        Self {
            kind,
            from: from.into(),
            tid,
            filename: String::new(),
            part: -1,
            parts: 0,
            size: 0,
            data: Vec::new(),
            perm: 0,
            modtime: 0,
            hash: String::new(),
            glob: Vec::new(),
            ack: false,
        }
    }

    /// A negative response: "I don't have it".
    pub fn nack(from: impl Into<String>, tid: i64, filename: impl Into<String>) -> Self {
        let mut message = Self::new(IomKind::Response, from, tid);
        message.filename = filename.into();
        message
    }
}

/// What one responder advertises for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Base-relative forward-slash path.
    pub name: String,
    pub size: u64,
    pub parts: i64,
    pub perm: u32,
    pub modtime: i64,
    pub hash: String,
    /// Node advertising this version.
    pub from: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let mut message = IomMessage::new(IomKind::WhoHas, "alpha", 42);
        message.filename = "images/disk.qcow2".into();
        message.part = 7;
        let bytes = ron_proto::to_record(&message).unwrap();
        let decoded: IomMessage = ron_proto::from_record(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn nack_is_not_an_ack() {
        let nack = IomMessage::nack("alpha", 1, "missing");
        assert!(!nack.ack);
        assert_eq!(nack.kind, IomKind::Response);
    }
}
