use std::time::Duration;

/// Errors surfaced by the RON wire layer.
///
/// End-of-stream and read timeouts are distinct variants so supervisors
/// can tell a dead transport from a slow one.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("end of stream")]
    Eof,

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("bad magic from peer")]
    BadMagic,

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    #[error("invalid filter: {0}")]
    Filter(String),

    #[error("trunk closed")]
    TrunkClosed,
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::Eof
        } else {
            ProtoError::Io(e)
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtoError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtoError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtoError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtoError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_io_error_maps_to_eof() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(ProtoError::from(io), ProtoError::Eof));
    }

    #[test]
    fn other_io_errors_stay_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(ProtoError::from(io), ProtoError::Io(_)));
    }

    #[test]
    fn display_timeout() {
        let err = ProtoError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
    }
}
