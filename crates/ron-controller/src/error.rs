use ron_proto::ProtoError;
use ron_tunnel::TunnelError;

/// Errors surfaced by the controller core.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed")]
    Handshake,

    #[error("unknown agent {0}")]
    UnknownAgent(String),

    #[error("no such client {0}")]
    NoSuchClient(String),

    #[error("checkpoint timed out; missing {0} acks")]
    Checkpoint(usize),

    #[error("controller is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_unknown_agent() {
        assert_eq!(
            ControllerError::UnknownAgent("aaaa".into()).to_string(),
            "unknown agent aaaa"
        );
    }
}
