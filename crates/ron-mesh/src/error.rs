use ron_proto::ProtoError;

/// Errors surfaced by the mesh layer.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("ack timeout waiting on {peer}")]
    AckTimeout { peer: String },

    #[error("already connected to {0}")]
    DuplicatePeer(String),

    #[error("refusing to dial self")]
    SelfDial,

    #[error("peer declined handshake")]
    Declined,

    #[error("node is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_route() {
        assert_eq!(MeshError::NoRoute("carol".into()).to_string(), "no route to carol");
    }

    #[test]
    fn display_ack_timeout() {
        let err = MeshError::AckTimeout { peer: "bob".into() };
        assert_eq!(err.to_string(), "ack timeout waiting on bob");
    }
}
