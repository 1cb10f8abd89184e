use ron_mesh::MeshError;
use ron_proto::ProtoError;

/// Errors surfaced by the plumbing fabric.
#[derive(Debug, thiserror::Error)]
pub enum PlumbError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipe {0} has no readers")]
    NoReaders(String),

    #[error("via program failed on pipe {pipe}: {reason}")]
    Via { pipe: String, reason: String },

    #[error("empty pipeline stage")]
    EmptyStage,

    #[error("pipeline stage failed: {0}")]
    Stage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_readers() {
        assert_eq!(
            PlumbError::NoReaders("events".into()).to_string(),
            "pipe events has no readers"
        );
    }
}
