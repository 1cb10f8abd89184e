use ron_mesh::MeshError;
use ron_proto::ProtoError;

/// Errors surfaced by the file fabric.
#[derive(Debug, thiserror::Error)]
pub enum IomError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("no source advertises {file} part {part}")]
    NoSource { file: String, part: i64 },

    #[error("part {part} of {file} failed after retries")]
    PartFailed { file: String, part: i64 },

    #[error("fabric is shut down")]
    Shutdown,
}
