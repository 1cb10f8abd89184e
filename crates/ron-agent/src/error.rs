use ron_proto::ProtoError;

/// Errors surfaced by the agent core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake with controller failed")]
    Handshake,

    #[error("dial retry budget exhausted")]
    DialBudget,

    #[error("another agent is running (pid {0})")]
    PidfileAlive(u32),

    #[error("serial reconnect is unsafe on this platform")]
    SerialUnsafe,

    #[error("session reset")]
    Reset,

    #[error("file transfer failed: {0}")]
    FileTransfer(String),
}
