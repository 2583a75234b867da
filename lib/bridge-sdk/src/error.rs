/// Errors surfaced by the bridge client. `execute_shell` distinguishes
/// timeout, unresponsive, rejected-while-offline, and I/O failure; the
/// other capabilities share this taxonomy rather than inventing their own.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("io error talking to bridge daemon: {0}")]
    Io(#[from] std::io::Error),

    #[error("shell command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("device did not respond (transient)")]
    Unresponsive,

    #[error("command rejected: device is offline")]
    RejectedWhileOffline,

    #[error("bridge daemon not initialized")]
    NotInitialized,

    #[error("no such device: {0}")]
    NoSuchDevice(String),

    #[error("malformed bridge response: {0}")]
    Protocol(String),
}
