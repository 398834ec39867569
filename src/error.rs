use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("store i/o error: {0}")]
    Store(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("lock on {path} not acquired within {waited_ms}ms")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("resource {0} is already running in this process")]
    AlreadyRunning(String),

    #[error("lease for {0} is held by another instance")]
    NotAcquired(String),

    #[error("resource {0} is not configured")]
    UnknownResource(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WardenError>;
