use gradflow_types::GradflowError;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("gradflow has not been initialized; call init() first")]
    NotInitialized,

    #[error("gradflow has been shut down and cannot be re-initialized")]
    ShutDown,

    #[error("gradflow init failed earlier and cannot be retried")]
    InitFailed,

    #[error("communicator error: {0}")]
    Communicator(String),

    #[error("parameter server error: {0}")]
    ParameterServer(String),

    #[error("device runtime error: {0}")]
    Device(String),

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("tensor {name}: partition {partition} is already in flight")]
    DuplicateEntry { name: String, partition: usize },

    #[error("tensor {name}: registered with {registered} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        registered: usize,
        actual: usize,
    },

    #[error(transparent)]
    Config(#[from] GradflowError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
