// Workspace-wide error type for configuration and parsing.

#[derive(Debug, thiserror::Error)]
pub enum GradflowError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("unknown data type: {0}")]
    UnknownDataType(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, GradflowError>;
