/// Result type alias for EIDOS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the EIDOS intelligence substrate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Distillation not found: {0}")]
    DistillationNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Phase violation: cannot transition from {from} to {to}")]
    PhaseViolation { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Storage(_) => true,
            Error::Io(_) => true,
            Error::EpisodeNotFound(_) => false,
            Error::StepNotFound(_) => false,
            Error::DistillationNotFound(_) => false,
            Error::Serialization(_) => false,
            Error::InvalidInput(_) => false,
            Error::InvalidState(_) => false,
            Error::PhaseViolation { .. } => false,
        }
    }
}
