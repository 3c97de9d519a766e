use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Recoverable failures (transport unavailable, store timeout, busy
    /// execution lock). The worker pool retries these with backoff.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Step failed (execution {execution_id}, step {step_id}, attempt {attempts}): {message}")]
    Step {
        execution_id: Uuid,
        step_id: Uuid,
        attempts: u32,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}
