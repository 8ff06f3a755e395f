use std::time::Duration;

use thiserror::Error;

/// Domain error taxonomy. Infrastructure plumbing (pool setup, metric
/// registration) stays on `anyhow`; everything a round, entry, or transfer
/// can do wrong is one of these.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Auth,

    #[error("rate limited")]
    RateLimited { retry_after: Duration },

    #[error("{0} is paused")]
    Paused(&'static str),

    #[error("transient external failure: {0}")]
    TransientExternal(String),

    #[error("oracle snapshot stale: published {publish_time}, wanted {requested}")]
    StaleOracle { publish_time: i64, requested: i64 },

    #[error("oracle owner mismatch: expected {expected}, got {actual}")]
    OracleOwnerMismatch { expected: String, actual: String },

    #[error("duplicate identity")]
    Replay,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Self::TransientExternal(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        Self::Fatal(msg.to_string())
    }

    /// Transient failures are retried by the keeper within a tick and
    /// abandoned until the next tick after that. Everything else either
    /// surfaces to the caller or goes to the audit sink.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientExternal(_))
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
