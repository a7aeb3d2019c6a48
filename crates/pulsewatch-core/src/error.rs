use thiserror::Error;

/// Errors surfaced by a single probe attempt (HTTP or SQL).
///
/// Retriability is a property of the variant, not of the caller: `Cancelled`
/// and `ResultShapeMismatch` are never worth retrying (see `is_retriable`).
#[derive(Debug, Error, Clone)]
pub enum ProbeError {
    #[error("probe timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("sql connect failed: {0}")]
    Connect(String),

    #[error("sql execute failed: {0}")]
    Execute(String),

    #[error("result shape mismatch: {0}")]
    ResultShapeMismatch(String),

    #[error("probe cancelled")]
    Cancelled,

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProbeError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProbeError::Cancelled | ProbeError::ResultShapeMismatch(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Retriable(String),

    #[error("permanent store failure: {0}")]
    Permanent(String),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error("spill file error: {0}")]
    Spill(#[from] std::io::Error),

    #[error("spill record serialization error: {0}")]
    SpillSerde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("job {0} is not in a state that allows this operation")]
    InvalidState(uuid::Uuid),

    #[error("governor resource exhausted")]
    ResourceExhausted,

    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Top-level error type. Library code returns this, or one of the narrower
/// sub-errors above where the caller benefits from matching on it; the CLI
/// binary wraps it in `anyhow::Context` at the process boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_probe_errors_are_not_retriable() {
        assert!(!ProbeError::Cancelled.is_retriable());
        assert!(!ProbeError::ResultShapeMismatch("scalar expected".into()).is_retriable());
    }

    #[test]
    fn timeout_is_retriable() {
        assert!(ProbeError::Timeout(5000).is_retriable());
    }

    #[test]
    fn probe_error_converts_into_top_level_error() {
        let err: Error = ProbeError::Transport("dns failure".into()).into();
        assert!(matches!(err, Error::Probe(ProbeError::Transport(_))));
    }
}
