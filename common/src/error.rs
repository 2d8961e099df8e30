use thiserror::Error;

/// Failures reported synchronously by the timer registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("task is invalid or already registered")]
    InvalidTask,
    #[error("no storage left for another registration")]
    AllocationFailure,
    #[error("task is not registered")]
    NotFound,
    #[error("task period must be greater than zero")]
    InvalidPeriod,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
}
