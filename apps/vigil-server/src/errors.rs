use std::time::Duration;

use thiserror::Error;

/// Engine-wide error taxonomy. Fetch-shaped variants are `Clone` so a
/// collapsed request can hand the same outcome to every waiter and the
/// result cache.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("insufficient storage: {available_mb} MB free, {required_mb} MB required")]
    InsufficientStorage { available_mb: u64, required_mb: u64 },

    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    #[error("fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("upstream returned status {0}")]
    HttpStatusError(u16),

    #[error("block page detected")]
    BlockPageDetected,

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("disallowed by robots.txt policy")]
    PolicyBlocked,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Failures the circuit breaker counts against a host. Robots denials
    /// and an already-open circuit are not new evidence.
    pub fn counts_for_breaker(&self) -> bool {
        matches!(
            self,
            EngineError::FetchTimeout(_)
                | EngineError::NetworkError(_)
                | EngineError::HttpStatusError(_)
                | EngineError::BlockPageDetected
        )
    }
}
