use std::time::Duration;

use thiserror::Error;

/// Failure conditions reported by a transport gateway.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("rate limited by source")]
    RateLimited { retry_after: Option<Duration> },
    #[error("source refused credentials: {0}")]
    Unauthorized(String),
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("source rejected query: {0}")]
    InvalidQuery(String),
    #[error("could not decode source response: {0}")]
    Decode(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited { .. } | TransportError::Transient(_)
        )
    }

    /// Minimum wait the source asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Error type for planning, fetching and assembling a normalized series.
#[derive(Debug, Error)]
pub enum StitchError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("degenerate data: {0}")]
    DegenerateData(String),
    #[error("assembly invariant violated: {0}")]
    AssemblyInvariantViolation(String),
    #[error("cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
}
