// errors.rs — subsystem error taxonomy, thiserror-derived at each boundary.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    #[error("exchange rejected action: {0}")]
    Rejected(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("auth failure: {0}")]
    Auth(String),
}

impl GatewayError {
    /// Transient-network classification drives the Gateway's own retry loop;
    /// everything else is handed back to the caller as a terminal outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_) | GatewayError::RateLimited)
    }
}
