/*
[INPUT]:  Venue error codes and transport failures
[OUTPUT]: Normalized error taxonomy with transient/permanent classification
[POS]:    Error handling layer - unified error types for the gateway surface
[UPDATE]: When a venue surfaces a new error class the engine must react to
*/

use thiserror::Error;

/// Normalized venue error surfaced to the engine.
///
/// Per-venue numeric codes are mapped into these variants by each
/// gateway implementation; anything unrecognized lands in `Venue` with
/// the raw code and message preserved.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("invalid order parameter: {0}")]
    InvalidOrderParameter(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("duplicate order: {0}")]
    DuplicateOrder(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("system overload: {0}")]
    SystemOverload(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("network error: {0}")]
    Network(String),

    /// Venue error code the adapter does not map to a known class.
    #[error("venue error (code {code}): {message}")]
    Venue { code: i64, message: String },
}

impl ExchangeError {
    /// Transient errors are retried by the order executor; everything
    /// else is surfaced to the caller as permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::RateLimitExceeded(_)
            | ExchangeError::SystemOverload(_)
            | ExchangeError::Network(_) => true,
            ExchangeError::Venue { message, .. } => message_looks_transient(message),
            _ => false,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, ExchangeError::AuthenticationFailed(_))
    }

    /// Cancels treat a missing order as already done.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExchangeError::OrderNotFound(_))
    }
}

/// Venues that speak HTTP-level throttling rather than a mapped code
/// still classify as transient by message inspection.
pub fn message_looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("429") || lower.contains("timeout")
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        assert!(ExchangeError::RateLimitExceeded("10s".into()).is_transient());
        assert!(ExchangeError::SystemOverload("busy".into()).is_transient());
        assert!(ExchangeError::Network("reset by peer".into()).is_transient());
        assert!(!ExchangeError::OrderRejected("post-only cross".into()).is_transient());
        assert!(!ExchangeError::AuthenticationFailed("bad key".into()).is_transient());
    }

    #[test]
    fn unmapped_venue_errors_classify_by_message() {
        let throttled = ExchangeError::Venue {
            code: -1003,
            message: "Too many requests; current limit is 429".into(),
        };
        assert!(throttled.is_transient());

        let rejected = ExchangeError::Venue {
            code: -2010,
            message: "Account has insufficient balance".into(),
        };
        assert!(!rejected.is_transient());
    }

    #[test]
    fn not_found_is_distinguished_for_cancels() {
        assert!(ExchangeError::OrderNotFound("42".into()).is_not_found());
        assert!(!ExchangeError::OrderRejected("42".into()).is_not_found());
    }
}
