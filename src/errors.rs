use thiserror::Error;

/// Error taxonomy for the dispatch pipeline. Retriable kinds flow back into
/// the queue with backoff; permanent kinds dead-letter the item.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),
    #[error("permanent transport error: {0}")]
    PermanentTransport(String),
    #[error("transient agent error: {0}")]
    TransientAgent(String),
    #[error("permanent agent error: {0}")]
    PermanentAgent(String),
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("duplicate message")]
    Duplicate,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bot paused for user")]
    Paused,
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("circuit open")]
    CircuitOpen,
}

impl DispatchError {
    /// Whether the queue should re-enqueue the item with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DispatchError::TransientTransport(_)
                | DispatchError::TransientAgent(_)
                | DispatchError::CacheUnavailable(_)
                | DispatchError::StoreUnavailable(_)
                | DispatchError::DeadlineExceeded(_)
                | DispatchError::CircuitOpen
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(DispatchError::TransientTransport("503".into()).is_retriable());
        assert!(DispatchError::CircuitOpen.is_retriable());
        assert!(DispatchError::DeadlineExceeded("agent".into()).is_retriable());
        assert!(!DispatchError::PermanentTransport("404".into()).is_retriable());
        assert!(!DispatchError::Duplicate.is_retriable());
        assert!(!DispatchError::Paused.is_retriable());
    }
}
