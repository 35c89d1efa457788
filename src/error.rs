use thiserror::Error;

/// Failure classes the engine distinguishes when handling a signal or a
/// broker update. Everything else rides on `anyhow` at the command layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or incomplete signal payload. Rejected before persistence.
    #[error("invalid signal: {0}")]
    Validation(String),

    /// Re-delivery of an already-recorded alert. Not a failure; callers
    /// report the existing trade_id as a success.
    #[error("duplicate signal for trade {0}")]
    DuplicateSignal(String),

    /// The broker refused the order (bad symbol, buying power, ...).
    /// Terminal for the order; never retried automatically.
    #[error("broker rejected order: {0}")]
    BrokerRejected(String),

    /// Transient transport problem talking to the broker. The order stays in
    /// a non-terminal state and the pull sync resolves it later.
    #[error("broker transport error: {0}")]
    BrokerTransport(String),

    /// A broker-reported state older than what is already stored locally.
    /// The more-advanced local state is kept.
    #[error("reconciliation conflict for trade {trade_id}: {detail}")]
    ReconciliationConflict { trade_id: String, detail: String },

    /// The durable store is unreachable. The engine fails closed: new
    /// submissions are rejected rather than accepted without durability.
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::BrokerTransport(_) | EngineError::Storage(_)
        )
    }

    /// HTTP status the webhook surface maps this failure to. Duplicates and
    /// broker-side failures are 200s: the signal was recorded and the
    /// failure is surfaced on the order row, not the transport.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::DuplicateSignal(_) => 200,
            EngineError::BrokerRejected(_) => 200,
            EngineError::BrokerTransport(_) => 200,
            EngineError::ReconciliationConflict { .. } => 409,
            EngineError::Storage(_) => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_and_broker_failures_are_not_http_errors() {
        assert_eq!(EngineError::DuplicateSignal("t-1".to_string()).http_status(), 200);
        assert_eq!(
            EngineError::BrokerRejected("insufficient buying power".to_string()).http_status(),
            200
        );
    }

    #[test]
    fn validation_and_storage_fail_the_request() {
        assert_eq!(EngineError::Validation("missing symbol".to_string()).http_status(), 400);
        assert_eq!(EngineError::Storage("connect refused".to_string()).http_status(), 503);
    }

    #[test]
    fn only_transport_and_storage_failures_are_transient() {
        assert!(EngineError::BrokerTransport("timeout".to_string()).is_transient());
        assert!(EngineError::Storage("down".to_string()).is_transient());
        assert!(!EngineError::BrokerRejected("bad symbol".to_string()).is_transient());
        assert!(!EngineError::Validation("bad".to_string()).is_transient());
    }
}
