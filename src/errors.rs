// =============================================================================
// Error kinds — classified failures with fixed semantics
// =============================================================================
//
// Workers recover and log per item; only shutdown-inducing errors reach the
// runtime. HTTP handlers translate these into structured bodies and never
// expose stack traces.
// =============================================================================

use thiserror::Error;

use crate::types::PipelineStage;

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint hit on `client_order_id` (or another identity
    /// column). Surfaced distinctly so duplicate submissions are not retried.
    #[error("duplicate row: {0}")]
    Duplicate(String),

    /// A status-guarded UPDATE matched zero rows: another worker won the
    /// race. The caller abandons the iteration; the next cycle re-reads.
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),

    /// Retryable database error. Callers retry once; a second failure is
    /// fatal for the item.
    #[error("transient store error: {0}")]
    Transient(#[from] rusqlite::Error),

    /// A persisted row no longer deserializes (corrupt enum tag, bad JSON).
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

// =============================================================================
// Market data
// =============================================================================

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("provider {provider} returned unusable data: {message}")]
    BadResponse { provider: String, message: String },

    #[error("provider {provider} is not configured")]
    NotConfigured { provider: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            Self::Request { provider, .. }
            | Self::BadResponse { provider, .. }
            | Self::NotConfigured { provider } => provider,
        }
    }
}

// =============================================================================
// Rate limiter
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The limiter is shutting down; all waiters resolve with this.
    #[error("rate limiter shut down while waiting for a token")]
    Shutdown,
}

// =============================================================================
// Broker
// =============================================================================

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker {broker} request failed: {message}")]
    Request { broker: String, message: String },

    #[error("broker {broker} rejected order: {message}")]
    Rejected { broker: String, message: String },

    #[error("broker {broker} is not configured")]
    NotConfigured { broker: String },

    #[error("unknown broker status '{status}' from {broker}")]
    UnknownStatus { broker: String, status: String },
}

// =============================================================================
// Pipeline
// =============================================================================

/// A stage rejection. Not every variant is an *error* in the operational
/// sense — duplicates are dropped silently to the audit log.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} rejected signal: {reason}")]
    Rejected {
        stage: PipelineStage,
        reason: String,
    },

    /// Dedup hit: an identical signal was seen inside the TTL window.
    #[error("duplicate signal dropped")]
    DuplicateSignal,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn rejected(stage: PipelineStage, reason: impl Into<String>) -> Self {
        Self::Rejected {
            stage,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Invalid configuration at startup. The process aborts before serving
/// traffic.
#[derive(Debug, Error)]
pub enum FatalConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required setting: {0}")]
    Missing(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable_duplicate_is_not() {
        let transient = StoreError::Transient(rusqlite::Error::ExecuteReturnedResults);
        assert!(transient.is_retryable());
        assert!(!transient.is_duplicate());

        let dup = StoreError::Duplicate("client_order_id=abc".into());
        assert!(dup.is_duplicate());
        assert!(!dup.is_retryable());

        let conflict = StoreError::Conflict("order status".into());
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn pipeline_rejection_carries_stage() {
        let err = PipelineError::rejected(PipelineStage::Validation, "symbol missing");
        let msg = err.to_string();
        assert!(msg.contains("VALIDATION"));
        assert!(msg.contains("symbol missing"));
    }

    #[test]
    fn provider_error_exposes_provider_name() {
        let err = ProviderError::Request {
            provider: "tradier".into(),
            message: "HTTP 500".into(),
        };
        assert_eq!(err.provider(), "tradier");
    }
}
