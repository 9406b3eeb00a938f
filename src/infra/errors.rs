// src/infra/errors.rs — Error types for Oracular

use thiserror::Error;

use crate::budget::BudgetCategory;

#[derive(Error, Debug)]
pub enum OracularError {
    // Programming error in an effect declaration; fatal for the branch, never retried
    #[error("malformed query spec for '{query}': {detail}")]
    MalformedQuerySpec { query: String, detail: String },

    // Recoverable: drives the corrective-retry loop
    #[error("parse failed at stage '{stage}': {message}")]
    Parse { stage: String, message: String },

    #[error("validation '{predicate}' rejected the value: {message}")]
    Validation { predicate: String, message: String },

    // Transport classification, consumed by the resilience layer
    #[error("oracle '{oracle}' transport error: {message}")]
    Transport {
        oracle: String,
        message: String,
        retriable: bool,
    },

    #[error("rate limited by '{oracle}', retry after {retry_after_ms}ms")]
    RateLimited { oracle: String, retry_after_ms: u64 },

    // Transient failures exhausted their retry budget; recoverable at the branch level
    #[error("oracle '{oracle}' unavailable after {attempts} attempts")]
    OracleUnavailable { oracle: String, attempts: u32 },

    // Non-retriable provider error; propagates to the session
    #[error("oracle '{oracle}' rejected the request: {message}")]
    OracleRejected { oracle: String, message: String },

    // Policy-level signal, not a hard failure of the exploration
    #[error("budget exceeded for {category}: {spent} of {ceiling}")]
    BudgetExceeded {
        category: BudgetCategory,
        spent: f64,
        ceiling: f64,
    },

    #[error("session cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OracularError {
    /// Transient transport failures the resilience layer may retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            OracularError::Transport {
                retriable: true,
                ..
            } | OracularError::RateLimited { .. }
        )
    }

    /// Failures the interpreter answers with a corrective follow-up query.
    pub fn is_correctable(&self) -> bool {
        matches!(
            self,
            OracularError::Parse { .. } | OracularError::Validation { .. }
        )
    }

    /// Failures local to the branch that raised them; the driver backtracks
    /// instead of aborting the session.
    pub fn is_branch_local(&self) -> bool {
        matches!(
            self,
            OracularError::MalformedQuerySpec { .. }
                | OracularError::Parse { .. }
                | OracularError::Validation { .. }
                | OracularError::OracleUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let rate_limited = OracularError::RateLimited {
            oracle: "test".into(),
            retry_after_ms: 5000,
        };
        assert!(rate_limited.is_retriable());

        let transient = OracularError::Transport {
            oracle: "test".into(),
            message: "HTTP 503".into(),
            retriable: true,
        };
        assert!(transient.is_retriable());

        let rejected = OracularError::Transport {
            oracle: "test".into(),
            message: "HTTP 401".into(),
            retriable: false,
        };
        assert!(!rejected.is_retriable());
    }

    #[test]
    fn test_correctable_classification() {
        let parse = OracularError::Parse {
            stage: "code_block".into(),
            message: "no fenced block found".into(),
        };
        assert!(parse.is_correctable());

        let validation = OracularError::Validation {
            predicate: "non_empty".into(),
            message: "empty list".into(),
        };
        assert!(validation.is_correctable());

        assert!(!OracularError::Cancelled.is_correctable());
    }

    #[test]
    fn test_branch_local_classification() {
        let unavailable = OracularError::OracleUnavailable {
            oracle: "test".into(),
            attempts: 3,
        };
        assert!(unavailable.is_branch_local());

        let rejected = OracularError::OracleRejected {
            oracle: "test".into(),
            message: "invalid api key".into(),
        };
        assert!(!rejected.is_branch_local());
    }

    #[test]
    fn test_display_includes_context() {
        let err = OracularError::BudgetExceeded {
            category: BudgetCategory::Requests,
            spent: 10.0,
            ceiling: 10.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("requests"));
        assert!(msg.contains("10"));
    }
}
