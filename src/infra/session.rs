// src/infra/session.rs — Session lifecycle

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetLedger, Charge};
use crate::cache::{MemoryCache, NoopCache, ResponseCache, YamlFileCache};
use crate::engine::trace::{TraceRecord, TraceSink};
use crate::infra::config::{CacheBackend, Config};
use crate::infra::errors::OracularError;
use crate::oracle::resilience::OracleRunner;
use crate::oracle::Oracle;

/// Everything one exploration shares: the oracle behind its resilience
/// runner, the budget ledger, the response cache, the trace sink and the
/// cancellation token.
///
/// A session is created at the start of an exploration and strictly nested
/// inside it. The ledger and cache are the only state shared across
/// concurrent branches; both are linearizable, so independent interpreters
/// may drive strategies over one session in parallel.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    oracle: Arc<dyn Oracle>,
    runner: Arc<OracleRunner>,
    ledger: Arc<BudgetLedger>,
    trace: Arc<TraceSink>,
    cancel: CancellationToken,
    max_corrective_cycles: u32,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("max_corrective_cycles", &self.max_corrective_cycles)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wire a session from configuration, building the cache backend it
    /// names.
    pub fn new(config: &Config, oracle: Arc<dyn Oracle>) -> Result<Self, OracularError> {
        let cache: Arc<dyn ResponseCache> = if !config.cache.enabled {
            Arc::new(NoopCache)
        } else {
            match config.cache.backend {
                CacheBackend::Memory => Arc::new(MemoryCache::new()),
                CacheBackend::Yaml => {
                    let dir = config.cache.dir.clone().ok_or_else(|| {
                        OracularError::Config(
                            "cache.backend = \"yaml\" requires cache.dir".into(),
                        )
                    })?;
                    Arc::new(YamlFileCache::open(dir)?)
                }
            }
        };
        Ok(Self::with_cache(config, oracle, cache))
    }

    /// Wire a session around a caller-provided cache, e.g. one shared
    /// between explorations.
    pub fn with_cache(
        config: &Config,
        oracle: Arc<dyn Oracle>,
        cache: Arc<dyn ResponseCache>,
    ) -> Self {
        let ledger = Arc::new(BudgetLedger::new(config.budget.limit()));
        let cancel = CancellationToken::new();
        let runner = Arc::new(OracleRunner::new(
            oracle.clone(),
            cache,
            ledger.clone(),
            config.retry.retry_config(),
            cancel.clone(),
        ));

        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            oracle,
            runner,
            ledger,
            trace: Arc::new(TraceSink::new()),
            cancel,
            max_corrective_cycles: config.feedback.max_corrective_cycles,
        };
        tracing::debug!(session = %session.id, "session opened");
        session
    }

    pub fn oracle(&self) -> &dyn Oracle {
        self.oracle.as_ref()
    }

    pub fn runner(&self) -> &OracleRunner {
        &self.runner
    }

    pub fn trace(&self) -> &TraceSink {
        &self.trace
    }

    pub fn max_corrective_cycles(&self) -> u32 {
        self.max_corrective_cycles
    }

    /// Committed spend so far.
    pub fn budget_snapshot(&self) -> Charge {
        self.ledger.snapshot()
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn trace_records(&self) -> Vec<TraceRecord> {
        self.trace.records()
    }

    /// Stop the exploration: in-flight attempts finish, no new attempts or
    /// effects are dispatched. Budget already committed stays committed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tear the session down, yielding its final accounting and trace.
    pub fn close(self) -> SessionSummary {
        self.cancel.cancel();
        let summary = SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            closed_at: Utc::now(),
            spent: self.ledger.snapshot(),
            trace: self.trace.records(),
        };
        tracing::debug!(session = %summary.id, "session closed");
        summary
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Releases anything still waiting on the token even if the caller
        // never called close().
        self.cancel.cancel();
    }
}

/// Final accounting for a closed session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub spent: Charge,
    pub trace: Vec<TraceRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::CacheConfig;
    use crate::oracle::{ModelInfo, OracleRequest, OracleResponse};
    use async_trait::async_trait;

    struct NullOracle;

    #[async_trait]
    impl Oracle for NullOracle {
        fn id(&self) -> &str {
            "null"
        }
        fn name(&self) -> &str {
            "Null"
        }
        fn models(&self) -> Vec<ModelInfo> {
            vec![]
        }
        async fn send(&self, _request: OracleRequest) -> Result<OracleResponse, OracularError> {
            Err(OracularError::Transport {
                oracle: "null".into(),
                message: "no transport".into(),
                retriable: false,
            })
        }
    }

    #[test]
    fn test_session_from_default_config() {
        let session = Session::new(&Config::default(), Arc::new(NullOracle)).unwrap();
        assert!(!session.is_cancelled());
        assert!(session.budget_snapshot().is_zero());
        assert_eq!(session.max_corrective_cycles(), 3);
    }

    #[test]
    fn test_yaml_backend_requires_dir() {
        let config = Config {
            cache: CacheConfig {
                enabled: true,
                backend: CacheBackend::Yaml,
                dir: None,
            },
            ..Config::default()
        };
        let err = Session::new(&config, Arc::new(NullOracle)).unwrap_err();
        assert!(matches!(err, OracularError::Config(_)));
    }

    #[test]
    fn test_cancel_is_sticky_and_close_reports() {
        let session = Session::new(&Config::default(), Arc::new(NullOracle)).unwrap();
        session.cancel();
        assert!(session.is_cancelled());

        let summary = session.close();
        assert!(summary.spent.is_zero());
        assert!(summary.trace.is_empty());
        assert!(summary.closed_at >= summary.created_at);
    }

    #[test]
    fn test_drop_cancels_token() {
        let token = {
            let session = Session::new(&Config::default(), Arc::new(NullOracle)).unwrap();
            session.cancellation_token()
        };
        assert!(token.is_cancelled());
    }
}
