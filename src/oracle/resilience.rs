// src/oracle/resilience.rs — Retry, caching and accounting around the transport
//
// Wraps a raw Oracle with the full resolution pipeline: fingerprint → cache
// → budget reservation → single-flight gate → timed attempts with backoff.
// Retries: rate limits, 5xx-class transport errors, attempt timeouts.
// Does NOT retry: auth failures, malformed requests, any non-transient error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetLedger, Charge};
use crate::cache::{Fingerprint, ResponseCache};
use crate::infra::errors::OracularError;
use crate::oracle::{ModelInfo, Oracle, OracleRequest, OracleResponse, QueryResponse};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_JITTER_FRACTION: f64 = 0.2;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 120;

// Rough chars-per-token ratio used for worst-case input estimates.
const CHARS_PER_TOKEN: f64 = 4.0;

/// Retry/backoff parameters for one oracle.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total transport attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    /// Bounds a single oracle round trip; distinct from budget ceilings.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        }
    }
}

/// Resolves requests against an oracle, transparently handling the cache,
/// the budget ledger and transient transport failures.
///
/// Shared by every branch of an exploration; all methods take `&self`.
pub struct OracleRunner {
    oracle: Arc<dyn Oracle>,
    cache: Arc<dyn ResponseCache>,
    ledger: Arc<BudgetLedger>,
    config: RetryConfig,
    cancel: CancellationToken,
    // Single-flight gates: one watch sender per in-flight fingerprint.
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<bool>>>,
}

impl OracleRunner {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        cache: Arc<dyn ResponseCache>,
        ledger: Arc<BudgetLedger>,
        config: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            oracle,
            cache,
            ledger,
            config,
            cancel,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn oracle_id(&self) -> &str {
        self.oracle.id()
    }

    pub fn fingerprint(&self, request: &OracleRequest) -> Fingerprint {
        Fingerprint::compute(self.oracle.id(), request)
    }

    /// Resolve a request to a response.
    ///
    /// Cache hits return immediately and commit a zero-cost accounting
    /// event. Misses reserve a worst-case budget estimate, go through the
    /// single-flight gate (identical concurrent requests wait for the first
    /// instead of duplicating the call), then run the attempt loop.
    pub async fn execute(&self, request: &OracleRequest) -> Result<QueryResponse, OracularError> {
        let fingerprint = self.fingerprint(request);

        loop {
            if self.cancel.is_cancelled() {
                return Err(OracularError::Cancelled);
            }

            if let Some(hit) = self.cache.lookup(&fingerprint) {
                self.ledger.commit(&Charge::cache_hit());
                tracing::debug!(fingerprint = %fingerprint, "cache hit");
                return Ok(hit);
            }

            let role = {
                let mut in_flight = self.in_flight.lock().await;
                // Re-check under the lock: the previous leader may have
                // stored its response between our lookup and here.
                if let Some(hit) = self.cache.lookup(&fingerprint) {
                    GateRole::Hit(hit)
                } else {
                    match in_flight.get(&fingerprint) {
                        Some(busy) => GateRole::Waiter(busy.clone()),
                        None => {
                            let (done, busy) = watch::channel(false);
                            in_flight.insert(fingerprint.clone(), busy);
                            GateRole::Leader(done)
                        }
                    }
                }
            };

            match role {
                GateRole::Hit(hit) => {
                    self.ledger.commit(&Charge::cache_hit());
                    return Ok(hit);
                }
                GateRole::Leader(done) => return self.lead(request, &fingerprint, done).await,
                GateRole::Waiter(mut busy) => {
                    tokio::select! {
                        _ = busy.changed() => {}
                        _ = self.cancel.cancelled() => return Err(OracularError::Cancelled),
                    }
                    // Leader finished; loop to pick up its cached response
                    // (or become the new leader if it failed).
                }
            }
        }
    }

    /// Perform the real call as the single-flight leader.
    async fn lead(
        &self,
        request: &OracleRequest,
        fingerprint: &Fingerprint,
        done: watch::Sender<bool>,
    ) -> Result<QueryResponse, OracularError> {
        let result = self.call_and_account(request, fingerprint).await;
        self.in_flight.lock().await.remove(fingerprint);
        let _ = done.send(true);
        result
    }

    async fn call_and_account(
        &self,
        request: &OracleRequest,
        fingerprint: &Fingerprint,
    ) -> Result<QueryResponse, OracularError> {
        let estimate = self.estimate(request);
        self.ledger.reserve(&estimate)?;

        let outcome = self.attempt_loop(request).await;
        self.ledger.release(&estimate);

        let (raw, attempts, latency_ms) = outcome?;
        let charge = match self.model_info(&request.model) {
            Some(info) => Charge::from_usage(&raw.usage, &info),
            // Unknown model: count tokens, price as zero.
            None => Charge {
                requests: 1.0,
                completions: 1.0,
                input_tokens: raw.usage.input_tokens as f64,
                cached_input_tokens: raw.usage.cached_input_tokens as f64,
                output_tokens: raw.usage.output_tokens as f64,
                cost_usd: 0.0,
            },
        };
        self.ledger.commit(&charge);

        let response = QueryResponse::from_raw(raw, self.oracle.id(), latency_ms, attempts);
        self.cache.store(fingerprint, &response);
        Ok(response)
    }

    /// Timed attempts with exponential backoff on transient failures.
    async fn attempt_loop(
        &self,
        request: &OracleRequest,
    ) -> Result<(OracleResponse, u32, u64), OracularError> {
        for attempt in 0..self.config.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(OracularError::Cancelled);
            }

            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.config.attempt_timeout, self.oracle.send(request.clone()))
                    .await;

            let error = match outcome {
                Ok(Ok(raw)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    return Ok((raw, attempt + 1, latency_ms));
                }
                Ok(Err(e)) if e.is_retriable() => e,
                Ok(Err(e)) => return Err(self.reject(e)),
                Err(_) => OracularError::Transport {
                    oracle: self.oracle.id().to_string(),
                    message: format!(
                        "attempt timed out after {}s",
                        self.config.attempt_timeout.as_secs()
                    ),
                    retriable: true,
                },
            };

            if attempt + 1 == self.config.max_attempts {
                break;
            }

            let delay = self.delay_for_attempt(attempt, rate_limit_hint(&error));
            tracing::warn!(
                oracle = self.oracle.id(),
                attempt = attempt + 1,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient error: {error}"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(OracularError::Cancelled),
            }
        }

        Err(OracularError::OracleUnavailable {
            oracle: self.oracle.id().to_string(),
            attempts: self.config.max_attempts,
        })
    }

    /// Non-transient transport failures surface as a rejection.
    fn reject(&self, error: OracularError) -> OracularError {
        match error {
            already @ OracularError::OracleRejected { .. } => already,
            other => OracularError::OracleRejected {
                oracle: self.oracle.id().to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Worst-case charge for one real call, used for the reservation.
    fn estimate(&self, request: &OracleRequest) -> Charge {
        let info = self.model_info(&request.model);
        let input_chars: usize = request
            .messages
            .iter()
            .map(|m| m.content.len())
            .chain(request.system.iter().map(|s| s.len()))
            .sum();
        let input_tokens = input_chars as f64 / CHARS_PER_TOKEN;
        let output_tokens = request
            .sampling
            .max_tokens
            .or(info.as_ref().map(|i| i.max_output_tokens))
            .unwrap_or(4096) as f64;

        let cost_usd = info
            .as_ref()
            .map(|i| {
                (input_tokens / 1_000_000.0) * i.input_price_per_mtok
                    + (output_tokens / 1_000_000.0) * i.output_price_per_mtok
            })
            .unwrap_or(0.0);

        Charge {
            requests: 1.0,
            completions: 1.0,
            input_tokens,
            cached_input_tokens: 0.0,
            output_tokens,
            cost_usd,
        }
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        self.oracle.models().into_iter().find(|m| m.id == model)
    }

    /// Delay before the retry following `attempt` (0-indexed).
    fn delay_for_attempt(&self, attempt: u32, rate_limit_delay: Option<Duration>) -> Duration {
        // If the server told us how long to wait, use that with a small buffer.
        if let Some(hint) = rate_limit_delay {
            return hint + Duration::from_millis(100);
        }

        let base_ms = self.config.base_delay.as_millis() as f64
            * self.config.backoff_factor.powi(attempt as i32);
        let capped_ms = base_ms.min(self.config.max_delay.as_millis() as f64);
        let jitter = deterministic_jitter(attempt, self.config.jitter_fraction);
        Duration::from_millis((capped_ms * jitter).max(1.0) as u64)
    }
}

enum GateRole {
    Hit(QueryResponse),
    Leader(watch::Sender<bool>),
    Waiter(watch::Receiver<bool>),
}

fn rate_limit_hint(error: &OracularError) -> Option<Duration> {
    match error {
        OracularError::RateLimited { retry_after_ms, .. } if *retry_after_ms > 0 => {
            Some(Duration::from_millis(*retry_after_ms))
        }
        _ => None,
    }
}

/// Deterministic jitter so retry timing is reproducible in tests.
/// Returns a multiplier in [1 - fraction, 1 + fraction].
fn deterministic_jitter(attempt: u32, fraction: f64) -> f64 {
    let hash = attempt.wrapping_mul(2654435761) as f64 / u32::MAX as f64;
    1.0 + fraction * (2.0 * hash - 1.0)
}
