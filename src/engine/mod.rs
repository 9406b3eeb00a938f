// src/engine/mod.rs — Policy interpreter: walks the effect tree and resolves effects

pub mod policy;
pub mod trace;

use std::sync::Arc;

use serde_json::Value;

use crate::budget::Charge;
use crate::infra::errors::OracularError;
use crate::infra::session::Session;
use crate::oracle::SamplingParams;
use crate::query::feedback::{corrective_request, FeedbackRecord};
use crate::query::RequestSummary;
use crate::tree::{BranchNode, Effect, FailureReason, Node, Strategy};
use policy::{BudgetVerdict, SearchPolicy};
use trace::{ResolutionOutcome, TraceRecord};

/// States of one effect resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectState {
    Pending,
    AwaitingResponse,
    Parsed,
    ParseFailed,
    Accepted,
    CorrectiveRetry,
    Exhausted,
}

/// How the whole exploration ended. Always one of these, never a silent
/// empty result.
pub enum SessionStatus<T> {
    /// At least one success value was materialized.
    Completed { values: Vec<T> },
    /// The search space was exhausted; the diagnostic chain explains the
    /// last dead end.
    Failed { failure: FailureReason },
    /// A non-retriable failure (or a budget abort) stopped the exploration.
    Aborted { error: OracularError },
    Cancelled,
}

impl<T> SessionStatus<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionStatus::Completed { .. })
    }
}

impl<T> std::fmt::Debug for SessionStatus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Completed { values } => {
                write!(f, "Completed({} values)", values.len())
            }
            SessionStatus::Failed { failure } => write!(f, "Failed({failure})"),
            SessionStatus::Aborted { error } => write!(f, "Aborted({error})"),
            SessionStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Outcome of a whole exploration: the terminal status plus the session's
/// accounting and trace, ready for export.
pub struct SessionReport<T> {
    pub status: SessionStatus<T>,
    pub spent: Charge,
    pub trace: Vec<TraceRecord>,
}

impl<T> SessionReport<T> {
    /// The collected success values, if the exploration completed.
    pub fn values(&self) -> Option<&[T]> {
        match &self.status {
            SessionStatus::Completed { values } => Some(values),
            _ => None,
        }
    }
}

/// Terminal result of resolving one candidate attempt at an effect.
enum Resolution {
    Accepted(Value),
    BranchFailed {
        reason: FailureReason,
        /// Remaining candidates for this effect would fail identically.
        fatal_for_effect: bool,
    },
    Aborted(OracularError),
    Cancelled,
}

/// One open decision point on the driver's explicit stack.
struct Frame<T> {
    branch: BranchNode<T>,
    attempts: Vec<SamplingParams>,
    next: usize,
}

/// Walks a strategy's search tree depth-first, resolving each effect through
/// the session's resilience runner and backtracking to the nearest untried
/// alternative on failure.
pub struct PolicyInterpreter {
    session: Arc<Session>,
    policy: Arc<dyn SearchPolicy>,
}

impl PolicyInterpreter {
    pub fn new(session: Arc<Session>, policy: Arc<dyn SearchPolicy>) -> Self {
        Self { session, policy }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run a strategy to a terminal report.
    pub async fn run<S: Strategy>(&self, strategy: &S) -> SessionReport<S::Output> {
        let status = self.drive(strategy).await;
        tracing::info!(
            session = %self.session.id,
            status = ?status,
            effects = self.session.trace().len(),
            "exploration finished"
        );
        SessionReport {
            status,
            spent: self.session.budget_snapshot(),
            trace: self.session.trace_records(),
        }
    }

    async fn drive<S: Strategy>(&self, strategy: &S) -> SessionStatus<S::Output> {
        let mut results: Vec<S::Output> = Vec::new();
        let mut stack: Vec<Frame<S::Output>> = Vec::new();
        let mut current = Some(strategy.root());
        let mut last_failure: Option<FailureReason> = None;

        loop {
            if self.session.is_cancelled() {
                return SessionStatus::Cancelled;
            }

            match current.take() {
                Some(Node::Success(value)) => {
                    results.push(value);
                    if results.len() >= self.policy.max_results() {
                        return SessionStatus::Completed { values: results };
                    }
                    // Quota not met: backtrack and keep enumerating.
                }
                Some(Node::Failure(reason)) => {
                    tracing::debug!(failure = %reason, "branch reported failure");
                    last_failure = Some(reason);
                }
                Some(Node::Branch(branch)) => {
                    let attempts = self.policy.attempts_for(&branch.effect);
                    if attempts.is_empty() {
                        last_failure = Some(FailureReason::new(format!(
                            "policy offered no candidates for effect '{}'",
                            branch.effect.name()
                        )));
                    } else {
                        stack.push(Frame {
                            branch,
                            attempts,
                            next: 0,
                        });
                    }
                }
                None => {}
            }

            // Advance the deepest frame that still has an untried candidate.
            loop {
                let Some(frame) = stack.last_mut() else {
                    return if !results.is_empty() {
                        SessionStatus::Completed { values: results }
                    } else {
                        SessionStatus::Failed {
                            failure: last_failure.unwrap_or_else(|| {
                                FailureReason::new("search space exhausted without a success")
                            }),
                        }
                    };
                };

                if frame.next >= frame.attempts.len() {
                    stack.pop();
                    continue;
                }

                let sampling = frame.attempts[frame.next];
                frame.next += 1;
                let branch = frame.branch.clone();

                match self.resolve(&branch.effect, sampling).await {
                    Resolution::Accepted(answer) => {
                        current = Some(branch.child(&answer));
                        break;
                    }
                    Resolution::BranchFailed {
                        reason,
                        fatal_for_effect,
                    } => {
                        last_failure = Some(reason);
                        if fatal_for_effect {
                            if let Some(frame) = stack.last_mut() {
                                frame.next = frame.attempts.len();
                            }
                        }
                    }
                    Resolution::Aborted(error) => return SessionStatus::Aborted { error },
                    Resolution::Cancelled => return SessionStatus::Cancelled,
                }
            }
        }
    }

    /// Resolve one candidate attempt:
    /// `Pending -> AwaitingResponse -> {Parsed, ParseFailed} -> {Accepted,
    /// CorrectiveRetry, Exhausted}`.
    async fn resolve(&self, effect: &Effect, sampling: SamplingParams) -> Resolution {
        let session = &self.session;
        let mut state = EffectState::Pending;
        let mut feedback = FeedbackRecord::new(session.max_corrective_cycles());
        let spent_before = session.budget_snapshot();

        let base = match effect.query.build(session.oracle(), sampling) {
            Ok(request) => request,
            Err(error) => {
                // A broken declaration fails the branch without a dispatch;
                // the other candidates share the declaration, so skip them.
                session.trace().push(TraceRecord::new(
                    effect.name(),
                    RequestSummary {
                        query: effect.name().to_string(),
                        model: String::new(),
                        message_count: 0,
                        sample_index: sampling.sample_index,
                    },
                    "",
                    ResolutionOutcome::MalformedSpec,
                ));
                return match error {
                    err @ OracularError::MalformedQuerySpec { .. } => Resolution::BranchFailed {
                        reason: FailureReason::new(err.to_string()),
                        fatal_for_effect: true,
                    },
                    other => Resolution::Aborted(other),
                };
            }
        };
        let mut request = base;

        loop {
            state = step(effect, state, EffectState::AwaitingResponse);
            let response = match session.runner().execute(&request).await {
                Ok(response) => response,
                Err(error @ OracularError::BudgetExceeded { .. }) => {
                    return match self.policy.on_budget_exceeded(effect) {
                        BudgetVerdict::PruneBranch => {
                            self.push_trace(
                                effect,
                                &request,
                                ResolutionOutcome::BudgetPruned,
                                None,
                                &feedback,
                                &spent_before,
                            );
                            Resolution::BranchFailed {
                                reason: FailureReason::new(error.to_string())
                                    .with_diagnostics(feedback.diagnostics()),
                                fatal_for_effect: false,
                            }
                        }
                        BudgetVerdict::AbortSession => {
                            self.push_trace(
                                effect,
                                &request,
                                ResolutionOutcome::Aborted,
                                None,
                                &feedback,
                                &spent_before,
                            );
                            Resolution::Aborted(error)
                        }
                    };
                }
                Err(error @ OracularError::OracleUnavailable { .. }) => {
                    self.push_trace(
                        effect,
                        &request,
                        ResolutionOutcome::Unavailable,
                        None,
                        &feedback,
                        &spent_before,
                    );
                    return Resolution::BranchFailed {
                        reason: FailureReason::new(error.to_string())
                            .with_diagnostics(feedback.diagnostics()),
                        fatal_for_effect: false,
                    };
                }
                Err(OracularError::Cancelled) => return Resolution::Cancelled,
                Err(error) => {
                    self.push_trace(
                        effect,
                        &request,
                        ResolutionOutcome::Aborted,
                        None,
                        &feedback,
                        &spent_before,
                    );
                    return Resolution::Aborted(error);
                }
            };

            match effect.query.parser.parse(&response) {
                Ok(value) => {
                    state = step(effect, state, EffectState::Parsed);
                    let _ = step(effect, state, EffectState::Accepted);
                    self.push_trace(
                        effect,
                        &request,
                        ResolutionOutcome::Accepted,
                        Some(response.provenance.clone()),
                        &feedback,
                        &spent_before,
                    );
                    return Resolution::Accepted(value);
                }
                Err(error) if error.is_correctable() => {
                    state = step(effect, state, EffectState::ParseFailed);
                    let diagnostic = error.to_string();
                    if feedback.is_exhausted() {
                        let _ = step(effect, state, EffectState::Exhausted);
                        let mut diagnostics = feedback.diagnostics();
                        diagnostics.push(diagnostic);
                        self.push_trace(
                            effect,
                            &request,
                            ResolutionOutcome::Exhausted,
                            Some(response.provenance.clone()),
                            &feedback,
                            &spent_before,
                        );
                        return Resolution::BranchFailed {
                            reason: FailureReason::new(format!(
                                "effect '{}' exhausted its corrective budget",
                                effect.name()
                            ))
                            .with_diagnostics(diagnostics),
                            fatal_for_effect: false,
                        };
                    }
                    feedback.push(&response.content, &diagnostic);
                    request = corrective_request(&request, &response, &diagnostic);
                    state = step(effect, state, EffectState::CorrectiveRetry);
                }
                Err(error) => {
                    self.push_trace(
                        effect,
                        &request,
                        ResolutionOutcome::Aborted,
                        Some(response.provenance.clone()),
                        &feedback,
                        &spent_before,
                    );
                    return Resolution::Aborted(error);
                }
            }
        }
    }

    fn push_trace(
        &self,
        effect: &Effect,
        request: &crate::oracle::OracleRequest,
        outcome: ResolutionOutcome,
        provenance: Option<crate::oracle::Provenance>,
        feedback: &FeedbackRecord,
        spent_before: &Charge,
    ) {
        let spent_after = self.session.budget_snapshot();
        let record = TraceRecord::new(
            effect.name(),
            RequestSummary::of(&effect.query, request),
            self.session.runner().fingerprint(request).as_str(),
            outcome,
        )
        .with_provenance(provenance)
        .with_corrective_cycles(feedback.len() as u32)
        .with_spent(Charge::delta(spent_before, &spent_after));
        self.session.trace().push(record);
    }
}

fn step(effect: &Effect, from: EffectState, to: EffectState) -> EffectState {
    tracing::trace!(effect = effect.name(), ?from, ?to, "effect state transition");
    to
}
