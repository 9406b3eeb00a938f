// src/engine/policy.rs — Pluggable exploration policies

use crate::oracle::SamplingParams;
use crate::tree::Effect;

/// What to do when the budget ceiling blocks a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    /// Treat the affected branch as a pruned failure and backtrack.
    PruneBranch,
    /// Abort the whole exploration.
    AbortSession,
}

/// Drives search order: which candidate answers to pursue for each effect,
/// how to react to budget exhaustion, and how many success values to
/// collect. The interpreter itself is exploration-order-agnostic.
pub trait SearchPolicy: Send + Sync {
    /// Candidate sampling variants for one effect, in exploration order.
    /// Each variant is one alternative at the decision point; an empty list
    /// makes the branch an immediate dead end.
    fn attempts_for(&self, effect: &Effect) -> Vec<SamplingParams>;

    /// Tie-break between pruning a branch and aborting the session once a
    /// budget ceiling is hit.
    fn on_budget_exceeded(&self, effect: &Effect) -> BudgetVerdict {
        let _ = effect;
        BudgetVerdict::PruneBranch
    }

    /// How many success values to collect before stopping. The driver keeps
    /// backtracking after a success until this quota is met or the space is
    /// exhausted.
    fn max_results(&self) -> usize {
        1
    }
}

/// Depth-first search with a fixed number of sampled candidates per effect.
///
/// Candidate `i` gets `base_temperature + i * temperature_step`, so the
/// first attempt is the most deterministic and later attempts diversify.
#[derive(Debug, Clone)]
pub struct DepthFirstPolicy {
    pub attempts_per_effect: u32,
    pub base_temperature: f32,
    pub temperature_step: f32,
    pub max_results: usize,
    pub budget_verdict: BudgetVerdict,
}

impl Default for DepthFirstPolicy {
    fn default() -> Self {
        Self {
            attempts_per_effect: 1,
            base_temperature: 0.0,
            temperature_step: 0.4,
            max_results: 1,
            budget_verdict: BudgetVerdict::PruneBranch,
        }
    }
}

impl DepthFirstPolicy {
    pub fn with_attempts(attempts_per_effect: u32) -> Self {
        Self {
            attempts_per_effect,
            ..Self::default()
        }
    }
}

impl SearchPolicy for DepthFirstPolicy {
    fn attempts_for(&self, _effect: &Effect) -> Vec<SamplingParams> {
        (0..self.attempts_per_effect)
            .map(|i| SamplingParams {
                temperature: Some(self.base_temperature + self.temperature_step * i as f32),
                max_tokens: None,
                sample_index: i,
            })
            .collect()
    }

    fn on_budget_exceeded(&self, _effect: &Effect) -> BudgetVerdict {
        self.budget_verdict
    }

    fn max_results(&self) -> usize {
        self.max_results
    }
}
