// src/budget/mod.rs — Resource categories, charges, and the shared ledger

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::infra::errors::OracularError;
use crate::oracle::{ModelInfo, TokenUsage};

/// One resource dimension tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCategory {
    Requests,
    Completions,
    InputTokens,
    CachedInputTokens,
    OutputTokens,
    CostUsd,
}

impl BudgetCategory {
    pub const ALL: [BudgetCategory; 6] = [
        BudgetCategory::Requests,
        BudgetCategory::Completions,
        BudgetCategory::InputTokens,
        BudgetCategory::CachedInputTokens,
        BudgetCategory::OutputTokens,
        BudgetCategory::CostUsd,
    ];
}

impl std::fmt::Display for BudgetCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BudgetCategory::Requests => "requests",
            BudgetCategory::Completions => "completions",
            BudgetCategory::InputTokens => "input_tokens",
            BudgetCategory::CachedInputTokens => "cached_input_tokens",
            BudgetCategory::OutputTokens => "output_tokens",
            BudgetCategory::CostUsd => "cost_usd",
        };
        write!(f, "{name}")
    }
}

/// Per-category amounts: a consumed delta, an estimate, or a running total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub requests: f64,
    pub completions: f64,
    pub input_tokens: f64,
    pub cached_input_tokens: f64,
    pub output_tokens: f64,
    pub cost_usd: f64,
}

impl Charge {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Accounting event for a cache hit: the request and completion counts
    /// still tick, but no new tokens were bought and no money was spent.
    pub fn cache_hit() -> Self {
        Self {
            requests: 1.0,
            completions: 1.0,
            ..Self::default()
        }
    }

    /// Price a completed call from its token usage and the model's metadata.
    pub fn from_usage(usage: &TokenUsage, model: &ModelInfo) -> Self {
        let fresh_input = usage.input_tokens.saturating_sub(usage.cached_input_tokens);
        let input_cost = (fresh_input as f64 / 1_000_000.0) * model.input_price_per_mtok;
        let cached_cost =
            (usage.cached_input_tokens as f64 / 1_000_000.0) * model.cached_input_price_per_mtok;
        let output_cost = (usage.output_tokens as f64 / 1_000_000.0) * model.output_price_per_mtok;

        Self {
            requests: 1.0,
            completions: 1.0,
            input_tokens: usage.input_tokens as f64,
            cached_input_tokens: usage.cached_input_tokens as f64,
            output_tokens: usage.output_tokens as f64,
            cost_usd: input_cost + cached_cost + output_cost,
        }
    }

    pub fn get(&self, category: BudgetCategory) -> f64 {
        match category {
            BudgetCategory::Requests => self.requests,
            BudgetCategory::Completions => self.completions,
            BudgetCategory::InputTokens => self.input_tokens,
            BudgetCategory::CachedInputTokens => self.cached_input_tokens,
            BudgetCategory::OutputTokens => self.output_tokens,
            BudgetCategory::CostUsd => self.cost_usd,
        }
    }

    fn get_mut(&mut self, category: BudgetCategory) -> &mut f64 {
        match category {
            BudgetCategory::Requests => &mut self.requests,
            BudgetCategory::Completions => &mut self.completions,
            BudgetCategory::InputTokens => &mut self.input_tokens,
            BudgetCategory::CachedInputTokens => &mut self.cached_input_tokens,
            BudgetCategory::OutputTokens => &mut self.output_tokens,
            BudgetCategory::CostUsd => &mut self.cost_usd,
        }
    }

    pub fn add(&mut self, other: &Charge) {
        for category in BudgetCategory::ALL {
            *self.get_mut(category) += other.get(category);
        }
    }

    pub fn sub(&mut self, other: &Charge) {
        for category in BudgetCategory::ALL {
            let slot = self.get_mut(category);
            *slot = (*slot - other.get(category)).max(0.0);
        }
    }

    /// Per-category difference `after - before`, clamped at zero.
    pub fn delta(before: &Charge, after: &Charge) -> Charge {
        let mut d = *after;
        d.sub(before);
        d
    }

    pub fn is_zero(&self) -> bool {
        BudgetCategory::ALL.iter().all(|c| self.get(*c) == 0.0)
    }
}

/// Optional ceiling per category. A missing ceiling means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub requests: Option<f64>,
    pub completions: Option<f64>,
    pub input_tokens: Option<f64>,
    pub cached_input_tokens: Option<f64>,
    pub output_tokens: Option<f64>,
    pub cost_usd: Option<f64>,
}

impl BudgetLimit {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn get(&self, category: BudgetCategory) -> Option<f64> {
        match category {
            BudgetCategory::Requests => self.requests,
            BudgetCategory::Completions => self.completions,
            BudgetCategory::InputTokens => self.input_tokens,
            BudgetCategory::CachedInputTokens => self.cached_input_tokens,
            BudgetCategory::OutputTokens => self.output_tokens,
            BudgetCategory::CostUsd => self.cost_usd,
        }
    }
}

struct LedgerState {
    spent: Charge,
    reserved: Charge,
    limit: BudgetLimit,
}

/// Process-shared accounting for one session.
///
/// Branches hold an `Arc<BudgetLedger>`; all mutation goes through the
/// resilience layer. The lock is internal and never held across an await.
///
/// `snapshot()` reports committed spend only, so observed amounts are
/// monotonically non-decreasing. Reservations are tracked separately and
/// released when the call settles, whatever the outcome.
pub struct BudgetLedger {
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    pub fn new(limit: BudgetLimit) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                spent: Charge::zero(),
                reserved: Charge::zero(),
                limit,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(BudgetLimit::unlimited())
    }

    /// Check ceilings and set aside a worst-case estimate for a real call.
    ///
    /// Fails with `BudgetExceeded` if any configured ceiling is already met
    /// or exceeded by committed spend. An in-flight call may still push a
    /// counter over its ceiling; no new call starts once one is reached.
    pub fn reserve(&self, estimate: &Charge) -> Result<(), OracularError> {
        let mut state = self.state.lock().expect("budget ledger poisoned");
        for category in BudgetCategory::ALL {
            if let Some(ceiling) = state.limit.get(category) {
                let spent = state.spent.get(category);
                if spent >= ceiling {
                    return Err(OracularError::BudgetExceeded {
                        category,
                        spent,
                        ceiling,
                    });
                }
            }
        }
        state.reserved.add(estimate);
        Ok(())
    }

    /// Release a reservation made by `reserve` once the call settles.
    pub fn release(&self, estimate: &Charge) {
        let mut state = self.state.lock().expect("budget ledger poisoned");
        state.reserved.sub(estimate);
    }

    /// Commit actual consumption. Never fails: cost already incurred is
    /// honored even past a ceiling.
    pub fn commit(&self, charge: &Charge) {
        let mut state = self.state.lock().expect("budget ledger poisoned");
        state.spent.add(charge);
    }

    /// Committed spend per category.
    pub fn snapshot(&self) -> Charge {
        self.state.lock().expect("budget ledger poisoned").spent
    }

    /// Amount currently set aside for in-flight calls.
    pub fn reserved(&self) -> Charge {
        self.state.lock().expect("budget ledger poisoned").reserved
    }

    pub fn limit(&self) -> BudgetLimit {
        self.state.lock().expect("budget ledger poisoned").limit
    }

    /// First category whose committed spend has reached its ceiling.
    pub fn exceeded(&self) -> Option<BudgetCategory> {
        let state = self.state.lock().expect("budget ledger poisoned");
        BudgetCategory::ALL.into_iter().find(|category| {
            state
                .limit
                .get(*category)
                .is_some_and(|ceiling| state.spent.get(*category) >= ceiling)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelInfo {
        ModelInfo {
            id: "m".into(),
            name: "M".into(),
            context_window: 128_000,
            max_output_tokens: 4096,
            supports_structured: true,
            input_price_per_mtok: 3.0,
            cached_input_price_per_mtok: 0.3,
            output_price_per_mtok: 15.0,
        }
    }

    // ─── Charge tests ───────────────────────────────────────────

    #[test]
    fn test_charge_from_usage_pricing() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            cached_input_tokens: 0,
            output_tokens: 500_000,
        };
        let charge = Charge::from_usage(&usage, &model());
        // 1M × $3/Mtok + 500K × $15/Mtok = $3 + $7.50
        assert!((charge.cost_usd - 10.50).abs() < 1e-9);
        assert_eq!(charge.requests, 1.0);
        assert_eq!(charge.completions, 1.0);
        assert_eq!(charge.input_tokens, 1_000_000.0);
    }

    #[test]
    fn test_charge_from_usage_cached_discount() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            cached_input_tokens: 500_000,
            output_tokens: 0,
        };
        let charge = Charge::from_usage(&usage, &model());
        // 500K fresh × $3 + 500K cached × $0.3 = $1.50 + $0.15
        assert!((charge.cost_usd - 1.65).abs() < 1e-9);
    }

    #[test]
    fn test_charge_cache_hit_is_free() {
        let charge = Charge::cache_hit();
        assert_eq!(charge.requests, 1.0);
        assert_eq!(charge.completions, 1.0);
        assert_eq!(charge.cost_usd, 0.0);
        assert_eq!(charge.input_tokens, 0.0);
        assert_eq!(charge.output_tokens, 0.0);
    }

    #[test]
    fn test_charge_delta() {
        let mut after = Charge::zero();
        after.requests = 3.0;
        after.cost_usd = 0.5;
        let mut before = Charge::zero();
        before.requests = 1.0;
        before.cost_usd = 0.2;

        let d = Charge::delta(&before, &after);
        assert_eq!(d.requests, 2.0);
        assert!((d.cost_usd - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_charge_sub_clamps_at_zero() {
        let mut a = Charge::zero();
        a.requests = 1.0;
        let mut b = Charge::zero();
        b.requests = 5.0;
        a.sub(&b);
        assert_eq!(a.requests, 0.0);
    }

    // ─── BudgetLedger tests ─────────────────────────────────────

    #[test]
    fn test_reserve_under_ceiling() {
        let ledger = BudgetLedger::new(BudgetLimit {
            requests: Some(2.0),
            ..BudgetLimit::unlimited()
        });
        assert!(ledger.reserve(&Charge::cache_hit()).is_ok());
    }

    #[test]
    fn test_reserve_refused_once_ceiling_met() {
        let ledger = BudgetLedger::new(BudgetLimit {
            requests: Some(1.0),
            ..BudgetLimit::unlimited()
        });
        ledger.commit(&Charge::cache_hit());

        let err = ledger.reserve(&Charge::cache_hit()).unwrap_err();
        match err {
            OracularError::BudgetExceeded { category, .. } => {
                assert_eq!(category, BudgetCategory::Requests);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_commit_past_ceiling_is_honored() {
        let ledger = BudgetLedger::new(BudgetLimit {
            cost_usd: Some(1.0),
            ..BudgetLimit::unlimited()
        });
        let mut charge = Charge::zero();
        charge.cost_usd = 2.5;
        ledger.commit(&charge);
        assert!((ledger.snapshot().cost_usd - 2.5).abs() < 1e-9);
        assert_eq!(ledger.exceeded(), Some(BudgetCategory::CostUsd));
    }

    #[test]
    fn test_snapshot_monotone_across_reserve_release() {
        let ledger = BudgetLedger::unlimited();
        let mut estimate = Charge::zero();
        estimate.output_tokens = 4096.0;

        ledger.reserve(&estimate).unwrap();
        assert!(ledger.snapshot().is_zero());
        assert_eq!(ledger.reserved().output_tokens, 4096.0);

        ledger.release(&estimate);
        let mut actual = Charge::zero();
        actual.output_tokens = 128.0;
        ledger.commit(&actual);

        assert_eq!(ledger.snapshot().output_tokens, 128.0);
        assert!(ledger.reserved().is_zero());
    }

    #[test]
    fn test_exceeded_none_when_unlimited() {
        let ledger = BudgetLedger::unlimited();
        ledger.commit(&Charge::cache_hit());
        assert_eq!(ledger.exceeded(), None);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(BudgetCategory::CostUsd.to_string(), "cost_usd");
        assert_eq!(BudgetCategory::Requests.to_string(), "requests");
    }
}
