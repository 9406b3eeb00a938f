// src/engine/trace.rs — Per-effect trace records

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::Charge;
use crate::oracle::Provenance;
use crate::query::RequestSummary;

/// Terminal state of one effect resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// A parsed, validated value was accepted.
    Accepted,
    /// Every corrective cycle was spent without a usable answer.
    Exhausted,
    /// The effect declaration itself was broken.
    MalformedSpec,
    /// Transient transport failures outlasted the retry budget.
    Unavailable,
    /// The budget ceiling blocked the call and the policy pruned the branch.
    BudgetPruned,
    /// A non-retriable failure aborted the session.
    Aborted,
}

/// One resolved effect, with everything an external tool needs to replay or
/// display it: the request, the response provenance, the parse outcome and
/// the accounting delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    pub effect: String,
    pub request: RequestSummary,
    pub fingerprint: String,
    pub outcome: ResolutionOutcome,
    pub provenance: Option<Provenance>,
    pub corrective_cycles: u32,
    pub spent: Charge,
    pub at: DateTime<Utc>,
}

impl TraceRecord {
    pub fn new(
        effect: impl Into<String>,
        request: RequestSummary,
        fingerprint: impl Into<String>,
        outcome: ResolutionOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            effect: effect.into(),
            request,
            fingerprint: fingerprint.into(),
            outcome,
            provenance: None,
            corrective_cycles: 0,
            spent: Charge::zero(),
            at: Utc::now(),
        }
    }

    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_corrective_cycles(mut self, cycles: u32) -> Self {
        self.corrective_cycles = cycles;
        self
    }

    pub fn with_spent(mut self, spent: Charge) -> Self {
        self.spent = spent;
        self
    }
}

/// Append-only collector for one session's trace.
#[derive(Default)]
pub struct TraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl TraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: TraceRecord) {
        self.records.lock().expect("trace sink poisoned").push(record);
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().expect("trace sink poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("trace sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
