// src/query/feedback.rs — Corrective feedback protocol

use serde::{Deserialize, Serialize};

use crate::oracle::{Message, OracleRequest, QueryResponse};

/// One failed attempt and the diagnostic that explains it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub cycle: u32,
    pub raw_answer: String,
    pub diagnostic: String,
}

/// Ordered history of corrective cycles for one effect resolution, bounded
/// by the configured maximum.
#[derive(Debug, Clone)]
pub struct FeedbackRecord {
    entries: Vec<FeedbackEntry>,
    max_cycles: u32,
}

impl FeedbackRecord {
    pub fn new(max_cycles: u32) -> Self {
        Self {
            entries: Vec::new(),
            max_cycles,
        }
    }

    /// True once every allowed corrective cycle has been spent.
    pub fn is_exhausted(&self) -> bool {
        self.entries.len() as u32 >= self.max_cycles
    }

    pub fn push(&mut self, raw_answer: impl Into<String>, diagnostic: impl Into<String>) {
        let cycle = self.entries.len() as u32 + 1;
        self.entries.push(FeedbackEntry {
            cycle,
            raw_answer: raw_answer.into(),
            diagnostic: diagnostic.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FeedbackEntry] {
        &self.entries
    }

    /// The diagnostics in order, for a failure report.
    pub fn diagnostics(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.diagnostic.clone()).collect()
    }
}

/// Turn a failed attempt into the follow-up request: the conversation so
/// far, extended with the assistant's unusable answer and a user turn that
/// embeds the diagnostic and restates what is expected.
pub fn corrective_request(
    previous: &OracleRequest,
    failed: &QueryResponse,
    diagnostic: &str,
) -> OracleRequest {
    let mut next = previous.clone();
    next.messages.push(Message::assistant(failed.content.clone()));
    next.messages.push(Message::user(format!(
        "Your previous answer could not be used: {diagnostic}\n\
         Please answer again, correcting this problem. \
         Keep the exact output format that was originally requested."
    )));
    next
}
