// src/oracle/mod.rs — Oracle capability layer

pub mod http;
pub mod resilience;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::infra::errors::OracularError;
use crate::query::schema::OutputSchema;

/// Core trait every answering capability implements.
///
/// An oracle is the external transport (typically a language-model provider)
/// that turns a request into a raw response. All retry, caching and budget
/// accounting live outside, in [`resilience::OracleRunner`].
#[async_trait]
pub trait Oracle: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn models(&self) -> Vec<ModelInfo>;

    async fn send(&self, request: OracleRequest) -> Result<OracleResponse, OracularError>;
}

/// Pricing and capability metadata for one model behind an oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_structured: bool,
    pub input_price_per_mtok: f64,
    pub cached_input_price_per_mtok: f64,
    pub output_price_per_mtok: f64,
}

/// Sampling parameters for one candidate attempt at an effect.
///
/// `sample_index` distinguishes otherwise-identical attempts so that each
/// candidate gets its own cache fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub sample_index: u32,
}

/// A fully built request, ready for the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub output_schema: Option<OutputSchema>,
    pub sampling: SamplingParams,
}

/// Raw transport output for one completed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish: FinishReason,
    pub model: String,
}

/// A raw response plus provenance metadata, as returned by the resilience
/// layer and memoized in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish: FinishReason,
    pub provenance: Provenance,
}

impl QueryResponse {
    pub fn from_raw(raw: OracleResponse, oracle: &str, latency_ms: u64, attempts: u32) -> Self {
        Self {
            content: raw.content,
            tool_calls: raw.tool_calls,
            usage: raw.usage,
            finish: raw.finish,
            provenance: Provenance {
                oracle: oracle.to_string(),
                model: raw.model,
                latency_ms,
                attempts,
            },
        }
    }
}

/// Where a response came from and what it took to obtain it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub oracle: String,
    pub model: String,
    pub latency_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub cached_input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Unknown,
}

impl Default for FinishReason {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A structured answer emitted through the provider's tool-call channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Message tests ──────────────────────────────────────────

    #[test]
    fn test_message_constructors() {
        let m = Message::system("be terse");
        assert_eq!(m.role, Role::System);
        assert_eq!(m.content, "be terse");

        let m = Message::user("prove it");
        assert_eq!(m.role, Role::User);

        let m = Message::assistant("done");
        assert_eq!(m.role, Role::Assistant);
    }

    // ─── TokenUsage tests ───────────────────────────────────────

    #[test]
    fn test_token_usage_total() {
        let u = TokenUsage {
            input_tokens: 100,
            cached_input_tokens: 20,
            output_tokens: 50,
        };
        assert_eq!(u.total(), 150);
    }

    #[test]
    fn test_token_usage_default() {
        let u = TokenUsage::default();
        assert_eq!(u.total(), 0);
    }

    // ─── QueryResponse tests ────────────────────────────────────

    #[test]
    fn test_query_response_from_raw() {
        let raw = OracleResponse {
            content: "42".into(),
            tool_calls: vec![],
            usage: TokenUsage {
                input_tokens: 10,
                cached_input_tokens: 0,
                output_tokens: 5,
            },
            finish: FinishReason::EndTurn,
            model: "m-1".into(),
        };
        let resp = QueryResponse::from_raw(raw, "mock", 120, 2);
        assert_eq!(resp.content, "42");
        assert_eq!(resp.provenance.oracle, "mock");
        assert_eq!(resp.provenance.model, "m-1");
        assert_eq!(resp.provenance.latency_ms, 120);
        assert_eq!(resp.provenance.attempts, 2);
    }

    #[test]
    fn test_finish_reason_default() {
        assert!(matches!(FinishReason::default(), FinishReason::Unknown));
    }

    #[test]
    fn test_sampling_params_default() {
        let s = SamplingParams::default();
        assert!(s.temperature.is_none());
        assert!(s.max_tokens.is_none());
        assert_eq!(s.sample_index, 0);
    }
}
