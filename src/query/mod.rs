// src/query/mod.rs — Typed queries and request construction

pub mod feedback;
pub mod parser;
pub mod schema;

use minijinja::Environment;
use serde::{Deserialize, Serialize};

use crate::infra::errors::OracularError;
use crate::oracle::{Message, ModelInfo, Oracle, OracleRequest, SamplingParams};
use parser::{ParserSpec, Stage};
use schema::OutputSchema;

/// How the oracle is asked to shape its answer.
#[derive(Debug, Clone)]
pub enum OutputFormat {
    /// Free-form text.
    Text,
    /// A fenced code block, optionally with a language tag.
    CodeBlock { lang: Option<String> },
    /// Typed structured output described by a schema.
    Structured(OutputSchema),
}

/// A structured question for the oracle: a prompt template, the expected
/// output shape, and the parser pipeline that turns the raw answer into a
/// typed value.
#[derive(Clone)]
pub struct Query {
    pub name: String,
    pub template: String,
    pub params: serde_json::Value,
    pub system: Option<String>,
    pub output: OutputFormat,
    pub parser: ParserSpec,
    /// Override the oracle's default model.
    pub model: Option<String>,
}

impl Query {
    pub fn new(
        name: impl Into<String>,
        template: impl Into<String>,
        params: serde_json::Value,
        output: OutputFormat,
        parser: ParserSpec,
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            params,
            system: None,
            output,
            parser,
            model: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Build the transport request for one candidate attempt.
    ///
    /// Validates that the declared output format can satisfy the parser spec
    /// and that the chosen model supports it; any violation is a
    /// `MalformedQuerySpec`: a programming error in the effect declaration,
    /// never retried.
    pub fn build(
        &self,
        oracle: &dyn Oracle,
        sampling: SamplingParams,
    ) -> Result<OracleRequest, OracularError> {
        self.parser
            .well_formed()
            .map_err(|detail| self.malformed(detail))?;
        self.check_format_matches_parser()?;

        let model = self.resolve_model(oracle)?;
        if matches!(self.output, OutputFormat::Structured(_)) && !model.supports_structured {
            return Err(self.malformed(format!(
                "model '{}' does not support structured output",
                model.id
            )));
        }

        let prompt = self.render_prompt()?;
        let output_schema = match &self.output {
            OutputFormat::Structured(schema) => Some(schema.clone()),
            _ => None,
        };

        Ok(OracleRequest {
            model: model.id,
            messages: vec![Message::user(prompt)],
            system: self.system.clone(),
            output_schema,
            sampling,
        })
    }

    fn check_format_matches_parser(&self) -> Result<(), OracularError> {
        match (self.parser.extraction(), &self.output) {
            (Stage::Structured, OutputFormat::Structured(_)) => Ok(()),
            (Stage::Structured, _) => Err(self.malformed(
                "parser expects structured output but the query asks for text".into(),
            )),
            (Stage::RawText | Stage::CodeBlock { .. }, OutputFormat::Structured(_)) => Err(self
                .malformed(
                    "query asks for structured output but the parser reads text".into(),
                )),
            (Stage::CodeBlock { .. }, OutputFormat::Text) => Err(self.malformed(
                "parser expects a code block but the query asks for free-form text".into(),
            )),
            _ => Ok(()),
        }
    }

    fn resolve_model(&self, oracle: &dyn Oracle) -> Result<ModelInfo, OracularError> {
        let models = oracle.models();
        match &self.model {
            Some(wanted) => models
                .into_iter()
                .find(|m| m.id == *wanted)
                .ok_or_else(|| {
                    self.malformed(format!(
                        "model '{wanted}' is not offered by oracle '{}'",
                        oracle.id()
                    ))
                }),
            None => models
                .into_iter()
                .next()
                .ok_or_else(|| self.malformed(format!("oracle '{}' offers no models", oracle.id()))),
        }
    }

    fn render_prompt(&self) -> Result<String, OracularError> {
        let env = Environment::new();
        env.render_str(&self.template, &self.params)
            .map_err(|e| self.malformed(format!("template failed to render: {e}")))
    }

    fn malformed(&self, detail: String) -> OracularError {
        OracularError::MalformedQuerySpec {
            query: self.name.clone(),
            detail,
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("name", &self.name)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Serializable summary of a built request, for trace records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub query: String,
    pub model: String,
    pub message_count: usize,
    pub sample_index: u32,
}

impl RequestSummary {
    pub fn of(query: &Query, request: &OracleRequest) -> Self {
        Self {
            query: query.name.clone(),
            model: request.model.clone(),
            message_count: request.messages.len(),
            sample_index: request.sampling.sample_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleResponse;
    use async_trait::async_trait;

    struct StubOracle {
        models: Vec<ModelInfo>,
    }

    impl StubOracle {
        fn new() -> Self {
            Self {
                models: vec![
                    model_info("m-default", true),
                    model_info("m-text-only", false),
                ],
            }
        }
    }

    fn model_info(id: &str, supports_structured: bool) -> ModelInfo {
        ModelInfo {
            id: id.into(),
            name: id.into(),
            context_window: 128_000,
            max_output_tokens: 4096,
            supports_structured,
            input_price_per_mtok: 1.0,
            cached_input_price_per_mtok: 0.1,
            output_price_per_mtok: 3.0,
        }
    }

    #[async_trait]
    impl Oracle for StubOracle {
        fn id(&self) -> &str {
            "stub"
        }
        fn name(&self) -> &str {
            "Stub"
        }
        fn models(&self) -> Vec<ModelInfo> {
            self.models.clone()
        }
        async fn send(&self, _request: OracleRequest) -> Result<OracleResponse, OracularError> {
            unreachable!("build() never calls the transport")
        }
    }

    fn text_query(name: &str, template: &str, params: serde_json::Value) -> Query {
        Query::new(name, template, params, OutputFormat::Text, ParserSpec::raw_text())
    }

    // ─── build tests ────────────────────────────────────────────

    #[test]
    fn test_build_renders_template() {
        let q = text_query(
            "greet",
            "Prove that {{ lhs }} = {{ rhs }}.",
            serde_json::json!({ "lhs": "sin(2x)", "rhs": "2 sin(x) cos(x)" }),
        );
        let request = q.build(&StubOracle::new(), SamplingParams::default()).unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(
            request.messages[0].content,
            "Prove that sin(2x) = 2 sin(x) cos(x)."
        );
        assert_eq!(request.model, "m-default");
    }

    #[test]
    fn test_build_carries_system_and_sampling() {
        let q = text_query("q", "hi", serde_json::json!({})).with_system("Be brief.");
        let sampling = SamplingParams {
            temperature: Some(0.7),
            max_tokens: Some(256),
            sample_index: 2,
        };
        let request = q.build(&StubOracle::new(), sampling).unwrap();
        assert_eq!(request.system.as_deref(), Some("Be brief."));
        assert_eq!(request.sampling.temperature, Some(0.7));
        assert_eq!(request.sampling.sample_index, 2);
    }

    #[test]
    fn test_build_bad_template_is_malformed_spec() {
        let q = text_query("q", "{{ unclosed", serde_json::json!({}));
        let err = q.build(&StubOracle::new(), SamplingParams::default()).unwrap_err();
        assert!(matches!(err, OracularError::MalformedQuerySpec { .. }));
    }

    #[test]
    fn test_build_structured_parser_needs_structured_output() {
        let q = Query::new(
            "q",
            "hi",
            serde_json::json!({}),
            OutputFormat::Text,
            ParserSpec::structured(),
        );
        let err = q.build(&StubOracle::new(), SamplingParams::default()).unwrap_err();
        match err {
            OracularError::MalformedQuerySpec { query, detail } => {
                assert_eq!(query, "q");
                assert!(detail.contains("structured"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_structured_output_needs_capable_model() {
        let q = Query::new(
            "q",
            "hi",
            serde_json::json!({}),
            OutputFormat::Structured(OutputSchema::new(
                "answer",
                "The answer",
                serde_json::json!({ "type": "object" }),
            )),
            ParserSpec::structured(),
        )
        .with_model("m-text-only");
        let err = q.build(&StubOracle::new(), SamplingParams::default()).unwrap_err();
        assert!(matches!(err, OracularError::MalformedQuerySpec { .. }));
    }

    #[test]
    fn test_build_structured_happy_path_attaches_schema() {
        let q = Query::new(
            "q",
            "hi",
            serde_json::json!({}),
            OutputFormat::Structured(OutputSchema::new(
                "answer",
                "The answer",
                serde_json::json!({ "type": "object" }),
            )),
            ParserSpec::structured(),
        );
        let request = q.build(&StubOracle::new(), SamplingParams::default()).unwrap();
        assert_eq!(request.output_schema.as_ref().unwrap().name, "answer");
    }

    #[test]
    fn test_build_unknown_model_override_is_malformed_spec() {
        let q = text_query("q", "hi", serde_json::json!({})).with_model("nope");
        let err = q.build(&StubOracle::new(), SamplingParams::default()).unwrap_err();
        assert!(matches!(err, OracularError::MalformedQuerySpec { .. }));
    }

    #[test]
    fn test_build_code_block_parser_with_text_format_is_malformed() {
        let q = Query::new(
            "q",
            "hi",
            serde_json::json!({}),
            OutputFormat::Text,
            ParserSpec::code_block(Some("yaml")),
        );
        assert!(q
            .build(&StubOracle::new(), SamplingParams::default())
            .is_err());
    }

    #[test]
    fn test_build_is_pure() {
        let q = text_query("q", "{{ x }}", serde_json::json!({ "x": 1 }));
        let oracle = StubOracle::new();
        let a = q.build(&oracle, SamplingParams::default()).unwrap();
        let b = q.build(&oracle, SamplingParams::default()).unwrap();
        assert_eq!(a.messages[0].content, b.messages[0].content);
    }

    #[test]
    fn test_request_summary() {
        let q = text_query("summing", "hi", serde_json::json!({}));
        let request = q.build(&StubOracle::new(), SamplingParams::default()).unwrap();
        let summary = RequestSummary::of(&q, &request);
        assert_eq!(summary.query, "summing");
        assert_eq!(summary.message_count, 1);
    }
}
