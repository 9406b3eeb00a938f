// src/query/parser.rs — Composable parsing of raw oracle answers

use std::sync::Arc;

use serde_json::Value;

use crate::infra::errors::OracularError;
use crate::oracle::QueryResponse;

type MapFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;
type ValidateFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// One pure transformation stage over the tagged pipeline value.
#[derive(Clone)]
pub enum Stage {
    /// Take the whole answer text.
    RawText,
    /// Take the last fenced code block, optionally requiring a language tag.
    CodeBlock { lang: Option<String> },
    /// Take the structured value: the first tool call's arguments, or the
    /// answer text parsed as JSON.
    Structured,
    /// Named pure transformation of the current value.
    Map { name: String, run: MapFn },
    /// Named predicate; never mutates the value.
    Validate { name: String, run: ValidateFn },
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Stage::RawText => "raw_text",
            Stage::CodeBlock { .. } => "code_block",
            Stage::Structured => "structured",
            Stage::Map { name, .. } => name,
            Stage::Validate { name, .. } => name,
        }
    }

    fn is_extraction(&self) -> bool {
        matches!(
            self,
            Stage::RawText | Stage::CodeBlock { .. } | Stage::Structured
        )
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::RawText => write!(f, "RawText"),
            Stage::CodeBlock { lang } => write!(f, "CodeBlock({lang:?})"),
            Stage::Structured => write!(f, "Structured"),
            Stage::Map { name, .. } => write!(f, "Map({name})"),
            Stage::Validate { name, .. } => write!(f, "Validate({name})"),
        }
    }
}

/// An ordered pipeline of pure stages: one leading extraction stage followed
/// by any number of maps and validators.
///
/// Deterministic given identical raw input. The first failing stage
/// short-circuits; no partial value escapes.
#[derive(Debug, Clone)]
pub struct ParserSpec {
    stages: Vec<Stage>,
}

impl ParserSpec {
    pub fn raw_text() -> Self {
        Self {
            stages: vec![Stage::RawText],
        }
    }

    pub fn code_block(lang: Option<&str>) -> Self {
        Self {
            stages: vec![Stage::CodeBlock {
                lang: lang.map(str::to_string),
            }],
        }
    }

    pub fn structured() -> Self {
        Self {
            stages: vec![Stage::Structured],
        }
    }

    pub fn map(
        mut self,
        name: impl Into<String>,
        run: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.stages.push(Stage::Map {
            name: name.into(),
            run: Arc::new(run),
        });
        self
    }

    pub fn validate(
        mut self,
        name: impl Into<String>,
        run: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.stages.push(Stage::Validate {
            name: name.into(),
            run: Arc::new(run),
        });
        self
    }

    /// The leading extraction stage. Used by the request builder to check
    /// the declared output format can satisfy this spec.
    pub fn extraction(&self) -> &Stage {
        &self.stages[0]
    }

    /// Structural sanity: exactly one extraction stage, and it comes first.
    pub fn well_formed(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("parser spec has no stages".into());
        }
        if !self.stages[0].is_extraction() {
            return Err(format!(
                "parser spec must start with an extraction stage, found '{}'",
                self.stages[0].name()
            ));
        }
        if let Some(stray) = self.stages[1..].iter().find(|s| s.is_extraction()) {
            return Err(format!(
                "extraction stage '{}' must come first in the parser spec",
                stray.name()
            ));
        }
        Ok(())
    }

    /// Run the pipeline over a raw response.
    pub fn parse(&self, response: &QueryResponse) -> Result<Value, OracularError> {
        let mut value = Value::Null;
        for stage in &self.stages {
            value = match stage {
                Stage::RawText => Value::String(response.content.clone()),
                Stage::CodeBlock { lang } => {
                    let block = last_fenced_block(&response.content, lang.as_deref())
                        .ok_or_else(|| OracularError::Parse {
                            stage: stage.name().into(),
                            message: match lang {
                                Some(lang) => format!("no fenced ```{lang} block in the answer"),
                                None => "no fenced code block in the answer".into(),
                            },
                        })?;
                    Value::String(block)
                }
                Stage::Structured => extract_structured(response).map_err(|message| {
                    OracularError::Parse {
                        stage: stage.name().into(),
                        message,
                    }
                })?,
                Stage::Map { name, run } => run(value).map_err(|message| OracularError::Parse {
                    stage: name.clone(),
                    message,
                })?,
                Stage::Validate { name, run } => {
                    run(&value).map_err(|message| OracularError::Validation {
                        predicate: name.clone(),
                        message,
                    })?;
                    value
                }
            };
        }
        Ok(value)
    }
}

fn extract_structured(response: &QueryResponse) -> Result<Value, String> {
    if let Some(call) = response.tool_calls.first() {
        return Ok(call.arguments.clone());
    }
    let text = response.content.trim();
    if text.is_empty() {
        return Err("answer carries neither a tool call nor text".into());
    }
    // Some providers wrap the JSON answer in a fence even when asked not to.
    let candidate = last_fenced_block(text, Some("json"))
        .or_else(|| last_fenced_block(text, None))
        .unwrap_or_else(|| text.to_string());
    serde_json::from_str(&candidate).map_err(|e| format!("answer is not valid JSON: {e}"))
}

/// Last complete fenced code block in `text`, optionally matching a language
/// tag on the opening fence.
fn last_fenced_block(text: &str, lang: Option<&str>) -> Option<String> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match current.take() {
                Some((tag, body)) => {
                    let matches = match lang {
                        Some(want) => tag.eq_ignore_ascii_case(want),
                        None => true,
                    };
                    if matches {
                        blocks.push(body.join("\n"));
                    }
                }
                None => {
                    current = Some((rest.trim().to_string(), Vec::new()));
                }
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }

    blocks.pop()
}
