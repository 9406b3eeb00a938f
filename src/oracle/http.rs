// src/oracle/http.rs — Chat-completions transport adapter
//
// One concrete Oracle over any OpenAI-compatible chat-completions endpoint.
// Carries no engine logic: retry, caching and accounting all happen in the
// resilience layer, which consumes the retriable/non-retriable classification
// attached here.

use async_trait::async_trait;

use super::{
    FinishReason, ModelInfo, Oracle, OracleRequest, OracleResponse, Role, TokenUsage, ToolCall,
};
use crate::infra::errors::OracularError;

pub struct HttpOracle {
    id_str: String,
    name_str: String,
    api_key: String,
    base_url: String,
    models: Vec<ModelInfo>,
    client: reqwest::Client,
}

impl HttpOracle {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        api_key: String,
        base_url: String,
        models: Vec<ModelInfo>,
    ) -> Self {
        Self {
            id_str: id.into(),
            name_str: name.into(),
            api_key,
            base_url,
            models,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, request: &OracleRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for m in &request.messages {
            messages.push(serde_json::json!({
                "role": match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                "content": m.content,
            }));
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.sampling.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = request.sampling.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        // Structured output rides the tool channel, with the choice forced so
        // the model cannot answer in prose.
        if let Some(schema) = &request.output_schema {
            body["tools"] = serde_json::json!([{
                "type": "function",
                "function": {
                    "name": schema.name,
                    "description": schema.description,
                    "parameters": schema.parameters,
                },
            }]);
            body["tool_choice"] = serde_json::json!({
                "type": "function",
                "function": { "name": schema.name },
            });
        }

        body
    }

    fn classify_status(
        &self,
        status: reqwest::StatusCode,
        retry_after_ms: Option<u64>,
        body: String,
    ) -> OracularError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return OracularError::RateLimited {
                oracle: self.id_str.clone(),
                retry_after_ms: retry_after_ms.unwrap_or(5_000),
            };
        }
        OracularError::Transport {
            oracle: self.id_str.clone(),
            message: format!("HTTP {status}: {body}"),
            retriable: status.is_server_error(),
        }
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    fn id(&self) -> &str {
        &self.id_str
    }

    fn name(&self) -> &str {
        &self.name_str
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn send(&self, request: OracleRequest) -> Result<OracleResponse, OracularError> {
        let body = self.build_body(&request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| OracularError::Transport {
                oracle: self.id_str.clone(),
                message: e.to_string(),
                retriable: e.is_timeout() || e.is_connect(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, retry_after_ms, body));
        }

        let payload: serde_json::Value =
            response.json().await.map_err(|e| OracularError::Transport {
                oracle: self.id_str.clone(),
                message: format!("failed to decode response body: {e}"),
                retriable: false,
            })?;

        let message = &payload["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();

        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let arguments = call["function"]["arguments"].as_str()?;
                        Some(ToolCall {
                            id: call["id"].as_str().unwrap_or("").to_string(),
                            name: call["function"]["name"].as_str().unwrap_or("").to_string(),
                            arguments: serde_json::from_str(arguments).ok()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = TokenUsage {
            input_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            cached_input_tokens: payload["usage"]["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
            output_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        let finish = match payload["choices"][0]["finish_reason"].as_str() {
            Some("stop") => FinishReason::EndTurn,
            Some("length") => FinishReason::MaxTokens,
            Some("tool_calls") => FinishReason::ToolUse,
            Some("content_filter") => FinishReason::StopSequence,
            _ => FinishReason::Unknown,
        };

        Ok(OracleResponse {
            content,
            tool_calls,
            usage,
            finish,
            model: payload["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Message, SamplingParams};
    use crate::query::schema::OutputSchema;

    fn oracle() -> HttpOracle {
        HttpOracle::new(
            "compat",
            "Compat",
            "key".into(),
            "http://localhost:9".into(),
            vec![],
        )
    }

    fn request() -> OracleRequest {
        OracleRequest {
            model: "m-1".into(),
            messages: vec![Message::user("hello")],
            system: Some("be brief".into()),
            output_schema: None,
            sampling: SamplingParams {
                temperature: Some(0.5),
                max_tokens: Some(128),
                sample_index: 0,
            },
        }
    }

    #[test]
    fn test_body_includes_system_and_sampling() {
        let body = oracle().build_body(&request());
        assert_eq!(body["model"], "m-1");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_body_forces_tool_choice_for_structured_output() {
        let mut req = request();
        req.output_schema = Some(OutputSchema::new(
            "answer",
            "The answer",
            serde_json::json!({ "type": "object" }),
        ));
        let body = oracle().build_body(&req);
        assert_eq!(body["tools"][0]["function"]["name"], "answer");
        assert_eq!(body["tool_choice"]["function"]["name"], "answer");
    }

    #[test]
    fn test_classify_rate_limit_uses_retry_after() {
        let err = oracle().classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(3_000),
            String::new(),
        );
        match err {
            OracularError::RateLimited { retry_after_ms, .. } => {
                assert_eq!(retry_after_ms, 3_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_classify_server_error_is_retriable() {
        let err = oracle().classify_status(
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            None,
            "busy".into(),
        );
        assert!(err.is_retriable());
    }

    #[test]
    fn test_classify_client_error_is_not_retriable() {
        let err =
            oracle().classify_status(reqwest::StatusCode::UNAUTHORIZED, None, "bad key".into());
        assert!(!err.is_retriable());
    }
}
