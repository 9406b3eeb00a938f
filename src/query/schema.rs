// src/query/schema.rs — Provider-agnostic description of a structured-output shape

use serde::{Deserialize, Serialize};

/// What a query expects back when it asks for typed structured output.
///
/// `parameters` is a JSON-schema value; transport adapters translate it into
/// whatever their provider's structured-output channel needs (a tool
/// definition, a response-format object, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl OutputSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// A schema accepting one object with the given required properties.
    pub fn object(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: serde_json::Value,
    ) -> Self {
        let required: Vec<String> = properties
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        Self::new(
            name,
            description,
            serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_schema_marks_all_properties_required() {
        let schema = OutputSchema::object(
            "proof_step",
            "One rewriting step",
            serde_json::json!({
                "rule": { "type": "string" },
                "result": { "type": "string" },
            }),
        );
        assert_eq!(schema.parameters["type"], "object");
        let required = schema.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn test_plain_constructor_keeps_parameters_verbatim() {
        let params = serde_json::json!({ "type": "array", "items": { "type": "string" } });
        let schema = OutputSchema::new("names", "List of names", params.clone());
        assert_eq!(schema.parameters, params);
    }
}
