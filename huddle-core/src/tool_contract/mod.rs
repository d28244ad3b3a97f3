//! Minimal JSON-Schema-like argument validation (§4.9).
//!
//! Grounded in `original_source/huddle_chat/services/tool_contract_service.py`'s
//! `validate_tool_args` (required-key / unknown-key / type checks) and the teacher's
//! `ToolSpec` shape in `tool_source::ToolSpec`.

use std::collections::HashMap;

/// Primitive JSON types this minimal schema subset supports (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Boolean,
    Object,
}

impl ArgType {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ArgType::String => value.is_string(),
            ArgType::Integer => value.is_i64() || value.is_u64(),
            // JSON booleans must not also satisfy is_i64/is_u64, so order doesn't matter here,
            // but serde_json::Value::Bool never does — this stays an explicit, separate arm
            // so "booleans are not integers" (§4.9) is visible in the match itself.
            ArgType::Boolean => value.is_boolean(),
            ArgType::Object => value.is_object(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ArgType::String => "a string",
            ArgType::Integer => "an integer",
            ArgType::Boolean => "a boolean",
            ArgType::Object => "an object",
        }
    }
}

/// One property declaration within a [`ToolDefinition`]'s schema.
#[derive(Debug, Clone)]
pub struct PropertySchema {
    pub arg_type: ArgType,
}

/// A registered tool's argument schema: object-typed, with declared properties and an
/// optional required subset (§4.9).
#[derive(Debug, Clone, Default)]
pub struct ToolDefinition {
    pub name: String,
    pub properties: HashMap<String, PropertySchema>,
    pub required: Vec<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), properties: HashMap::new(), required: Vec::new() }
    }

    pub fn with_property(mut self, key: impl Into<String>, arg_type: ArgType, required: bool) -> Self {
        let key = key.into();
        if required {
            self.required.push(key.clone());
        }
        self.properties.insert(key, PropertySchema { arg_type });
        self
    }
}

/// Validates `args` against `definition` (§4.9, §8 property 8, scenario C2). Returns `Ok(())`
/// or a single human-readable error describing the first violation found, checked in the
/// order: input-is-object, required keys present, no unknown keys, types match.
pub fn validate(definition: &ToolDefinition, args: &serde_json::Value) -> Result<(), String> {
    let obj = args.as_object().ok_or_else(|| "Arguments must be an object.".to_string())?;

    for key in &definition.required {
        if !obj.contains_key(key) {
            return Err(format!("Missing required argument '{key}'."));
        }
    }

    for key in obj.keys() {
        if !definition.properties.contains_key(key) {
            return Err(format!("Unsupported argument '{key}'."));
        }
    }

    for (key, schema) in &definition.properties {
        if let Some(value) = obj.get(key) {
            if !schema.arg_type.matches(value) {
                return Err(format!("Argument '{key}' must be {}.", schema.arg_type.label()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_definition() -> ToolDefinition {
        ToolDefinition::new("read_file")
            .with_property("path", ArgType::String, true)
            .with_property("startLine", ArgType::Integer, false)
    }

    /// **Scenario (§8 property 8)**: the minimal valid argument set validates.
    #[test]
    fn minimal_valid_args_pass() {
        let definition = sample_definition();
        let args = serde_json::json!({"path": "chat.py"});
        assert!(validate(&definition, &args).is_ok());
    }

    /// **Scenario C2**: an undeclared key is rejected with the canonical message.
    #[test]
    fn unknown_key_is_rejected() {
        let definition = sample_definition();
        let args = serde_json::json!({"path": "chat.py", "bogus": 1});
        let err = validate(&definition, &args).unwrap_err();
        assert_eq!(err, "Unsupported argument 'bogus'.");
    }

    /// **Scenario C2**: a boolean where an integer is declared is rejected, not silently coerced.
    #[test]
    fn boolean_is_not_accepted_as_integer() {
        let definition = sample_definition();
        let args = serde_json::json!({"path": "chat.py", "startLine": true});
        let err = validate(&definition, &args).unwrap_err();
        assert_eq!(err, "Argument 'startLine' must be an integer.");
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let definition = sample_definition();
        let args = serde_json::json!({});
        let err = validate(&definition, &args).unwrap_err();
        assert_eq!(err, "Missing required argument 'path'.");
    }

    #[test]
    fn non_object_input_is_rejected() {
        let definition = sample_definition();
        let args = serde_json::json!("not an object");
        assert!(validate(&definition, &args).is_err());
    }
}
