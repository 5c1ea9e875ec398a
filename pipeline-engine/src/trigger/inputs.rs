// Trigger Inputs
// Binds supplied dispatch/call inputs to their declared schema

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::TriggerError;
use crate::expression::lexer::parse_number_literal;
use crate::expression::Value;
use crate::workflow::models::{scalar_to_string, InputType, WorkflowInput};

/// Validate supplied inputs against their declarations.
///
/// Missing values take the declared default. Values are coerced to the
/// declared type. Undeclared inputs are dropped.
pub fn bind_inputs(
    declared: &BTreeMap<String, WorkflowInput>,
    supplied: &serde_json::Map<String, serde_json::Value>,
) -> Result<BTreeMap<String, Value>, TriggerError> {
    let mut bound = BTreeMap::new();

    for (name, input) in declared {
        let raw = supplied
            .get(name)
            .filter(|v| !v.is_null())
            .or(input.default.as_ref());

        let Some(raw) = raw else {
            if input.required {
                return Err(TriggerError::MissingRequiredInput {
                    input: name.clone(),
                });
            }
            continue;
        };

        bound.insert(name.clone(), coerce(name, input, raw)?);
    }

    for name in supplied.keys() {
        if !declared.contains_key(name) {
            warn!(input = %name, "ignoring undeclared input");
        }
    }

    Ok(bound)
}

fn coerce(
    name: &str,
    input: &WorkflowInput,
    raw: &serde_json::Value,
) -> Result<Value, TriggerError> {
    let mismatch = || TriggerError::InvalidInputType {
        input: name.to_string(),
        expected: input.input_type.as_str().to_string(),
        value: scalar_to_string(raw).unwrap_or_else(|| raw.to_string()),
    };

    match input.input_type {
        InputType::Boolean => match raw {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            serde_json::Value::String(s) if s.eq_ignore_ascii_case("false") => {
                Ok(Value::Bool(false))
            }
            _ => Err(mismatch()),
        },
        InputType::Number => match raw {
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).ok_or_else(mismatch),
            serde_json::Value::String(s) => parse_number_literal(s.trim())
                .map(Value::Number)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        InputType::Choice => {
            let value = scalar_to_string(raw).ok_or_else(mismatch)?;
            if !input.options.is_empty() && !input.options.contains(&value) {
                return Err(TriggerError::InvalidChoice {
                    input: name.to_string(),
                    value,
                    options: input.options.clone(),
                });
            }
            Ok(Value::String(value))
        }
        InputType::String | InputType::Environment => {
            scalar_to_string(raw).map(Value::String).ok_or_else(mismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared(yaml: &str) -> BTreeMap<String, WorkflowInput> {
        let tree: serde_json::Value = serde_yaml::from_str(yaml).unwrap();
        serde_json::from_value(tree).unwrap()
    }

    fn supplied(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    const INPUTS: &str = r#"
environment:
  type: choice
  required: true
  options: [staging, production]
dry-run:
  type: boolean
  default: false
replicas:
  type: number
  default: "2"
note:
  type: string
"#;

    #[test]
    fn test_defaults_and_coercion() {
        let bound = bind_inputs(
            &declared(INPUTS),
            &supplied(json!({"environment": "staging", "dry-run": "TRUE"})),
        )
        .unwrap();

        assert_eq!(bound["environment"], Value::from("staging"));
        assert_eq!(bound["dry-run"], Value::Bool(true));
        assert_eq!(bound["replicas"], Value::Number(2.0));
        assert!(!bound.contains_key("note"));
    }

    #[test]
    fn test_missing_required_input() {
        let err = bind_inputs(&declared(INPUTS), &supplied(json!({}))).unwrap_err();
        assert_eq!(
            err,
            TriggerError::MissingRequiredInput {
                input: "environment".into()
            }
        );
    }

    #[test]
    fn test_invalid_choice() {
        let err = bind_inputs(
            &declared(INPUTS),
            &supplied(json!({"environment": "qa"})),
        )
        .unwrap_err();
        assert!(matches!(err, TriggerError::InvalidChoice { ref value, .. } if value == "qa"));
    }

    #[test]
    fn test_invalid_type() {
        let err = bind_inputs(
            &declared(INPUTS),
            &supplied(json!({"environment": "staging", "replicas": "many"})),
        )
        .unwrap_err();
        assert!(matches!(err, TriggerError::InvalidInputType { ref expected, .. } if expected == "number"));
    }
}
