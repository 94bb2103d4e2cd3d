//! Declarative device options.
//!
//! A device declares the options it accepts as a list of [`OptionSpec`]. Incoming
//! configuration maps are validated against that schema before anything is applied.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::StateValue;
use crate::error::{AppResult, BeamlineError};

/// Configuration input: option name to JSON value.
pub type ConfigMap = BTreeMap<String, Value>;

/// Accepted type and range of one option.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptionKind {
    /// Number within `[min, max]`
    Float {
        /// Inclusive lower bound
        min: f64,
        /// Inclusive upper bound
        max: f64,
    },
    /// Integer within `[min, max]`
    Integer {
        /// Inclusive lower bound
        min: i64,
        /// Inclusive upper bound
        max: i64,
    },
    /// true/false
    Bool,
    /// Any string
    Text,
    /// One of a fixed set of strings
    Choice {
        /// Allowed values
        choices: Vec<String>,
    },
}

/// One declared option.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    /// Option name; also the name of the state slot it is stored in
    pub name: String,
    /// Type and range
    pub kind: OptionKind,
}

impl OptionSpec {
    /// Float option with inclusive range.
    pub fn float(name: &str, min: f64, max: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: OptionKind::Float { min, max },
        }
    }

    /// Integer option with inclusive range.
    pub fn integer(name: &str, min: i64, max: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: OptionKind::Integer { min, max },
        }
    }

    /// Boolean option.
    pub fn boolean(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: OptionKind::Bool,
        }
    }

    /// Free text option.
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: OptionKind::Text,
        }
    }

    /// Enumerated option.
    pub fn choice(name: &str, choices: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: OptionKind::Choice {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
        }
    }

    /// Check `value` against this spec and convert it to a state value.
    pub fn validate(&self, value: &Value) -> AppResult<StateValue> {
        let mismatch = |expected: &str| {
            BeamlineError::Configuration(format!(
                "option '{}' expects {}, got {}",
                self.name, expected, value
            ))
        };
        match &self.kind {
            OptionKind::Float { min, max } => {
                let v = value.as_f64().ok_or_else(|| mismatch("a number"))?;
                if !v.is_finite() || v < *min || v > *max {
                    return Err(BeamlineError::Configuration(format!(
                        "option '{}' value {} out of range [{}, {}]",
                        self.name, v, min, max
                    )));
                }
                Ok(StateValue::Float(v))
            }
            OptionKind::Integer { min, max } => {
                let v = value.as_i64().ok_or_else(|| mismatch("an integer"))?;
                if v < *min || v > *max {
                    return Err(BeamlineError::Configuration(format!(
                        "option '{}' value {} out of range [{}, {}]",
                        self.name, v, min, max
                    )));
                }
                Ok(StateValue::Int(v))
            }
            OptionKind::Bool => value
                .as_bool()
                .map(StateValue::Bool)
                .ok_or_else(|| mismatch("a boolean")),
            OptionKind::Text => value
                .as_str()
                .map(StateValue::from)
                .ok_or_else(|| mismatch("a string")),
            OptionKind::Choice { choices } => {
                let v = value.as_str().ok_or_else(|| mismatch("a string"))?;
                if choices.iter().any(|c| c == v) {
                    Ok(StateValue::from(v))
                } else {
                    Err(BeamlineError::Configuration(format!(
                        "option '{}' must be one of {:?}, got '{}'",
                        self.name, choices, v
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_float_range() {
        let spec = OptionSpec::float("speed", 0.1, 100.0);
        assert_eq!(spec.validate(&json!(5)).unwrap(), StateValue::Float(5.0));
        assert!(spec.validate(&json!(0.05)).is_err());
        assert!(spec.validate(&json!(150.0)).is_err());
        assert!(spec.validate(&json!("fast")).is_err());
    }

    #[test]
    fn test_integer_rejects_float() {
        let spec = OptionSpec::integer("retries", 0, 10);
        assert_eq!(spec.validate(&json!(3)).unwrap(), StateValue::Int(3));
        assert!(spec.validate(&json!(2.5)).is_err());
    }

    #[test]
    fn test_choice() {
        let spec = OptionSpec::choice("mode", &["fast", "fine"]);
        assert!(spec.validate(&json!("fine")).is_ok());
        let err = spec.validate(&json!("coarse")).unwrap_err();
        assert!(err.to_string().contains("must be one of"));
    }
}
