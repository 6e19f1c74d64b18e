//! Socket and parameter schemas for node types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse value classification used for binding compatibility and parameter
/// validation. `Any` is compatible with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Geometry,
    Number,
    Boolean,
    Text,
    Vector,
    Any,
}

impl SemanticType {
    pub fn is_compatible(self, other: SemanticType) -> bool {
        self == other || self == SemanticType::Any || other == SemanticType::Any
    }

    /// Shallow shape check of a JSON value against this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            SemanticType::Geometry => value.is_object(),
            SemanticType::Number => value.is_number(),
            SemanticType::Boolean => value.is_boolean(),
            SemanticType::Text => value.is_string(),
            SemanticType::Vector => value
                .as_array()
                .map(|items| items.len() == 3 && items.iter().all(Value::is_number))
                .unwrap_or(false),
            SemanticType::Any => true,
        }
    }
}

impl std::fmt::Display for SemanticType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SemanticType::Geometry => "geometry",
            SemanticType::Number => "number",
            SemanticType::Boolean => "boolean",
            SemanticType::Text => "text",
            SemanticType::Vector => "vector",
            SemanticType::Any => "any",
        };
        write!(f, "{name}")
    }
}

/// One input or output socket of a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketSpec {
    pub name: String,
    pub semantic: SemanticType,
    /// Required inputs must be bound before evaluation. Ignored on outputs.
    #[serde(default)]
    pub required: bool,
}

impl SocketSpec {
    pub fn required(name: impl Into<String>, semantic: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, semantic: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic,
            required: false,
        }
    }

    pub fn output(name: impl Into<String>, semantic: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic,
            required: false,
        }
    }
}

/// One declared parameter of a node type: default value plus constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub semantic: SemanticType,
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Allowed values for text parameters that act as an enumeration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

impl ParamSpec {
    pub fn number(name: impl Into<String>, default: f64) -> Self {
        Self {
            name: name.into(),
            semantic: SemanticType::Number,
            default: Value::from(default),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn boolean(name: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            semantic: SemanticType::Boolean,
            default: Value::from(default),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn text(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            semantic: SemanticType::Text,
            default: Value::from(default.into()),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn vector(name: impl Into<String>, default: [f64; 3]) -> Self {
        Self {
            name: name.into(),
            semantic: SemanticType::Vector,
            default: Value::from(default.to_vec()),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn any(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            semantic: SemanticType::Any,
            default,
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_choices(mut self, choices: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    /// Check a concrete value against this spec. Returns the human-readable
    /// reason on failure.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if !self.semantic.accepts(value) {
            return Err(format!("expected a {} value", self.semantic));
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("{n} is below the minimum {min}"));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("{n} is above the maximum {max}"));
                }
            }
        }
        if let (Some(choices), Some(text)) = (&self.choices, value.as_str()) {
            if !choices.iter().any(|choice| choice == text) {
                return Err(format!(
                    "'{text}' is not one of: {}",
                    choices.join(", ")
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compatibility_is_symmetric_around_any() {
        assert!(SemanticType::Geometry.is_compatible(SemanticType::Geometry));
        assert!(SemanticType::Any.is_compatible(SemanticType::Number));
        assert!(SemanticType::Number.is_compatible(SemanticType::Any));
        assert!(!SemanticType::Number.is_compatible(SemanticType::Text));
    }

    #[test]
    fn numeric_bounds_are_enforced() {
        let spec = ParamSpec::number("radius", 1.0).with_min(0.0).with_max(10.0);
        assert!(spec.check(&json!(5.0)).is_ok());
        assert!(spec.check(&json!(-1.0)).is_err());
        assert!(spec.check(&json!(11.0)).is_err());
        assert!(spec.check(&json!("five")).is_err());
    }

    #[test]
    fn choices_restrict_text_params() {
        let spec = ParamSpec::text("mode", "fast").with_choices(["fast", "exact"]);
        assert!(spec.check(&json!("exact")).is_ok());
        let reason = spec.check(&json!("sloppy")).unwrap_err();
        assert!(reason.contains("not one of"));
    }

    #[test]
    fn vectors_must_have_three_numeric_components() {
        let spec = ParamSpec::vector("offset", [0.0, 0.0, 0.0]);
        assert!(spec.check(&json!([1.0, 2.0, 3.0])).is_ok());
        assert!(spec.check(&json!([1.0, 2.0])).is_err());
        assert!(spec.check(&json!([1.0, "two", 3.0])).is_err());
    }
}
