//! Declarative configuration schemas checked before a node is constructed.

use std::collections::HashMap;
use weftcore::{ValidationError, Value};

/// Accepted type for a configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Object, Value::Json(j)) => j.is_object(),
            (FieldType::Array, Value::Json(j)) => j.is_array(),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Enumerated values; only meaningful for string fields
    pub allowed: Option<Vec<String>>,
    pub description: String,
}

/// Schema a node type declares for its configuration map.
/// Fields not named in the schema are accepted as-is.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    fields: Vec<FieldSpec>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field(name, field_type, true)
    }

    pub fn optional(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field(name, field_type, false)
    }

    /// Restrict a string field to a fixed set of values
    pub fn one_of<I, S>(mut self, name: &str, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<String> = allowed.into_iter().map(Into::into).collect();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.allowed = Some(allowed),
            None => self.fields.push(FieldSpec {
                name: name.to_string(),
                field_type: FieldType::String,
                required: false,
                allowed: Some(allowed),
                description: String::new(),
            }),
        }
        self
    }

    pub fn describe(mut self, name: &str, description: impl Into<String>) -> Self {
        if let Some(field) = self.fields.iter_mut().find(|f| f.name == name) {
            field.description = description.into();
        }
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn field(mut self, name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            field_type,
            required,
            allowed: None,
            description: String::new(),
        });
        self
    }

    pub fn validate(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<(), ValidationError> {
        for field in &self.fields {
            let value = match config.get(&field.name) {
                Some(Value::Null) | None if field.required => {
                    return Err(ValidationError::MissingField {
                        node_type: node_type.to_string(),
                        field: field.name.clone(),
                    });
                }
                Some(Value::Null) | None => continue,
                Some(value) => value,
            };

            if !field.field_type.accepts(value) {
                return Err(ValidationError::WrongType {
                    node_type: node_type.to_string(),
                    field: field.name.clone(),
                    expected: field.field_type.label().to_string(),
                    actual: value.type_name().to_string(),
                });
            }

            if let (Some(allowed), Some(text)) = (&field.allowed, value.as_str()) {
                if !allowed.iter().any(|a| a == text) {
                    return Err(ValidationError::NotAllowed {
                        node_type: node_type.to_string(),
                        field: field.name.clone(),
                        value: text.to_string(),
                        allowed: allowed.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_schema() -> ConfigSchema {
        ConfigSchema::new()
            .required("url", FieldType::String)
            .optional("method", FieldType::String)
            .one_of("method", ["GET", "POST"])
            .optional("headers", FieldType::Object)
    }

    fn config(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn accepts_valid_config_with_extra_fields() {
        let cfg = config(&[
            ("url", Value::from("http://x")),
            ("method", Value::from("POST")),
            ("note", Value::from(1.0)),
        ]);
        assert!(http_schema().validate("http.request", &cfg).is_ok());
    }

    #[test]
    fn missing_required_field() {
        let err = http_schema().validate("http.request", &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                node_type: "http.request".into(),
                field: "url".into()
            }
        );
    }

    #[test]
    fn null_counts_as_missing() {
        let cfg = config(&[("url", Value::Null)]);
        assert!(matches!(
            http_schema().validate("http.request", &cfg),
            Err(ValidationError::MissingField { .. })
        ));
    }

    #[test]
    fn wrong_type_is_reported() {
        let cfg = config(&[("url", Value::from(3.0))]);
        let err = http_schema().validate("http.request", &cfg).unwrap_err();
        assert!(matches!(err, ValidationError::WrongType { ref actual, .. } if actual == "number"));
    }

    #[test]
    fn enumerated_values_are_enforced() {
        let cfg = config(&[("url", Value::from("http://x")), ("method", Value::from("PATCH"))]);
        assert!(matches!(
            http_schema().validate("http.request", &cfg),
            Err(ValidationError::NotAllowed { .. })
        ));
    }

    #[test]
    fn json_objects_satisfy_object_fields() {
        let cfg = config(&[
            ("url", Value::from("http://x")),
            ("headers", Value::Json(serde_json::json!({"a": "b"}))),
        ]);
        assert!(http_schema().validate("http.request", &cfg).is_ok());
    }
}
