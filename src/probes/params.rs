// probes/params.rs
use serde_json::Value;
use thiserror::Error;

use crate::types::TestDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("required parameter '{key}' is missing")]
    Missing { key: String },

    #[error("parameter '{key}' must be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("parameter '{key}' must be between {min} and {max} (got {value})")]
    OutOfRange { key: String, min: i64, max: i64, value: i64 },

    #[error("parameter '{key}' is invalid: {reason}")]
    Invalid { key: String, reason: String },
}

impl ParamError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ParamError::Invalid { key: key.to_string(), reason: reason.into() }
    }

    fn wrong_type(key: &str, expected: &'static str) -> Self {
        ParamError::WrongType { key: key.to_string(), expected }
    }
}

/// Typed, validated reads over a definition's loosely typed parameter bag.
/// Unknown keys are ignored; `null` is treated the same as absent.
pub struct Params<'a> {
    def: &'a TestDefinition,
}

impl<'a> Params<'a> {
    pub fn new(def: &'a TestDefinition) -> Self {
        Self { def }
    }

    fn raw(&self, key: &str) -> Option<&'a Value> {
        match self.def.parameters.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        }
    }

    pub fn required_str(&self, key: &str) -> Result<String, ParamError> {
        match self.optional_str(key)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(ParamError::Missing { key: key.to_string() }),
        }
    }

    /// Strings pass through; numbers and booleans are stringified.
    pub fn optional_str(&self, key: &str) -> Result<Option<String>, ParamError> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(ParamError::wrong_type(key, "a string")),
        }
    }

    fn optional_i64(&self, key: &str) -> Result<Option<i64>, ParamError> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(i) => Ok(Some(i)),
                // 10.0 is fine, 10.5 is not
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
                    _ => Err(ParamError::wrong_type(key, "an integer")),
                },
            },
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ParamError::wrong_type(key, "an integer")),
            Some(_) => Err(ParamError::wrong_type(key, "an integer")),
        }
    }

    /// Integer with default substitution and an inclusive range check.
    pub fn int_in_range(&self, key: &str, default: i64, min: i64, max: i64) -> Result<i64, ParamError> {
        let value = self.optional_i64(key)?.unwrap_or(default);
        if value < min || value > max {
            return Err(ParamError::OutOfRange { key: key.to_string(), min, max, value });
        }
        Ok(value)
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, ParamError> {
        match self.optional_i64(key)? {
            None => Ok(default),
            Some(v) if v < 0 => Err(ParamError::OutOfRange {
                key: key.to_string(),
                min: 0,
                max: i64::MAX,
                value: v,
            }),
            Some(v) => Ok(v as u64),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ParamError> {
        match self.raw(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(ParamError::wrong_type(key, "a boolean")),
            },
            Some(Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(ParamError::wrong_type(key, "a boolean")),
            },
            Some(_) => Err(ParamError::wrong_type(key, "a boolean")),
        }
    }

    pub fn port(&self, key: &str, default: u16) -> Result<u16, ParamError> {
        let p = self.int_in_range(key, i64::from(default), 1, 65535)?;
        Ok(p as u16)
    }

    /// `timeoutMs` parameter, else the definition-level timeout, else `default`. Must be > 0.
    pub fn timeout_ms(&self, default: u64) -> Result<u64, ParamError> {
        let value = match self.optional_i64("timeoutMs")? {
            Some(v) => v,
            None => self.def.timeout_ms.map(|t| t as i64).unwrap_or(default as i64),
        };
        if value <= 0 {
            return Err(ParamError::OutOfRange {
                key: "timeoutMs".to_string(),
                min: 1,
                max: i64::MAX,
                value,
            });
        }
        Ok(value as u64)
    }

    /// Name/value pairs from either `{"X-A": "1"}` or `[{"name": "X-A", "value": "1"}]`.
    pub fn string_pairs(&self, key: &str) -> Result<Vec<(String, String)>, ParamError> {
        let scalar = |v: &Value| -> Option<String> {
            match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }
        };
        match self.raw(key) {
            None => Ok(Vec::new()),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    scalar(v)
                        .map(|s| (k.clone(), s))
                        .ok_or_else(|| ParamError::invalid(key, format!("value for '{}' must be a string", k)))
                })
                .collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    let name = item.get("name").and_then(scalar);
                    let value = item.get("value").and_then(scalar);
                    match (name, value) {
                        (Some(n), Some(v)) if !n.trim().is_empty() => Ok((n, v)),
                        _ => Err(ParamError::invalid(key, "entries must have string 'name' and 'value'")),
                    }
                })
                .collect(),
            Some(_) => Err(ParamError::wrong_type(key, "an object or an array of name/value pairs")),
        }
    }
}
