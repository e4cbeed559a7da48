use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GoldenError;

/// Operator parameters as captured: a flat or nested JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpParam(Map<String, Value>);

impl From<Map<String, Value>> for OpParam {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl std::fmt::Display for OpParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.compact())
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> GoldenError {
    GoldenError::InvalidParam {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl OpParam {
    /// Builds from any JSON value; non-objects give an empty parameter set.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy holding only the top-level keys `keep` accepts.
    #[must_use]
    pub fn retained(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| keep(key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    /// Keys from `required` that are absent, in declaration order.
    #[must_use]
    pub fn missing(&self, required: &[&'static str]) -> Vec<&'static str> {
        required
            .iter()
            .copied()
            .filter(|key| !self.contains(key))
            .collect()
    }

    pub fn i64(&self, key: &str) -> Result<i64, GoldenError> {
        let value = self.get(key).ok_or_else(|| invalid(key, "is missing"))?;
        value_to_i64(value).ok_or_else(|| invalid(key, format!("is not an integer: {value}")))
    }

    pub fn i64_or(&self, key: &str, default: i64) -> Result<i64, GoldenError> {
        if self.contains(key) {
            self.i64(key)
        } else {
            Ok(default)
        }
    }

    pub fn f64(&self, key: &str) -> Result<f64, GoldenError> {
        let value = self.get(key).ok_or_else(|| invalid(key, "is missing"))?;
        value_to_f64(value).ok_or_else(|| invalid(key, format!("is not a number: {value}")))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, GoldenError> {
        if self.contains(key) {
            self.f64(key)
        } else {
            Ok(default)
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, GoldenError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
            Some(value) => value_to_i64(value)
                .map(|v| v != 0)
                .ok_or_else(|| invalid(key, format!("is not a flag: {value}"))),
        }
    }

    pub fn string(&self, key: &str) -> Result<String, GoldenError> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(value) => Ok(value.to_string()),
            None => Err(invalid(key, "is missing")),
        }
    }

    /// Integer list; a lone scalar counts as a one-element list.
    pub fn i64_list(&self, key: &str) -> Result<Vec<i64>, GoldenError> {
        let value = self.get(key).ok_or_else(|| invalid(key, "is missing"))?;
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    value_to_i64(item)
                        .ok_or_else(|| invalid(key, format!("holds a non-integer: {item}")))
                })
                .collect(),
            scalar => value_to_i64(scalar)
                .map(|v| vec![v])
                .ok_or_else(|| invalid(key, format!("is not an integer list: {scalar}"))),
        }
    }

    pub fn i64_list_or(&self, key: &str, default: &[i64]) -> Result<Vec<i64>, GoldenError> {
        if self.contains(key) {
            self.i64_list(key)
        } else {
            Ok(default.to_vec())
        }
    }

    pub fn f64_list(&self, key: &str) -> Result<Vec<f64>, GoldenError> {
        let value = self.get(key).ok_or_else(|| invalid(key, "is missing"))?;
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    value_to_f64(item)
                        .ok_or_else(|| invalid(key, format!("holds a non-number: {item}")))
                })
                .collect(),
            scalar => value_to_f64(scalar)
                .map(|v| vec![v])
                .ok_or_else(|| invalid(key, format!("is not a number list: {scalar}"))),
        }
    }

    /// Nested parameter object such as `normParam`; absent gives empty.
    #[must_use]
    pub fn nested(&self, key: &str) -> Self {
        match self.get(key) {
            Some(Value::Object(map)) => Self(map.clone()),
            _ => Self::default(),
        }
    }

    /// Enum-valued parameter given either as its numeric code or as one of
    /// the symbolic `names` (case-insensitive).
    pub fn code(&self, key: &str, names: &[(&str, i64)]) -> Result<i64, GoldenError> {
        let value = self.get(key).ok_or_else(|| invalid(key, "is missing"))?;
        if let Some(code) = value_to_i64(value) {
            return Ok(code);
        }
        if let Value::String(name) = value {
            if let Some((_, code)) = names
                .iter()
                .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name.trim()))
            {
                return Ok(*code);
            }
        }
        Err(GoldenError::unsupported(key, value))
    }

    pub fn code_or(&self, key: &str, names: &[(&str, i64)], default: i64) -> Result<i64, GoldenError> {
        if self.contains(key) {
            self.code(key, names)
        } else {
            Ok(default)
        }
    }

    /// Single-line JSON with keys in sorted order.
    #[must_use]
    pub fn compact(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::OpParam;
    use crate::error::GoldenError;
    use serde_json::json;

    fn param(value: serde_json::Value) -> OpParam {
        OpParam::from_value(value)
    }

    #[test]
    fn missing_keeps_declaration_order() {
        let p = param(json!({"rankRoot": 0}));
        assert_eq!(
            p.missing(&["rank", "rankRoot", "rankSize"]),
            vec!["rank", "rankSize"]
        );
        assert!(param(json!({"axis": 0, "depth": 3})).missing(&["axis", "depth"]).is_empty());
    }

    #[test]
    fn scalars_widen_to_lists() {
        let p = param(json!({"axes": 0, "offsets": [1, -2], "value": [1.5]}));
        assert_eq!(p.i64_list("axes").expect("scalar axis"), vec![0]);
        assert_eq!(p.i64_list("offsets").expect("list"), vec![1, -2]);
        assert_eq!(p.f64_list("value").expect("floats"), vec![1.5]);
        assert!(matches!(
            p.i64_list("size"),
            Err(GoldenError::InvalidParam { .. })
        ));
    }

    #[test]
    fn flags_accept_bools_and_numbers() {
        let p = param(json!({"transposeA": true, "transposeB": 0, "hasBias": "false"}));
        assert!(p.bool_or("transposeA", false).expect("bool"));
        assert!(!p.bool_or("transposeB", true).expect("number"));
        assert!(!p.bool_or("hasBias", true).expect("string"));
        assert!(p.bool_or("absent", true).expect("default"));
    }

    #[test]
    fn codes_accept_numbers_or_names() {
        let names = [("REDUCE_MAX", 1), ("REDUCE_MIN", 2), ("REDUCE_SUM", 3)];
        assert_eq!(param(json!({"reduceType": 3})).code("reduceType", &names), Ok(3));
        assert_eq!(
            param(json!({"reduceType": "reduce_min"})).code("reduceType", &names),
            Ok(2)
        );
        assert!(matches!(
            param(json!({"reduceType": "REDUCE_MEAN"})).code("reduceType", &names),
            Err(GoldenError::UnsupportedParam { .. })
        ));
    }

    #[test]
    fn nested_and_compact() {
        let p = param(json!({"normParam": {"epsilon": 1e-5}, "layerType": 1}));
        assert_eq!(p.nested("normParam").f64_or("epsilon", 0.0), Ok(1e-5));
        assert!(p.nested("postNormParam").is_empty());
        assert_eq!(p.compact(), r#"{"layerType":1,"normParam":{"epsilon":0.00001}}"#);
    }
}
