//! Conversions between Rhai values and JSON trees.
//!
//! Messages carry `serde_json::Value` payloads while formulas work on Rhai
//! `Dynamic`s. Objects map to `rhai::Map`, arrays to `rhai::Array`, `null` to
//! unit. Error sentinels and range references serialize to their display form.

use rhai::Dynamic;
use serde_json::Value;

use super::cell_ref::RangeRef;
use super::error::ErrorCode;

/// Convert a Rhai value into JSON.
pub fn to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(n) = value.as_int() {
        return Value::from(n);
    }
    if let Ok(n) = value.as_float() {
        return number_value(n);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return Value::String(value.clone().into_string().unwrap_or_default());
    }
    if value.is_array() {
        let array = value.clone().into_array().unwrap_or_default();
        return Value::Array(array.iter().map(to_json).collect());
    }
    if value.is_map() {
        let map = value.clone().try_cast::<rhai::Map>().unwrap_or_default();
        return Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect(),
        );
    }
    if let Some(code) = ErrorCode::from_dynamic(value) {
        return Value::String(code.to_string());
    }
    if let Some(range) = value.clone().try_cast::<RangeRef>() {
        return Value::String(range.to_string());
    }
    Value::String(value.to_string())
}

/// JSON number for a float; integral values become JSON integers.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Convert a JSON tree into a Rhai value.
pub fn from_json(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => Dynamic::from(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: rhai::Array = items.iter().map(from_json).collect();
            Dynamic::from_array(array)
        }
        Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (k, v) in map {
                out.insert(k.as_str().into(), from_json(v));
            }
            Dynamic::from_map(out)
        }
    }
}

/// Numeric view of a value (ints widen to floats).
pub fn as_number(value: &Dynamic) -> Option<f64> {
    if let Ok(n) = value.as_float() {
        return Some(n);
    }
    value.as_int().ok().map(|n| n as f64)
}

/// Numeric view of a JSON value.
pub fn json_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Text view of a value (numbers and bools are rendered, unit is empty).
pub fn as_text(value: &Dynamic) -> String {
    if value.is_unit() {
        return String::new();
    }
    if value.is_string() {
        return value.clone().into_string().unwrap_or_default();
    }
    super::format::format_dynamic(value)
}

/// Spreadsheet truthiness: non-zero numbers, TRUE, non-empty text except "FALSE".
pub fn is_truthy(value: &Dynamic) -> bool {
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Some(n) = as_number(value) {
        return n != 0.0;
    }
    if value.is_string() {
        let text = as_text(value);
        return !text.is_empty() && !text.eq_ignore_ascii_case("false");
    }
    false
}
