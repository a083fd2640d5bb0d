//! Conversions between JSON values and rectangular cell blocks.
//!
//! Four layouts are supported:
//! - `json`: nested key/value pairs; a key sits in the column matching its
//!   nesting level and a scalar value in the column right after it.
//! - `array`: a flat list laid out along one line.
//! - `dictionary`: one line of keys, followed by lines of values.
//! - `range`: a matrix of plain values, no headers.
//!
//! `horizontal = true` lays lines out as rows, `false` as columns.

use serde_json::{Map, Value};

use crate::engine::{CellRef, ErrorCode, RangeRef};

/// Row-major block of plain values.
pub type Matrix = Vec<Vec<Value>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeCodec {
    Json,
    Array,
    Dictionary,
    Range,
}

impl RangeCodec {
    pub fn parse(name: &str) -> Option<RangeCodec> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(RangeCodec::Json),
            "array" => Some(RangeCodec::Array),
            "dictionary" => Some(RangeCodec::Dictionary),
            "range" => Some(RangeCodec::Range),
            _ => None,
        }
    }
}

/// Encode a block of cells into a JSON value.
pub fn encode(codec: RangeCodec, cells: &Matrix, horizontal: bool) -> Value {
    match codec {
        RangeCodec::Json => encode_json(&oriented(cells, horizontal)),
        RangeCodec::Array => Value::Array(oriented(cells, horizontal).into_iter().flatten().collect()),
        RangeCodec::Dictionary => encode_dictionary(&oriented(cells, horizontal)),
        RangeCodec::Range => Value::Array(
            oriented(cells, horizontal)
                .into_iter()
                .map(Value::Array)
                .collect(),
        ),
    }
}

/// Decode a JSON value into a block of cells.
pub fn decode(codec: RangeCodec, value: &Value, horizontal: bool) -> Result<Matrix, ErrorCode> {
    let lines = match (codec, value) {
        (_, Value::Null) => Vec::new(),
        (RangeCodec::Json, Value::Object(_) | Value::Array(_)) => {
            let mut rows = Vec::new();
            decode_json(value, 0, &mut rows);
            rows
        }
        (RangeCodec::Array | RangeCodec::Range, Value::Array(items)) => lines_of(items),
        (RangeCodec::Dictionary, Value::Object(map)) => decode_dictionary(map),
        (RangeCodec::Array, scalar) if !scalar.is_object() => vec![vec![scalar.clone()]],
        _ => return Err(ErrorCode::Value),
    };
    Ok(oriented(&lines, horizontal))
}

/// Cell writes that place `matrix` into `target`.
///
/// A single-cell target grows to fit the matrix; any other target clips to its
/// bounds. Target cells not covered by the matrix are cleared (`Null`).
pub fn spill(target: &RangeRef, matrix: &Matrix) -> Vec<(CellRef, Value)> {
    let width = matrix.iter().map(Vec::len).max().unwrap_or(0);
    let area = if target.is_single_cell() && width > 0 {
        target.resized(width, matrix.len())
    } else {
        target.clone()
    };
    area.cells()
        .map(|cell| {
            let value = cell
                .offset_from(&area.start)
                .and_then(|(col, row)| matrix.get(row).and_then(|line| line.get(col)))
                .cloned()
                .unwrap_or(Value::Null);
            (cell, value)
        })
        .collect()
}

fn oriented(lines: &Matrix, horizontal: bool) -> Matrix {
    if horizontal {
        lines.clone()
    } else {
        transpose(lines)
    }
}

/// Transpose a possibly ragged block, padding with `Null`.
pub fn transpose(lines: &Matrix) -> Matrix {
    let width = lines.iter().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .map(|col| {
            lines
                .iter()
                .map(|line| line.get(col).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect()
}

fn lines_of(items: &[Value]) -> Matrix {
    if items.iter().any(Value::is_array) {
        items
            .iter()
            .map(|item| match item {
                Value::Array(inner) => inner.iter().map(plain).collect(),
                other => vec![plain(other)],
            })
            .collect()
    } else {
        vec![items.iter().map(plain).collect()]
    }
}

/// Nested containers are stored as JSON text in a cell.
fn plain(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if f.fract() == 0.0 => format!("{}", f as i64),
            _ => n.to_string(),
        }),
        other => Some(other.to_string()),
    }
}

fn decode_json(value: &Value, level: usize, rows: &mut Matrix) {
    let entries: Vec<(Value, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| (Value::from(k.as_str()), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i as i64), v))
            .collect(),
        _ => return,
    };
    for (key, child) in entries {
        let mut row = vec![Value::Null; level];
        row.push(key);
        match child {
            Value::Object(_) | Value::Array(_) => {
                rows.push(row);
                decode_json(child, level + 1, rows);
            }
            scalar => {
                row.push(scalar.clone());
                rows.push(row);
            }
        }
    }
}

struct JsonRow {
    level: usize,
    key: String,
    value: Value,
}

fn encode_json(rows: &Matrix) -> Value {
    let parsed: Vec<JsonRow> = rows
        .iter()
        .filter_map(|row| {
            let level = row.iter().position(|v| key_text(v).is_some())?;
            Some(JsonRow {
                level,
                key: key_text(&row[level])?,
                value: row.get(level + 1).cloned().unwrap_or(Value::Null),
            })
        })
        .collect();
    let base = parsed.iter().map(|r| r.level).min().unwrap_or(0);
    let mut idx = 0;
    build_container(&parsed, &mut idx, base)
}

fn build_container(rows: &[JsonRow], idx: &mut usize, level: usize) -> Value {
    let mut entries: Vec<(String, Value)> = Vec::new();
    while let Some(row) = rows.get(*idx) {
        if row.level < level {
            break;
        }
        *idx += 1;
        if row.level > level {
            // orphaned deeper row
            continue;
        }
        let nested = rows.get(*idx).is_some_and(|next| next.level > level);
        let value = if nested {
            build_container(rows, idx, level + 1)
        } else {
            row.value.clone()
        };
        entries.push((row.key.clone(), value));
    }
    let is_list = !entries.is_empty()
        && entries
            .iter()
            .enumerate()
            .all(|(i, (key, _))| *key == i.to_string());
    if is_list {
        Value::Array(entries.into_iter().map(|(_, v)| v).collect())
    } else {
        Value::Object(entries.into_iter().collect())
    }
}

fn decode_dictionary(map: &Map<String, Value>) -> Matrix {
    let depth = map
        .values()
        .map(|v| match v {
            Value::Array(items) => items.len(),
            _ => 1,
        })
        .max()
        .unwrap_or(0);
    let mut lines = vec![map.keys().map(|k| Value::from(k.as_str())).collect::<Vec<_>>()];
    for i in 0..depth {
        lines.push(
            map.values()
                .map(|v| match v {
                    Value::Array(items) => items.get(i).map(plain).unwrap_or(Value::Null),
                    scalar if i == 0 => scalar.clone(),
                    _ => Value::Null,
                })
                .collect(),
        );
    }
    lines
}

fn encode_dictionary(lines: &Matrix) -> Value {
    let Some((keys, values)) = lines.split_first() else {
        return Value::Object(Map::new());
    };
    let mut map = Map::new();
    for (col, key) in keys.iter().enumerate() {
        let Some(key) = key_text(key) else {
            continue;
        };
        let mut column: Vec<Value> = values
            .iter()
            .map(|line| line.get(col).cloned().unwrap_or(Value::Null))
            .collect();
        while column.len() > 1 && column.last().is_some_and(Value::is_null) {
            column.pop();
        }
        let value = match column.len() {
            0 => Value::Null,
            1 => column.remove(0),
            _ => Value::Array(column),
        };
        map.insert(key, value);
    }
    Value::Object(map)
}
