//! Keyed table updates behind TABLE_UPDATE.
//!
//! A table is a rectangular block whose first column holds row keys and whose
//! first row holds column keys. The top-left corner belongs to neither and is
//! never touched. Unknown keys can be pushed in at the end (append) or at the
//! start (prepend); a full table evicts the line at the opposite end.

use std::collections::HashMap;

use serde_json::Value;

use crate::aggregate::{Accumulator, AggregationMethod};
use crate::codec::{Matrix, transpose};
use crate::engine::ErrorCode;

/// Where an unknown key is inserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Push {
    Prepend,
    None,
    Append,
}

impl Push {
    pub fn from_code(code: i64) -> Push {
        match code.signum() {
            -1 => Push::Prepend,
            1 => Push::Append,
            _ => Push::None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableUpdate {
    pub value: Value,
    pub row_key: Value,
    pub column_key: Value,
    pub push_row: Push,
    pub push_column: Push,
    pub aggregation: AggregationMethod,
}

type TargetKey = (String, String);

/// Per-cell accumulators kept between evaluations of one TABLE_UPDATE cell.
#[derive(Clone, Debug, Default)]
pub struct TableState {
    accumulators: HashMap<TargetKey, Accumulator>,
    last_target: Option<TargetKey>,
}

/// Canonical text used to match keys (`1` and `"1"` stay distinct).
fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        other => Some(other.to_string()),
    }
}

#[derive(Clone, Copy)]
enum Axis {
    Rows,
    Columns,
}

impl TableState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.accumulators.clear();
        self.last_target = None;
    }

    /// Apply one update to `cells` (the full table, headers included).
    pub fn apply(&mut self, cells: &mut Matrix, update: &TableUpdate) -> Result<(), ErrorCode> {
        let height = cells.len();
        let width = cells.first().map_or(0, Vec::len);
        if width == 0 || (width == 1 && height == 1) {
            return Err(ErrorCode::Value);
        }
        if width == 1 {
            let key = key_of(&update.row_key).ok_or(ErrorCode::Value)?;
            if find_line(cells, &key, Axis::Rows).is_none() {
                self.push_line(cells, &update.row_key, update.push_row, Axis::Rows);
            }
            return Ok(());
        }
        if height == 1 {
            let key = key_of(&update.column_key).ok_or(ErrorCode::Value)?;
            if find_line(cells, &key, Axis::Columns).is_none() {
                self.push_line(cells, &update.column_key, update.push_column, Axis::Columns);
            }
            return Ok(());
        }

        let row_key = key_of(&update.row_key).ok_or(ErrorCode::Value)?;
        let column_key = key_of(&update.column_key).ok_or(ErrorCode::Value)?;
        let row = find_line(cells, &row_key, Axis::Rows)
            .or_else(|| self.push_line(cells, &update.row_key, update.push_row, Axis::Rows));
        let Some(row) = row else {
            return Ok(());
        };
        // row pushes never move columns, and column pushes never move rows
        let col = find_line(cells, &column_key, Axis::Columns).or_else(|| {
            self.push_line(cells, &update.column_key, update.push_column, Axis::Columns)
        });
        let Some(col) = col else {
            return Ok(());
        };

        let target = (row_key, column_key);
        let value = if update.aggregation == AggregationMethod::None {
            self.accumulators.remove(&target);
            update.value.clone()
        } else {
            if self.last_target.as_ref() != Some(&target) {
                self.accumulators.remove(&target);
            }
            let acc = self.accumulators.entry(target.clone()).or_default();
            acc.push(&update.value);
            acc.result(update.aggregation)?
        };
        self.last_target = Some(target);
        cells[row][col] = value;
        Ok(())
    }

    /// Insert a new line for `key` along `axis`, returning its index.
    fn push_line(&mut self, cells: &mut Matrix, key: &Value, push: Push, axis: Axis) -> Option<usize> {
        let (index, evicted) = match axis {
            Axis::Rows => push_row(cells, key, push)?,
            Axis::Columns => {
                let mut lines = transpose(cells);
                let pushed = push_row(&mut lines, key, push)?;
                *cells = transpose(&lines);
                pushed
            }
        };
        if let Some(evicted) = evicted {
            self.drop_key(&evicted, axis);
        }
        Some(index)
    }

    /// Forget accumulators whose row or column left the table.
    fn drop_key(&mut self, key: &str, axis: Axis) {
        let matches = |(row, col): &TargetKey| match axis {
            Axis::Rows => row == key,
            Axis::Columns => col == key,
        };
        self.accumulators.retain(|target, _| !matches(target));
        if self.last_target.as_ref().is_some_and(matches) {
            self.last_target = None;
        }
    }
}

/// Row push on a header-first block. Returns the new row's index and the key
/// of an evicted row, if any.
fn push_row(cells: &mut Matrix, key: &Value, push: Push) -> Option<(usize, Option<String>)> {
    if push == Push::None || cells.len() < 2 {
        return None;
    }
    let width = cells.first().map_or(0, Vec::len);
    let mut body: Matrix = cells.drain(1..).collect();
    let mut new_line = vec![Value::Null; width];
    new_line[0] = key.clone();
    let last_used = body.iter().rposition(|line| key_of(&line[0]).is_some());
    let (index, evicted) = match (push, last_used) {
        (Push::Append, Some(last)) if last + 1 == body.len() => {
            let evicted = body.remove(0);
            body.push(new_line);
            (body.len(), Some(evicted))
        }
        (Push::Append, Some(last)) => {
            body[last + 1] = new_line;
            (last + 2, None)
        }
        (Push::Append, None) => {
            body[0] = new_line;
            (1, None)
        }
        _ => {
            body.insert(0, new_line);
            (1, body.pop())
        }
    };
    cells.append(&mut body);
    Some((index, evicted.and_then(|line| key_of(&line[0]))))
}

fn find_line(cells: &Matrix, key: &str, axis: Axis) -> Option<usize> {
    match axis {
        Axis::Rows => (1..cells.len()).find(|&r| key_of(&cells[r][0]).as_deref() == Some(key)),
        Axis::Columns => {
            let header = cells.first()?;
            (1..header.len()).find(|&c| key_of(&header[c]).as_deref() == Some(key))
        }
    }
}
