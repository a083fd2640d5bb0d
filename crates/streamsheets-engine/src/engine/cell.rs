//! Cell data structures for a sheet grid.
//!
//! This module provides the core data types for representing cells:
//! - [`CellType`] - The type of content in a cell (empty, text, number, bool, or formula)
//! - [`Cell`] - A cell with content
//! - [`Grid`] - Thread-safe sparse storage for cells (backed by `DashMap`)
//! - [`ValueCache`] - Thread-safe storage for evaluated formula results

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::cell_ref::CellRef;
use rhai::Dynamic;

/// The type of content stored in a cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CellType {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Script(String),
}

/// A cell in the sheet grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub contents: CellType,
}

impl Cell {
    pub fn new_empty() -> Cell {
        Cell {
            contents: CellType::Empty,
        }
    }

    pub fn new_text(text: &str) -> Cell {
        Cell {
            contents: CellType::Text(text.to_string()),
        }
    }

    pub fn new_number(n: f64) -> Cell {
        Cell {
            contents: CellType::Number(n),
        }
    }

    pub fn new_bool(b: bool) -> Cell {
        Cell {
            contents: CellType::Bool(b),
        }
    }

    /// Create a new cell containing a formula (stored without the leading '=').
    pub fn new_script(script: &str) -> Cell {
        Cell {
            contents: CellType::Script(script.to_string()),
        }
    }

    /// Parse user input and create appropriate cell type.
    /// - Empty string or whitespace -> Empty
    /// - Starts with '=' -> Script (without the '=')
    /// - Quoted string -> Text (without quotes)
    /// - TRUE / FALSE -> Bool
    /// - Valid number -> Number
    /// - Otherwise -> Text
    pub fn from_input(input: &str) -> Cell {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Cell::new_empty();
        }

        if let Some(formula) = trimmed.strip_prefix('=') {
            return Cell::new_script(formula);
        }

        if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
            let text = &trimmed[1..trimmed.len() - 1];
            return Cell::new_text(text);
        }

        match trimmed {
            "TRUE" | "true" => return Cell::new_bool(true),
            "FALSE" | "false" => return Cell::new_bool(false),
            _ => {}
        }

        if let Ok(n) = trimmed.parse::<f64>() {
            return Cell::new_number(n);
        }

        Cell::new_text(trimmed)
    }

    /// Build a plain value cell from a JSON value (objects and arrays become JSON text).
    pub fn from_json(value: &serde_json::Value) -> Cell {
        match value {
            serde_json::Value::Null => Cell::new_empty(),
            serde_json::Value::Bool(b) => Cell::new_bool(*b),
            serde_json::Value::Number(n) => Cell::new_number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Cell::new_text(s),
            other => Cell::new_text(&other.to_string()),
        }
    }

    pub fn is_script(&self) -> bool {
        matches!(self.contents, CellType::Script(_))
    }

    /// Literal value of a non-formula cell. Formula cells yield unit.
    pub fn literal_value(&self) -> Dynamic {
        match &self.contents {
            CellType::Empty | CellType::Script(_) => Dynamic::UNIT,
            CellType::Text(s) => Dynamic::from(s.clone()),
            CellType::Number(n) => Dynamic::from(*n),
            CellType::Bool(b) => Dynamic::from(*b),
        }
    }
}

/// Thread-safe sparse grid storage (DashMap is internally sharded, clones of the Arc are cheap).
pub type Grid = Arc<DashMap<CellRef, Cell>>;

/// Thread-safe cache for computed cell values.
/// Maps formula cell positions to their evaluated Dynamic values so that
/// references read the value produced in the current (or last) step.
pub type ValueCache = Arc<DashMap<CellRef, Dynamic>>;

/// Resolve the current value of a cell: a computed formula value if present,
/// otherwise the literal contents.
pub fn cell_value(grid: &Grid, value_cache: &ValueCache, cell_ref: &CellRef) -> Dynamic {
    if let Some(cached) = value_cache.get(cell_ref) {
        return cached.clone();
    }
    match grid.get(cell_ref) {
        Some(cell) => cell.literal_value(),
        None => Dynamic::UNIT,
    }
}
