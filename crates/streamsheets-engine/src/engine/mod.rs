//! Sheet engine API.
//!
//! This module provides the cell model and formula evaluation:
//!
//! - [`Cell`], [`CellType`], [`Grid`], [`ValueCache`] - Data structures for cell storage
//! - [`CellRef`], [`RangeRef`] - A1 references ↔ row/col indices
//! - [`ErrorCode`] - Formula error sentinels
//! - [`preprocess_script`] - Transform formulas for Rhai evaluation
//! - [`create_engine`] - Create a Rhai engine with built-in functions
//! - [`format_dynamic`] - Format values for display
//! - [`value`] - JSON ⇄ Rhai conversions

mod cell;
mod cell_ref;
mod error;
mod eval;
mod format;
mod preprocess;
pub mod value;

pub use cell::{Cell, CellType, Grid, ValueCache, cell_value};
pub use cell_ref::{CellRef, RangeRef};
pub use error::ErrorCode;
pub use eval::{
    create_engine, create_engine_with_handler, error_code_for, eval_with_functions_script,
    evaluate_formula,
};
pub use format::{format_dynamic, format_number};
pub use preprocess::{preprocess_script, preprocess_script_with_context};

pub use rhai::{AST, Dynamic};
