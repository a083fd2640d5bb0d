//! Rhai engine creation and formula evaluation.
//!
//! Creates the Rhai scripting engine with all built-in functions registered,
//! and evaluates formulas with optional user-defined custom functions loaded
//! from external files. Evaluation never fails: Rhai errors become
//! [`ErrorCode`] values.

use std::sync::Arc;

use rhai::{Engine, EvalAltResult};

use super::{CellRef, Dynamic, ErrorCode, Grid, ValueCache, preprocess_script_with_context};
use crate::builtins::{FunctionHandler, PureFunctions, lookup};

/// Create a Rhai engine with built-ins that need no sheet context.
pub fn create_engine(grid: Grid, value_cache: ValueCache) -> Engine {
    let handler = Arc::new(PureFunctions::new(grid.clone(), value_cache.clone()));
    create_engine_with_handler(grid, value_cache, handler)
}

/// Create a Rhai engine whose built-ins are served by `handler`.
pub fn create_engine_with_handler(
    grid: Grid,
    value_cache: ValueCache,
    handler: Arc<dyn FunctionHandler>,
) -> Engine {
    let mut engine = Engine::new();
    crate::builtins::register_builtins(&mut engine, grid, value_cache, handler);
    engine
}

/// Evaluate a formula with custom functions provided as script text.
/// The scripts are concatenated so custom functions can call registered ones.
pub fn eval_with_functions_script(
    engine: &Engine,
    formula: &str,
    custom_script: Option<&str>,
) -> Result<Dynamic, Box<EvalAltResult>> {
    if let Some(script) = custom_script {
        let combined = format!("{}\n{}", script, formula);
        engine.eval(&combined)
    } else {
        engine.eval(formula)
    }
}

/// Preprocess and evaluate the formula of `cell` (stored without the leading '=').
pub fn evaluate_formula(
    engine: &Engine,
    formula: &str,
    cell: &CellRef,
    custom_script: Option<&str>,
) -> Dynamic {
    let processed = preprocess_script_with_context(formula, Some(cell));
    match eval_with_functions_script(engine, &processed, custom_script) {
        Ok(value) => value,
        Err(err) => Dynamic::from(error_code_for(&err)),
    }
}

/// Map a Rhai evaluation failure to a formula error.
pub fn error_code_for(err: &EvalAltResult) -> ErrorCode {
    match err {
        EvalAltResult::ErrorFunctionNotFound(signature, _) => {
            let name = signature.split('(').next().unwrap_or_default().trim();
            if lookup(name).is_some() {
                ErrorCode::Args
            } else {
                ErrorCode::Name
            }
        }
        EvalAltResult::ErrorVariableNotFound(..) => ErrorCode::Name,
        EvalAltResult::ErrorRuntime(value, _) => {
            ErrorCode::from_dynamic(value).unwrap_or(ErrorCode::Value)
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => error_code_for(inner),
        _ => ErrorCode::Value,
    }
}
