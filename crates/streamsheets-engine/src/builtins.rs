//! Built-in function table and Rhai registration.
//!
//! Conventions:
//! - Sheet-facing names are ALL CAPS (`INBOXDATA`, `TIMEAGGREGATE`).
//! - Every built-in goes through one static table ([`FUNCTIONS`]) holding its
//!   arity bounds. Rhai only sees variadic `Dynamic` shims; the shim checks the
//!   arity, short-circuits error arguments, and hands off to a
//!   [`FunctionHandler`].
//! - `VALUE(col, row)` and `REF(c1, r1, c2, r2)` are internal: the formula
//!   preprocessor emits them for `A1`, `@A1` and `A1:C3`.
//! - If you add a built-in, add a [`FunctionId`] variant, a table row, and an
//!   arm in every handler.

use std::sync::Arc;

use rhai::{Dynamic, Engine};
use serde_json::Value;

use crate::codec::{self, Matrix, RangeCodec};
use crate::datetime;
use crate::engine::value::{as_number, as_text, from_json, is_truthy, to_json};
use crate::engine::{CellRef, ErrorCode, Grid, RangeRef, ValueCache, cell_value};

/// Largest argument count a built-in can be called with.
pub const MAX_ARITY: usize = 8;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum FunctionId {
    Inbox,
    InboxData,
    InboxMetadata,
    Outbox,
    OutboxData,
    OutboxMetadata,
    Read,
    Write,
    Delete,
    LoopIndex,
    GetCycle,
    Return,
    Publish,
    Request,
    RequestInfo,
    Sleep,
    TimeAggregate,
    TableUpdate,
    Json,
    Array,
    Dictionary,
    Range,
    JsonRange,
    JsonValue,
    Date,
    DateValue,
    JsonTimeToExcel,
    ExcelToJsonTime,
}

pub struct FunctionDef {
    pub id: FunctionId,
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub description: &'static str,
}

const fn def(
    id: FunctionId,
    name: &'static str,
    min_args: usize,
    max_args: usize,
    description: &'static str,
) -> FunctionDef {
    FunctionDef {
        id,
        name,
        min_args,
        max_args,
        description,
    }
}

pub const FUNCTIONS: &[FunctionDef] = &[
    def(FunctionId::Inbox, "INBOX", 0, 2, "Path to a message in a sheet's inbox"),
    def(FunctionId::InboxData, "INBOXDATA", 0, MAX_ARITY, "Path into an inbox message's data"),
    def(FunctionId::InboxMetadata, "INBOXMETADATA", 0, MAX_ARITY, "Path into an inbox message's metadata"),
    def(FunctionId::Outbox, "OUTBOX", 0, 1, "Path to a message in the outbox"),
    def(FunctionId::OutboxData, "OUTBOXDATA", 0, MAX_ARITY, "Path into an outbox message's data"),
    def(FunctionId::OutboxMetadata, "OUTBOXMETADATA", 0, MAX_ARITY, "Path into an outbox message's metadata"),
    def(FunctionId::Read, "READ", 1, 3, "Read the value at a message path"),
    def(FunctionId::Write, "WRITE", 2, 3, "Write a value into an outbox message"),
    def(FunctionId::Delete, "DELETE", 1, 1, "Delete a message or a message subtree"),
    def(FunctionId::LoopIndex, "LOOPINDEX", 0, 0, "Index of the current loop element"),
    def(FunctionId::GetCycle, "GETCYCLE", 0, 0, "Number of steps the sheet has processed"),
    def(FunctionId::Return, "RETURN", 0, 1, "Stop the step, optionally replaying it"),
    def(FunctionId::Publish, "PUBLISH", 2, 3, "Send a message to a stream endpoint"),
    def(FunctionId::Request, "REQUEST", 2, 4, "Issue a request and route its response"),
    def(FunctionId::RequestInfo, "REQUESTINFO", 1, 1, "State of a request issued by REQUEST"),
    def(FunctionId::Sleep, "SLEEP", 1, 1, "Suspend the sheet for a number of seconds"),
    def(FunctionId::TimeAggregate, "TIMEAGGREGATE", 1, 8, "Aggregate values over a time window"),
    def(FunctionId::TableUpdate, "TABLE_UPDATE", 4, 7, "Update a keyed table cell"),
    def(FunctionId::Json, "JSON", 1, 2, "Encode a key/value range as JSON"),
    def(FunctionId::Array, "ARRAY", 1, 2, "Encode a range as a flat list"),
    def(FunctionId::Dictionary, "DICTIONARY", 1, 2, "Encode a key row and value rows as an object"),
    def(FunctionId::Range, "RANGE", 1, 2, "Encode a range as a matrix"),
    def(FunctionId::JsonRange, "JSON_RANGE", 2, 4, "Decode JSON into a target range"),
    def(FunctionId::JsonValue, "JSON_VALUE", 1, MAX_ARITY, "Value at a key path in a JSON value"),
    def(FunctionId::Date, "DATE", 3, 3, "Date serial from month, day, year"),
    def(FunctionId::DateValue, "DATEVALUE", 1, 1, "Date serial from text"),
    def(FunctionId::JsonTimeToExcel, "JSONTIME2EXCEL", 1, 1, "Date serial from an ISO-8601 timestamp"),
    def(FunctionId::ExcelToJsonTime, "EXCEL2JSONTIME", 1, 1, "ISO-8601 timestamp from a date serial"),
];

pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    FUNCTIONS.iter().find(|f| f.name == name)
}

/// Executes built-ins once arity and error arguments have been checked.
pub trait FunctionHandler: Send + Sync {
    fn call(&self, id: FunctionId, args: &[Dynamic]) -> Dynamic;
}

type Dispatch = Arc<dyn Fn(&[Dynamic]) -> Dynamic + Send + Sync>;

macro_rules! register_arities {
    ($engine:expr, $name:expr, $dispatch:expr; $( ( $($arg:ident),* ) )+) => {
        $({
            let dispatch = Arc::clone(&$dispatch);
            $engine.register_fn($name, move |$($arg: Dynamic),*| -> Dynamic {
                dispatch(&[$($arg),*])
            });
        })+
    };
}

const OPERATORS: &[&str] = &[
    "+", "-", "*", "/", "%", "**", "==", "!=", "<", ">", "<=", ">=", "&", "|",
];

pub fn register_builtins(
    engine: &mut Engine,
    grid: Grid,
    value_cache: ValueCache,
    handler: Arc<dyn FunctionHandler>,
) {
    engine.register_type_with_name::<ErrorCode>("ErrorCode");
    engine.register_fn("to_string", |code: &mut ErrorCode| code.to_string());
    engine.register_fn("to_debug", |code: &mut ErrorCode| code.to_string());
    engine.register_type_with_name::<RangeRef>("RangeRef");
    engine.register_fn("to_string", |range: &mut RangeRef| range.to_string());
    engine.register_fn("to_debug", |range: &mut RangeRef| range.to_string());

    // An error operand wins over anything it is combined with.
    for op in OPERATORS {
        engine.register_fn(*op, |code: ErrorCode, _: ErrorCode| code);
        engine.register_fn(*op, |code: ErrorCode, _: Dynamic| code);
        engine.register_fn(*op, |_: Dynamic, code: ErrorCode| code);
    }
    engine.register_fn("-", |code: ErrorCode| code);

    // VALUE(col, row): current value of a cell
    engine.register_fn("VALUE", move |col: i64, row: i64| -> Dynamic {
        match (usize::try_from(col), usize::try_from(row)) {
            (Ok(col), Ok(row)) => cell_value(&grid, &value_cache, &CellRef::new(col, row)),
            _ => Dynamic::from(ErrorCode::Name),
        }
    });

    // REF(c1, r1, c2, r2): a range (or single-cell) reference
    engine.register_fn("REF", |c1: i64, r1: i64, c2: i64, r2: i64| -> Dynamic {
        let corner = |c: i64, r: i64| Some(CellRef::new(usize::try_from(c).ok()?, usize::try_from(r).ok()?));
        match (corner(c1, r1), corner(c2, r2)) {
            (Some(a), Some(b)) => Dynamic::from(RangeRef::new(a, b)),
            _ => Dynamic::from(ErrorCode::Name),
        }
    });

    for function in FUNCTIONS {
        let handler = Arc::clone(&handler);
        let dispatch: Dispatch = Arc::new(move |args: &[Dynamic]| {
            if args.len() < function.min_args || args.len() > function.max_args {
                return Dynamic::from(ErrorCode::Args);
            }
            if let Some(code) = ErrorCode::first_in(args) {
                return Dynamic::from(code);
            }
            handler.call(function.id, args)
        });
        register_arities!(engine, function.name, dispatch;
            ()
            (a)
            (a, b)
            (a, b, c)
            (a, b, c, d)
            (a, b, c, d, e)
            (a, b, c, d, e, f)
            (a, b, c, d, e, f, g)
            (a, b, c, d, e, f, g, h)
        );
    }
}

/// Collapse a handler result into a cell value.
pub fn into_dynamic(result: Result<Dynamic, ErrorCode>) -> Dynamic {
    result.unwrap_or_else(Dynamic::from)
}

fn is_missing(value: &Dynamic) -> bool {
    value.is_unit() || (value.is_string() && as_text(value).is_empty())
}

/// Optional numeric argument (missing or empty yields `None`).
pub fn number_arg(args: &[Dynamic], index: usize) -> Result<Option<f64>, ErrorCode> {
    match args.get(index) {
        None => Ok(None),
        Some(value) if is_missing(value) => Ok(None),
        Some(value) => as_number(value)
            .or_else(|| as_text(value).trim().parse().ok())
            .map(Some)
            .ok_or(ErrorCode::Value),
    }
}

/// Optional integer argument.
pub fn int_arg(args: &[Dynamic], index: usize) -> Result<Option<i64>, ErrorCode> {
    Ok(number_arg(args, index)?.map(|n| n.trunc() as i64))
}

/// Optional text argument (numbers and booleans are rendered).
pub fn text_arg(args: &[Dynamic], index: usize) -> Option<String> {
    args.get(index).filter(|v| !v.is_unit()).map(as_text)
}

/// Optional boolean argument.
pub fn bool_arg(args: &[Dynamic], index: usize, default: bool) -> bool {
    match args.get(index) {
        Some(value) if !is_missing(value) => is_truthy(value),
        _ => default,
    }
}

/// Range argument: a `REF(...)` value or a reference string like "A1:B3".
pub fn range_arg(args: &[Dynamic], index: usize) -> Result<Option<RangeRef>, ErrorCode> {
    match args.get(index) {
        None => Ok(None),
        Some(value) if value.is_unit() => Ok(None),
        Some(value) => {
            if let Some(range) = value.clone().try_cast::<RangeRef>() {
                return Ok(Some(range));
            }
            if value.is_string() {
                return RangeRef::parse(&as_text(value)).map(Some).ok_or(ErrorCode::Value);
            }
            Err(ErrorCode::Value)
        }
    }
}

/// JSON argument: Rhai maps/arrays, or text holding JSON.
pub fn json_arg(value: &Dynamic) -> Result<Value, ErrorCode> {
    if value.is_string() {
        return serde_json::from_str(&as_text(value)).map_err(|_| ErrorCode::Value);
    }
    Ok(to_json(value))
}

/// Side-effect free built-ins: codec encoders and date conversions.
///
/// Used as the handler for plain evaluation, and by richer handlers for the
/// functions that need no sheet context.
#[derive(Clone)]
pub struct PureFunctions {
    grid: Grid,
    value_cache: ValueCache,
}

impl PureFunctions {
    pub fn new(grid: Grid, value_cache: ValueCache) -> Self {
        PureFunctions { grid, value_cache }
    }

    /// Current values of a range, row-major.
    pub fn range_values(&self, range: &RangeRef) -> Matrix {
        (range.start.row..=range.end.row)
            .map(|row| {
                (range.start.col..=range.end.col)
                    .map(|col| {
                        to_json(&cell_value(
                            &self.grid,
                            &self.value_cache,
                            &CellRef::new(col, row),
                        ))
                    })
                    .collect()
            })
            .collect()
    }

    fn encode(&self, codec: RangeCodec, args: &[Dynamic]) -> Result<Dynamic, ErrorCode> {
        let range = range_arg(args, 0)?.ok_or(ErrorCode::Value)?;
        let horizontal = bool_arg(args, 1, true);
        let cells = self.range_values(&range);
        Ok(from_json(&codec::encode(codec, &cells, horizontal)))
    }

    fn json_value(&self, args: &[Dynamic]) -> Result<Dynamic, ErrorCode> {
        let mut current = json_arg(&args[0])?;
        for key in &args[1..] {
            let key = as_text(key);
            current = match current {
                Value::Object(mut map) => map.remove(&key),
                Value::Array(mut items) => key
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i < items.len())
                    .map(|i| items.swap_remove(i)),
                _ => None,
            }
            .ok_or(ErrorCode::Na)?;
        }
        Ok(from_json(&current))
    }

    fn dates(&self, id: FunctionId, args: &[Dynamic]) -> Result<Dynamic, ErrorCode> {
        let serial = match id {
            FunctionId::Date => {
                let part = |i| int_arg(args, i).and_then(|n| n.ok_or(ErrorCode::Value));
                datetime::date(part(0)?, part(1)?, part(2)?)?
            }
            FunctionId::DateValue => datetime::date_value(&text_arg(args, 0).unwrap_or_default())?,
            FunctionId::JsonTimeToExcel => {
                datetime::json_time_to_serial(&text_arg(args, 0).unwrap_or_default())?
            }
            FunctionId::ExcelToJsonTime => {
                let serial = number_arg(args, 0)?.ok_or(ErrorCode::Value)?;
                return datetime::serial_to_json_time(serial).map(Dynamic::from);
            }
            _ => return Err(ErrorCode::NoMachine),
        };
        Ok(Dynamic::from(serial))
    }
}

impl FunctionHandler for PureFunctions {
    fn call(&self, id: FunctionId, args: &[Dynamic]) -> Dynamic {
        let result = match id {
            FunctionId::Json => self.encode(RangeCodec::Json, args),
            FunctionId::Array => self.encode(RangeCodec::Array, args),
            FunctionId::Dictionary => self.encode(RangeCodec::Dictionary, args),
            FunctionId::Range => self.encode(RangeCodec::Range, args),
            FunctionId::JsonValue => self.json_value(args),
            FunctionId::Date
            | FunctionId::DateValue
            | FunctionId::JsonTimeToExcel
            | FunctionId::ExcelToJsonTime => self.dates(id, args),
            _ => Err(ErrorCode::NoMachine),
        };
        into_dynamic(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Cell;
    use dashmap::DashMap;

    fn engine_with(grid: Grid) -> Engine {
        let value_cache = ValueCache::default();
        let mut engine = Engine::new();
        let handler = Arc::new(PureFunctions::new(grid.clone(), value_cache.clone()));
        register_builtins(&mut engine, grid, value_cache, handler);
        engine
    }

    #[test]
    fn test_function_table_is_consistent() {
        for function in FUNCTIONS {
            assert!(function.min_args <= function.max_args, "{}", function.name);
            assert!(function.max_args <= MAX_ARITY, "{}", function.name);
            assert_eq!(lookup(function.name).map(|f| f.id), Some(function.id));
            assert!(!function.description.is_empty(), "{}", function.name);
        }
        assert!(lookup("SUM").is_none());
    }

    #[test]
    fn test_value_and_ref() {
        let grid: Grid = Arc::new(DashMap::new());
        grid.insert(CellRef::new(0, 0), Cell::new_number(2.0));
        let engine = engine_with(grid);
        let n: f64 = engine.eval("VALUE(0, 0) * 3.0").unwrap();
        assert_eq!(n, 6.0);
        let range: RangeRef = engine.eval("REF(2, 2, 0, 0)").unwrap();
        assert_eq!(range.to_string(), "A1:C3");
    }

    #[test]
    fn test_wrong_arity_is_args_error() {
        let engine = engine_with(Arc::new(DashMap::new()));
        let value: Dynamic = engine.eval("DATE(1, 2)").unwrap();
        assert_eq!(ErrorCode::from_dynamic(&value), Some(ErrorCode::Args));
    }

    #[test]
    fn test_errors_short_circuit_operators_and_arguments() {
        let engine = engine_with(Arc::new(DashMap::new()));
        let value: Dynamic = engine.eval("1 + DATE(1, 2)").unwrap();
        assert_eq!(ErrorCode::from_dynamic(&value), Some(ErrorCode::Args));
        let value: Dynamic = engine.eval("DATEVALUE(\"nope\") * 2").unwrap();
        assert_eq!(ErrorCode::from_dynamic(&value), Some(ErrorCode::Value));
        let value: Dynamic = engine.eval("EXCEL2JSONTIME(DATEVALUE(\"nope\"))").unwrap();
        assert_eq!(ErrorCode::from_dynamic(&value), Some(ErrorCode::Value));
    }

    #[test]
    fn test_context_functions_need_a_machine() {
        let engine = engine_with(Arc::new(DashMap::new()));
        let value: Dynamic = engine.eval("SLEEP(1)").unwrap();
        assert_eq!(ErrorCode::from_dynamic(&value), Some(ErrorCode::NoMachine));
    }

    #[test]
    fn test_date_functions() {
        let engine = engine_with(Arc::new(DashMap::new()));
        let n: f64 = engine.eval("DATE(3, 14, 2012)").unwrap();
        assert_eq!(n, 40982.0);
        let n: f64 = engine.eval("DATEVALUE(\"8/22/2011\")").unwrap();
        assert_eq!(n, 40777.0);
        let s: String = engine
            .eval("EXCEL2JSONTIME(JSONTIME2EXCEL(\"2012-04-23T18:25:43.511Z\"))")
            .unwrap();
        assert_eq!(s, "2012-04-23T18:25:43.511Z");
        let value: Dynamic = engine.eval("DATE(1, 1e15, 2000)").unwrap();
        assert_eq!(ErrorCode::from_dynamic(&value), Some(ErrorCode::Value));
    }

    #[test]
    fn test_dictionary_and_json_value() {
        let grid: Grid = Arc::new(DashMap::new());
        grid.insert(CellRef::new(0, 0), Cell::new_text("speed"));
        grid.insert(CellRef::new(1, 0), Cell::new_text("unit"));
        grid.insert(CellRef::new(0, 1), Cell::new_number(12.0));
        grid.insert(CellRef::new(1, 1), Cell::new_text("rpm"));
        let engine = engine_with(grid);
        let unit: String = engine
            .eval("JSON_VALUE(DICTIONARY(REF(0, 0, 1, 1)), \"unit\")")
            .unwrap();
        assert_eq!(unit, "rpm");
        let value: Dynamic = engine
            .eval("JSON_VALUE(DICTIONARY(REF(0, 0, 1, 1)), \"missing\")")
            .unwrap();
        assert_eq!(ErrorCode::from_dynamic(&value), Some(ErrorCode::Na));
    }
}
