//! Built-ins that need a sheet: message access, streams, sleep, aggregation.
//!
//! Side effects (store mutations, dispatches, cell writes, window updates)
//! happen only while the owning sheet is processing a step. Evaluating a
//! formula at entry time sees the same functions but changes nothing.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use streamsheets_engine::aggregate::{AggregationMethod, DEFAULT_PERIOD_SECS, Sample, WindowOptions};
use streamsheets_engine::builtins::{
    FunctionHandler, FunctionId, PureFunctions, bool_arg, int_arg, into_dynamic, json_arg,
    number_arg, range_arg, text_arg,
};
use streamsheets_engine::codec::{self, Matrix, RangeCodec};
use streamsheets_engine::datetime;
use streamsheets_engine::engine::value::{as_text, from_json, is_truthy, json_number, to_json};
use streamsheets_engine::engine::{Cell, CellRef, Dynamic, ErrorCode, Grid, RangeRef, ValueCache};
use streamsheets_engine::table::{Push, TableUpdate};
use tracing::{debug, warn};

use super::sheet::SheetRuntime;
use crate::clock::Clock;
use crate::endpoint::EndpointRegistry;
use crate::message::{Message, MessageHub, MessagePath, Section, StoreRef, set_at, value_at};
use crate::request::RequestState;
use crate::sleep::SleepOutcome;

type Outcome = Result<Dynamic, ErrorCode>;

/// How READ and WRITE coerce a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueType {
    Number,
    String,
    Boolean,
    Json,
}

impl ValueType {
    fn parse(name: &str) -> Option<ValueType> {
        match name.trim().to_ascii_lowercase().as_str() {
            "number" => Some(ValueType::Number),
            "string" => Some(ValueType::String),
            "boolean" | "bool" => Some(ValueType::Boolean),
            "json" => Some(ValueType::Json),
            _ => None,
        }
    }

    fn coerce(self, value: Value) -> Result<Value, ErrorCode> {
        match (self, value) {
            (ValueType::Json, Value::String(text)) => {
                serde_json::from_str(&text).map_err(|_| ErrorCode::Value)
            }
            (ValueType::Json, value) => Ok(value),
            (ValueType::Number, Value::Bool(b)) => Ok(Value::from(b as i64)),
            (ValueType::Number, Value::String(text)) => text
                .trim()
                .parse::<f64>()
                .map(streamsheets_engine::engine::value::number_value)
                .map_err(|_| ErrorCode::Value),
            (ValueType::Number, value @ Value::Number(_)) => Ok(value),
            (ValueType::Number, _) => Err(ErrorCode::Value),
            (ValueType::String, Value::String(text)) => Ok(Value::String(text)),
            (ValueType::String, Value::Null) => Ok(Value::String(String::new())),
            (ValueType::String, value) => Ok(Value::String(as_text(&from_json(&value)))),
            (ValueType::Boolean, value) => Ok(Value::Bool(is_truthy(&from_json(&value)))),
        }
    }
}

fn type_arg(args: &[Dynamic], index: usize) -> Result<Option<ValueType>, ErrorCode> {
    match text_arg(args, index).filter(|t| !t.is_empty()) {
        Some(name) => ValueType::parse(&name).map(Some).ok_or(ErrorCode::Value),
        None => Ok(None),
    }
}

fn path_arg(args: &[Dynamic], index: usize) -> Result<MessagePath, ErrorCode> {
    let text = text_arg(args, index).ok_or(ErrorCode::Value)?;
    MessagePath::parse(&text).ok_or(ErrorCode::Value)
}

/// Value inside a message addressed by a path section and keys.
fn message_value(message: &Message, section: Section, keys: &[String]) -> Option<Value> {
    match section {
        Section::Message => Some(message.to_json()),
        Section::Data => value_at(&message.data, keys).cloned(),
        Section::Metadata => {
            let metadata = Value::Object(message.metadata.clone());
            value_at(&metadata, keys).cloned()
        }
    }
}

pub struct SheetFunctions {
    sheet: String,
    pure: PureFunctions,
    grid: Grid,
    runtime: Arc<Mutex<SheetRuntime>>,
    hub: MessageHub,
    endpoints: Arc<EndpointRegistry>,
    clock: Arc<dyn Clock>,
}

impl SheetFunctions {
    pub fn new(
        sheet: &str,
        grid: Grid,
        value_cache: ValueCache,
        runtime: Arc<Mutex<SheetRuntime>>,
        hub: MessageHub,
        endpoints: Arc<EndpointRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SheetFunctions {
            sheet: sheet.to_string(),
            pure: PureFunctions::new(grid.clone(), value_cache),
            grid,
            runtime,
            hub,
            endpoints,
            clock,
        }
    }

    /// The cell under evaluation, if the sheet is processing a step.
    fn processing_cell(&self) -> Option<CellRef> {
        let runtime = self.runtime.lock();
        runtime.processing.then(|| runtime.current_cell.clone()).flatten()
    }

    fn current_cell(&self) -> Option<CellRef> {
        self.runtime.lock().current_cell.clone()
    }

    /// Write plain values into the grid. Formula cells are left alone.
    fn write_cells(&self, writes: Vec<(CellRef, Value)>) {
        for (cell, value) in writes {
            if self.grid.get(&cell).is_some_and(|c| c.is_script()) {
                continue;
            }
            if value.is_null() {
                self.grid.remove(&cell);
            } else {
                self.grid.insert(cell, Cell::from_json(&value));
            }
        }
    }

    fn sheet_arg(&self, args: &[Dynamic], index: usize) -> Result<String, ErrorCode> {
        let name = text_arg(args, index).filter(|s| !s.is_empty());
        let name = name.unwrap_or_else(|| self.sheet.clone());
        if self.hub.inbox(&name).is_none() {
            return Err(ErrorCode::Name);
        }
        Ok(name)
    }

    fn keys_from(args: &[Dynamic], start: usize) -> Vec<String> {
        args.iter().skip(start).map(as_text).collect()
    }

    fn inbox_path(&self, args: &[Dynamic], section: Section) -> Outcome {
        let sheet = self.sheet_arg(args, 0)?;
        let id = text_arg(args, 1).unwrap_or_default();
        let mut keys = Self::keys_from(args, 2);
        if section == Section::Data && id.is_empty() && sheet == self.sheet {
            if let Some(prefix) = self.runtime.lock().loop_prefix.clone() {
                keys = prefix.into_iter().chain(keys).collect();
            }
        }
        Ok(Dynamic::from(
            MessagePath::new(StoreRef::Inbox(sheet), id, section, keys).to_string(),
        ))
    }

    fn outbox_path(&self, args: &[Dynamic], section: Section) -> Outcome {
        let id = text_arg(args, 0).unwrap_or_default();
        let keys = Self::keys_from(args, 1);
        Ok(Dynamic::from(
            MessagePath::new(StoreRef::Outbox, id, section, keys).to_string(),
        ))
    }

    /// Look up the value a path addresses.
    fn resolve(&self, path: &MessagePath) -> Result<Value, ErrorCode> {
        let found = match &path.store {
            StoreRef::Outbox => {
                let outbox = self.hub.outbox().lock();
                let message = outbox.peek(path.message_id()).ok_or(ErrorCode::NoMsg)?;
                message_value(message, path.section, &path.keys)
            }
            StoreRef::Inbox(sheet) => {
                let inbox = self.hub.inbox(sheet).ok_or(ErrorCode::Name)?;
                let inbox = inbox.lock();
                let message = inbox.peek(path.message_id()).ok_or(ErrorCode::NoMsg)?;
                message_value(message, path.section, &path.keys)
            }
        };
        found.ok_or(ErrorCode::Na)
    }

    fn read(&self, args: &[Dynamic]) -> Outcome {
        let path = path_arg(args, 0)?;
        let target = range_arg(args, 1)?;
        let value_type = type_arg(args, 2)?;
        let mut value = self.resolve(&path)?;
        if let Some(value_type) = value_type {
            value = value_type.coerce(value)?;
        }
        let Some(target) = target else {
            return Ok(from_json(&value));
        };
        if self.processing_cell().is_some() {
            let matrix = match &value {
                Value::Object(_) | Value::Array(_) => codec::decode(RangeCodec::Json, &value, true)?,
                scalar => vec![vec![scalar.clone()]],
            };
            self.write_cells(codec::spill(&target, &matrix));
        }
        Ok(Dynamic::from(path.leaf_name().to_string()))
    }

    fn write(&self, args: &[Dynamic]) -> Outcome {
        let path = path_arg(args, 0)?;
        if path.store != StoreRef::Outbox {
            return Err(ErrorCode::Value);
        }
        if path.section == Section::Metadata && path.keys.first().is_some_and(|k| k == "id") {
            return Err(ErrorCode::Value);
        }
        let mut value = to_json(&args[1]);
        if let Some(value_type) = type_arg(args, 2)? {
            value = value_type.coerce(value)?;
        }
        if self.processing_cell().is_none() {
            return Ok(Dynamic::from(path.leaf_name().to_string()));
        }

        let mut outbox = self.hub.outbox().lock();
        if outbox.peek(path.message_id()).is_none() {
            let message = match path.message_id() {
                Some(id) => Message::with_id(id, Value::Object(Default::default())),
                None => Message::new(Value::Object(Default::default())),
            };
            outbox.put(message);
        }
        let message = outbox.peek_mut(path.message_id()).ok_or(ErrorCode::NoMsg)?;
        match path.section {
            Section::Message | Section::Data => set_at(&mut message.data, &path.keys, value),
            Section::Metadata => {
                let mut metadata = Value::Object(std::mem::take(&mut message.metadata));
                set_at(&mut metadata, &path.keys, value);
                if let Value::Object(map) = metadata {
                    message.metadata = map;
                }
            }
        }
        Ok(Dynamic::from(path.leaf_name().to_string()))
    }

    fn delete(&self, args: &[Dynamic]) -> Outcome {
        let path = path_arg(args, 0)?;
        if self.processing_cell().is_none() {
            return Ok(Dynamic::from(true));
        }
        let id = path.message_id();
        match (&path.store, path.section) {
            (StoreRef::Outbox, Section::Message) => {
                let mut outbox = self.hub.outbox().lock();
                let id = match id {
                    Some(id) => Some(id.to_string()),
                    None => outbox.peek(None).map(|m| m.id.clone()),
                };
                if let Some(id) = id {
                    outbox.delete(&id);
                }
            }
            (StoreRef::Outbox, section) => {
                self.hub
                    .outbox()
                    .lock()
                    .delete_subtree(id, section, &path.keys)?;
            }
            (StoreRef::Inbox(sheet), section) => {
                let inbox = self.hub.inbox(sheet).ok_or(ErrorCode::Name)?;
                let mut inbox = inbox.lock();
                if section == Section::Message {
                    inbox.delete(id);
                } else {
                    inbox.delete_subtree(id, section, &path.keys)?;
                }
            }
        }
        Ok(Dynamic::from(true))
    }

    /// Message to send for a PUBLISH or REQUEST payload argument.
    fn payload_message(&self, payload: &Dynamic) -> Result<Message, ErrorCode> {
        if payload.is_map() || payload.is_array() {
            return Ok(Message::new(to_json(payload)));
        }
        if !payload.is_string() {
            return Err(ErrorCode::InvalidParam);
        }
        let text = as_text(payload);
        let Some(path) = MessagePath::parse(&text) else {
            return Ok(Message::new(Value::String(text)));
        };
        if path.section != Section::Message {
            return Ok(Message::new(self.resolve(&path)?));
        }
        let message = match &path.store {
            StoreRef::Outbox => self.hub.outbox().lock().peek(path.message_id()).cloned(),
            StoreRef::Inbox(sheet) => {
                let inbox = self.hub.inbox(sheet).ok_or(ErrorCode::Name)?;
                let message = inbox.lock().peek(path.message_id()).cloned();
                message
            }
        };
        message.ok_or(ErrorCode::NoMsg)
    }

    fn publish(&self, args: &[Dynamic]) -> Outcome {
        let name = text_arg(args, 0).unwrap_or_default();
        let endpoint = self.endpoints.get(&name).ok_or(ErrorCode::NoProducer)?;
        let message = self.payload_message(&args[1])?;
        let topic = text_arg(args, 2).filter(|t| !t.is_empty());
        if self.processing_cell().is_none() {
            return Ok(Dynamic::from(true));
        }
        endpoint.publish(&message, topic.as_deref()).map_err(|err| {
            warn!(endpoint = %name, error = %err, "publish failed");
            ErrorCode::Err
        })?;
        debug!(endpoint = %name, id = %message.id, "published");
        Ok(Dynamic::from(true))
    }

    fn request(&self, args: &[Dynamic]) -> Outcome {
        let name = text_arg(args, 0).unwrap_or_default();
        let endpoint = self.endpoints.get(&name).ok_or(ErrorCode::NoProducer)?;

        // An outstanding request keeps its id whatever the arguments resolve to now.
        let processing = self.processing_cell();
        if let Some(cell) = self.current_cell() {
            let runtime = self.runtime.lock();
            let existing = match processing {
                Some(_) => runtime.requests.reusable_id(&cell),
                None => runtime.requests.for_cell(&cell).map(|r| r.id.as_str()),
            };
            if let Some(id) = existing {
                return Ok(Dynamic::from(id.to_string()));
            }
        }

        let destination = match text_arg(args, 2).filter(|t| !t.is_empty()) {
            Some(text) => {
                let store = MessagePath::parse(&text)
                    .map(|p| p.store)
                    .ok_or(ErrorCode::InvalidParam)?;
                if let StoreRef::Inbox(sheet) = &store {
                    if self.hub.inbox(sheet).is_none() {
                        return Err(ErrorCode::InvalidParam);
                    }
                }
                store
            }
            None => StoreRef::Inbox(self.sheet.clone()),
        };
        let timeout_ms = number_arg(args, 3)?.map(|ms| ms as i64);
        let message = self.payload_message(&args[1])?;

        let Some(cell) = processing else {
            return Ok(Dynamic::from(String::new()));
        };
        let receiver = endpoint.request(message);
        let now = self.clock.now_ms();
        let id = self
            .runtime
            .lock()
            .requests
            .issue(&cell, destination, receiver, now, timeout_ms);
        Ok(Dynamic::from(id))
    }

    fn request_info(&self, args: &[Dynamic]) -> Outcome {
        let id = text_arg(args, 0).unwrap_or_default();
        match self.runtime.lock().requests.info(&id) {
            Some(RequestState::Pending) => Ok(Dynamic::from(false)),
            Some(RequestState::Resolved) => Ok(Dynamic::from(true)),
            Some(RequestState::Rejected(_)) => Err(ErrorCode::Err),
            None => Err(ErrorCode::Na),
        }
    }

    fn sleep(&self, args: &[Dynamic]) -> Outcome {
        let seconds = number_arg(args, 0)?.ok_or(ErrorCode::Value)?;
        if let Some(cell) = self.processing_cell() {
            let now = self.clock.now_ms();
            let mut runtime = self.runtime.lock();
            if runtime.sleeps.sleep(&cell, seconds, now) == SleepOutcome::Suspend {
                runtime.suspended_at = Some(cell);
            }
        }
        Ok(Dynamic::from(true))
    }

    fn window_options(args: &[Dynamic]) -> Result<WindowOptions, ErrorCode> {
        let defaults = WindowOptions::default();
        let period_secs = number_arg(args, 1)?.unwrap_or(DEFAULT_PERIOD_SECS);
        let method = match int_arg(args, 2)? {
            Some(code) => AggregationMethod::from_code(code).ok_or(ErrorCode::Value)?,
            None => defaults.method,
        };
        let limit = match int_arg(args, 7)? {
            Some(n) => usize::try_from(n).map_err(|_| ErrorCode::Value)?,
            None => defaults.limit,
        };
        let options = WindowOptions {
            period_ms: (period_secs * 1000.0) as i64,
            method,
            interval_ms: number_arg(args, 4)?.map(|secs| (secs * 1000.0) as i64),
            sort: bool_arg(args, 6, false),
            limit,
        };
        options.validate()?;
        Ok(options)
    }

    fn time_aggregate(&self, args: &[Dynamic]) -> Outcome {
        let options = Self::window_options(args)?;
        let target = range_arg(args, 5)?;
        let Some(cell) = self.processing_cell() else {
            let cell = self.current_cell().ok_or(ErrorCode::Na)?;
            let runtime = self.runtime.lock();
            return match runtime.aggregators.get(&cell) {
                Some(window) => window.current(&options).map(|v| from_json(&v)),
                None => Err(ErrorCode::Na),
            };
        };
        let timestamp_ms = match number_arg(args, 3)? {
            Some(serial) => datetime::serial_to_ms(serial),
            None => self.clock.now_ms(),
        };
        let sample = Sample {
            timestamp_ms,
            value: to_json(&args[0]),
        };

        let (result, rows) = {
            let mut runtime = self.runtime.lock();
            let window = runtime.aggregators.entry(cell).or_default();
            let result = window.push(sample, &options);
            let rows = target.as_ref().map(|target| window_rows(window.samples(), target, options.sort));
            (result, rows)
        };
        if let (Some(target), Some(rows)) = (target, rows) {
            self.write_cells(codec::spill(&target, &rows));
        }
        result.map(|v| from_json(&v))
    }

    fn table_update(&self, args: &[Dynamic]) -> Outcome {
        let range = range_arg(args, 0)?.ok_or(ErrorCode::Value)?;
        let aggregation = match int_arg(args, 6)? {
            Some(code) => AggregationMethod::from_code(code).ok_or(ErrorCode::Value)?,
            None => AggregationMethod::None,
        };
        let update = TableUpdate {
            value: to_json(&args[1]),
            row_key: to_json(&args[2]),
            column_key: to_json(&args[3]),
            push_row: Push::from_code(int_arg(args, 4)?.unwrap_or(0)),
            push_column: Push::from_code(int_arg(args, 5)?.unwrap_or(0)),
            aggregation,
        };
        let Some(cell) = self.processing_cell() else {
            return Ok(Dynamic::from(true));
        };
        let before = self.pure.range_values(&range);
        let mut after = before.clone();
        self.runtime
            .lock()
            .tables
            .entry(cell)
            .or_default()
            .apply(&mut after, &update)?;
        self.write_cells(changed_cells(&range, &before, &after));
        Ok(Dynamic::from(true))
    }

    fn json_range(&self, args: &[Dynamic]) -> Outcome {
        let value = json_arg(&args[0])?;
        let target = range_arg(args, 1)?.ok_or(ErrorCode::Value)?;
        let codec = match text_arg(args, 2).filter(|t| !t.is_empty()) {
            Some(name) => RangeCodec::parse(&name).ok_or(ErrorCode::Value)?,
            None => RangeCodec::Json,
        };
        let horizontal = bool_arg(args, 3, true);
        let matrix = codec::decode(codec, &value, horizontal)?;
        if self.processing_cell().is_some() {
            self.write_cells(codec::spill(&target, &matrix));
        }
        Ok(Dynamic::from(true))
    }
}

/// Window rows to spill: `[serial, value]`, or just the value for a one-column target.
fn window_rows<'a>(
    samples: impl DoubleEndedIterator<Item = &'a Sample>,
    target: &RangeRef,
    newest_first: bool,
) -> Matrix {
    let row = |s: &Sample| {
        if target.width() == 1 {
            vec![s.value.clone()]
        } else {
            let serial = datetime::ms_to_serial(s.timestamp_ms);
            vec![
                serde_json::Number::from_f64(serial)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                s.value.clone(),
            ]
        }
    };
    if newest_first {
        samples.rev().map(row).collect()
    } else {
        samples.map(row).collect()
    }
}

/// Cells whose value changed, excluding the header corner.
fn changed_cells(range: &RangeRef, before: &Matrix, after: &Matrix) -> Vec<(CellRef, Value)> {
    let mut writes = Vec::new();
    for (r, line) in after.iter().enumerate() {
        for (c, value) in line.iter().enumerate() {
            if (r, c) == (0, 0) {
                continue;
            }
            let old = before.get(r).and_then(|l| l.get(c));
            let same = match (old, value) {
                (Some(a), b) if a == b => true,
                (Some(a), b) => json_number(a).is_some() && json_number(a) == json_number(b),
                (None, _) => false,
            };
            if !same {
                if let Some(cell) = range.cell_at(c, r) {
                    writes.push((cell, value.clone()));
                }
            }
        }
    }
    writes
}

impl FunctionHandler for SheetFunctions {
    fn call(&self, id: FunctionId, args: &[Dynamic]) -> Dynamic {
        let result = match id {
            FunctionId::Inbox => self.inbox_path(args, Section::Message),
            FunctionId::InboxData => self.inbox_path(args, Section::Data),
            FunctionId::InboxMetadata => self.inbox_path(args, Section::Metadata),
            FunctionId::Outbox => self.outbox_path(args, Section::Message),
            FunctionId::OutboxData => self.outbox_path(args, Section::Data),
            FunctionId::OutboxMetadata => self.outbox_path(args, Section::Metadata),
            FunctionId::Read => self.read(args),
            FunctionId::Write => self.write(args),
            FunctionId::Delete => self.delete(args),
            FunctionId::LoopIndex => Ok(Dynamic::from(self.runtime.lock().loop_index as i64)),
            FunctionId::GetCycle => Ok(Dynamic::from(self.runtime.lock().cycle as i64)),
            FunctionId::Return => {
                let retry = bool_arg(args, 0, false);
                if self.processing_cell().is_some() {
                    self.runtime.lock().return_requested = Some(retry);
                }
                Ok(Dynamic::from(true))
            }
            FunctionId::Publish => self.publish(args),
            FunctionId::Request => self.request(args),
            FunctionId::RequestInfo => self.request_info(args),
            FunctionId::Sleep => self.sleep(args),
            FunctionId::TimeAggregate => self.time_aggregate(args),
            FunctionId::TableUpdate => self.table_update(args),
            FunctionId::JsonRange => self.json_range(args),
            FunctionId::Json
            | FunctionId::Array
            | FunctionId::Dictionary
            | FunctionId::Range
            | FunctionId::JsonValue
            | FunctionId::Date
            | FunctionId::DateValue
            | FunctionId::JsonTimeToExcel
            | FunctionId::ExcelToJsonTime => return self.pure.call(id, args),
        };
        into_dynamic(result)
    }
}
