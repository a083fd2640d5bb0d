use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::Engine;
use streamsheets_engine::aggregate::TimeWindow;
use streamsheets_engine::engine::{
    Cell, CellRef, CellType, Dynamic, Grid, ValueCache, cell_value, create_engine_with_handler,
    evaluate_formula,
};
use streamsheets_engine::table::TableState;
use tracing::{debug, info, warn};

use super::cursor::LoopCursor;
use super::functions::SheetFunctions;
use super::trigger::{StepReason, Trigger, TriggerConfig};
use crate::clock::Clock;
use crate::endpoint::EndpointRegistry;
use crate::error::{Result, StreamsheetsError};
use crate::message::{Inbox, Message, MessageHub, SharedInbox};
use crate::request::RequestManager;
use crate::sleep::SleepCoordinator;

/// Sheet state shared between the step loop and the formula built-ins.
#[derive(Debug, Default)]
pub struct SheetRuntime {
    /// Set while formulas run as part of a step; built-ins only act then.
    pub processing: bool,
    pub current_cell: Option<CellRef>,
    pub requests: RequestManager,
    pub sleeps: SleepCoordinator,
    pub aggregators: HashMap<CellRef, TimeWindow>,
    pub tables: HashMap<CellRef, TableState>,
    /// Steps processed since the machine started.
    pub cycle: u64,
    pub loop_index: usize,
    /// Data keys of the current loop element.
    pub loop_prefix: Option<Vec<String>>,
    /// Sleeping cell the sheet waits on.
    pub suspended_at: Option<CellRef>,
    /// Set by RETURN: `Some(retry)`.
    pub return_requested: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The trigger did not fire.
    Skipped,
    Completed,
    /// A SLEEP cell holds the sheet.
    Suspended,
    /// A RETURN cell ended the step early.
    Returned,
}

/// One sheet: cells, trigger, loop cursor and its inbox.
pub struct StreamSheet {
    name: String,
    pub grid: Grid,
    pub value_cache: ValueCache,
    engine: Engine,
    custom_functions: Option<String>,
    trigger: Trigger,
    cursor: LoopCursor,
    inbox: SharedInbox,
    hub: MessageHub,
    runtime: Arc<Mutex<SheetRuntime>>,
    clock: Arc<dyn Clock>,
    /// Re-run the current element on the next step (RETURN with retry).
    replay: bool,
}

impl StreamSheet {
    pub fn new(
        name: &str,
        trigger: TriggerConfig,
        loop_path: Option<&str>,
        inbox_size: Option<usize>,
        hub: MessageHub,
        endpoints: Arc<EndpointRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cursor = LoopCursor::new(loop_path)?;
        let grid: Grid = Arc::new(dashmap::DashMap::new());
        let value_cache = ValueCache::default();
        let runtime = Arc::new(Mutex::new(SheetRuntime::default()));
        let inbox: SharedInbox = Arc::new(Mutex::new(Inbox::new(inbox_size)));
        hub.add_inbox(name, inbox.clone());

        let handler = Arc::new(SheetFunctions::new(
            name,
            grid.clone(),
            value_cache.clone(),
            runtime.clone(),
            hub.clone(),
            endpoints,
            clock.clone(),
        ));
        let engine = create_engine_with_handler(grid.clone(), value_cache.clone(), handler);

        Ok(StreamSheet {
            name: name.to_string(),
            grid,
            value_cache,
            engine,
            custom_functions: None,
            trigger: Trigger::new(trigger),
            cursor,
            inbox,
            hub,
            runtime,
            clock,
            replay: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> &TriggerConfig {
        self.trigger.config()
    }

    pub fn inbox(&self) -> &SharedInbox {
        &self.inbox
    }

    pub fn runtime(&self) -> &Arc<Mutex<SheetRuntime>> {
        &self.runtime
    }

    pub(crate) fn set_custom_functions(&mut self, script: Option<String>) {
        self.custom_functions = script;
    }

    pub fn put_message(&self, message: Message) {
        if let Some(evicted) = self.inbox.lock().put(message) {
            debug!(sheet = %self.name, id = %evicted.id, "inbox full, dropped oldest message");
        }
    }

    /// Current value of a cell (evaluated result for formulas).
    pub fn cell_value(&self, cell: &CellRef) -> Dynamic {
        cell_value(&self.grid, &self.value_cache, cell)
    }

    /// Replace a cell's contents.
    ///
    /// Anything the old formula owned is dropped first: its pending request,
    /// sleep, aggregation window and table state. Formulas are evaluated once
    /// without side effects so the cell shows a value right away.
    pub fn set_cell(&mut self, cell: &CellRef, input: &str) {
        self.put_cell(cell, Cell::from_input(input));
    }

    /// Replace a cell's contents with an already parsed cell.
    pub fn put_cell(&mut self, cell: &CellRef, new_cell: Cell) {
        {
            let mut runtime = self.runtime.lock();
            runtime.requests.cancel(cell);
            runtime.sleeps.cancel(cell);
            if runtime.suspended_at.as_ref() == Some(cell) {
                runtime.suspended_at = None;
            }
            runtime.aggregators.remove(cell);
            runtime.tables.remove(cell);
        }
        self.value_cache.remove(cell);

        if new_cell.contents == CellType::Empty {
            self.grid.remove(cell);
            return;
        }
        let is_script = new_cell.is_script();
        self.grid.insert(cell.clone(), new_cell);
        if is_script {
            self.evaluate(cell, false);
        }
    }

    /// Formula cells in evaluation order (row by row, left to right).
    fn formula_cells(&self) -> Vec<CellRef> {
        let mut cells: Vec<CellRef> = self
            .grid
            .iter()
            .filter(|entry| entry.value().is_script())
            .map(|entry| entry.key().clone())
            .collect();
        cells.sort_by(|a, b| a.row.cmp(&b.row).then(a.col.cmp(&b.col)));
        cells
    }

    fn evaluate(&self, cell: &CellRef, processing: bool) {
        let formula = match self.grid.get(cell) {
            Some(entry) => match &entry.contents {
                CellType::Script(formula) => formula.clone(),
                _ => return,
            },
            None => return,
        };
        {
            let mut runtime = self.runtime.lock();
            runtime.processing = processing;
            runtime.current_cell = Some(cell.clone());
        }
        let value = evaluate_formula(&self.engine, &formula, cell, self.custom_functions.as_deref());
        {
            let mut runtime = self.runtime.lock();
            runtime.processing = false;
            runtime.current_cell = None;
        }
        self.value_cache.insert(cell.clone(), value);
    }

    /// Re-evaluate every formula without side effects.
    pub fn refresh(&self) {
        for cell in self.formula_cells() {
            self.evaluate(&cell, false);
        }
    }

    /// Route request responses that arrived since the last step.
    fn deliver_responses(&self, now_ms: i64) {
        let completions = self.runtime.lock().requests.poll(now_ms);
        for completion in completions {
            debug!(sheet = %self.name, request = %completion.request_id, "delivering response");
            if !self.hub.deliver(&completion.destination, completion.response) {
                warn!(
                    sheet = %self.name,
                    request = %completion.request_id,
                    "response destination no longer exists"
                );
            }
        }
    }

    fn advance_loop(&mut self) {
        let endless = self.trigger.is_endless();
        {
            let mut inbox = self.inbox.lock();
            self.cursor.advance(&mut inbox, endless);
        }
        let mut runtime = self.runtime.lock();
        runtime.loop_index = self.cursor.index();
        runtime.loop_prefix = self.cursor.element_keys();
    }

    fn evaluate_from(&mut self, formulas: &[CellRef]) -> StepOutcome {
        for cell in formulas {
            self.evaluate(cell, true);
            let mut runtime = self.runtime.lock();
            if let Some(retry) = runtime.return_requested.take() {
                self.replay = retry;
                return StepOutcome::Returned;
            }
            if runtime.suspended_at.is_some() {
                return StepOutcome::Suspended;
            }
        }
        StepOutcome::Completed
    }

    /// Run one step of this sheet.
    pub fn step(&mut self, reason: StepReason) -> StepOutcome {
        let now = self.clock.now_ms();
        self.deliver_responses(now);
        let formulas = self.formula_cells();

        if matches!(reason, StepReason::Cycle | StepReason::Manual) {
            let sleeping = self.runtime.lock().suspended_at.take();
            if let Some(cell) = sleeping {
                self.evaluate(&cell, true);
                if self.runtime.lock().suspended_at.is_some() {
                    return StepOutcome::Suspended;
                }
                debug!(sheet = %self.name, cell = %cell, "resuming after sleep");
                let start = formulas.iter().position(|c| *c == cell).map_or(0, |p| p + 1);
                return self.evaluate_from(&formulas[start..]);
            }
        }

        let has_work = {
            let inbox = self.inbox.lock();
            self.cursor.has_work(&inbox, self.trigger.is_endless())
        };
        if !self.trigger.should_fire(reason, now, has_work) {
            return StepOutcome::Skipped;
        }
        self.runtime.lock().cycle += 1;
        if !std::mem::take(&mut self.replay) {
            self.advance_loop();
        }
        let outcome = self.evaluate_from(&formulas);
        debug!(sheet = %self.name, ?reason, ?outcome, "step");
        outcome
    }

    /// Prepare for a fresh run: windows, table state, schedule and loop start over.
    pub(crate) fn reset_for_start(&mut self) {
        let mut runtime = self.runtime.lock();
        runtime.aggregators.clear();
        runtime.tables.clear();
        runtime.cycle = 0;
        runtime.loop_index = 0;
        runtime.loop_prefix = None;
        self.trigger.reset();
        self.cursor.reset();
        self.replay = false;
    }

    /// Cancel every pending request and sleep.
    pub(crate) fn cancel_all(&mut self) {
        let mut runtime = self.runtime.lock();
        let pending = runtime.requests.len();
        runtime.requests.cancel_all();
        runtime.sleeps.clear();
        runtime.suspended_at = None;
        runtime.return_requested = None;
        self.replay = false;
        if pending > 0 {
            info!(sheet = %self.name, pending, "cancelled pending requests");
        }
    }

    pub(crate) fn reset_cursor(&mut self) {
        self.cursor.reset();
    }

    /// Check that a custom functions script compiles against this sheet's engine.
    pub(crate) fn compile(&self, script: &str) -> Result<()> {
        self.engine
            .compile(script)
            .map(|_| ())
            .map_err(|err| StreamsheetsError::RhaiCompile(format!("Error in custom functions: {}", err)))
    }
}
