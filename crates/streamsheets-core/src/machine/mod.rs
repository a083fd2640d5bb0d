//! Machine: named sheets stepping together over a shared set of message stores.

mod cursor;
mod functions;
mod sheet;
mod trigger;

pub use cursor::LoopCursor;
pub use functions::SheetFunctions;
pub use sheet::{SheetRuntime, StepOutcome, StreamSheet};
pub use trigger::{Repeat, StepReason, Trigger, TriggerConfig, TriggerKind};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use streamsheets_engine::engine::{CellRef, Dynamic};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::endpoint::EndpointRegistry;
use crate::error::{Result, StreamsheetsError};
use crate::message::{Message, MessageHub};

const MAX_FUNCTION_FILE_BYTES: u64 = 1_048_576; // 1 MiB

pub const DEFAULT_CYCLE_TIME_MS: u64 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Paused,
    Running,
}

fn read_functions_file(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > MAX_FUNCTION_FILE_BYTES {
        return Err(StreamsheetsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "Refusing to read {}: functions file too large ({} bytes, max {})",
                path.display(),
                meta.len(),
                MAX_FUNCTION_FILE_BYTES
            ),
        )));
    }
    Ok(std::fs::read_to_string(path)?)
}

pub struct Machine {
    name: String,
    state: MachineState,
    cycle_time_ms: u64,
    sheets: Vec<StreamSheet>,
    hub: MessageHub,
    endpoints: Arc<EndpointRegistry>,
    clock: Arc<dyn Clock>,
    /// Paths to custom Rhai functions files
    functions_files: Vec<PathBuf>,
    /// Concatenated contents of the functions files
    custom_functions: Option<String>,
    cycles: u64,
}

impl Machine {
    pub fn new(name: &str, endpoints: EndpointRegistry, clock: Arc<dyn Clock>) -> Self {
        Machine {
            name: name.to_string(),
            state: MachineState::Stopped,
            cycle_time_ms: DEFAULT_CYCLE_TIME_MS,
            sheets: Vec::new(),
            hub: MessageHub::new(),
            endpoints: Arc::new(endpoints),
            clock,
            functions_files: Vec::new(),
            custom_functions: None,
            cycles: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn cycle_time_ms(&self) -> u64 {
        self.cycle_time_ms
    }

    pub fn set_cycle_time_ms(&mut self, ms: u64) {
        self.cycle_time_ms = ms;
    }

    /// Cycles run since the machine last started.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn hub(&self) -> &MessageHub {
        &self.hub
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn sheets(&self) -> &[StreamSheet] {
        &self.sheets
    }

    pub fn sheet(&self, name: &str) -> Result<&StreamSheet> {
        self.sheets
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| StreamsheetsError::UnknownSheet(name.to_string()))
    }

    pub fn sheet_mut(&mut self, name: &str) -> Result<&mut StreamSheet> {
        self.sheets
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or_else(|| StreamsheetsError::UnknownSheet(name.to_string()))
    }

    pub fn add_sheet(
        &mut self,
        name: &str,
        trigger: TriggerConfig,
        loop_path: Option<&str>,
        inbox_size: Option<usize>,
    ) -> Result<&mut StreamSheet> {
        if self.sheets.iter().any(|s| s.name() == name) {
            return Err(StreamsheetsError::DuplicateSheet(name.to_string()));
        }
        let mut sheet = StreamSheet::new(
            name,
            trigger,
            loop_path,
            inbox_size,
            self.hub.clone(),
            self.endpoints.clone(),
            self.clock.clone(),
        )?;
        sheet.set_custom_functions(self.custom_functions.clone());
        debug!(machine = %self.name, sheet = name, "sheet added");
        self.sheets.push(sheet);
        let index = self.sheets.len() - 1;
        Ok(&mut self.sheets[index])
    }

    /// Set a cell from user input (`42`, `"text"`, `TRUE`, `=formula`).
    pub fn set_cell(&mut self, sheet: &str, cell: &str, input: &str) -> Result<()> {
        let cell_ref = CellRef::from_str(cell)
            .ok_or_else(|| StreamsheetsError::InvalidCellRef(cell.to_string()))?;
        self.sheet_mut(sheet)?.set_cell(&cell_ref, input);
        Ok(())
    }

    pub fn cell_value(&self, sheet: &str, cell: &str) -> Result<Dynamic> {
        let cell_ref = CellRef::from_str(cell)
            .ok_or_else(|| StreamsheetsError::InvalidCellRef(cell.to_string()))?;
        Ok(self.sheet(sheet)?.cell_value(&cell_ref))
    }

    pub fn put_message(&self, sheet: &str, message: Message) -> Result<()> {
        self.sheet(sheet)?.put_message(message);
        Ok(())
    }

    pub fn start(&mut self) {
        match self.state {
            MachineState::Running => {}
            MachineState::Paused => {
                info!(machine = %self.name, "resumed");
                self.state = MachineState::Running;
            }
            MachineState::Stopped => {
                info!(machine = %self.name, "starting");
                self.cycles = 0;
                for sheet in &mut self.sheets {
                    sheet.reset_for_start();
                }
                self.state = MachineState::Running;
                for sheet in &mut self.sheets {
                    sheet.step(StepReason::MachineStart);
                }
            }
        }
    }

    /// Keep requests, sleeps and windows; stop cycling.
    pub fn pause(&mut self) {
        if self.state == MachineState::Running {
            info!(machine = %self.name, "paused");
            self.state = MachineState::Paused;
        }
    }

    pub fn stop(&mut self) {
        if self.state == MachineState::Stopped {
            return;
        }
        info!(machine = %self.name, cycles = self.cycles, "stopping");
        for sheet in &mut self.sheets {
            sheet.cancel_all();
        }
        for sheet in &mut self.sheets {
            sheet.step(StepReason::MachineStop);
        }
        // Stop sheets may have slept or requested during their final step.
        for sheet in &mut self.sheets {
            sheet.cancel_all();
            sheet.reset_cursor();
        }
        self.hub.clear_all();
        self.state = MachineState::Stopped;
    }

    /// Step every sheet once while the machine is not running.
    pub fn step(&mut self) -> Result<Vec<StepOutcome>> {
        if self.state == MachineState::Running {
            return Err(StreamsheetsError::StepWhileRunning);
        }
        Ok(self
            .sheets
            .iter_mut()
            .map(|sheet| sheet.step(StepReason::Manual))
            .collect())
    }

    /// Run one cycle of a running machine.
    pub fn cycle(&mut self) -> Result<Vec<StepOutcome>> {
        if self.state != MachineState::Running {
            return Err(StreamsheetsError::NotRunning);
        }
        self.cycles += 1;
        Ok(self
            .sheets
            .iter_mut()
            .map(|sheet| sheet.step(StepReason::Cycle))
            .collect())
    }

    /// Load custom Rhai functions from a file (appends to existing functions).
    /// Returns the canonical path loaded.
    pub fn load_functions(&mut self, path: &Path) -> Result<PathBuf> {
        let path_buf = std::fs::canonicalize(path)?;
        let content = read_functions_file(&path_buf)?;
        if self.functions_files.contains(&path_buf) {
            return Ok(path_buf);
        }
        let merged = match &self.custom_functions {
            Some(existing) => format!("{}\n\n{}", existing, content),
            None => content,
        };
        self.install_functions(&merged)?;
        self.functions_files.push(path_buf.clone());
        info!(path = %path_buf.display(), "custom functions loaded");
        Ok(path_buf)
    }

    /// Reload all custom functions files. Returns the number of files reloaded.
    pub fn reload_functions(&mut self) -> Result<usize> {
        if self.functions_files.is_empty() {
            return Err(StreamsheetsError::NoFunctionsLoaded);
        }
        let mut merged = String::new();
        for (idx, path) in self.functions_files.iter().enumerate() {
            if idx > 0 {
                merged.push_str("\n\n");
            }
            merged.push_str(&read_functions_file(path)?);
        }
        self.install_functions(&merged)?;
        Ok(self.functions_files.len())
    }

    /// Compile first so a broken script leaves the machine unchanged.
    fn install_functions(&mut self, script: &str) -> Result<()> {
        if let Some(sheet) = self.sheets.first() {
            sheet.compile(script)?;
        } else {
            let engine = rhai::Engine::new();
            engine
                .compile(script)
                .map_err(|err| StreamsheetsError::RhaiCompile(format!("Error in custom functions: {}", err)))?;
        }
        self.custom_functions = Some(script.to_string());
        for sheet in &mut self.sheets {
            sheet.set_custom_functions(self.custom_functions.clone());
            sheet.refresh();
        }
        Ok(())
    }

    pub fn custom_functions(&self) -> Option<&str> {
        self.custom_functions.as_deref()
    }
}
