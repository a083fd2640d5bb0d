//! Machine definitions in TOML.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::clock::Clock;
use crate::endpoint::{EndpointRegistry, LoopbackEndpoint};
use crate::error::Result;
use crate::machine::{DEFAULT_CYCLE_TIME_MS, Machine, TriggerConfig};
use crate::message::Message;
use crate::storage::parse_cells;

fn default_name() -> String {
    "machine".to_string()
}

fn default_cycle_time() -> u64 {
    DEFAULT_CYCLE_TIME_MS
}

#[derive(Clone, Debug, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_cycle_time")]
    pub cycle_time_ms: u64,
    #[serde(default)]
    pub sheets: Vec<SheetConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SheetConfig {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerConfig,
    pub loop_path: Option<String>,
    pub inbox_size: Option<usize>,
    /// `REF: value` lines.
    #[serde(default)]
    pub cells: String,
    #[serde(default)]
    pub messages: Vec<MessageConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MessageConfig {
    pub id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Loopback,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub kind: EndpointKind,
}

impl MessageConfig {
    fn to_message(&self) -> Message {
        let mut message = match &self.id {
            Some(id) => Message::with_id(id.clone(), self.data.clone()),
            None => Message::new(self.data.clone()),
        };
        for (key, value) in &self.metadata {
            if key != "id" {
                message.metadata.insert(key.clone(), value.clone());
            }
        }
        message
    }
}

impl MachineConfig {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        info!(path = %path.display(), sheets = config.sheets.len(), "machine definition loaded");
        Ok(config)
    }

    /// Build a stopped machine with its sheets, cells and initial messages.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Result<Machine> {
        let mut endpoints = EndpointRegistry::new();
        for endpoint in &self.endpoints {
            match endpoint.kind {
                EndpointKind::Loopback => {
                    endpoints.register(endpoint.name.clone(), Arc::new(LoopbackEndpoint::new()))
                }
            }
        }

        let mut machine = Machine::new(&self.name, endpoints, clock);
        machine.set_cycle_time_ms(self.cycle_time_ms);
        // Sheets first, so formulas can address any inbox.
        for sheet in &self.sheets {
            machine.add_sheet(
                &sheet.name,
                sheet.trigger.clone(),
                sheet.loop_path.as_deref(),
                sheet.inbox_size,
            )?;
        }
        for sheet in &self.sheets {
            for message in &sheet.messages {
                machine.put_message(&sheet.name, message.to_message())?;
            }
            let cells = parse_cells(&sheet.cells)?;
            let target = machine.sheet_mut(&sheet.name)?;
            for (cell_ref, cell) in cells {
                target.put_cell(&cell_ref, cell);
            }
        }
        Ok(machine)
    }
}
