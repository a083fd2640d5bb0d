//! streamsheets-core - machine runtime: sheets, message stores, triggers,
//! requests, sleeps and machine definitions.

pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod machine;
pub mod message;
pub mod request;
pub mod sleep;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MachineConfig;
pub use endpoint::{EndpointRegistry, LoopbackEndpoint, StreamEndpoint};
pub use error::{Result, StreamsheetsError};
pub use machine::{Machine, MachineState, StepOutcome, StreamSheet, TriggerConfig, TriggerKind};
pub use message::{Message, MessageHub};

pub use streamsheets_engine::engine::CellRef;
