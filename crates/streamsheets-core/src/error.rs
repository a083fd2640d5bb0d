//! Error types for the Streamsheets runtime.

use thiserror::Error;

/// Errors raised by machine control, configuration and storage.
///
/// Formula-level failures never surface here; they are
/// [`ErrorCode`](streamsheets_engine::engine::ErrorCode) cell values.
#[derive(Error, Debug)]
pub enum StreamsheetsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid machine definition: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Unknown sheet: {0}")]
    UnknownSheet(String),

    #[error("Duplicate sheet name: {0}")]
    DuplicateSheet(String),

    #[error("Invalid cell reference: {0}")]
    InvalidCellRef(String),

    #[error("Invalid loop path: {0}")]
    InvalidLoopPath(String),

    #[error("Cannot step while the machine is running")]
    StepWhileRunning,

    #[error("Machine is not running")]
    NotRunning,

    #[error("No functions file loaded")]
    NoFunctionsLoaded,

    #[error("Rhai compile error: {0}")]
    RhaiCompile(String),
}

pub type Result<T> = std::result::Result<T, StreamsheetsError>;
