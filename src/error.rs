//! Command-line errors for the streamsheets runner

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CliError {
    #[error("{0} requires a value")]
    MissingValue(&'static str),

    #[error("Invalid cycle count: {0}")]
    InvalidCycles(String),

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("No machine definition given")]
    MissingFile,
}
