//! Formula-level error sentinels.
//!
//! Built-in functions never raise: they return an [`ErrorCode`] in place of a
//! value. Error values are registered as a Rhai custom type, so they flow
//! through cell references like any other value and short-circuit operators
//! and function arguments.

use rhai::Dynamic;
use thiserror::Error;

#[derive(Error, Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ErrorCode {
    /// Wrong number of arguments.
    #[error("#ARGS")]
    Args,
    /// Wrong type, shape or format.
    #[error("#VALUE")]
    Value,
    /// Unresolvable reference or unknown function.
    #[error("#NAME")]
    Name,
    /// Path or key not found, or data not yet available.
    #[error("#NA")]
    Na,
    /// Message id not found.
    #[error("#NO_MSG")]
    NoMsg,
    /// Subtree not found within an existing message.
    #[error("#NO_MSG_DATA")]
    NoMsgData,
    /// Required message id argument missing.
    #[error("#NO_MSG_ID")]
    NoMsgId,
    #[error("#NO_MACHINE")]
    NoMachine,
    /// Endpoint could not be resolved.
    #[error("#NO_PRODUCER")]
    NoProducer,
    /// Malformed request payload.
    #[error("#INVALID_PARAM")]
    InvalidParam,
    /// Capacity exceeded.
    #[error("#LIMIT")]
    Limit,
    /// Generic request rejection.
    #[error("#ERR")]
    Err,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 12] = [
        ErrorCode::Args,
        ErrorCode::Value,
        ErrorCode::Name,
        ErrorCode::Na,
        ErrorCode::NoMsg,
        ErrorCode::NoMsgData,
        ErrorCode::NoMsgId,
        ErrorCode::NoMachine,
        ErrorCode::NoProducer,
        ErrorCode::InvalidParam,
        ErrorCode::Limit,
        ErrorCode::Err,
    ];

    /// Parse the display form ("#NA", "#NO_MSG", ...).
    pub fn parse(text: &str) -> Option<ErrorCode> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.to_string() == text)
    }

    /// Extract an error sentinel from a Rhai value.
    pub fn from_dynamic(value: &Dynamic) -> Option<ErrorCode> {
        if value.is::<ErrorCode>() {
            value.clone().try_cast::<ErrorCode>()
        } else {
            None
        }
    }

    /// First error sentinel among a list of arguments.
    pub fn first_in(values: &[Dynamic]) -> Option<ErrorCode> {
        values.iter().find_map(ErrorCode::from_dynamic)
    }
}
