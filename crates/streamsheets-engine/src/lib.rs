//! Cell model, formula evaluation and the stream-processing algorithms that do
//! not need a running machine.

pub mod aggregate;
pub mod builtins;
pub mod codec;
pub mod datetime;
pub mod engine;
pub mod table;
