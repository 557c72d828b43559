//! Cadence Core - real-time multi-program scheduling engine
//!
//! Drives many independently running programs through a bytecode synthesis
//! engine, one quantum at a time, with a shared transport and a sample
//! registry that programs address by handle and slice point.

pub mod config;
pub mod engine;
pub mod error;
pub mod samples;
pub mod shared;
pub mod types;

pub use error::{EngineError, EngineResult, VmError};
pub use types::*;
