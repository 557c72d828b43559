//! Engine error types

use thiserror::Error;

use crate::types::{ProgramId, VmId};

/// Faults raised by the bytecode engine while running an instance
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// The instance raised an exception during `run`
    #[error("{message}")]
    Fault { vm: VmId, message: String },

    /// The instance id is not known to the backend
    #[error("Unknown engine instance: {0}")]
    UnknownInstance(VmId),
}

/// Errors reported to the control context
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No engine module has been loaded yet
    #[error("No state")]
    NotLoaded,

    /// A request referenced a program that does not exist
    #[error("Program not found with id: {0}")]
    ProgramNotFound(ProgramId),

    /// The request queue to the render thread is full
    #[error("Request queue is full")]
    QueueFull,

    /// The render side dropped the reply without answering
    #[error("Engine disconnected before replying")]
    Disconnected,

    /// A bytecode engine failure outside the render loop
    #[error("Engine instance error: {0}")]
    Vm(#[from] VmError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
