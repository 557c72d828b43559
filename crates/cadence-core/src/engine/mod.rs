//! Render engine - program slots, quantum scheduler, request plumbing
//!
//! This module contains everything that runs on or talks to the render thread:
//! - Program: two engine-instance slots with double-buffered control ops
//!   and the crossfade swap protocol
//! - Scheduler: the per-quantum loop (seek, loop wrap, mixing, limiting)
//! - Engine / EngineClient: request dispatch on the render side and the
//!   lock-free control-side handle
//! - VmBackend: boundary to the bytecode engine that renders a program

mod client;
mod engine;
pub mod gc;
mod limiter;
#[cfg(test)]
pub(crate) mod mock;
mod program;
mod request;
mod scheduler;
pub mod vm;

pub use client::*;
pub use engine::*;
pub use limiter::*;
pub use program::*;
pub use request::*;
pub use scheduler::*;
pub use vm::{RunContext, VmBackend, VmOutput};
