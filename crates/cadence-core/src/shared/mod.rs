//! Shared state between the control context and the renderer
//!
//! Everything here is read and written through atomics only. The renderer
//! never blocks on these records and the control context never observes a
//! half-written value.

pub mod double_buffer;
pub mod history;
pub mod program;
pub mod transport;

pub use double_buffer::{DoubleBuffer, FlipIndex};
pub use history::{HistoryExchange, HistoryPack, HISTORY_CAPACITY, HISTORY_STRIDE};
pub use program::{ProgramField, SharedProgramState, PROGRAM_SLOTS};
pub use transport::{SharedTransport, TimelineBounds, TransportField, TRANSPORT_SLOTS};
