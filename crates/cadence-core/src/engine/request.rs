//! Lock-free request queue from the control context to the renderer
//!
//! The control context never touches renderer-owned state directly. It
//! pushes an [`EngineRequest`] onto an `rtrb` ring and the renderer drains
//! the ring at the start of every quantum, so requests always execute
//! between quanta. Each variant carries its own typed
//! `tokio::sync::oneshot` reply sender.
//!
//! Notifications flow the other way on a second ring ([`EngineEvent`]);
//! the renderer drops an event rather than wait when that ring is full.
//!
//! ```ignore
//! let (tx, rx) = oneshot::channel();
//! producer.push(EngineRequest::GetStats { program: None, reply: tx })?;
//! // ... renderer runs a quantum ...
//! let stats = Reply::new(rx).await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use basedrop::{Owned, Shared};
use tokio::sync::oneshot;

use super::program::ProgramInit;
use super::vm::VmBackend;
use crate::config::LimiterConfig;
use crate::error::{EngineError, EngineResult};
use crate::samples::{RequiredSample, SampleData, SampleMemoryInfo, SampleSource};
use crate::shared::{HistoryExchange, SharedProgramState, SharedTransport};
use crate::types::{ProgramId, ProgramState, SampleHandle, VmId};

/// Reply sender for a request
pub type ReplyTx<T> = oneshot::Sender<T>;

/// Receiving end of a reply
///
/// Await it from async code, or poll it with [`Reply::try_recv`] from a
/// UI loop. Yields [`EngineError::Disconnected`] when the renderer went
/// away without answering.
#[derive(Debug)]
pub struct Reply<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Reply<T> {
    pub(crate) fn new(rx: oneshot::Receiver<T>) -> Self {
        Self { rx }
    }

    /// `Ok(None)` while the renderer has not answered yet
    pub fn try_recv(&mut self) -> EngineResult<Option<T>> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(EngineError::Disconnected),
        }
    }

    /// Block the calling thread until the renderer answers
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_recv(self) -> EngineResult<T> {
        self.rx.blocking_recv().map_err(|_| EngineError::Disconnected)
    }
}

impl<T> Future for Reply<T> {
    type Output = EngineResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| EngineError::Disconnected))
    }
}

/// Resolves once the renderer has produced a quantum with newly applied ops
///
/// `None` when the program was not playing: the ops were applied
/// synchronously and there is nothing to wait for.
pub type OpsApplied = Option<Reply<()>>;

/// Control ops handed over to the renderer
///
/// Freed on the collector thread once the renderer has copied them.
pub type OpsPayload = Owned<Vec<u32>>;

/// Engine statistics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    /// Engine memory in MiB
    pub memory_usage: f64,
    /// Whether an engine module is loaded
    pub has_core: bool,
    pub sample_count: u32,
    pub bpm: f32,
    pub bpm_override: f32,
    pub program_count: usize,
    pub program_id: Option<ProgramId>,
    pub program_state: ProgramState,
    pub control_ops_length: usize,
    pub program_sample_count: u32,
}

impl EngineStats {
    /// Stats reported before any module is loaded
    pub fn unloaded(program_id: Option<ProgramId>) -> Self {
        Self {
            memory_usage: 0.0,
            has_core: false,
            sample_count: 0,
            bpm: crate::types::DEFAULT_BPM,
            bpm_override: 0.0,
            program_count: 0,
            program_id,
            program_state: ProgramState::Stop,
            control_ops_length: 0,
            program_sample_count: 0,
        }
    }
}

/// Requests from the control context
///
/// Large payloads are boxed or basedrop-owned so the enum stays small.
pub enum EngineRequest {
    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────
    /// Replace the processor state with a freshly loaded engine
    LoadModule {
        backend: Box<dyn VmBackend>,
        transport: Arc<SharedTransport>,
        reply: ReplyTx<()>,
    },
    /// Create a program; the shared records are allocated by the caller
    InitProgram {
        shared: Arc<SharedProgramState>,
        history: Option<Arc<HistoryExchange>>,
        reply: ReplyTx<EngineResult<ProgramInit>>,
    },
    DisposeProgram {
        program: ProgramId,
        reply: ReplyTx<EngineResult<()>>,
    },
    GetProgramShared {
        program: ProgramId,
        reply: ReplyTx<EngineResult<ProgramInit>>,
    },
    /// Engine instance of the program's active slot
    GetVmInfo {
        program: ProgramId,
        reply: ReplyTx<EngineResult<VmId>>,
    },
    /// Grow engine memory; replies with the previous size in pages
    MemoryGrow {
        delta_pages: u32,
        reply: ReplyTx<EngineResult<u32>>,
    },

    // ─────────────────────────────────────────────────────────────
    // Control ops
    // ─────────────────────────────────────────────────────────────
    SetControlOps {
        program: ProgramId,
        ops: OpsPayload,
        reply: ReplyTx<EngineResult<OpsApplied>>,
    },
    /// Swap to the other slot, crossfading if playing
    SwapControlOps {
        program: ProgramId,
        ops: OpsPayload,
        fade_samples: Option<i64>,
        reply: ReplyTx<EngineResult<OpsApplied>>,
    },

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────
    Start {
        programs: Vec<ProgramId>,
        reply: ReplyTx<EngineResult<Vec<ProgramInit>>>,
    },
    Stop {
        programs: Vec<ProgramId>,
        reply: ReplyTx<EngineResult<Vec<ProgramInit>>>,
    },
    Pause {
        programs: Vec<ProgramId>,
        reply: ReplyTx<EngineResult<Vec<ProgramInit>>>,
    },
    SwapPrograms {
        stop: Vec<ProgramId>,
        start: Vec<ProgramId>,
        reply: ReplyTx<EngineResult<Vec<ProgramInit>>>,
    },
    /// Seek the transport and the listed programs
    SeekTransport {
        sample_count: u32,
        programs: Vec<ProgramId>,
        preview: bool,
        reply: ReplyTx<EngineResult<Vec<ProgramInit>>>,
    },
    /// Seek programs only; `preview` freezes normal advance for a few quanta
    SeekPrograms {
        sample_count: u32,
        programs: Vec<ProgramId>,
        preview: bool,
        reply: ReplyTx<EngineResult<Vec<ProgramInit>>>,
    },
    SetProgramGain {
        program: ProgramId,
        gain: f32,
        reply: ReplyTx<EngineResult<()>>,
    },
    /// 0 clears the override
    SetTempoOverride {
        bpm: f32,
        reply: ReplyTx<()>,
    },
    SetLimiter {
        config: LimiterConfig,
        reply: ReplyTx<()>,
    },

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────
    GetStats {
        program: Option<ProgramId>,
        reply: ReplyTx<EngineStats>,
    },
    GetMemoryInfo {
        reply: ReplyTx<SampleMemoryInfo>,
    },
    GetRequiredSamples {
        reply: ReplyTx<Vec<RequiredSample>>,
    },

    // ─────────────────────────────────────────────────────────────
    // Samples
    // ─────────────────────────────────────────────────────────────
    RegisterSample {
        source: SampleSource,
        reply: ReplyTx<SampleHandle>,
    },
    RegisterInlineSample {
        data: Shared<SampleData>,
        reply: ReplyTx<SampleHandle>,
    },
    SyncSampleRegistrations {
        invalidated: Vec<SampleHandle>,
        registrations: Vec<(SampleHandle, SampleSource)>,
        reply: ReplyTx<()>,
    },
    SetSampleData {
        handle: SampleHandle,
        data: Shared<SampleData>,
        reply: ReplyTx<bool>,
    },
    SetSampleError {
        handle: SampleHandle,
        error: String,
        reply: ReplyTx<bool>,
    },
    RecordSample {
        handle: SampleHandle,
        data: Shared<SampleData>,
        reply: ReplyTx<bool>,
    },
}

/// Notifications from the renderer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Something the control context mirrors changed; re-read state
    Refresh,
    /// `Some` on the first failing quantum, `None` once rendering recovers
    RenderError(Option<String>),
}

/// Create the request ring
pub fn request_channel(
    capacity: usize,
) -> (rtrb::Producer<EngineRequest>, rtrb::Consumer<EngineRequest>) {
    rtrb::RingBuffer::new(capacity)
}

/// Create the event ring
pub fn event_channel(
    capacity: usize,
) -> (rtrb::Producer<EngineEvent>, rtrb::Consumer<EngineEvent>) {
    rtrb::RingBuffer::new(capacity)
}
