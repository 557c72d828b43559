//! Control-side handle to the render engine
//!
//! Every method pushes one request onto the ring and returns immediately
//! with a [`Reply`]. The reply resolves once the renderer has executed the
//! request, at the start of its next quantum. Await it from async code or
//! poll it with `try_recv`.
//!
//! Buffers that end up owned by the renderer (control ops, sample
//! channels) are allocated here and wrapped for deferred deallocation, so
//! the render thread neither allocates nor frees them.

use std::sync::Arc;

use basedrop::{Owned, Shared};
use tokio::sync::oneshot;

use super::gc::gc_handle;
use super::program::ProgramInit;
use super::request::{EngineEvent, EngineRequest, EngineStats, OpsApplied, Reply, ReplyTx};
use super::vm::VmBackend;
use crate::config::LimiterConfig;
use crate::error::{EngineError, EngineResult};
use crate::samples::{RequiredSample, SampleData, SampleMemoryInfo, SampleSource};
use crate::shared::{HistoryExchange, SharedProgramState, SharedTransport};
use crate::types::{ProgramId, SampleHandle, VmId};

/// Sends requests to an [`super::Engine`] and receives its notifications
pub struct EngineClient {
    requests: rtrb::Producer<EngineRequest>,
    events: rtrb::Consumer<EngineEvent>,
    transport: Arc<SharedTransport>,
}

impl EngineClient {
    pub(crate) fn new(
        requests: rtrb::Producer<EngineRequest>,
        events: rtrb::Consumer<EngineEvent>,
        transport: Arc<SharedTransport>,
    ) -> Self {
        Self {
            requests,
            events,
            transport,
        }
    }

    /// Shared transport record handed to every loaded module
    pub fn transport(&self) -> &Arc<SharedTransport> {
        &self.transport
    }

    /// Push a request built around a fresh reply channel
    fn send<T>(&mut self, build: impl FnOnce(ReplyTx<T>) -> EngineRequest) -> EngineResult<Reply<T>> {
        let (tx, rx) = oneshot::channel();
        self.requests.push(build(tx)).map_err(|_| {
            log::warn!("Engine request queue full");
            EngineError::QueueFull
        })?;
        Ok(Reply::new(rx))
    }

    /// Drain pending notifications from the renderer
    pub fn poll_events(&mut self) -> impl Iterator<Item = EngineEvent> + '_ {
        std::iter::from_fn(move || self.events.pop().ok())
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Load a bytecode engine, replacing any previous one
    pub fn load_module(&mut self, backend: Box<dyn VmBackend>) -> EngineResult<Reply<()>> {
        let transport = Arc::clone(&self.transport);
        self.send(|reply| EngineRequest::LoadModule {
            backend,
            transport,
            reply,
        })
    }

    /// Create a program, optionally with history snapshot buffers
    pub fn init_program(&mut self, with_history: bool) -> EngineResult<Reply<EngineResult<ProgramInit>>> {
        let shared = Arc::new(SharedProgramState::new());
        let history = with_history.then(|| Arc::new(HistoryExchange::new(Arc::clone(&shared))));
        self.send(|reply| EngineRequest::InitProgram {
            shared,
            history,
            reply,
        })
    }

    pub fn dispose_program(&mut self, program: ProgramId) -> EngineResult<Reply<EngineResult<()>>> {
        self.send(|reply| EngineRequest::DisposeProgram { program, reply })
    }

    pub fn program_shared(
        &mut self,
        program: ProgramId,
    ) -> EngineResult<Reply<EngineResult<ProgramInit>>> {
        self.send(|reply| EngineRequest::GetProgramShared { program, reply })
    }

    pub fn vm_info(&mut self, program: ProgramId) -> EngineResult<Reply<EngineResult<VmId>>> {
        self.send(|reply| EngineRequest::GetVmInfo { program, reply })
    }

    pub fn memory_grow(&mut self, delta_pages: u32) -> EngineResult<Reply<EngineResult<u32>>> {
        self.send(|reply| EngineRequest::MemoryGrow { delta_pages, reply })
    }

    // ─────────────────────────────────────────────────────────────
    // Control ops
    // ─────────────────────────────────────────────────────────────

    pub fn set_control_ops(
        &mut self,
        program: ProgramId,
        ops: Vec<u32>,
    ) -> EngineResult<Reply<EngineResult<OpsApplied>>> {
        let ops = Owned::new(&gc_handle(), ops);
        self.send(|reply| EngineRequest::SetControlOps {
            program,
            ops,
            reply,
        })
    }

    /// `fade_samples` of `None` or ≤ 0 uses the configured default
    pub fn swap_control_ops(
        &mut self,
        program: ProgramId,
        ops: Vec<u32>,
        fade_samples: Option<i64>,
    ) -> EngineResult<Reply<EngineResult<OpsApplied>>> {
        let ops = Owned::new(&gc_handle(), ops);
        self.send(|reply| EngineRequest::SwapControlOps {
            program,
            ops,
            fade_samples,
            reply,
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    pub fn start(
        &mut self,
        programs: Vec<ProgramId>,
    ) -> EngineResult<Reply<EngineResult<Vec<ProgramInit>>>> {
        self.send(|reply| EngineRequest::Start { programs, reply })
    }

    /// Stop the listed programs and rewind the transport to 0
    pub fn stop(
        &mut self,
        programs: Vec<ProgramId>,
    ) -> EngineResult<Reply<EngineResult<Vec<ProgramInit>>>> {
        self.send(|reply| EngineRequest::Stop { programs, reply })
    }

    pub fn pause(
        &mut self,
        programs: Vec<ProgramId>,
    ) -> EngineResult<Reply<EngineResult<Vec<ProgramInit>>>> {
        self.send(|reply| EngineRequest::Pause { programs, reply })
    }

    pub fn swap_programs(
        &mut self,
        stop: Vec<ProgramId>,
        start: Vec<ProgramId>,
    ) -> EngineResult<Reply<EngineResult<Vec<ProgramInit>>>> {
        self.send(|reply| EngineRequest::SwapPrograms { stop, start, reply })
    }

    /// Seek the transport and the listed programs
    pub fn seek(
        &mut self,
        sample_count: u32,
        programs: Vec<ProgramId>,
        preview: bool,
    ) -> EngineResult<Reply<EngineResult<Vec<ProgramInit>>>> {
        self.send(|reply| EngineRequest::SeekTransport {
            sample_count,
            programs,
            preview,
            reply,
        })
    }

    pub fn seek_programs(
        &mut self,
        sample_count: u32,
        programs: Vec<ProgramId>,
        preview: bool,
    ) -> EngineResult<Reply<EngineResult<Vec<ProgramInit>>>> {
        self.send(|reply| EngineRequest::SeekPrograms {
            sample_count,
            programs,
            preview,
            reply,
        })
    }

    pub fn set_program_gain(
        &mut self,
        program: ProgramId,
        gain: f32,
    ) -> EngineResult<Reply<EngineResult<()>>> {
        self.send(|reply| EngineRequest::SetProgramGain {
            program,
            gain,
            reply,
        })
    }

    /// 0 clears the override
    pub fn set_tempo_override(&mut self, bpm: f32) -> EngineResult<Reply<()>> {
        self.send(|reply| EngineRequest::SetTempoOverride { bpm, reply })
    }

    pub fn set_limiter(&mut self, config: LimiterConfig) -> EngineResult<Reply<()>> {
        self.send(|reply| EngineRequest::SetLimiter { config, reply })
    }

    /// Ask the renderer to republish history snapshots
    pub fn request_history_sync(&self) {
        self.transport.set_history_sync_requested(true);
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub fn stats(&mut self, program: Option<ProgramId>) -> EngineResult<Reply<EngineStats>> {
        self.send(|reply| EngineRequest::GetStats { program, reply })
    }

    pub fn memory_info(&mut self) -> EngineResult<Reply<SampleMemoryInfo>> {
        self.send(|reply| EngineRequest::GetMemoryInfo { reply })
    }

    pub fn required_samples(&mut self) -> EngineResult<Reply<Vec<RequiredSample>>> {
        self.send(|reply| EngineRequest::GetRequiredSamples { reply })
    }

    // ─────────────────────────────────────────────────────────────
    // Samples
    // ─────────────────────────────────────────────────────────────

    pub fn register_sample(&mut self, source: SampleSource) -> EngineResult<Reply<SampleHandle>> {
        self.send(|reply| EngineRequest::RegisterSample { source, reply })
    }

    /// Register audio that is available right away
    pub fn register_inline_sample(
        &mut self,
        channels: Vec<Vec<f32>>,
        sample_rate: u32,
    ) -> EngineResult<Reply<SampleHandle>> {
        let data = Shared::new(&gc_handle(), SampleData::new(channels, sample_rate));
        self.send(|reply| EngineRequest::RegisterInlineSample { data, reply })
    }

    pub fn sync_sample_registrations(
        &mut self,
        invalidated: Vec<SampleHandle>,
        registrations: Vec<(SampleHandle, SampleSource)>,
    ) -> EngineResult<Reply<()>> {
        self.send(|reply| EngineRequest::SyncSampleRegistrations {
            invalidated,
            registrations,
            reply,
        })
    }

    /// Push loaded audio; the reply is false for unknown handles
    pub fn set_sample_data(
        &mut self,
        handle: SampleHandle,
        channels: Vec<Vec<f32>>,
        sample_rate: u32,
    ) -> EngineResult<Reply<bool>> {
        let data = Shared::new(&gc_handle(), SampleData::new(channels, sample_rate));
        self.send(|reply| EngineRequest::SetSampleData {
            handle,
            data,
            reply,
        })
    }

    pub fn set_sample_error(
        &mut self,
        handle: SampleHandle,
        error: impl Into<String>,
    ) -> EngineResult<Reply<bool>> {
        let error = error.into();
        self.send(|reply| EngineRequest::SetSampleError {
            handle,
            error,
            reply,
        })
    }

    /// Push audio captured by the recorder
    pub fn record_sample(
        &mut self,
        handle: SampleHandle,
        channels: Vec<Vec<f32>>,
        sample_rate: u32,
    ) -> EngineResult<Reply<bool>> {
        let data = Shared::new(&gc_handle(), SampleData::new(channels, sample_rate));
        self.send(|reply| EngineRequest::RecordSample {
            handle,
            data,
            reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;

    #[test]
    fn test_full_queue_reports_queue_full() {
        let config = EngineConfig {
            request_queue_capacity: 2,
            ..EngineConfig::default()
        };
        let (_engine, mut client) = Engine::new(config);
        assert!(client.stats(None).is_ok());
        assert!(client.stats(None).is_ok());
        assert_eq!(client.stats(None).unwrap_err(), EngineError::QueueFull);
    }

    #[test]
    fn test_reply_pending_until_quantum() {
        let (mut engine, mut client) = Engine::new(EngineConfig::default());
        let mut reply = client.memory_info().unwrap();
        assert_eq!(
            reply.try_recv(),
            Ok(None),
            "nothing answered before the renderer runs"
        );

        let mut left = [0.0; 64];
        let mut right = [0.0; 64];
        engine.process(&mut left, &mut right);
        assert_eq!(reply.try_recv(), Ok(Some(SampleMemoryInfo::default())));
    }

    #[test]
    fn test_dropped_engine_disconnects_reply() {
        let (engine, mut client) = Engine::new(EngineConfig::default());
        let mut reply = client.stats(None).unwrap();
        drop(engine);
        assert_eq!(reply.try_recv().unwrap_err(), EngineError::Disconnected);
    }

    #[test]
    fn test_blocking_recv_reports_disconnect() {
        let (mut engine, mut client) = Engine::new(EngineConfig::default());
        let answered = client.memory_info().unwrap();

        let mut left = [0.0; 64];
        let mut right = [0.0; 64];
        engine.process(&mut left, &mut right);
        assert_eq!(answered.blocking_recv(), Ok(SampleMemoryInfo::default()));

        let late = client.memory_info().unwrap();
        drop(engine);
        assert_eq!(late.blocking_recv(), Err(EngineError::Disconnected));
    }

    #[test]
    fn test_history_sync_flag() {
        let (_engine, client) = Engine::new(EngineConfig::default());
        assert!(!client.transport().history_sync_requested());
        client.request_history_sync();
        assert!(client.transport().history_sync_requested());
    }

    #[test]
    fn test_poll_events_empty() {
        let (_engine, mut client) = Engine::new(EngineConfig::default());
        assert_eq!(client.poll_events().count(), 0);
    }
}
