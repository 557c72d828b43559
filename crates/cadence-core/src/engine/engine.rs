//! Render-side engine: request dispatch and program lifecycle
//!
//! [`Engine`] lives on the real-time thread. Every call to
//! [`Engine::process`] first drains the request ring, so control operations
//! always take effect between quanta, then renders one quantum through the
//! [`Scheduler`] and forwards its notifications to the control context.
//!
//! The control operations are also public methods, for hosts that drive
//! the engine directly from the thread that owns it.

use std::sync::Arc;

use basedrop::{Owned, Shared};

use super::client::EngineClient;
use super::gc::gc_handle;
use super::program::{Program, ProgramInit};
use super::request::{
    event_channel, request_channel, EngineEvent, EngineRequest, EngineStats, OpsApplied,
};
use super::scheduler::Scheduler;
use super::vm::{scan_tempo, VmBackend};
use crate::config::{EngineConfig, LimiterConfig};
use crate::error::{EngineError, EngineResult};
use crate::samples::{RequiredSample, SampleData, SampleMemoryInfo, SampleRegistry, SampleSource};
use crate::shared::{HistoryExchange, SharedProgramState, SharedTransport};
use crate::types::{ProgramId, ProgramState, SampleHandle, TransportRunning, VmId};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// The loaded processor state, or `NotLoaded`
fn loaded(scheduler: &mut Option<Scheduler>) -> EngineResult<&mut Scheduler> {
    scheduler.as_mut().ok_or(EngineError::NotLoaded)
}

/// Multi-program render engine
pub struct Engine {
    config: EngineConfig,
    requests: rtrb::Consumer<EngineRequest>,
    events: rtrb::Producer<EngineEvent>,
    /// Survives module reloads
    samples: SampleRegistry,
    scheduler: Option<Scheduler>,
}

impl Engine {
    /// Create the render-side engine and its control-side client
    pub fn new(config: EngineConfig) -> (Self, EngineClient) {
        let (request_tx, request_rx) = request_channel(config.request_queue_capacity);
        let (event_tx, event_rx) = event_channel(config.event_queue_capacity);
        let client = EngineClient::new(request_tx, event_rx, Arc::new(SharedTransport::new()));

        log::info!(
            "Engine created: {} Hz, quantum {}, ops capacity {}",
            config.sample_rate,
            config.quantum,
            config.control_ops_capacity
        );

        let engine = Self {
            samples: SampleRegistry::with_max_slices(config.max_slices),
            config,
            requests: request_rx,
            events: event_tx,
            scheduler: None,
        };
        (engine, client)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.scheduler.is_some()
    }

    pub fn samples(&self) -> &SampleRegistry {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut SampleRegistry {
        &mut self.samples
    }

    /// Render one quantum
    ///
    /// Output is silent until a module is loaded.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        left.fill(0.0);
        right.fill(0.0);

        self.process_requests();

        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let report = scheduler.process(left, right, &mut self.samples);

        if let Some(error) = report.error {
            match &error {
                Some(message) => log::warn!("Render error: {}", message),
                None => log::info!("Rendering recovered"),
            }
            self.emit(EngineEvent::RenderError(error));
        }
        if report.refresh {
            self.emit(EngineEvent::Refresh);
        }
    }

    /// Push a notification; dropped when the ring is full
    fn emit(&mut self, event: EngineEvent) {
        let _ = self.events.push(event);
    }

    /// Execute every queued request
    fn process_requests(&mut self) {
        while let Ok(request) = self.requests.pop() {
            self.handle_request(request);
        }
    }

    /// Replies are best effort: a dropped receiver just means nobody waits
    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::LoadModule {
                backend,
                transport,
                reply,
            } => {
                self.load_module(backend, transport);
                let _ = reply.send(());
            }
            EngineRequest::InitProgram {
                shared,
                history,
                reply,
            } => {
                let _ = reply.send(self.init_program(shared, history));
            }
            EngineRequest::DisposeProgram { program, reply } => {
                let _ = reply.send(self.dispose_program(program));
            }
            EngineRequest::GetProgramShared { program, reply } => {
                let _ = reply.send(self.program_init(program));
            }
            EngineRequest::GetVmInfo { program, reply } => {
                let _ = reply.send(self.vm_info(program));
            }
            EngineRequest::MemoryGrow { delta_pages, reply } => {
                let _ = reply.send(self.memory_grow(delta_pages));
            }
            EngineRequest::SetControlOps { program, ops, reply } => {
                let _ = reply.send(self.set_control_ops(program, &ops));
            }
            EngineRequest::SwapControlOps {
                program,
                ops,
                fade_samples,
                reply,
            } => {
                let _ = reply.send(self.swap_control_ops(program, &ops, fade_samples));
            }
            EngineRequest::Start { programs, reply } => {
                let _ = reply.send(self.start(&programs));
            }
            EngineRequest::Stop { programs, reply } => {
                let _ = reply.send(self.stop(&programs));
            }
            EngineRequest::Pause { programs, reply } => {
                let _ = reply.send(self.pause(&programs));
            }
            EngineRequest::SwapPrograms { stop, start, reply } => {
                let _ = reply.send(self.swap_programs(&stop, &start));
            }
            EngineRequest::SeekTransport {
                sample_count,
                programs,
                preview,
                reply,
            } => {
                let _ = reply.send(self.seek(sample_count, &programs, preview));
            }
            EngineRequest::SeekPrograms {
                sample_count,
                programs,
                preview,
                reply,
            } => {
                let _ = reply.send(self.seek_programs(sample_count, &programs, preview));
            }
            EngineRequest::SetProgramGain {
                program,
                gain,
                reply,
            } => {
                let _ = reply.send(self.set_program_gain(program, gain));
            }
            EngineRequest::SetTempoOverride { bpm, reply } => {
                self.set_tempo_override(bpm);
                let _ = reply.send(());
            }
            EngineRequest::SetLimiter { config, reply } => {
                self.set_limiter(config);
                let _ = reply.send(());
            }
            EngineRequest::GetStats { program, reply } => {
                let _ = reply.send(self.stats(program));
            }
            EngineRequest::GetMemoryInfo { reply } => {
                let _ = reply.send(self.samples.memory_info());
            }
            EngineRequest::GetRequiredSamples { reply } => {
                let _ = reply.send(self.required_samples());
            }
            EngineRequest::RegisterSample { source, reply } => {
                let _ = reply.send(self.register_sample(source));
            }
            EngineRequest::RegisterInlineSample { data, reply } => {
                let _ = reply.send(self.register_inline_sample(data));
            }
            EngineRequest::SyncSampleRegistrations {
                invalidated,
                registrations,
                reply,
            } => {
                self.sync_sample_registrations(&invalidated, &registrations);
                let _ = reply.send(());
            }
            EngineRequest::SetSampleData {
                handle,
                data,
                reply,
            } => {
                let _ = reply.send(self.set_sample_data(handle, data));
            }
            EngineRequest::SetSampleError {
                handle,
                error,
                reply,
            } => {
                let _ = reply.send(self.set_sample_error(handle, error));
            }
            EngineRequest::RecordSample {
                handle,
                data,
                reply,
            } => {
                let _ = reply.send(self.record_sample(handle, data));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Replace the processor state; existing programs are disposed first
    pub fn load_module(&mut self, backend: Box<dyn VmBackend>, transport: Arc<SharedTransport>) {
        if let Some(mut previous) = self.scheduler.take() {
            log::info!(
                "Replacing engine module, disposing {} programs",
                previous.programs.len()
            );
            previous.dispose_programs();
            drop(Owned::new(&gc_handle(), previous));
        }
        self.scheduler = Some(Scheduler::new(backend, transport, &self.config));
        log::info!("Engine module loaded");
    }

    /// Create a stopped program at the current engine tempo
    pub fn init_program(
        &mut self,
        shared: Arc<SharedProgramState>,
        history: Option<Arc<HistoryExchange>>,
    ) -> EngineResult<ProgramInit> {
        let capacity = self.config.control_ops_capacity;
        let s = loaded(&mut self.scheduler)?;

        let id = ProgramId(s.next_program_id);
        s.next_program_id += 1;
        let vm_ids = [s.alloc_vm_id(), s.alloc_vm_id()];

        let program = Program::new(id, vm_ids, capacity, shared, history, s.bpm);
        let init = program.init();
        s.insert_program(program);

        log::info!("Program {} created on instances {} / {}", id, vm_ids[0], vm_ids[1]);
        Ok(init)
    }

    /// Reset and release a program's instances and recycle their ids
    pub fn dispose_program(&mut self, id: ProgramId) -> EngineResult<()> {
        let s = loaded(&mut self.scheduler)?;
        let Some(program) = s.programs.remove(&id) else {
            log::warn!("Program not found with id: {}", id);
            return Err(EngineError::ProgramNotFound(id));
        };

        program.reset(&mut *s.backend);
        program.dispose(&mut *s.backend);
        s.free_vm_ids.extend(program.vm_ids());
        s.pending.remove(&id);
        s.preview_ids.retain(|&p| p != id);
        drop(Owned::new(&gc_handle(), program));

        log::info!("Program {} disposed", id);
        Ok(())
    }

    pub fn program_init(&mut self, id: ProgramId) -> EngineResult<ProgramInit> {
        Ok(loaded(&mut self.scheduler)?.program(id)?.init())
    }

    /// Engine instance of the program's active slot
    pub fn vm_info(&mut self, id: ProgramId) -> EngineResult<VmId> {
        Ok(loaded(&mut self.scheduler)?.program(id)?.active_slot().vm())
    }

    pub fn memory_grow(&mut self, delta_pages: u32) -> EngineResult<u32> {
        let s = loaded(&mut self.scheduler)?;
        let previous = s.backend.memory_grow(delta_pages);
        log::debug!("Engine memory grown by {} pages (was {})", delta_pages, previous);
        Ok(previous)
    }

    // ─────────────────────────────────────────────────────────────
    // Control ops
    // ─────────────────────────────────────────────────────────────

    /// Replace the ops of the program's active slot
    ///
    /// Returns a waiter when the program is playing; it resolves once a
    /// quantum has been rendered with the new ops.
    pub fn set_control_ops(&mut self, id: ProgramId, ops: &[u32]) -> EngineResult<OpsApplied> {
        let s = loaded(&mut self.scheduler)?;
        let running = s.transport.running();
        let program = s.program_mut(id)?;

        let slot = program.active_slot_index();
        let playing = program.state() == ProgramState::Start && running == TransportRunning::Start;
        let written = program.apply_ops(slot, ops);
        let stored = written.len();
        let tempo = scan_tempo(written);
        s.adopt_tempo(tempo);

        log::debug!("Program {} ops applied to slot {} ({} words)", id, slot, stored);
        Ok(playing.then(|| s.await_applied(id, slot)))
    }

    /// Clone the active slot into the other one and switch to it with `ops`
    ///
    /// Crossfades over `fade_samples` (non-positive or absent: the configured
    /// default) when playing, switches immediately otherwise.
    pub fn swap_control_ops(
        &mut self,
        id: ProgramId,
        ops: &[u32],
        fade_samples: Option<i64>,
    ) -> EngineResult<OpsApplied> {
        let fade = match fade_samples {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => self.config.swap_fade_samples,
        };
        let s = loaded(&mut self.scheduler)?;
        let running = s.transport.running();
        let Some(program) = s.programs.get_mut(&id) else {
            log::warn!("Program not found with id: {}", id);
            return Err(EngineError::ProgramNotFound(id));
        };

        let playing = program.state() == ProgramState::Start && running == TransportRunning::Start;
        let (from, to) = program.swap(&mut *s.backend, ops, playing.then_some(fade))?;
        let tempo = scan_tempo(program.slot(to).ops());
        s.adopt_tempo(tempo);

        if playing {
            log::debug!("Program {} swapping slot {} -> {} over {} samples", id, from, to, fade);
        } else {
            log::debug!("Program {} swapped to slot {}", id, to);
        }
        Ok(playing.then(|| s.await_applied(id, to)))
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    /// Apply `state` to every listed program; nothing changes on error
    fn set_programs_state(s: &mut Scheduler, state: ProgramState, ids: &[ProgramId]) -> EngineResult<()> {
        s.check_programs(ids)?;
        for id in ids {
            if let Some(p) = s.programs.get_mut(id) {
                p.set_state(state);
            }
        }
        Ok(())
    }

    /// Start the listed programs and the transport
    pub fn start(&mut self, ids: &[ProgramId]) -> EngineResult<Vec<ProgramInit>> {
        let s = loaded(&mut self.scheduler)?;
        Self::set_programs_state(s, ProgramState::Start, ids)?;
        s.transport.set_running(TransportRunning::Start);
        log::info!("Transport started with programs {:?}", ids);
        Ok(s.inits())
    }

    /// Schedule stop-and-seek-to-zero for the listed programs
    ///
    /// Executed by the next quantum.
    pub fn stop(&mut self, ids: &[ProgramId]) -> EngineResult<Vec<ProgramInit>> {
        let s = loaded(&mut self.scheduler)?;
        s.stop_and_seek_ids.clear();
        s.stop_and_seek_ids.extend_from_slice(ids);
        s.transport.set_stop_and_seek_to_zero(true);
        s.transport.set_running(TransportRunning::Stop);
        log::info!("Transport stopping, programs {:?}", ids);
        Ok(s.inits())
    }

    /// Pause the listed programs; the transport pauses once none is started
    pub fn pause(&mut self, ids: &[ProgramId]) -> EngineResult<Vec<ProgramInit>> {
        let s = loaded(&mut self.scheduler)?;
        Self::set_programs_state(s, ProgramState::Pause, ids)?;
        let any_started = s
            .programs
            .values()
            .any(|p| p.state() == ProgramState::Start);
        if !any_started {
            s.transport.set_running(TransportRunning::Pause);
            log::info!("Transport paused");
        }
        Ok(s.inits())
    }

    /// Stop one set of programs and start another
    pub fn swap_programs(
        &mut self,
        stop: &[ProgramId],
        start: &[ProgramId],
    ) -> EngineResult<Vec<ProgramInit>> {
        let s = loaded(&mut self.scheduler)?;
        s.check_programs(start)?;
        Self::set_programs_state(s, ProgramState::Stop, stop)?;
        Self::set_programs_state(s, ProgramState::Start, start)?;
        log::info!("Programs {:?} replaced by {:?}", stop, start);
        Ok(s.inits())
    }

    /// Seek the transport and the listed programs
    pub fn seek(
        &mut self,
        sample_count: u32,
        ids: &[ProgramId],
        preview: bool,
    ) -> EngineResult<Vec<ProgramInit>> {
        let s = loaded(&mut self.scheduler)?;
        s.check_programs(ids)?;
        s.transport.seek(sample_count);
        log::info!("Transport seek to sample {}", sample_count);
        self.seek_programs(sample_count, ids, preview)
    }

    /// Move the listed programs to `sample_count`
    ///
    /// With `preview` the listed programs render from there for the
    /// configured number of quanta without advancing the live timeline.
    pub fn seek_programs(
        &mut self,
        sample_count: u32,
        ids: &[ProgramId],
        preview: bool,
    ) -> EngineResult<Vec<ProgramInit>> {
        let preview_quanta = self.config.preview_seek_quanta;
        let s = loaded(&mut self.scheduler)?;
        s.check_programs(ids)?;
        for id in ids {
            if let Some(p) = s.programs.get_mut(id) {
                p.seek(sample_count);
            }
        }
        if preview {
            s.preview_ids.clear();
            s.preview_ids.extend_from_slice(ids);
            s.preview_quanta = preview_quanta;
        }
        log::debug!("Programs {:?} seek to sample {} (preview: {})", ids, sample_count, preview);
        Ok(s.inits())
    }

    /// Non-finite gains are treated as 0
    pub fn set_program_gain(&mut self, id: ProgramId, gain: f32) -> EngineResult<()> {
        let s = loaded(&mut self.scheduler)?;
        let program = s.program_mut(id)?;
        program.gain = if gain.is_finite() { gain } else { 0.0 };
        Ok(())
    }

    /// Override the engine tempo; 0 (or a non-finite value) clears it
    ///
    /// Ignored when no module is loaded.
    pub fn set_tempo_override(&mut self, bpm: f32) {
        let Some(s) = self.scheduler.as_mut() else {
            return;
        };
        let bpm = if bpm.is_finite() { bpm } else { 0.0 };
        s.bpm_override = bpm;
        s.backend.set_tempo_override(bpm);
        if bpm != 0.0 {
            s.bpm = bpm;
        }
        log::info!("Tempo override: {}", bpm);
    }

    /// Update the limiter; also kept for modules loaded later
    pub fn set_limiter(&mut self, config: LimiterConfig) {
        self.config.limiter = config;
        if let Some(s) = self.scheduler.as_mut() {
            s.limiter.set_params(config);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    /// Engine statistics, optionally with one program's details
    pub fn stats(&self, program: Option<ProgramId>) -> EngineStats {
        let Some(s) = self.scheduler.as_ref() else {
            return EngineStats::unloaded(program);
        };
        let selected = program.and_then(|id| s.programs.get(&id));
        EngineStats {
            memory_usage: s.backend.memory_usage() as f64 / BYTES_PER_MIB,
            has_core: true,
            sample_count: s.sample_count(),
            bpm: s.bpm,
            bpm_override: s.bpm_override,
            program_count: s.programs.len(),
            program_id: program,
            program_state: selected.map_or(ProgramState::Stop, |p| p.state()),
            control_ops_length: selected.map_or(0, |p| p.active_slot().ops_len()),
            program_sample_count: selected.map_or(0, |p| p.sample_count()),
        }
    }

    pub fn memory_info(&self) -> SampleMemoryInfo {
        self.samples.memory_info()
    }

    pub fn required_samples(&self) -> Vec<RequiredSample> {
        self.samples.required_samples()
    }

    // ─────────────────────────────────────────────────────────────
    // Samples
    // ─────────────────────────────────────────────────────────────

    pub fn register_sample(&mut self, source: SampleSource) -> SampleHandle {
        let handle = self.samples.register(source);
        log::debug!("Sample {} registered", handle);
        handle
    }

    pub fn register_inline_sample(&mut self, data: Shared<SampleData>) -> SampleHandle {
        self.samples.register_inline(data)
    }

    /// Mirror registrations made by the control context
    pub fn sync_sample_registrations(
        &mut self,
        invalidated: &[SampleHandle],
        registrations: &[(SampleHandle, SampleSource)],
    ) {
        self.samples.sync_registrations(invalidated, registrations);
        log::debug!(
            "Sample registrations synced: {} invalidated, {} mirrored",
            invalidated.len(),
            registrations.len()
        );
    }

    pub fn set_sample_data(&mut self, handle: SampleHandle, data: Shared<SampleData>) -> bool {
        let known = self.samples.set_data(handle, data);
        if known {
            log::debug!("Sample {} data set", handle);
        } else {
            log::warn!("Sample data for unknown handle {}", handle);
        }
        known
    }

    pub fn set_sample_error(&mut self, handle: SampleHandle, error: String) -> bool {
        log::warn!("Sample {} failed to load: {}", handle, error);
        self.samples.set_error(handle, error)
    }

    pub fn record_sample(&mut self, handle: SampleHandle, data: Shared<SampleData>) -> bool {
        let known = self.samples.record_sample(handle, data);
        if known {
            log::debug!("Sample {} recorded", handle);
        }
        known
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockProbe, MockVm};
    use crate::engine::request::Reply;
    use crate::engine::vm::Opcode;

    const Q: usize = 128;

    struct Rig {
        engine: Engine,
        client: EngineClient,
        probe: MockProbe,
    }

    impl Rig {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let (engine, mut client) = Engine::new(EngineConfig::default());
            let vm = MockVm::new();
            let probe = vm.probe();
            let loaded = client.load_module(Box::new(vm)).unwrap();
            let mut rig = Self {
                engine,
                client,
                probe,
            };
            rig.reply(loaded);
            rig
        }

        /// Render one quantum, returning the left channel
        fn quantum(&mut self) -> Vec<f32> {
            let mut left = vec![1.0; Q];
            let mut right = vec![1.0; Q];
            self.engine.process(&mut left, &mut right);
            left
        }

        /// Run a quantum so the request executes, then take its reply
        fn reply<T>(&mut self, mut reply: Reply<T>) -> T {
            self.quantum();
            reply
                .try_recv()
                .ok()
                .flatten()
                .expect("request answered within one quantum")
        }

        fn program(&mut self, level: f32) -> ProgramInit {
            let reply = self.client.init_program(true).unwrap();
            let init = self.reply(reply).unwrap();
            self.probe.set_level(init.vm_ids[0], level);
            self.probe.set_level(init.vm_ids[1], level);
            init
        }

        fn set_ops(&mut self, id: ProgramId, ops: Vec<u32>) -> OpsApplied {
            let reply = self.client.set_control_ops(id, ops).unwrap();
            self.reply(reply).unwrap()
        }

        fn start(&mut self, ids: Vec<ProgramId>) -> Vec<ProgramInit> {
            let reply = self.client.start(ids).unwrap();
            self.reply(reply).unwrap()
        }

        fn stats(&mut self, program: Option<ProgramId>) -> EngineStats {
            let reply = self.client.stats(program).unwrap();
            self.reply(reply)
        }
    }

    fn out_op() -> Vec<u32> {
        vec![Opcode::Out as u32, 0]
    }

    fn tempo_ops(bpm: f32) -> Vec<u32> {
        vec![Opcode::SetBpm as u32, bpm.to_bits(), Opcode::Out as u32, 0]
    }

    #[test]
    fn test_requests_without_module_fail_not_loaded() {
        let (mut engine, mut client) = Engine::new(EngineConfig::default());
        let mut start = client.start(vec![ProgramId(0)]).unwrap();
        let mut stats = client.stats(None).unwrap();

        let mut left = vec![1.0; Q];
        let mut right = vec![1.0; Q];
        engine.process(&mut left, &mut right);

        assert_eq!(
            start.try_recv().unwrap().unwrap().unwrap_err(),
            EngineError::NotLoaded
        );
        assert!(!stats.try_recv().unwrap().unwrap().has_core);
        assert!(left.iter().all(|&s| s == 0.0), "silent without a module");
    }

    #[test]
    fn test_init_program_allocates_ids() {
        let mut rig = Rig::new();
        let a = rig.program(0.0);
        let b = rig.program(0.0);
        assert_eq!(a.id, ProgramId(0));
        assert_eq!(b.id, ProgramId(1));
        assert_eq!(a.vm_ids, [VmId(0), VmId(1)]);
        assert_eq!(b.vm_ids, [VmId(2), VmId(3)]);
        assert_eq!(a.shared.state(), ProgramState::Stop);
        assert_eq!(a.shared.bpm(), 120.0);
        assert!(a.history.is_some());
    }

    #[test]
    fn test_dispose_recycles_instance_ids_not_program_ids() {
        let mut rig = Rig::new();
        let a = rig.program(0.0);
        let reply = rig.client.dispose_program(a.id).unwrap();
        rig.reply(reply).unwrap();

        assert_eq!(rig.probe.resets(), vec![VmId(0), VmId(1)]);
        assert_eq!(rig.probe.disposed(), vec![VmId(0), VmId(1)]);

        let b = rig.program(0.0);
        assert_eq!(b.id, ProgramId(1), "program ids are never reused");
        let mut vms = b.vm_ids.to_vec();
        vms.sort();
        assert_eq!(vms, vec![VmId(0), VmId(1)], "instance ids recycled");
        assert_eq!(
            rig.probe.resets(),
            vec![VmId(0), VmId(1), VmId(1), VmId(0)],
            "recycled instances are reset before reuse"
        );

        let reply = rig.client.swap_control_ops(b.id, out_op(), None).unwrap();
        assert!(rig.reply(reply).is_ok(), "recycled instances accept state copies");
    }

    #[test]
    fn test_unknown_program_is_reported() {
        let mut rig = Rig::new();
        let reply = rig.client.set_program_gain(ProgramId(9), 0.5).unwrap();
        assert_eq!(rig.reply(reply), Err(EngineError::ProgramNotFound(ProgramId(9))));

        let a = rig.program(0.0);
        let reply = rig.client.start(vec![a.id, ProgramId(9)]).unwrap();
        assert!(rig.reply(reply).is_err());
        assert_eq!(a.shared.state(), ProgramState::Stop, "no partial state change");
    }

    #[test]
    fn test_ops_tempo_becomes_engine_tempo() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        let b = rig.program(0.1);
        rig.set_ops(a.id, tempo_ops(140.0));

        let stats = rig.stats(None);
        assert_eq!(stats.bpm, 140.0);
        assert_eq!(a.shared.bpm(), 140.0);
        assert_eq!(b.shared.bpm(), 140.0, "tempo propagates to all programs");

        rig.start(vec![a.id]);
        rig.probe.clear_runs();
        rig.quantum();
        assert_eq!(rig.probe.runs()[0].ctx.tempo, 140.0);
    }

    #[test]
    fn test_tempo_override_suppresses_scan() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        let reply = rig.client.set_tempo_override(100.0).unwrap();
        rig.reply(reply);
        assert_eq!(rig.probe.tempo_override(), 100.0);

        rig.set_ops(a.id, tempo_ops(140.0));
        let stats = rig.stats(None);
        assert_eq!(stats.bpm, 100.0);
        assert_eq!(stats.bpm_override, 100.0);

        let reply = rig.client.set_tempo_override(f32::NAN).unwrap();
        rig.reply(reply);
        assert_eq!(rig.stats(None).bpm_override, 0.0, "NaN clears the override");
    }

    #[test]
    fn test_ops_applied_resolves_after_render() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        assert!(rig.set_ops(a.id, out_op()).is_none(), "stopped: nothing to wait for");

        rig.start(vec![a.id]);
        let reply = rig.client.set_control_ops(a.id, out_op()).unwrap();
        // The request and the first render happen in the same quantum
        let mut applied = rig.reply(reply).unwrap().expect("playing program waits");
        assert_eq!(applied.try_recv(), Ok(Some(())));
    }

    #[test]
    fn test_swap_crossfade_completes_after_fade() {
        let mut rig = Rig::new();
        let a = rig.program(0.0);
        rig.probe.set_level(a.vm_ids[0], 1.0);
        rig.set_ops(a.id, out_op());
        rig.start(vec![a.id]);

        let reply = rig.client.swap_control_ops(a.id, out_op(), Some(512)).unwrap();
        let mut applied = rig.reply(reply).unwrap().expect("swap while playing waits");
        assert_eq!(applied.try_recv(), Ok(Some(())));
        assert_eq!(rig.probe.copies(), vec![(a.vm_ids[0], a.vm_ids[1])]);

        // One quantum of the fade already rendered with the request
        for _ in 0..3 {
            let left = rig.quantum();
            assert!(left[0] > 0.0, "old slot still audible during fade");
        }
        let left = rig.quantum();
        assert_eq!(left[0], 0.0, "fully on the new slot after 512 samples");

        let stats = rig.stats(Some(a.id));
        assert_eq!(stats.program_state, ProgramState::Start);
        let reply = rig.client.vm_info(a.id).unwrap();
        assert_eq!(rig.reply(reply).unwrap(), a.vm_ids[1]);

        let reply = rig.client.swap_control_ops(a.id, out_op(), None).unwrap();
        assert!(rig.reply(reply).is_ok(), "next swap may proceed");
    }

    #[test]
    fn test_swap_while_stopped_is_immediate() {
        let mut rig = Rig::new();
        let a = rig.program(0.0);
        let reply = rig.client.swap_control_ops(a.id, out_op(), Some(512)).unwrap();
        assert!(rig.reply(reply).unwrap().is_none());
        let reply = rig.client.vm_info(a.id).unwrap();
        assert_eq!(rig.reply(reply).unwrap(), a.vm_ids[1]);
    }

    #[test]
    fn test_stop_and_seek_to_zero_with_three_programs() {
        let mut rig = Rig::new();
        let programs: Vec<_> = (0..3).map(|_| rig.program(0.2)).collect();
        let ids: Vec<_> = programs.iter().map(|p| p.id).collect();
        for &id in &ids {
            rig.set_ops(id, out_op());
        }
        rig.start(ids.clone());
        for _ in 0..4 {
            rig.quantum();
        }
        assert!(programs[0].shared.sample_count() > 0);

        let mut reply = rig.client.stop(ids).unwrap();
        let left = rig.quantum();
        assert_eq!(reply.try_recv().unwrap().unwrap().unwrap().len(), 3);

        assert!(left.iter().all(|&s| s == 0.0), "stop quantum is silent");
        let transport = rig.client.transport();
        assert_eq!(transport.sample_count(), 0);
        assert_eq!(transport.running(), TransportRunning::Stop);
        for p in &programs {
            assert_eq!(p.shared.sample_count(), 0);
            assert_eq!(p.shared.state(), ProgramState::Stop);
        }
    }

    #[test]
    fn test_pause_keeps_transport_while_others_play() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        let b = rig.program(0.1);
        rig.start(vec![a.id, b.id]);

        let reply = rig.client.pause(vec![a.id]).unwrap();
        rig.reply(reply).unwrap();
        assert_eq!(rig.client.transport().running(), TransportRunning::Start);
        assert_eq!(a.shared.state(), ProgramState::Pause);

        let reply = rig.client.pause(vec![b.id]).unwrap();
        rig.reply(reply).unwrap();
        assert_eq!(rig.client.transport().running(), TransportRunning::Pause);
    }

    #[test]
    fn test_swap_programs() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        let b = rig.program(0.1);
        rig.start(vec![a.id]);
        let reply = rig.client.swap_programs(vec![a.id], vec![b.id]).unwrap();
        assert_eq!(rig.reply(reply).unwrap().len(), 2);
        assert_eq!(a.shared.state(), ProgramState::Stop);
        assert_eq!(b.shared.state(), ProgramState::Start);
    }

    #[test]
    fn test_seek_is_idempotent() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        rig.set_ops(a.id, out_op());
        rig.start(vec![a.id]);

        let version = rig.client.transport().seek_version();
        let reply = rig.client.seek(4800, vec![a.id], false).unwrap();
        rig.reply(reply).unwrap();
        // Adopted and rendered one quantum in the same call
        assert_eq!(a.shared.sample_count(), 4800 + Q as u32);

        let reply = rig.client.seek(4800, vec![a.id], false).unwrap();
        rig.reply(reply).unwrap();
        assert_eq!(a.shared.sample_count(), 4800 + Q as u32);
        assert_eq!(rig.client.transport().seek_version(), version + 2);
    }

    #[test]
    fn test_loop_region_wraps_program() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        rig.set_ops(a.id, out_op());
        rig.client.transport().set_loop(0, 48000);
        let reply = rig.client.seek(47900, vec![a.id], false).unwrap();
        rig.reply(reply).unwrap();
        rig.start(vec![a.id]);
        assert_eq!(a.shared.sample_count(), 28);
    }

    #[test]
    fn test_preview_seek_freezes_live_counter() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        rig.set_ops(a.id, out_op());
        let reply = rig.client.seek_programs(9600, vec![a.id], true).unwrap();
        rig.reply(reply).unwrap();

        assert_eq!(rig.client.transport().running(), TransportRunning::Stop);
        assert_eq!(rig.probe.runs().last().unwrap().ctx.sample_count, 9600);
        for _ in 1..PREVIEW_QUANTA {
            rig.quantum();
        }
        assert_eq!(a.shared.sample_count(), 9600, "live counter untouched");

        rig.probe.clear_runs();
        rig.quantum();
        assert!(rig.probe.runs().is_empty(), "preview over");
    }

    const PREVIEW_QUANTA: u32 = crate::types::PREVIEW_SEEK_QUANTA;

    #[test]
    fn test_program_gain() {
        let mut rig = Rig::new();
        let a = rig.program(0.5);
        rig.set_ops(a.id, out_op());
        rig.start(vec![a.id]);
        let reply = rig.client.set_program_gain(a.id, 0.5).unwrap();
        rig.reply(reply).unwrap();
        let left = rig.quantum();
        assert!((left[0] - 0.25).abs() < 1e-6);

        let reply = rig.client.set_program_gain(a.id, f32::INFINITY).unwrap();
        rig.reply(reply).unwrap();
        let left = rig.quantum();
        assert_eq!(left[0], 0.0);
    }

    #[test]
    fn test_render_error_events_are_deduplicated() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        rig.set_ops(a.id, out_op());
        rig.start(vec![a.id]);
        rig.client.poll_events().for_each(drop);

        rig.probe.fail(a.vm_ids[0]);
        for _ in 0..3 {
            rig.quantum();
        }
        rig.probe.heal(a.vm_ids[0]);
        rig.quantum();

        let errors: Vec<_> = rig
            .client
            .poll_events()
            .filter(|e| matches!(e, EngineEvent::RenderError(_)))
            .collect();
        assert_eq!(errors.len(), 2, "one error and one recovery: {:?}", errors);
        assert!(matches!(errors[0], EngineEvent::RenderError(Some(_))));
        assert_eq!(errors[1], EngineEvent::RenderError(None));
    }

    #[test]
    fn test_stats_report_program() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        rig.set_ops(a.id, out_op());
        let stats = rig.stats(Some(a.id));
        assert!(stats.has_core);
        assert_eq!(stats.program_count, 1);
        assert_eq!(stats.control_ops_length, 2);
        assert!(stats.memory_usage > 0.0);
    }

    #[test]
    fn test_reload_disposes_programs_keeps_samples() {
        let mut rig = Rig::new();
        let a = rig.program(0.1);
        let reply = rig
            .client
            .register_sample(SampleSource::External { id: "kick".into() })
            .unwrap();
        let handle = rig.reply(reply);

        let reply = rig.client.load_module(Box::new(MockVm::new())).unwrap();
        rig.reply(reply);
        assert_eq!(rig.probe.disposed(), a.vm_ids.to_vec());
        assert_eq!(rig.stats(None).program_count, 0);
        assert!(rig.engine.samples().get(handle).is_some(), "registry survives");
    }

    #[test]
    fn test_sample_requests() {
        let mut rig = Rig::new();
        let reply = rig
            .client
            .register_sample(SampleSource::External { id: "snare".into() })
            .unwrap();
        let handle = rig.reply(reply);

        let reply = rig.client.required_samples().unwrap();
        assert_eq!(rig.reply(reply).len(), 1);

        let reply = rig
            .client
            .set_sample_data(handle, vec![vec![0.5; 256]], 48000)
            .unwrap();
        assert!(rig.reply(reply));
        let reply = rig.client.required_samples().unwrap();
        assert!(rig.reply(reply).is_empty());

        let reply = rig.client.memory_info().unwrap();
        assert_eq!(rig.reply(reply).total_channel_bytes, 256 * 4);
    }
}
