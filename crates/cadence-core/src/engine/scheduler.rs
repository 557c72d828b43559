//! Per-quantum scheduling loop
//!
//! [`Scheduler::process`] is the real-time entry point. For every output
//! block it, in order:
//!
//! 1. flags a refresh when the engine's memory region was replaced, and
//!    republishes history snapshots when the control context asked for it
//! 2. executes a pending stop-and-seek-to-zero and returns silent
//! 3. adopts a transport seek when the seek version moved
//! 4. returns silent when the transport is not running and no preview seek
//!    is in progress
//! 5. renders every started program with ops (crossfading where a swap is
//!    in flight), advances its counter and resolves "ops applied" waiters
//! 6. limits the mix
//! 7. reports the first error of an error streak, and the recovery
//! 8. counts down a preview seek
//! 9. advances and publishes the transport position
//! 10. flags a refresh when the set of playing programs changed
//!
//! Loop and project-end wraparound are applied to a counter after the block
//! that crossed the boundary was rendered.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use basedrop::Owned;
use tokio::sync::oneshot;

use super::gc::gc_handle;
use super::limiter::Limiter;
use super::program::{crossfade_gains, Crossfade, Program, ProgramInit};
use super::request::Reply;
use super::vm::{RunContext, VmBackend};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, VmError};
use crate::samples::SampleRegistry;
use crate::shared::SharedTransport;
use crate::types::{ProgramId, ProgramState, TransportRunning, VmId, DEFAULT_BPM};

/// Waiter for the first quantum rendered with newly applied ops
pub(crate) struct PendingApplied {
    pub slot: usize,
    pub tx: oneshot::Sender<()>,
}

/// What a quantum wants to tell the control context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantumReport {
    pub refresh: bool,
    /// `Some(Some(msg))` on a new error, `Some(None)` on recovery
    pub error: Option<Option<String>>,
}

/// Renderer-owned processor state for one loaded engine module
pub struct Scheduler {
    pub(crate) backend: Box<dyn VmBackend>,
    pub(crate) transport: Arc<SharedTransport>,
    pub(crate) programs: BTreeMap<ProgramId, Program>,
    pub(crate) pending: HashMap<ProgramId, PendingApplied>,

    // ─── Id allocation ───
    pub(crate) next_program_id: u32,
    pub(crate) next_vm_id: u32,
    pub(crate) free_vm_ids: Vec<VmId>,

    // ─── Tempo ───
    pub(crate) bpm: f32,
    /// 0 when no override is active
    pub(crate) bpm_override: f32,

    // ─── Timeline ───
    /// Exact renderer-side transport position
    pub(crate) sample_count: u32,
    last_seek_version: u32,
    pub(crate) stop_and_seek_ids: Vec<ProgramId>,
    pub(crate) preview_ids: Vec<ProgramId>,
    pub(crate) preview_quanta: u32,

    // ─── Output ───
    pub(crate) limiter: Limiter,
    sample_rate: u32,
    nyquist: f32,
    pi_over_nyquist: f32,

    // ─── Change tracking ───
    memory_generation: u64,
    had_error: bool,
    was_playing: bool,
    playing_ids: Vec<ProgramId>,
    now_playing: Vec<ProgramId>,
}

impl Scheduler {
    pub fn new(
        backend: Box<dyn VmBackend>,
        transport: Arc<SharedTransport>,
        config: &EngineConfig,
    ) -> Self {
        let memory_generation = backend.memory_generation();
        let last_seek_version = transport.seek_version();
        Self {
            backend,
            transport,
            programs: BTreeMap::new(),
            pending: HashMap::new(),
            next_program_id: 0,
            next_vm_id: 0,
            free_vm_ids: Vec::new(),
            bpm: DEFAULT_BPM,
            bpm_override: 0.0,
            sample_count: 0,
            last_seek_version,
            stop_and_seek_ids: Vec::new(),
            preview_ids: Vec::new(),
            preview_quanta: 0,
            limiter: Limiter::new(config.limiter, config.sample_rate),
            sample_rate: config.sample_rate,
            nyquist: config.nyquist(),
            pi_over_nyquist: config.pi_over_nyquist(),
            memory_generation,
            had_error: false,
            was_playing: false,
            playing_ids: Vec::new(),
            now_playing: Vec::new(),
        }
    }

    /// Tempo handed to the engine: the override if set
    #[inline]
    pub fn effective_tempo(&self) -> f32 {
        if self.bpm_override != 0.0 {
            self.bpm_override
        } else {
            self.bpm
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    // ─────────────────────────────────────────────────────────────
    // Program registry
    // ─────────────────────────────────────────────────────────────

    /// Next engine instance id: recycled ids first, reset so the backend
    /// knows them again
    pub(crate) fn alloc_vm_id(&mut self) -> VmId {
        if let Some(id) = self.free_vm_ids.pop() {
            self.backend.reset(id);
            return id;
        }
        let id = VmId(self.next_vm_id);
        self.next_vm_id += 1;
        id
    }

    /// Insert a program and grow per-quantum bookkeeping to match
    pub(crate) fn insert_program(&mut self, program: Program) {
        self.programs.insert(program.id(), program);
        let count = self.programs.len();
        self.now_playing.reserve(count);
        self.playing_ids.reserve(count);
        self.free_vm_ids.reserve(count * 2);
    }

    pub(crate) fn program(&self, id: ProgramId) -> EngineResult<&Program> {
        self.programs.get(&id).ok_or_else(|| not_found(id))
    }

    pub(crate) fn program_mut(&mut self, id: ProgramId) -> EngineResult<&mut Program> {
        self.programs.get_mut(&id).ok_or_else(|| not_found(id))
    }

    /// Fail on the first id that names no program
    pub(crate) fn check_programs(&self, ids: &[ProgramId]) -> EngineResult<()> {
        match ids.iter().find(|id| !self.programs.contains_key(*id)) {
            Some(&id) => Err(not_found(id)),
            None => Ok(()),
        }
    }

    /// Init records of every program
    pub(crate) fn inits(&self) -> Vec<ProgramInit> {
        self.programs.values().map(Program::init).collect()
    }

    /// Adopt a tempo scanned from freshly applied ops
    ///
    /// Ignored while an override is active or when the ops set no tempo.
    pub(crate) fn adopt_tempo(&mut self, bpm: f32) {
        if self.bpm_override != 0.0 || bpm == 0.0 || bpm == self.bpm {
            return;
        }
        self.bpm = bpm;
        for p in self.programs.values() {
            p.set_bpm(bpm);
        }
        log::debug!("Engine tempo set to {} BPM by program ops", bpm);
    }

    /// Register an "ops applied" waiter for `slot` of `program`
    ///
    /// A waiter still pending for the same program resolves immediately:
    /// its ops were superseded.
    pub(crate) fn await_applied(&mut self, program: ProgramId, slot: usize) -> Reply<()> {
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self.pending.insert(program, PendingApplied { slot, tx }) {
            let _ = stale.tx.send(());
        }
        Reply::new(rx)
    }

    /// Reset, release and drop every program
    pub(crate) fn dispose_programs(&mut self) {
        for (_, program) in std::mem::take(&mut self.programs) {
            program.reset(&mut *self.backend);
            program.dispose(&mut *self.backend);
            self.free_vm_ids.extend(program.vm_ids());
            drop(Owned::new(&gc_handle(), program));
        }
        self.pending.clear();
        self.preview_ids.clear();
        self.playing_ids.clear();
    }

    /// Resolve the waiter of `program` if it targets the active slot
    fn resolve_pending(pending: &mut HashMap<ProgramId, PendingApplied>, program: &Program) {
        let ready = pending
            .get(&program.id())
            .is_some_and(|p| p.slot == program.active_slot_index());
        if ready {
            if let Some(p) = pending.remove(&program.id()) {
                // Receiver may be gone; nothing to do then
                let _ = p.tx.send(());
            }
        }
    }

    /// Render one quantum into `left` / `right`
    ///
    /// Both buffers are expected to be zeroed. The block length is the
    /// shorter of the two.
    pub fn process(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        samples: &mut SampleRegistry,
    ) -> QuantumReport {
        let block = left.len().min(right.len());
        let left = &mut left[..block];
        let right = &mut right[..block];
        let mut report = QuantumReport::default();

        if block == 0 {
            self.was_playing = false;
            return report;
        }

        // 1. memory region replaced
        let generation = self.backend.memory_generation();
        if generation != self.memory_generation {
            self.memory_generation = generation;
            report.refresh = true;
        }

        if self.transport.history_sync_requested() {
            self.transport.set_history_sync_requested(false);
            for p in self.programs.values() {
                p.flush_history(&*self.backend);
            }
        }

        // 2. stop and seek to zero
        if self.transport.stop_and_seek_to_zero() {
            self.stop_and_seek_to_zero();
            self.was_playing = false;
            return report;
        }

        // 3. transport seek
        let seek_version = self.transport.seek_version();
        if seek_version != self.last_seek_version {
            self.last_seek_version = seek_version;
            let position = self.transport.sample_count();
            self.sample_count = position;
            for p in self.programs.values() {
                p.set_sample_count(position);
            }
        }

        // 4. idle transport
        let running = self.transport.running();
        if running != TransportRunning::Start && self.preview_quanta == 0 {
            self.transport.set_actually_playing(running);
            self.transport.set_sample_count(self.sample_count);
            if self.was_playing {
                for p in self.programs.values() {
                    p.flush_history(&*self.backend);
                }
            }
            self.was_playing = false;
            return report;
        }
        self.transport.set_actually_playing(running);

        // 5. programs
        let bounds = self.transport.bounds();
        let previewing = self.preview_quanta > 0;
        let tempo = self.effective_tempo();
        self.now_playing.clear();
        let mut fault: Option<VmError> = None;

        for p in self.programs.values_mut() {
            let in_preview = self.preview_ids.contains(&p.id());
            let idle = p.state() != ProgramState::Start || p.active_slot().ops_len() == 0;
            if idle && !in_preview {
                p.flush_history(&*self.backend);
                Self::resolve_pending(&mut self.pending, p);
                continue;
            }

            let base = if previewing {
                p.seek_sample_count
            } else {
                p.sample_count()
            };
            let ctx = RunContext {
                block_len: block,
                sample_count: base,
                sample_rate: self.sample_rate,
                nyquist: self.nyquist,
                pi_over_nyquist: self.pi_over_nyquist,
                tempo,
            };

            let rendered = render_program(&mut *self.backend, samples, p, &ctx, left, right);
            if let Err(e) = rendered {
                fault = Some(e);
                break;
            }

            let advanced = base.wrapping_add(block as u32);
            if previewing {
                p.seek_sample_count = advanced;
            } else {
                p.set_sample_count(bounds.wrap(advanced));
            }

            Self::resolve_pending(&mut self.pending, p);
            self.now_playing.push(p.id());
        }

        // 6. limiter
        self.limiter.process(left, right);

        // 7. error streak
        match fault {
            Some(e) => {
                if !self.had_error {
                    self.had_error = true;
                    report.error = Some(Some(e.to_string()));
                }
            }
            None => {
                if self.had_error {
                    self.had_error = false;
                    report.error = Some(None);
                }
            }
        }

        // 8. preview countdown
        if self.preview_quanta > 0 {
            self.preview_quanta -= 1;
            if self.preview_quanta == 0 {
                self.preview_ids.clear();
                report.refresh = true;
            }
        }

        // 9. transport position
        self.sample_count = bounds.wrap(self.sample_count.wrapping_add(block as u32));
        self.transport.set_sample_count(self.sample_count);

        // 10. playing set
        if self.now_playing != self.playing_ids {
            report.refresh = true;
            std::mem::swap(&mut self.now_playing, &mut self.playing_ids);
        }
        if !self.playing_ids.is_empty() && !self.was_playing {
            report.refresh = true;
            self.was_playing = true;
        }

        report
    }

    /// Stop listed programs, rewind everything to 0 and emit final snapshots
    fn stop_and_seek_to_zero(&mut self) {
        self.transport.set_stop_and_seek_to_zero(false);
        self.transport.set_running(TransportRunning::Stop);
        self.transport.set_actually_playing(TransportRunning::Stop);
        self.last_seek_version = self.transport.seek(0);
        self.sample_count = 0;

        for id in std::mem::take(&mut self.stop_and_seek_ids) {
            if let Some(p) = self.programs.get_mut(&id) {
                p.set_state(ProgramState::Stop);
                p.seek(0);
                if let Some(history) = p.history() {
                    history.clear();
                }
            }
        }

        self.backend.collect();
        for p in self.programs.values() {
            p.flush_history(&*self.backend);
        }
        self.playing_ids.clear();
    }
}

fn not_found(id: ProgramId) -> EngineError {
    log::warn!("Program not found with id: {}", id);
    EngineError::ProgramNotFound(id)
}

/// Render `program` for one quantum, crossfading if a swap is in flight
fn render_program(
    backend: &mut dyn VmBackend,
    samples: &mut SampleRegistry,
    program: &mut Program,
    ctx: &RunContext,
    left: &mut [f32],
    right: &mut [f32],
) -> Result<(), VmError> {
    let gain = program.gain;
    if program.crossfade.is_active() {
        let (out_gain, in_gain) = crossfade_gains(program.crossfade.progress());
        let Crossfade { from, to, .. } = program.crossfade;
        render_slot(backend, samples, program, from, ctx, left, right, out_gain * gain, false)?;
        render_slot(backend, samples, program, to, ctx, left, right, in_gain * gain, true)?;
        program.crossfade.advance(ctx.block_len);
    } else {
        let active = program.active_slot_index();
        render_slot(backend, samples, program, active, ctx, left, right, gain, true)?;
    }
    Ok(())
}

/// Run one slot of `program` and mix its output at `gain`
#[allow(clippy::too_many_arguments)]
fn render_slot(
    backend: &mut dyn VmBackend,
    samples: &mut SampleRegistry,
    program: &Program,
    slot: usize,
    ctx: &RunContext,
    left: &mut [f32],
    right: &mut [f32],
    gain: f32,
    publish_history: bool,
) -> Result<(), VmError> {
    let slot = program.slot(slot);
    backend.run(slot.vm(), slot.ops(), ctx, samples)?;

    let output = backend.output(slot.vm());
    if publish_history {
        program.publish_history(&output);
    }
    if let (Some(l), Some(r)) = (output.left, output.right) {
        for (out, s) in left.iter_mut().zip(l) {
            *out += s * gain;
        }
        for (out, s) in right.iter_mut().zip(r) {
            *out += s * gain;
        }
    }
    Ok(())
}
