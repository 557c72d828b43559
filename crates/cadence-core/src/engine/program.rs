//! Program slots and the crossfade swap protocol
//!
//! Every program owns two slots, each bound to its own engine instance and
//! each holding a double-buffered control-op stream. Normal updates write
//! the inactive op buffer of the active slot and flip it. A swap instead
//! clones the active instance into the other slot, loads the new ops there,
//! and crossfades between the two slots while audio keeps running.

use std::sync::Arc;

use super::vm::{VmBackend, VmOutput};
use crate::shared::{DoubleBuffer, HistoryExchange, SharedProgramState};
use crate::types::{ProgramId, ProgramState, VmId};

/// Fixed-capacity control-op buffer
pub struct OpsBuffer {
    words: Vec<u32>,
    len: usize,
}

impl OpsBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity],
            len: 0,
        }
    }

    /// Copy `ops` in, truncated to capacity; returns the stored length
    pub fn write(&mut self, ops: &[u32]) -> usize {
        let len = ops.len().min(self.words.len());
        self.words[..len].copy_from_slice(&ops[..len]);
        self.len = len;
        len
    }

    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        &self.words[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }
}

/// One of a program's two execution slots
pub struct Slot {
    vm: VmId,
    ops: DoubleBuffer<OpsBuffer>,
}

impl Slot {
    pub fn new(vm: VmId, ops_capacity: usize) -> Self {
        Self {
            vm,
            ops: DoubleBuffer::new(
                OpsBuffer::with_capacity(ops_capacity),
                OpsBuffer::with_capacity(ops_capacity),
            ),
        }
    }

    #[inline]
    pub fn vm(&self) -> VmId {
        self.vm
    }

    /// Ops the renderer executes for this slot
    #[inline]
    pub fn ops(&self) -> &[u32] {
        self.ops.active().as_slice()
    }

    #[inline]
    pub fn ops_len(&self) -> usize {
        self.ops.active().len()
    }

    /// Index of the op buffer currently in use (0 or 1)
    pub fn ops_index(&self) -> usize {
        self.ops.active_index()
    }

    /// Write `ops` into the inactive op buffer and make it active
    ///
    /// Returns the stored (possibly truncated) ops.
    pub fn apply(&mut self, ops: &[u32]) -> &[u32] {
        self.ops.write_inactive(|buf| {
            buf.write(ops);
        });
        self.ops()
    }
}

/// Crossfade bookkeeping between two slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crossfade {
    pub remaining: u32,
    pub total: u32,
    pub from: usize,
    pub to: usize,
}

impl Crossfade {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    pub fn start(&mut self, from: usize, to: usize, samples: u32) {
        self.from = from;
        self.to = to;
        self.remaining = samples;
        self.total = samples;
    }

    pub fn cancel(&mut self) {
        self.remaining = 0;
        self.total = 0;
    }

    /// Fraction of the fade already rendered, in [0, 1]
    pub fn progress(&self) -> f32 {
        let total = self.total.max(1);
        let elapsed = total.saturating_sub(self.remaining);
        (elapsed as f32 / total as f32).clamp(0.0, 1.0)
    }

    /// Account for one rendered block
    pub fn advance(&mut self, block_len: usize) {
        self.remaining = self.remaining.saturating_sub(block_len as u32);
    }
}

/// Gain weights `(outgoing, incoming)` at fade position `t`
///
/// Linear and complementary: the weights always sum to 1.
#[inline]
pub fn crossfade_gains(t: f32) -> (f32, f32) {
    let t = t.clamp(0.0, 1.0);
    (1.0 - t, t)
}

/// Everything the control context needs to observe a program
#[derive(Clone)]
pub struct ProgramInit {
    pub id: ProgramId,
    pub vm_ids: [VmId; 2],
    pub shared: Arc<SharedProgramState>,
    pub control_ops_capacity: usize,
    pub history: Option<Arc<HistoryExchange>>,
}

impl std::fmt::Debug for ProgramInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramInit")
            .field("id", &self.id)
            .field("vm_ids", &self.vm_ids)
            .field("control_ops_capacity", &self.control_ops_capacity)
            .field("has_history", &self.history.is_some())
            .finish()
    }
}

/// A logical sound source
pub struct Program {
    id: ProgramId,
    slots: DoubleBuffer<Slot>,
    /// Output gain; renderer-owned
    pub gain: f32,
    pub crossfade: Crossfade,
    shared: Arc<SharedProgramState>,
    history: Option<Arc<HistoryExchange>>,
    /// Time base used during a preview seek
    pub seek_sample_count: u32,
}

impl Program {
    /// Create a stopped program; the shared record is reset to `bpm`
    pub fn new(
        id: ProgramId,
        vm_ids: [VmId; 2],
        ops_capacity: usize,
        shared: Arc<SharedProgramState>,
        history: Option<Arc<HistoryExchange>>,
        bpm: f32,
    ) -> Self {
        shared.reset(bpm);
        Self {
            id,
            slots: DoubleBuffer::new(
                Slot::new(vm_ids[0], ops_capacity),
                Slot::new(vm_ids[1], ops_capacity),
            ),
            gain: 1.0,
            crossfade: Crossfade::default(),
            shared,
            history,
            seek_sample_count: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn vm_ids(&self) -> [VmId; 2] {
        [self.slots.get(0).vm(), self.slots.get(1).vm()]
    }

    #[inline]
    pub fn active_slot_index(&self) -> usize {
        self.slots.active_index()
    }

    #[inline]
    pub fn active_slot(&self) -> &Slot {
        self.slots.active()
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &Slot {
        self.slots.get(index)
    }

    pub fn shared(&self) -> &Arc<SharedProgramState> {
        &self.shared
    }

    pub fn history(&self) -> Option<&Arc<HistoryExchange>> {
        self.history.as_ref()
    }

    pub fn init(&self) -> ProgramInit {
        ProgramInit {
            id: self.id,
            vm_ids: self.vm_ids(),
            shared: Arc::clone(&self.shared),
            control_ops_capacity: self.slots.get(0).ops.active().capacity(),
            history: self.history.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> ProgramState {
        self.shared.state()
    }

    /// Transition to `state`
    ///
    /// Entering Start empties the history packs; any state other than Start
    /// cancels an in-progress crossfade.
    pub fn set_state(&mut self, state: ProgramState) {
        if state == ProgramState::Start {
            if let Some(history) = &self.history {
                history.clear();
            }
        }
        self.shared.set_state(state);
        if state != ProgramState::Start {
            self.crossfade.cancel();
        }
    }

    #[inline]
    pub fn sample_count(&self) -> u32 {
        self.shared.sample_count()
    }

    #[inline]
    pub fn set_sample_count(&self, samples: u32) {
        self.shared.set_sample_count(samples);
    }

    /// Move both the live and the preview position
    pub fn seek(&mut self, samples: u32) {
        self.set_sample_count(samples);
        self.seek_sample_count = samples;
    }

    pub fn set_bpm(&self, bpm: f32) {
        self.shared.set_bpm(bpm);
    }

    // ─────────────────────────────────────────────────────────────
    // Ops and swaps
    // ─────────────────────────────────────────────────────────────

    /// Load `ops` into slot `slot` through its inactive op buffer
    ///
    /// Returns the stored ops (truncated to capacity).
    pub fn apply_ops(&mut self, slot: usize, ops: &[u32]) -> &[u32] {
        self.slots.get_mut(slot).apply(ops)
    }

    /// Swap to the other slot with new ops
    ///
    /// The active instance's state is cloned into the other slot first, so
    /// the new ops continue from where the old ones are. With `fade` set the
    /// two slots crossfade over that many samples; without it the switch is
    /// immediate. Returns `(from, to)`.
    pub fn swap(
        &mut self,
        backend: &mut dyn VmBackend,
        ops: &[u32],
        fade: Option<u32>,
    ) -> Result<(usize, usize), crate::error::VmError> {
        let from = self.active_slot_index();
        let to = from ^ 1;
        backend.copy_state(self.slots.get(from).vm(), self.slots.get(to).vm())?;
        self.apply_ops(to, ops);

        match fade {
            Some(samples) if samples > 0 => self.crossfade.start(from, to, samples),
            _ => self.crossfade.cancel(),
        }
        self.slots.set_active(to);
        Ok((from, to))
    }

    // ─────────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────────

    /// Publish a history snapshot from an instance output
    pub fn publish_history(&self, output: &VmOutput<'_>) {
        if let Some(history) = &self.history {
            history.publish(output.history);
        }
    }

    /// Publish whatever history the active instance currently holds
    pub fn flush_history(&self, backend: &dyn VmBackend) {
        if self.history.is_some() {
            let output = backend.output(self.active_slot().vm());
            self.publish_history(&output);
        }
    }

    /// Reset both instances
    pub fn reset(&self, backend: &mut dyn VmBackend) {
        for vm in self.vm_ids() {
            backend.reset(vm);
        }
    }

    /// Release both instances
    pub fn dispose(&self, backend: &mut dyn VmBackend) {
        for vm in self.vm_ids() {
            backend.dispose(vm);
        }
    }
}
