//! Test double for the bytecode engine
//!
//! Every instance renders a constant level (0 unless set). The level belongs
//! to the instance and is not part of the state cloned by `copy_state`, so a
//! crossfade between two slots is audible in the output. A disposed
//! instance is unknown until it is reset again. Calls are logged
//! behind a shared handle that tests keep after the backend is moved into
//! the engine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::vm::{RunContext, VmBackend, VmOutput};
use crate::error::VmError;
use crate::samples::SampleRegistry;
use crate::types::VmId;

/// One recorded `run` call
#[derive(Debug, Clone, PartialEq)]
pub struct MockRun {
    pub vm: VmId,
    pub ops: Vec<u32>,
    pub ctx: RunContext,
}

#[derive(Default)]
struct MockLog {
    levels: HashMap<VmId, f32>,
    faults: HashSet<VmId>,
    retired: HashSet<VmId>,
    history: HashMap<VmId, Vec<u32>>,
    runs: Vec<MockRun>,
    copies: Vec<(VmId, VmId)>,
    resets: Vec<VmId>,
    disposed: Vec<VmId>,
    collects: usize,
    tempo_override: f32,
    generation: u64,
    pages: u32,
}

#[derive(Default)]
struct MockOutput {
    left: Vec<f32>,
    right: Vec<f32>,
    history: Vec<u32>,
}

/// Mock engine backend
pub struct MockVm {
    log: Arc<Mutex<MockLog>>,
    outputs: HashMap<VmId, MockOutput>,
}

/// Handle for steering and inspecting a [`MockVm`] after it moved
#[derive(Clone)]
pub struct MockProbe {
    log: Arc<Mutex<MockLog>>,
}

impl MockVm {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(MockLog {
                pages: 1,
                ..MockLog::default()
            })),
            outputs: HashMap::new(),
        }
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            log: Arc::clone(&self.log),
        }
    }

    pub fn copies(&self) -> Vec<(VmId, VmId)> {
        self.probe().copies()
    }

    fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap()
    }
}

impl Default for MockVm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProbe {
    fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap()
    }

    pub fn set_level(&self, vm: VmId, level: f32) {
        self.log().levels.insert(vm, level);
    }

    /// Make every subsequent `run` of `vm` fail
    pub fn fail(&self, vm: VmId) {
        self.log().faults.insert(vm);
    }

    pub fn heal(&self, vm: VmId) {
        self.log().faults.remove(&vm);
    }

    /// History words `vm` reports after each run
    pub fn set_history(&self, vm: VmId, words: Vec<u32>) {
        self.log().history.insert(vm, words);
    }

    /// Simulate the engine replacing its memory region
    pub fn bump_generation(&self) {
        self.log().generation += 1;
    }

    pub fn runs(&self) -> Vec<MockRun> {
        self.log().runs.clone()
    }

    pub fn clear_runs(&self) {
        self.log().runs.clear();
    }

    pub fn copies(&self) -> Vec<(VmId, VmId)> {
        self.log().copies.clone()
    }

    pub fn resets(&self) -> Vec<VmId> {
        self.log().resets.clone()
    }

    pub fn disposed(&self) -> Vec<VmId> {
        self.log().disposed.clone()
    }

    pub fn collects(&self) -> usize {
        self.log().collects
    }

    pub fn tempo_override(&self) -> f32 {
        self.log().tempo_override
    }
}

impl VmBackend for MockVm {
    fn run(
        &mut self,
        vm: VmId,
        ops: &[u32],
        ctx: &RunContext,
        _samples: &mut SampleRegistry,
    ) -> Result<(), VmError> {
        let (level, history) = {
            let mut log = self.log();
            if log.retired.contains(&vm) {
                return Err(VmError::UnknownInstance(vm));
            }
            log.runs.push(MockRun {
                vm,
                ops: ops.to_vec(),
                ctx: *ctx,
            });
            if log.faults.contains(&vm) {
                return Err(VmError::Fault {
                    vm,
                    message: format!("mock fault in instance {}", vm),
                });
            }
            (
                log.levels.get(&vm).copied().unwrap_or(0.0),
                log.history.get(&vm).cloned().unwrap_or_default(),
            )
        };

        let out = self.outputs.entry(vm).or_default();
        out.left.clear();
        out.left.resize(ctx.block_len, level);
        out.right.clear();
        out.right.resize(ctx.block_len, level);
        out.history = history;
        Ok(())
    }

    fn output(&self, vm: VmId) -> VmOutput<'_> {
        match self.outputs.get(&vm) {
            Some(out) => VmOutput {
                left: Some(&out.left),
                right: Some(&out.right),
                history: &out.history,
            },
            None => VmOutput::default(),
        }
    }

    fn reset(&mut self, vm: VmId) {
        self.outputs.remove(&vm);
        let mut log = self.log();
        log.retired.remove(&vm);
        log.resets.push(vm);
    }

    fn dispose(&mut self, vm: VmId) {
        self.outputs.remove(&vm);
        let mut log = self.log();
        log.retired.insert(vm);
        log.disposed.push(vm);
    }

    fn copy_state(&mut self, from: VmId, to: VmId) -> Result<(), VmError> {
        let mut log = self.log();
        if let Some(&vm) = [from, to].iter().find(|vm| log.retired.contains(*vm)) {
            return Err(VmError::UnknownInstance(vm));
        }
        log.copies.push((from, to));
        Ok(())
    }

    fn collect(&mut self) {
        self.log().collects += 1;
    }

    fn memory_generation(&self) -> u64 {
        self.log().generation
    }

    fn memory_usage(&self) -> usize {
        self.log().pages as usize * 65536
    }

    fn memory_grow(&mut self, delta_pages: u32) -> u32 {
        let mut log = self.log();
        let previous = log.pages;
        log.pages += delta_pages;
        previous
    }

    fn set_tempo_override(&mut self, bpm: f32) {
        self.log().tempo_override = bpm;
    }
}
