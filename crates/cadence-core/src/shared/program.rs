//! Shared per-program record
//!
//! | slot | field              | encoding |
//! |------|--------------------|----------|
//! | 0    | history pack index | u32      |
//! | 1    | history pack epoch | u32      |
//! | 2    | tempo (bpm)        | f32      |
//! | 3    | play state         | u32 enum |
//! | 4    | sample count       | u32      |

use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::ProgramState;

/// Slot indices of the program record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ProgramField {
    HistoryPackIndex = 0,
    HistoryPackEpoch = 1,
    Bpm = 2,
    State = 3,
    SampleCount = 4,
}

/// Number of 32-bit slots in the program record
pub const PROGRAM_SLOTS: usize = 5;

/// Atomic view over one program's shared record
pub struct SharedProgramState {
    slots: [AtomicU32; PROGRAM_SLOTS],
}

impl SharedProgramState {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    #[inline]
    pub fn load_u32(&self, field: ProgramField) -> u32 {
        self.slots[field as usize].load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_u32(&self, field: ProgramField, value: u32) {
        self.slots[field as usize].store(value, Ordering::Release);
    }

    #[inline]
    pub fn load_f32(&self, field: ProgramField) -> f32 {
        f32::from_bits(self.load_u32(field))
    }

    #[inline]
    pub fn store_f32(&self, field: ProgramField, value: f32) {
        self.store_u32(field, value.to_bits());
    }

    /// Raw slot, for compare-and-swap and fetch-add users
    #[inline]
    pub(crate) fn slot(&self, field: ProgramField) -> &AtomicU32 {
        &self.slots[field as usize]
    }

    /// Zero every slot, then set the tempo and Stop
    pub fn reset(&self, bpm: f32) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
        self.set_bpm(bpm);
        self.set_state(ProgramState::Stop);
    }

    #[inline]
    pub fn state(&self) -> ProgramState {
        ProgramState::from_u32(self.load_u32(ProgramField::State))
    }

    #[inline]
    pub fn set_state(&self, state: ProgramState) {
        self.store_u32(ProgramField::State, state as u32);
    }

    #[inline]
    pub fn sample_count(&self) -> u32 {
        self.load_u32(ProgramField::SampleCount)
    }

    #[inline]
    pub fn set_sample_count(&self, samples: u32) {
        self.store_u32(ProgramField::SampleCount, samples);
    }

    #[inline]
    pub fn bpm(&self) -> f32 {
        self.load_f32(ProgramField::Bpm)
    }

    #[inline]
    pub fn set_bpm(&self, bpm: f32) {
        self.store_f32(ProgramField::Bpm, bpm);
    }

    #[inline]
    pub fn history_index(&self) -> u32 {
        self.load_u32(ProgramField::HistoryPackIndex)
    }

    #[inline]
    pub fn history_epoch(&self) -> u32 {
        self.load_u32(ProgramField::HistoryPackEpoch)
    }
}

impl Default for SharedProgramState {
    fn default() -> Self {
        Self::new()
    }
}
