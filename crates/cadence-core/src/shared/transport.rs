//! Shared transport record
//!
//! Nine 32-bit slots shared between the control context and the renderer.
//! The slot order is a cross-thread contract; append new fields, never
//! reorder.
//!
//! | slot | field                  | encoding |
//! |------|------------------------|----------|
//! | 0    | sample count           | f32      |
//! | 1    | running                | u32 enum |
//! | 2    | seek version           | u32      |
//! | 3    | stop and seek to zero  | u32 flag |
//! | 4    | actually playing       | u32 enum |
//! | 5    | history sync requested | u32 flag |
//! | 6    | loop begin             | i32      |
//! | 7    | loop end               | u32      |
//! | 8    | project end            | u32      |

use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::TransportRunning;

/// Slot indices of the transport record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TransportField {
    SampleCount = 0,
    Running = 1,
    SeekVersion = 2,
    StopAndSeekToZero = 3,
    ActuallyPlaying = 4,
    HistorySyncRequested = 5,
    LoopBegin = 6,
    LoopEnd = 7,
    ProjectEnd = 8,
}

/// Number of 32-bit slots in the transport record
pub const TRANSPORT_SLOTS: usize = 9;

/// Atomic view over the transport record
pub struct SharedTransport {
    slots: [AtomicU32; TRANSPORT_SLOTS],
}

impl SharedTransport {
    /// Stopped transport at sample 0 with no loop region
    pub fn new() -> Self {
        let transport = Self {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
        };
        transport.set_loop(-1, 0);
        transport
    }

    // ─────────────────────────────────────────────────────────────
    // Raw accessors
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn load_u32(&self, field: TransportField) -> u32 {
        self.slots[field as usize].load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_u32(&self, field: TransportField, value: u32) {
        self.slots[field as usize].store(value, Ordering::Release);
    }

    #[inline]
    pub fn load_f32(&self, field: TransportField) -> f32 {
        f32::from_bits(self.load_u32(field))
    }

    #[inline]
    pub fn store_f32(&self, field: TransportField, value: f32) {
        self.store_u32(field, value.to_bits());
    }

    #[inline]
    pub fn load_i32(&self, field: TransportField) -> i32 {
        self.load_u32(field) as i32
    }

    #[inline]
    pub fn store_i32(&self, field: TransportField, value: i32) {
        self.store_u32(field, value as u32);
    }

    // ─────────────────────────────────────────────────────────────
    // Named fields
    // ─────────────────────────────────────────────────────────────

    /// Published sample position
    ///
    /// Encoded as f32: positions past 2^24 samples lose integer precision
    /// on this field only. The renderer keeps its own exact counter.
    #[inline]
    pub fn sample_count(&self) -> u32 {
        self.load_f32(TransportField::SampleCount).round().max(0.0) as u32
    }

    #[inline]
    pub fn set_sample_count(&self, samples: u32) {
        self.store_f32(TransportField::SampleCount, samples as f32);
    }

    #[inline]
    pub fn running(&self) -> TransportRunning {
        TransportRunning::from_u32(self.load_u32(TransportField::Running))
    }

    #[inline]
    pub fn set_running(&self, running: TransportRunning) {
        self.store_u32(TransportField::Running, running as u32);
    }

    #[inline]
    pub fn actually_playing(&self) -> TransportRunning {
        TransportRunning::from_u32(self.load_u32(TransportField::ActuallyPlaying))
    }

    #[inline]
    pub fn set_actually_playing(&self, running: TransportRunning) {
        self.store_u32(TransportField::ActuallyPlaying, running as u32);
    }

    #[inline]
    pub fn seek_version(&self) -> u32 {
        self.load_u32(TransportField::SeekVersion)
    }

    /// Publish a new position and bump the seek version
    ///
    /// The renderer adopts the position on the next quantum that observes
    /// the new version.
    pub fn seek(&self, samples: u32) -> u32 {
        self.set_sample_count(samples);
        self.slots[TransportField::SeekVersion as usize].fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn stop_and_seek_to_zero(&self) -> bool {
        self.load_u32(TransportField::StopAndSeekToZero) != 0
    }

    #[inline]
    pub fn set_stop_and_seek_to_zero(&self, requested: bool) {
        self.store_u32(TransportField::StopAndSeekToZero, requested as u32);
    }

    #[inline]
    pub fn history_sync_requested(&self) -> bool {
        self.load_u32(TransportField::HistorySyncRequested) != 0
    }

    #[inline]
    pub fn set_history_sync_requested(&self, requested: bool) {
        self.store_u32(TransportField::HistorySyncRequested, requested as u32);
    }

    /// Configure the loop region; a negative `begin` disables looping
    pub fn set_loop(&self, begin: i32, end: u32) {
        self.store_i32(TransportField::LoopBegin, begin);
        self.store_u32(TransportField::LoopEnd, end);
    }

    /// 0 disables project-end wraparound
    pub fn set_project_end(&self, end: u32) {
        self.store_u32(TransportField::ProjectEnd, end);
    }

    /// Snapshot of the loop and project-end bounds
    pub fn bounds(&self) -> TimelineBounds {
        TimelineBounds {
            loop_begin: self.load_i32(TransportField::LoopBegin),
            loop_end: self.load_u32(TransportField::LoopEnd),
            project_end: self.load_u32(TransportField::ProjectEnd),
        }
    }
}

impl Default for SharedTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop and project-end bounds, read once per quantum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimelineBounds {
    pub loop_begin: i32,
    pub loop_end: u32,
    pub project_end: u32,
}

impl TimelineBounds {
    /// Whether a loop region is configured
    #[inline]
    pub fn has_loop(&self) -> bool {
        self.loop_begin >= 0 && self.loop_end > 0 && self.loop_end > self.loop_begin as u32
    }

    /// Apply loop then project-end wraparound, preserving overshoot
    pub fn wrap(&self, position: u32) -> u32 {
        let mut pos = position;
        if self.has_loop() && pos >= self.loop_end {
            pos = self.loop_begin as u32 + (pos - self.loop_end);
        }
        if self.project_end > 0 && pos >= self.project_end {
            pos -= self.project_end;
        }
        pos
    }
}
