//! Common types for Cadence
//!
//! This module contains the identifiers, state enums and engine-wide constants
//! shared by the sample registry, the shared-state layouts and the scheduler.

use std::fmt;

/// Default sample rate (48kHz - standard professional audio rate)
/// The host's actual rate is passed in through [`crate::config::EngineConfig`].
pub const SAMPLE_RATE: u32 = 48000;

/// Default render quantum in samples
pub const QUANTUM: usize = 128;

/// Capacity (in 32-bit words) of each control-ops buffer
pub const CONTROL_OPS_CAPACITY: usize = 16384;

/// Crossfade length used when a swap does not specify one
pub const PROGRAM_SWAP_FADE_SAMPLES: u32 = 1024;

/// Number of quanta a preview seek freezes normal timeline advance for
pub const PREVIEW_SEEK_QUANTA: u32 = 32;

/// Maximum number of slice points returned by onset detection
pub const MAX_SLICES: usize = 256;

/// Default tempo before any program sets one
pub const DEFAULT_BPM: f32 = 120.0;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u32);

        impl $name {
            /// Raw numeric value
            #[inline]
            pub fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Stable identity of a logical program (sound source)
    ProgramId
);

id_type!(
    /// Identity of one bytecode engine instance; each program owns two
    VmId
);

id_type!(
    /// Opaque handle of a registered sample
    SampleHandle
);

/// Play state of a single program
///
/// Stored in the shared program record, so the discriminants are part of the
/// cross-thread layout contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ProgramState {
    #[default]
    Stop = 0,
    Start = 1,
    Pause = 2,
}

impl ProgramState {
    /// Decode from the shared record (unknown values read as Stop)
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => ProgramState::Start,
            2 => ProgramState::Pause,
            _ => ProgramState::Stop,
        }
    }
}

/// Running intent of the global transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum TransportRunning {
    #[default]
    Stop = 0,
    Start = 1,
    Pause = 2,
}

impl TransportRunning {
    /// Decode from the shared record (unknown values read as Stop)
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => TransportRunning::Start,
            2 => TransportRunning::Pause,
            _ => TransportRunning::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_through_u32() {
        for state in [ProgramState::Stop, ProgramState::Start, ProgramState::Pause] {
            assert_eq!(ProgramState::from_u32(state as u32), state);
        }
        assert_eq!(ProgramState::from_u32(99), ProgramState::Stop);
        assert_eq!(TransportRunning::from_u32(2), TransportRunning::Pause);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ProgramId(7).to_string(), "7");
        assert_eq!(VmId(3).get(), 3);
    }
}
