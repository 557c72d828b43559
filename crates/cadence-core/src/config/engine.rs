//! Render engine configuration

use serde::{Deserialize, Serialize};

use crate::types::{
    CONTROL_OPS_CAPACITY, MAX_SLICES, PREVIEW_SEEK_QUANTA, PROGRAM_SWAP_FADE_SAMPLES, QUANTUM,
    SAMPLE_RATE,
};

/// Output safety limiter settings
///
/// Values outside the supported range are clamped when the limiter
/// recomputes its coefficients, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Ceiling in dBFS, clamped to [-80, 0]
    /// Default: 0.0 dBFS
    pub threshold_db: f32,

    /// Release time in seconds, clamped to [1e-4, 5]
    /// Default: 0.1 s
    pub release_seconds: f32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            threshold_db: 0.0,
            release_seconds: 0.1,
        }
    }
}

/// Configuration for [`crate::engine::Engine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Host sample rate in Hz
    pub sample_rate: u32,

    /// Expected quantum length in samples. Reported at startup; the host may
    /// still pass any block length to `Engine::process`.
    pub quantum: usize,

    /// Words per control-ops buffer; longer op streams are truncated
    pub control_ops_capacity: usize,

    /// Crossfade length for swaps that don't specify one
    pub swap_fade_samples: u32,

    /// How many quanta a preview seek freezes the timeline for
    pub preview_seek_quanta: u32,

    /// Maximum slice points per onset detection
    pub max_slices: usize,

    /// Capacity of the control → render request ring buffer
    pub request_queue_capacity: usize,

    /// Capacity of the render → control event ring buffer
    pub event_queue_capacity: usize,

    /// Output safety limiter
    pub limiter: LimiterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            quantum: QUANTUM,
            control_ops_capacity: CONTROL_OPS_CAPACITY,
            swap_fade_samples: PROGRAM_SWAP_FADE_SAMPLES,
            preview_seek_quanta: PREVIEW_SEEK_QUANTA,
            max_slices: MAX_SLICES,
            request_queue_capacity: 256,
            event_queue_capacity: 64,
            limiter: LimiterConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Nyquist frequency for the configured sample rate
    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 * 0.5
    }

    /// π / nyquist, handed to the bytecode engine every quantum
    pub fn pi_over_nyquist(&self) -> f32 {
        std::f32::consts::PI / self.nyquist()
    }
}
