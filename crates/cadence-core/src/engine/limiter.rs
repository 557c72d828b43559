//! Output safety limiter
//!
//! Last stage of every quantum: keeps the summed program output inside
//! ±threshold no matter what the programs produce.
//!
//! # Algorithm
//!
//! Per channel, per sample:
//!
//! 1. Target gain is `threshold / |x|` above the threshold, else 1.
//! 2. When the current gain is above the target it falls toward it with a
//!    one-pole release (`coeff = exp(-3 / (release * sample_rate))`); when
//!    it may rise it snaps to the target immediately.
//! 3. The scaled sample is hard-clamped to ±threshold as a backstop, and
//!    the gain resynchronized to the target when that clamp fires.
//!
//! Non-finite input is treated as silence. No lookahead, no latency.
//! Coefficients are recomputed lazily, only when the threshold or release
//! actually change.

use crate::config::LimiterConfig;

const MIN_THRESHOLD_DB: f32 = -80.0;
const MAX_THRESHOLD_DB: f32 = 0.0;
const MIN_RELEASE_SECS: f32 = 1e-4;
const MAX_RELEASE_SECS: f32 = 5.0;

/// Gain state for one channel
struct ChannelState {
    gain: f32,
}

/// Stereo peak limiter with a single threshold knob
pub struct Limiter {
    threshold_db: f32,
    release_seconds: f32,
    sample_rate: u32,

    // ─── Derived, recomputed lazily ───

    /// Parameters the coefficients were last computed for
    computed: Option<(f32, f32, u32)>,
    threshold_linear: f32,
    release_coeff: f32,

    channels: [ChannelState; 2],
}

impl Limiter {
    pub fn new(config: LimiterConfig, sample_rate: u32) -> Self {
        let mut limiter = Self {
            threshold_db: 0.0,
            release_seconds: 0.0,
            sample_rate,
            computed: None,
            threshold_linear: 1.0,
            release_coeff: 0.0,
            channels: [ChannelState { gain: 1.0 }, ChannelState { gain: 1.0 }],
        };
        limiter.set_params(config);
        limiter
    }

    /// Update threshold and release (clamped to the supported range)
    pub fn set_params(&mut self, config: LimiterConfig) {
        self.threshold_db = config.threshold_db.clamp(MIN_THRESHOLD_DB, MAX_THRESHOLD_DB);
        self.release_seconds = config.release_seconds.clamp(MIN_RELEASE_SECS, MAX_RELEASE_SECS);
    }

    /// Linear ceiling for the current parameters
    pub fn threshold_linear(&mut self) -> f32 {
        self.update_coefficients();
        self.threshold_linear
    }

    /// Current gain of a channel (0 = left, 1 = right)
    pub fn gain(&self, channel: usize) -> f32 {
        self.channels[channel & 1].gain
    }

    fn update_coefficients(&mut self) {
        let params = (self.threshold_db, self.release_seconds, self.sample_rate);
        if self.computed == Some(params) {
            return;
        }
        self.threshold_linear = 10.0_f32.powf(self.threshold_db / 20.0);
        self.release_coeff = (-3.0 / (self.release_seconds * self.sample_rate.max(1) as f32)).exp();
        self.computed = Some(params);
    }

    /// Limit both channels in place
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        self.update_coefficients();
        let threshold = self.threshold_linear;
        let coeff = self.release_coeff;
        let [l, r] = &mut self.channels;
        Self::process_channel(l, left, threshold, coeff);
        Self::process_channel(r, right, threshold, coeff);
    }

    fn process_channel(state: &mut ChannelState, buffer: &mut [f32], threshold: f32, coeff: f32) {
        let mut gain = state.gain;
        for sample in buffer.iter_mut() {
            // NaN and infinities would slip past the clamp below
            let input = if sample.is_finite() { *sample } else { 0.0 };
            let level = input.abs();
            let target = if level > threshold { threshold / level } else { 1.0 };

            if gain > target {
                // Release: ease down toward the target
                gain = target + (gain - target) * coeff;
            } else {
                gain = target;
            }
            gain = gain.clamp(0.0, 1.0);

            let mut out = input * gain;
            if out.abs() > threshold {
                out = threshold.copysign(out);
                gain = target;
            }
            *sample = out;
        }
        state.gain = gain;
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default(), crate::types::SAMPLE_RATE)
    }
}
