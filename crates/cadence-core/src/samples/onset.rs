//! Onset (slice point) detection
//!
//! Finds musically meaningful transients in a sample so programs can address
//! material by slice index instead of raw offsets.
//!
//! # Algorithm
//!
//! 1. The channel is reduced to min/max peaks over an adaptive bucket grid:
//!    `16 * max_slices` buckets clamped to [256, 16384], but never more than
//!    one bucket per 32 samples. Work is bounded regardless of sample length.
//! 2. Per bucket, the positive-only increase in peak amplitude ("rise").
//! 3. A fast/slow one-pole pair follows the rise signal; novelty is
//!    `max(0, fast - slow)`.
//! 4. Local maxima of novelty become slice candidates, gated by:
//!    - adaptive minimum rise and novelty, scaled up by a momentum term that
//!      jumps after every detection and decays per bucket
//!    - a minimum bucket distance from the previous slice
//!    - a re-arm gate (novelty must fall back under the rearm level) and a
//!      short cooldown
//!    - a minimum fast/slow ratio of `1 + 0.9 * threshold`
//! 5. Accepted buckets map back to `floor(bucket * len / bucket_count)`.
//!
//! Every constant below is part of the persisted slice format: changing one
//! moves slice points in existing projects.

use super::peaks::compute_peaks;

const MIN_BUCKETS: usize = 256;
const MAX_BUCKETS: usize = 16384;
const BUCKETS_PER_SLICE: usize = 16;
const MIN_BUCKET_SAMPLES: usize = 32;

const FAST_COEFF: f64 = 0.25;
const SLOW_COEFF: f64 = 0.02;

/// Sentinel "last peak" far enough back that the first candidate always
/// clears the distance gate
const NO_PEAK: i64 = -1_073_741_823;

/// Detection thresholds derived from the user threshold and the rise maximum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetParams {
    /// Normalized threshold in [0, 1]
    pub threshold: f64,
    pub min_rise: f64,
    pub novelty_min: f64,
    pub ratio_min: f64,
    pub min_distance_buckets: i64,
    pub rearm_level: f64,
    pub cooldown_frames: i64,
    /// Per-bucket momentum decay
    pub release: f64,
}

impl OnsetParams {
    /// Derive all gates from `threshold` (clamped to [0, 1]) and `rise_max`
    pub fn new(threshold: f32, rise_max: f64) -> Self {
        let thr = if threshold.is_nan() {
            0.0
        } else {
            threshold.clamp(0.0, 1.0) as f64
        };
        Self {
            threshold: thr,
            min_rise: rise_max * (0.02 + thr * 0.28),
            novelty_min: rise_max * (0.01 + thr * 0.18),
            ratio_min: thr * 0.9,
            min_distance_buckets: 1 + (thr * 24.0) as i64,
            rearm_level: rise_max * (0.006 + thr * 0.06),
            cooldown_frames: 1 + (thr * 10.0) as i64,
            release: 0.995 + thr * 0.01,
        }
    }

    /// Gain applied to the rise and novelty minimums for momentum `mg`
    fn momentum_multiplier(&self, mg: f64) -> f64 {
        1.0 + mg * (10.0 + self.threshold * 12.0)
    }

    /// Minimum bucket gap before another slice may be accepted
    fn min_distance(&self, mg: f64, accepted: usize) -> i64 {
        let base = ((self.min_distance_buckets as f64 * (1.0 + mg * 2.0)).floor() as i64).max(2);
        if accepted <= 2 {
            base.max(4 + (self.threshold * 8.0) as i64)
        } else {
            base
        }
    }
}

/// Number of peak buckets used for a sample of `len` samples
pub fn bucket_count(len: usize, max_slices: usize) -> usize {
    let desired = (max_slices * BUCKETS_PER_SLICE).clamp(MIN_BUCKETS, MAX_BUCKETS);
    let by_min_size = (len / MIN_BUCKET_SAMPLES).max(1);
    len.min(desired).min(by_min_size).max(1)
}

/// Positive frame-to-frame amplitude increase per bucket
///
/// Returns the rise signal and its maximum.
fn rise_signal(peaks: &[f32]) -> (Vec<f32>, f64) {
    let mut rise = Vec::with_capacity(peaks.len() / 2);
    let mut rise_max = 0.0_f64;
    let mut prev_amp = 0.0_f64;

    for (i, pair) in peaks.chunks_exact(2).enumerate() {
        let amp = (pair[0].abs() as f64).max(pair[1].abs() as f64);
        let r = if i == 0 { 0.0 } else { (amp - prev_amp).max(0.0) };
        let r = r as f32;
        rise.push(r);
        if r as f64 > rise_max {
            rise_max = r as f64;
        }
        prev_amp = amp;
    }

    (rise, rise_max)
}

/// Detect slice points in `samples`
///
/// Returns strictly increasing sample offsets, at most `max_slices` of them.
/// Silence, DC, very short input and empty input all yield `[0]`.
pub fn detect_slices(samples: &[f32], threshold: f32, max_slices: usize) -> Vec<usize> {
    let len = samples.len();
    if len == 0 {
        return vec![0];
    }

    let buckets = bucket_count(len, max_slices);
    if buckets <= 1 {
        return vec![0];
    }

    let peaks = compute_peaks(samples, buckets);
    let (rise, rise_max) = rise_signal(&peaks);
    if rise_max <= 0.0 {
        return vec![0];
    }

    let params = OnsetParams::new(threshold, rise_max);

    let mut points: Vec<usize> = Vec::new();
    let mut fast = rise[0] as f64;
    let mut slow = rise[0] as f64;
    let mut prev2 = 0.0_f64;
    let mut prev1 = 0.0_f64;
    let mut prev_fast1 = fast;
    let mut prev_slow1 = slow;
    let mut last_peak_bucket = NO_PEAK;
    let mut armed = true;
    let mut cooldown = 0_i64;
    let mut mg = 0.0_f64;

    for frame in 1..buckets {
        if points.len() >= max_slices {
            break;
        }

        let e = rise[frame] as f64;
        fast += (e - fast) * FAST_COEFF;
        slow += (e - slow) * SLOW_COEFF;
        let novelty = (fast - slow).max(0.0);

        mg *= params.release;
        let mg_mul = params.momentum_multiplier(mg);
        let eff_min_rise = params.min_rise * mg_mul;
        let eff_novelty_min = params.novelty_min * mg_mul;
        let eff_min_dist = params.min_distance(mg, points.len());

        if !armed && novelty <= params.rearm_level {
            armed = true;
        }
        if cooldown > 0 {
            cooldown -= 1;
        }

        // prev1 is a local maximum of novelty
        if frame >= 2 && prev1 > prev2 && prev1 >= novelty {
            let pos_bucket = frame as i64 - 1;
            let base = prev_slow1.max(rise_max * 1e-5);
            let ratio = prev_fast1 / base;

            let accept = armed
                && cooldown <= 0
                && pos_bucket - last_peak_bucket >= eff_min_dist
                && prev_fast1 >= eff_min_rise
                && ratio >= 1.0 + params.ratio_min
                && prev1 >= eff_novelty_min;

            if accept {
                let offset = (pos_bucket as usize) * len / buckets;
                if points.last().map_or(true, |&last| offset > last) {
                    points.push(offset);
                    last_peak_bucket = pos_bucket;
                    armed = false;
                    cooldown = params.cooldown_frames;
                    mg = (mg + 0.75).min(1.0);
                }
            }
        }

        prev2 = prev1;
        prev1 = novelty;
        prev_fast1 = fast;
        prev_slow1 = slow;
    }

    if points.is_empty() {
        points.push(0);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Silence with decaying bursts starting at the given offsets
    fn bursts(len: usize, onsets: &[usize]) -> Vec<f32> {
        let mut samples = vec![0.0; len];
        for &onset in onsets {
            for i in 0..2000 {
                if onset + i < len {
                    samples[onset + i] = (-(i as f32) / 300.0).exp();
                }
            }
        }
        samples
    }

    #[test]
    fn test_silence_yields_single_slice() {
        let silence = vec![0.0; 48000];
        for thr in [0.0, 0.25, 0.5, 1.0] {
            assert_eq!(detect_slices(&silence, thr, 256), vec![0], "threshold {}", thr);
        }
    }

    #[test]
    fn test_dc_yields_single_slice() {
        let dc = vec![0.5; 10000];
        assert_eq!(detect_slices(&dc, 0.3, 256), vec![0]);
    }

    #[test]
    fn test_short_and_empty_input() {
        assert_eq!(detect_slices(&[], 0.5, 256), vec![0]);
        assert_eq!(detect_slices(&[0.0, 1.0, 0.0], 0.5, 256), vec![0]);
    }

    #[test]
    fn test_bucket_grid() {
        assert_eq!(bucket_count(48000, 256), 1500);
        assert_eq!(bucket_count(1_000_000, 256), 4096);
        assert_eq!(bucket_count(10_000_000, 4096), 16384);
        assert_eq!(bucket_count(48000, 2), 256);
        assert_eq!(bucket_count(20, 256), 1);
    }

    #[test]
    fn test_detects_bursts_at_low_threshold() {
        let samples = bursts(48000, &[12000, 24000, 36000]);
        let slices = detect_slices(&samples, 0.0, 256);
        assert_eq!(slices, vec![12000, 24000, 36000]);
    }

    #[test]
    fn test_output_capped_at_max_slices() {
        let samples = bursts(48000, &[12000, 24000, 36000]);
        let slices = detect_slices(&samples, 0.0, 2);
        assert_eq!(slices.len(), 2);
        assert!(slices[0] < slices[1], "slices must be strictly increasing");
    }

    #[test]
    fn test_offsets_strictly_increasing() {
        let onsets: Vec<usize> = (1..40).map(|i| i * 2400).collect();
        let samples = bursts(100_000, &onsets);
        for thr in [0.0, 0.2, 0.6, 1.0] {
            let slices = detect_slices(&samples, thr, 256);
            assert!(!slices.is_empty());
            assert!(
                slices.windows(2).all(|w| w[0] < w[1]),
                "threshold {} produced {:?}",
                thr,
                slices
            );
        }
    }

    #[test]
    fn test_params_are_pure_functions_of_threshold() {
        let p = OnsetParams::new(0.5, 2.0);
        assert!((p.min_rise - 2.0 * 0.16).abs() < 1e-12);
        assert!((p.novelty_min - 2.0 * 0.1).abs() < 1e-12);
        assert!((p.ratio_min - 0.45).abs() < 1e-12);
        assert_eq!(p.min_distance_buckets, 13);
        assert_eq!(p.cooldown_frames, 6);

        // Out-of-range thresholds clamp
        assert_eq!(OnsetParams::new(7.0, 1.0), OnsetParams::new(1.0, 1.0));
        assert_eq!(OnsetParams::new(-1.0, 1.0), OnsetParams::new(0.0, 1.0));
    }
}
