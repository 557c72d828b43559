//! Min/max peak reduction of a sample channel
//!
//! Used both for waveform overviews and as the first stage of onset
//! detection.

/// Reduce `samples` to `width` buckets of interleaved `(min, max)` pairs
///
/// Bucket `i` covers `floor(i*len/width) .. floor((i+1)*len/width)`, widened
/// to at least one sample so every bucket reports a real value even when
/// `width > len`. An empty channel yields `width` pairs of zeros; a zero
/// width yields an empty vector.
pub fn compute_peaks(samples: &[f32], width: usize) -> Vec<f32> {
    let mut peaks = vec![0.0; width * 2];
    compute_peaks_into(samples, width, &mut peaks);
    peaks
}

/// Non-allocating variant of [`compute_peaks`]
///
/// `out` must hold at least `width * 2` values; only that prefix is written.
pub fn compute_peaks_into(samples: &[f32], width: usize, out: &mut [f32]) {
    let len = samples.len();
    if len == 0 || width == 0 {
        out.iter_mut().take(width * 2).for_each(|v| *v = 0.0);
        return;
    }

    for (i, pair) in out.chunks_exact_mut(2).take(width).enumerate() {
        let from = i * len / width;
        let to = (i + 1) * len / width;
        let a = from.min(len - 1);
        let b = (a + 1).max(to.min(len));

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &s in &samples[a..b] {
            if s < min {
                min = s;
            }
            if s > max {
                max = s;
            }
        }
        pair[0] = min;
        pair[1] = max;
    }
}
