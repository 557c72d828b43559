//! Sample registry
//!
//! Owns every sample buffer a program can address, versions it, and caches
//! slice detection results. Content arrives asynchronously from the control
//! context (downloads, recordings, speech synthesis), so a handle usually
//! exists well before its data does. Reads against such a handle are never
//! an error: they produce silence.

use std::collections::{BTreeMap, HashMap};

use basedrop::Shared;

use super::onset::detect_slices;
use crate::types::{SampleHandle, MAX_SLICES};

/// Rate assumed for a sample until its real data arrives
pub const PLACEHOLDER_SAMPLE_RATE: u32 = 44100;

/// Slice result for samples with nothing to analyze
const SINGLE_SLICE: &[usize] = &[0];

/// Where a sample's content comes from
#[derive(Debug, Clone, PartialEq)]
pub enum SampleSource {
    /// Fetched from an external library by id
    External { id: String },
    /// Captured by the recorder
    Record {
        project_id: Option<String>,
        seconds: f32,
        callback_id: u32,
    },
    /// Data supplied directly by the control context
    Inline,
    /// Rendered by the speech synthesizer
    Speech,
}

impl SampleSource {
    /// Whether registering this source twice should reuse the first handle
    fn is_deduplicated(&self) -> bool {
        matches!(self, SampleSource::External { .. } | SampleSource::Record { .. })
    }
}

/// Decoded audio for one sample
///
/// Channels are expected to share a length; the first channel's length is
/// the sample's length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleData {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl SampleData {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Length in frames (length of the first channel)
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn byte_len(&self) -> usize {
        self.channels
            .iter()
            .map(|ch| ch.len() * std::mem::size_of::<f32>())
            .sum()
    }
}

/// One registered sample
pub struct SampleEntry {
    pub source: SampleSource,
    data: Option<Shared<SampleData>>,
    pub sample_rate: u32,
    pub ready: bool,
    pub error: Option<String>,
}

impl SampleEntry {
    fn placeholder(source: SampleSource) -> Self {
        Self {
            source,
            data: None,
            sample_rate: PLACEHOLDER_SAMPLE_RATE,
            ready: false,
            error: None,
        }
    }

    /// Channel buffers, empty until data has been pushed
    pub fn channels(&self) -> &[Vec<f32>] {
        self.data.as_deref().map_or(&[], |d| d.channels.as_slice())
    }

    /// Frames in the first channel
    pub fn len(&self) -> usize {
        self.data.as_deref().map_or(0, SampleData::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(&mut self, data: Shared<SampleData>) {
        self.sample_rate = data.sample_rate;
        self.ready = !data.channels.is_empty() && !data.is_empty();
        self.data = Some(data);
    }

    /// Channel `channel` if the sample is ready and has it
    fn ready_channel(&self, channel: usize) -> Option<&[f32]> {
        if !self.ready {
            return None;
        }
        self.channels().get(channel).map(Vec::as_slice)
    }
}

/// A handle still waiting for its content
#[derive(Debug, Clone, PartialEq)]
pub struct RequiredSample {
    pub handle: SampleHandle,
    pub source: SampleSource,
}

/// Sample memory summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleMemoryInfo {
    pub handle_count: usize,
    pub total_channel_bytes: usize,
}

/// Registry of all samples, keyed by handle
pub struct SampleRegistry {
    samples: BTreeMap<SampleHandle, SampleEntry>,
    versions: HashMap<SampleHandle, u32>,
    /// handle -> quantized threshold -> slice offsets
    slice_cache: HashMap<SampleHandle, HashMap<i32, Vec<usize>>>,
    next_handle: u32,
    max_slices: usize,
}

impl SampleRegistry {
    pub fn new() -> Self {
        Self::with_max_slices(MAX_SLICES)
    }

    pub fn with_max_slices(max_slices: usize) -> Self {
        Self {
            samples: BTreeMap::new(),
            versions: HashMap::new(),
            slice_cache: HashMap::new(),
            next_handle: 1,
            max_slices,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────

    /// Register a sample source and return its handle
    ///
    /// External and record sources are deduplicated: registering the same
    /// descriptor again returns the existing handle. Inline and speech
    /// sources always get a fresh handle.
    pub fn register(&mut self, source: SampleSource) -> SampleHandle {
        if source.is_deduplicated() {
            if let Some((&handle, _)) = self.samples.iter().find(|(_, e)| e.source == source) {
                return handle;
            }
        }
        let handle = self.allocate_handle();
        self.samples.insert(handle, SampleEntry::placeholder(source));
        handle
    }

    /// Register inline data, ready immediately
    pub fn register_inline(&mut self, data: Shared<SampleData>) -> SampleHandle {
        let handle = self.allocate_handle();
        let mut entry = SampleEntry::placeholder(SampleSource::Inline);
        entry.install(data);
        self.samples.insert(handle, entry);
        self.bump_version(handle);
        handle
    }

    /// Mirror a handle the control context allocated itself
    ///
    /// No-op if the handle already exists.
    pub fn ensure_handle(&mut self, handle: SampleHandle, source: SampleSource) {
        if self.samples.contains_key(&handle) {
            return;
        }
        self.samples.insert(handle, SampleEntry::placeholder(source));
        if handle.get() >= self.next_handle {
            self.next_handle = handle.get().saturating_add(1);
        }
    }

    /// Apply a batch of control-side registrations
    ///
    /// Invalidated handles are cleared first, so a handle can be invalidated
    /// and re-registered in one batch.
    pub fn sync_registrations(
        &mut self,
        invalidated: &[SampleHandle],
        registrations: &[(SampleHandle, SampleSource)],
    ) {
        for &handle in invalidated {
            self.clear_handle(handle);
        }
        for (handle, source) in registrations {
            self.ensure_handle(*handle, source.clone());
        }
    }

    fn allocate_handle(&mut self) -> SampleHandle {
        let handle = SampleHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn bump_version(&mut self, handle: SampleHandle) {
        *self.versions.entry(handle).or_insert(0) += 1;
    }

    // ─────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────

    /// Replace a sample's content
    ///
    /// Clears any previous error and invalidates cached slices. Returns
    /// false if the handle is unknown.
    pub fn set_data(&mut self, handle: SampleHandle, data: Shared<SampleData>) -> bool {
        let Some(entry) = self.samples.get_mut(&handle) else {
            return false;
        };
        entry.install(data);
        entry.error = None;
        self.bump_version(handle);
        self.slice_cache.remove(&handle);
        true
    }

    /// Store captured audio from the recorder
    ///
    /// Like [`Self::set_data`] but leaves a previously reported error in place.
    pub fn record_sample(&mut self, handle: SampleHandle, data: Shared<SampleData>) -> bool {
        let Some(entry) = self.samples.get_mut(&handle) else {
            return false;
        };
        entry.install(data);
        self.bump_version(handle);
        self.slice_cache.remove(&handle);
        true
    }

    /// Mark a sample as failed
    pub fn set_error(&mut self, handle: SampleHandle, error: impl Into<String>) -> bool {
        let Some(entry) = self.samples.get_mut(&handle) else {
            return false;
        };
        entry.error = Some(error.into());
        entry.ready = false;
        self.bump_version(handle);
        self.slice_cache.remove(&handle);
        true
    }

    /// Drop a sample's content but keep its handle and source
    pub fn clear_handle(&mut self, handle: SampleHandle) {
        if let Some(entry) = self.samples.get_mut(&handle) {
            entry.data = None;
            entry.ready = false;
            entry.error = None;
        }
        self.bump_version(handle);
        self.slice_cache.remove(&handle);
    }

    /// Forget every sample and restart handle numbering
    pub fn clear(&mut self) {
        self.samples.clear();
        self.versions.clear();
        self.slice_cache.clear();
        self.next_handle = 1;
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub fn get(&self, handle: SampleHandle) -> Option<&SampleEntry> {
        self.samples.get(&handle)
    }

    /// Content version, 0 for never-touched handles
    pub fn version(&self, handle: SampleHandle) -> u32 {
        self.versions.get(&handle).copied().unwrap_or(0)
    }

    /// Channel count, 0 unless ready
    pub fn channel_count(&self, handle: SampleHandle) -> usize {
        match self.samples.get(&handle) {
            Some(e) if e.ready => e.channels().len(),
            _ => 0,
        }
    }

    /// Length of one channel, 0 unless ready and present
    pub fn sample_length(&self, handle: SampleHandle, channel: usize) -> usize {
        self.samples
            .get(&handle)
            .and_then(|e| e.ready_channel(channel))
            .map_or(0, <[f32]>::len)
    }

    pub fn all_ready(&self) -> bool {
        self.samples.values().all(|e| e.ready)
    }

    /// Every handle still waiting for content, in handle order
    pub fn required_samples(&self) -> Vec<RequiredSample> {
        self.samples
            .iter()
            .filter(|(_, e)| !e.ready)
            .map(|(&handle, e)| RequiredSample {
                handle,
                source: e.source.clone(),
            })
            .collect()
    }

    pub fn memory_info(&self) -> SampleMemoryInfo {
        SampleMemoryInfo {
            handle_count: self.samples.len(),
            total_channel_bytes: self
                .samples
                .values()
                .filter_map(|e| e.data.as_deref())
                .map(SampleData::byte_len)
                .sum(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────

    /// Copy `length` frames starting at `offset` into a new buffer
    ///
    /// Always returns exactly `length` values; anything outside the
    /// sample (or the whole buffer, if not ready) reads as zero.
    pub fn read_chunk(
        &self,
        handle: SampleHandle,
        channel: usize,
        offset: i64,
        length: usize,
    ) -> Vec<f32> {
        let mut out = vec![0.0; length];
        self.read_chunk_into(handle, channel, offset, &mut out);
        out
    }

    /// Non-allocating [`Self::read_chunk`]; fills all of `out`
    pub fn read_chunk_into(&self, handle: SampleHandle, channel: usize, offset: i64, out: &mut [f32]) {
        out.fill(0.0);
        let Some(ch) = self.samples.get(&handle).and_then(|e| e.ready_channel(channel)) else {
            return;
        };
        let start = offset.clamp(0, ch.len() as i64) as usize;
        let end = (start + out.len()).min(ch.len()).max(start);
        out[..end - start].copy_from_slice(&ch[start..end]);
    }

    /// Slice offsets for `threshold`, cached per handle and quantized threshold
    ///
    /// Samples that are missing, not ready or channel-less yield `[0]`.
    pub fn slices(&mut self, handle: SampleHandle, threshold: f32) -> &[usize] {
        let max_slices = self.max_slices;
        let Some(entry) = self.samples.get(&handle) else {
            return SINGLE_SLICE;
        };
        let Some(first) = entry.ready_channel(0) else {
            return SINGLE_SLICE;
        };
        self.slice_cache
            .entry(handle)
            .or_default()
            .entry(threshold_key(threshold))
            .or_insert_with(|| detect_slices(first, threshold, max_slices))
            .as_slice()
    }

    pub fn slice_count(&mut self, handle: SampleHandle, threshold: f32) -> usize {
        self.slices(handle, threshold).len()
    }

    /// Slice offset at `index`, 0 when out of range
    pub fn slice_point(&mut self, handle: SampleHandle, threshold: f32, index: i64) -> usize {
        if index < 0 {
            return 0;
        }
        self.slices(handle, threshold)
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for SampleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Slice cache key: threshold quantized to 1/1000
fn threshold_key(threshold: f32) -> i32 {
    (threshold as f64 * 1000.0).round() as i32
}
