//! Sample registry and slice detection
//!
//! - [`registry`]: handle allocation, versioned content, chunked reads
//! - [`onset`]: transient detection producing slice points
//! - [`peaks`]: min/max reduction shared by analysis and overviews

pub mod onset;
pub mod peaks;
pub mod registry;

pub use onset::{detect_slices, OnsetParams};
pub use peaks::{compute_peaks, compute_peaks_into};
pub use registry::{
    RequiredSample, SampleData, SampleEntry, SampleMemoryInfo, SampleRegistry, SampleSource,
    PLACEHOLDER_SAMPLE_RATE,
};
