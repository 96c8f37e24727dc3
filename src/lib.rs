//! Depth estimation from vertically stacked equirectangular panoramas.
//!
//! For a vertical baseline, corresponding points share an image column, so disparity is a
//! vertical offset. Blocks of one panorama are compared against vertically shifted samples of
//! the other, and the best offset of every block is converted into depth.

pub mod config;
pub mod correlation;
pub mod data;
pub mod depthmap;
pub mod error;
pub mod panorama;
pub mod pipeline;

pub use config::{
    Calibration, CandidateRange, ConfigurationError, ErrorMetric, FilterMode, HardwareMode,
    SearchConfig,
};
pub use correlation::{
    BlockScorer, CancellationToken, DisparitySearch, ProgressListener, SearchDirection,
    SearchState,
};
pub use depthmap::DepthMap;
pub use error::{DepthError, Stage};
pub use panorama::Panorama;
pub use pipeline::{DepthMaps, PipelineContext, RunOptions, estimate_depth};
