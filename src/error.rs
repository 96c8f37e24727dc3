use std::fmt;

use thiserror::Error;

use crate::{
    config::ConfigurationError,
    correlation::{
        MatchError, SearchError,
        gpu::{GpuError, ScorerError, SurfaceError, UploadError},
    },
    depthmap::OutputError,
    panorama::DecodeError,
};

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Configuration,
    Device,
    Upload,
    Surface,
    Matching,
    Output,
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::Configuration => "configuration",
            Stage::Device => "device",
            Stage::Upload => "upload",
            Stage::Surface => "surface",
            Stage::Matching => "matching",
            Stage::Output => "output",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DepthError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Device(#[from] GpuError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("depth estimation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Output(#[from] OutputError),
}

impl DepthError {
    pub fn stage(&self) -> Stage {
        match self {
            DepthError::Decode(_) => Stage::Decode,
            DepthError::Configuration(_) => Stage::Configuration,
            DepthError::Device(_) => Stage::Device,
            DepthError::Upload(_) => Stage::Upload,
            DepthError::Surface(_) => Stage::Surface,
            DepthError::Match(_) => Stage::Matching,
            DepthError::Cancelled => Stage::Cancelled,
            DepthError::Output(_) => Stage::Output,
        }
    }

    /// True if the GPU cannot be used at all, so that the CPU scorer can take over.
    pub fn is_gpu_unavailable(&self) -> bool {
        matches!(
            self,
            DepthError::Device(GpuError::AdapterNotFound | GpuError::Device(_))
                | DepthError::Surface(SurfaceError::UnsupportedAttachment(_))
        )
    }
}

impl From<SearchError> for DepthError {
    fn from(err: SearchError) -> DepthError {
        match err {
            SearchError::Match(err) => DepthError::Match(err),
            SearchError::Configuration(err) => DepthError::Configuration(err),
            SearchError::Cancelled => DepthError::Cancelled,
        }
    }
}

impl From<ScorerError> for DepthError {
    fn from(err: ScorerError) -> DepthError {
        match err {
            ScorerError::Surface(err) => DepthError::Surface(err),
            ScorerError::Upload(err) => DepthError::Upload(err),
            ScorerError::Program(err) => DepthError::Device(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_report_their_stage() {
        assert_eq!(
            DepthError::from(ConfigurationError::BlockSize).stage(),
            Stage::Configuration
        );
        assert_eq!(
            DepthError::from(SearchError::Cancelled).stage(),
            Stage::Cancelled
        );
        assert_eq!(
            DepthError::from(ScorerError::Surface(SurfaceError::ZeroSize)).stage(),
            Stage::Surface
        );
        assert_eq!(DepthError::from(GpuError::AdapterNotFound).stage(), Stage::Device);
        assert_eq!(Stage::Matching.to_string(), "matching");
    }

    #[test]
    fn unusable_devices_allow_fallback() {
        assert!(DepthError::from(GpuError::AdapterNotFound).is_gpu_unavailable());
        assert!(DepthError::from(GpuError::Device("lost".to_string())).is_gpu_unavailable());
        assert!(
            DepthError::from(SurfaceError::UnsupportedAttachment(
                wgpu::TextureFormat::R32Float
            ))
            .is_gpu_unavailable()
        );
        assert!(!DepthError::from(GpuError::Program("invalid".to_string())).is_gpu_unavailable());
        assert!(!DepthError::from(SurfaceError::ZeroSize).is_gpu_unavailable());
    }
}
