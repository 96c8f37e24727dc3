use std::{fmt, fs, path::Path, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_BLOCK_SIZE: usize = 8;
const DEFAULT_MIN_OFFSET: i32 = -16;
const DEFAULT_MAX_OFFSET: i32 = 16;
const MAX_SUBPIXEL: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HardwareMode {
    #[default]
    Gpu,
    GpuLowPower,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Fractional rows round to the nearest row, halves round down the image.
    #[default]
    Nearest,
    /// Fractional rows blend the two neighbouring rows.
    Linear,
}

impl FilterMode {
    pub(crate) fn shader_id(&self) -> u32 {
        match self {
            FilterMode::Nearest => 0,
            FilterMode::Linear => 1,
        }
    }
}

/// Per-pixel error between two RGBA samples, summed over the RGB channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMetric {
    /// Absolute channel difference.
    #[default]
    Sad,
    /// Squared channel difference.
    Ssd,
}

impl ErrorMetric {
    /// Channel values are normalized to `[0, 1]` before comparison.
    #[inline]
    pub fn pixel_error(&self, a: [u8; 4], b: [u8; 4]) -> f32 {
        self.color_error(normalize(a), normalize(b))
    }

    #[inline]
    pub fn color_error(&self, a: [f32; 3], b: [f32; 3]) -> f32 {
        let mut sum = 0.0f32;
        for c in 0..3 {
            let diff = a[c] - b[c];
            sum += match self {
                ErrorMetric::Sad => diff.abs(),
                ErrorMetric::Ssd => diff * diff,
            };
        }
        sum
    }

    pub(crate) fn shader_id(&self) -> u32 {
        match self {
            ErrorMetric::Sad => 0,
            ErrorMetric::Ssd => 1,
        }
    }
}

/// RGB channels of an RGBA8 pixel scaled to `[0, 1]`.
#[inline]
pub fn normalize(pixel: [u8; 4]) -> [f32; 3] {
    [
        pixel[0] as f32 / 255.0,
        pixel[1] as f32 / 255.0,
        pixel[2] as f32 / 255.0,
    ]
}

/// Vertical offsets `min, min + step, ..` up to and including `max` if reachable.
///
/// Offsets are counted in `1 / subpixel` rows, so `subpixel = 2` searches half-row
/// disparities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
    #[serde(default = "default_subpixel")]
    pub subpixel: u32,
}

fn default_subpixel() -> u32 {
    1
}

impl Default for CandidateRange {
    fn default() -> Self {
        CandidateRange::new(DEFAULT_MIN_OFFSET, DEFAULT_MAX_OFFSET, 1)
    }
}

impl CandidateRange {
    pub const fn new(min: i32, max: i32, step: i32) -> CandidateRange {
        CandidateRange {
            min,
            max,
            step,
            subpixel: 1,
        }
    }

    pub const fn with_subpixel(self, subpixel: u32) -> CandidateRange {
        CandidateRange { subpixel, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.step <= 0 {
            return Err(ConfigurationError::CandidateStep(self.step));
        }
        if self.min > self.max {
            return Err(ConfigurationError::EmptyCandidateRange {
                min: self.min,
                max: self.max,
            });
        }
        // Every offset must have a mirrored counterpart for the reverse search.
        if self.min.checked_neg().is_none() {
            return Err(ConfigurationError::CandidateOverflow(self.min));
        }
        if self.subpixel == 0 || self.subpixel > MAX_SUBPIXEL {
            return Err(ConfigurationError::Subpixel {
                subpixel: self.subpixel,
                max: MAX_SUBPIXEL,
            });
        }
        Ok(())
    }

    /// Disparity in rows of an offset from this range.
    pub fn disparity(&self, offset: i32) -> f32 {
        offset as f32 / self.subpixel.max(1) as f32
    }

    pub fn len(&self) -> usize {
        if self.step <= 0 || self.min > self.max {
            return 0;
        }
        let span = self.max as i64 - self.min as i64;
        (span / self.step as i64) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offsets in ascending order.
    pub fn offsets(&self) -> Vec<i32> {
        (0..self.len() as i64)
            .map(|i| (self.min as i64 + i * self.step as i64) as i32)
            .collect()
    }

    /// Offsets of the reverse search, negated so that the same physical disparity is covered;
    /// still ascending. Ranges that fail `validate()` saturate at `i32::MAX`.
    pub fn mirrored_offsets(&self) -> Vec<i32> {
        self.offsets()
            .iter()
            .rev()
            .map(|offset| offset.saturating_neg())
            .collect()
    }
}

pub type DepthFn = dyn Fn(f32) -> f32 + Send + Sync;

#[derive(Clone)]
pub struct CalibrationFn(Arc<DepthFn>);

impl fmt::Debug for CalibrationFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CalibrationFn")
    }
}

/// Converts a winning disparity (in rows) into depth; every variant must be monotonic in
/// `|disparity|`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calibration {
    /// `depth = scale / |disparity|`, clamped to `[min_depth, max_depth]`.
    /// A zero disparity maps to `max_depth`, or `+inf` if no maximum is set.
    InverseProportional {
        scale: f32,
        min_depth: f32,
        max_depth: Option<f32>,
    },
    /// `depth = max_depth - slope * |disparity|`, clamped to `[min_depth, max_depth]`.
    Linear {
        slope: f32,
        min_depth: f32,
        max_depth: f32,
    },
    /// Caller-provided function; it is trusted to be monotonic in `|disparity|`.
    #[serde(skip)]
    Custom(CalibrationFn),
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::InverseProportional {
            scale: 1.0,
            min_depth: 0.0,
            max_depth: None,
        }
    }
}

impl Calibration {
    pub fn custom<F>(f: F) -> Calibration
    where
        F: Fn(f32) -> f32 + Send + Sync + 'static,
    {
        Calibration::Custom(CalibrationFn(Arc::new(f)))
    }

    pub fn depth(&self, disparity: f32) -> f32 {
        let distance = disparity.abs();
        match *self {
            Calibration::InverseProportional {
                scale,
                min_depth,
                max_depth,
            } => {
                let max_depth = max_depth.unwrap_or(f32::INFINITY);
                if distance == 0.0 {
                    return max_depth;
                }
                (scale / distance).max(min_depth).min(max_depth)
            }
            Calibration::Linear {
                slope,
                min_depth,
                max_depth,
            } => (max_depth - slope * distance).max(min_depth).min(max_depth),
            Calibration::Custom(ref f) => (f.0)(disparity),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match *self {
            Calibration::InverseProportional {
                scale,
                min_depth,
                max_depth,
            } => {
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(ConfigurationError::Calibration("scale must be positive"));
                }
                if !(min_depth.is_finite() && min_depth >= 0.0) {
                    return Err(ConfigurationError::Calibration(
                        "min_depth must be non-negative",
                    ));
                }
                if let Some(max_depth) = max_depth {
                    if max_depth.is_nan() || max_depth < min_depth {
                        return Err(ConfigurationError::Calibration(
                            "max_depth must not be less than min_depth",
                        ));
                    }
                }
            }
            Calibration::Linear {
                slope,
                min_depth,
                max_depth,
            } => {
                if !(slope.is_finite() && slope > 0.0) {
                    return Err(ConfigurationError::Calibration("slope must be positive"));
                }
                if !(min_depth.is_finite() && max_depth.is_finite() && min_depth <= max_depth) {
                    return Err(ConfigurationError::Calibration(
                        "depth limits must be finite and ordered",
                    ));
                }
            }
            Calibration::Custom(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub block_size: usize,
    pub candidate_range: CandidateRange,
    pub calibration: Calibration,
    pub filter_mode: FilterMode,
    pub metric: ErrorMetric,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            candidate_range: CandidateRange::default(),
            calibration: Calibration::default(),
            filter_mode: FilterMode::default(),
            metric: ErrorMetric::default(),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.block_size == 0 {
            return Err(ConfigurationError::BlockSize);
        }
        self.candidate_range.validate()?;
        self.calibration.validate()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<SearchConfig, ConfigurationError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("block size must be positive")]
    BlockSize,
    #[error("candidate range {min}..={max} is empty")]
    EmptyCandidateRange { min: i32, max: i32 },
    #[error("candidate step must be positive, got {0}")]
    CandidateStep(i32),
    #[error("candidate offset {0} cannot be mirrored")]
    CandidateOverflow(i32),
    #[error("subpixel divisor must be between 1 and {max}, got {subpixel}")]
    Subpixel { subpixel: u32, max: u32 },
    #[error(
        "filter mode {requested:?} differs from the {active:?} sampler of the texture cache"
    )]
    FilterModeMismatch {
        active: FilterMode,
        requested: FilterMode,
    },
    #[error("invalid calibration: {0}")]
    Calibration(&'static str),
    #[error("at least one scorer is required")]
    NoScorers,
    #[error(
        "panorama dimensions differ: bottom is {bottom:?}, top is {top:?} (width, height)"
    )]
    DimensionMismatch {
        bottom: (usize, usize),
        top: (usize, usize),
    },
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
