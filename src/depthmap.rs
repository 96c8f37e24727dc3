use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use image::{ImageBuffer, Luma};
use rayon::prelude::*;
use thiserror::Error;
use tracing::info;

use crate::{correlation::BlockResults, data::Grid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Little-endian `f32` values without a header.
    Raw,
    /// 16-bit grayscale, near is bright.
    Png,
    Tiff,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Result<OutputFormat, OutputError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("raw") | Some("f32") | Some("bin") => Ok(OutputFormat::Raw),
            Some("png") => Ok(OutputFormat::Png),
            Some("tif") | Some("tiff") => Ok(OutputFormat::Tiff),
            _ => Err(OutputError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Inserts a suffix before the extension: `out.png` becomes `out_bottom.png`.
pub fn output_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}_{}", stem, suffix),
    };
    path.with_file_name(file_name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    depth: Grid<f32>,
}

impl DepthMap {
    /// Upsamples block results so that every pixel of a block gets the block's depth.
    pub fn assemble(results: &BlockResults) -> DepthMap {
        let mut depth = Grid::new(results.layout.width(), results.layout.height(), f32::NAN);
        let blocks_x = results.layout.blocks_x().max(1);
        let block_size = results.layout.block_size();
        let matches = &results.matches;
        depth.par_rows_mut().for_each(|(y, row)| {
            let by = y / block_size;
            for (x, out) in row.iter_mut().enumerate() {
                let index = by * blocks_x + x / block_size;
                if let Some(block_match) = matches.get(index) {
                    *out = block_match.depth;
                }
            }
        });
        DepthMap { depth }
    }

    pub fn width(&self) -> usize {
        self.depth.width()
    }

    pub fn height(&self) -> usize {
        self.depth.height()
    }

    pub fn depth(&self, x: usize, y: usize) -> f32 {
        *self.depth.val(x, y)
    }

    /// Row-major depth values.
    pub fn values(&self) -> &[f32] {
        self.depth.as_slice()
    }

    /// True if no pixel was left unassigned.
    pub fn is_complete(&self) -> bool {
        self.values().iter().all(|v| !v.is_nan())
    }

    pub fn write(&self, path: &Path) -> Result<(), OutputError> {
        match OutputFormat::from_path(path)? {
            OutputFormat::Raw => self.write_raw(path),
            OutputFormat::Png | OutputFormat::Tiff => self.write_image(path),
        }?;
        info!(path = %path.display(), "Saved depth map");
        Ok(())
    }

    fn write_raw(&self, path: &Path) -> Result<(), OutputError> {
        let io_error = |source| OutputError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = BufWriter::new(File::create(path).map_err(io_error)?);
        for value in self.values() {
            writer.write_all(&value.to_le_bytes()).map_err(io_error)?;
        }
        writer.flush().map_err(io_error)
    }

    fn write_image(&self, path: &Path) -> Result<(), OutputError> {
        let img = self.visualize();
        img.save(path).map_err(|source| OutputError::Image {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Maps the finite depth range to 16-bit intensity; non-finite values are black.
    pub fn visualize(&self) -> ImageBuffer<Luma<u16>, Vec<u16>> {
        let (min_depth, max_depth) = self
            .values()
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::MAX, f32::MIN), |(min, max), &v| (min.min(v), max.max(v)));
        let range = max_depth - min_depth;
        let pixels = self
            .values()
            .iter()
            .map(|&v| {
                if !v.is_finite() {
                    0
                } else if range > 0.0 {
                    ((max_depth - v) / range * u16::MAX as f32).round() as u16
                } else {
                    u16::MAX
                }
            })
            .collect::<Vec<_>>();
        ImageBuffer::from_fn(self.width() as u32, self.height() as u32, |x, y| {
            Luma([pixels[y as usize * self.width() + x as usize]])
        })
    }
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot encode {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unsupported output format for {0} (expected .raw, .f32, .bin, .png, .tif or .tiff)")]
    UnsupportedFormat(PathBuf),
}
