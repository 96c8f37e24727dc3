use std::path::{Path, PathBuf};

use image::RgbaImage;
use thiserror::Error;
use tracing::debug;

use crate::data::Grid;

/// An equirectangular RGBA8 image, row-major with the origin at the top-left.
#[derive(Debug, Clone)]
pub struct Panorama {
    pixels: Grid<[u8; 4]>,
}

impl Panorama {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Panorama, DecodeError> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|source| DecodeError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .into_rgba8();
        debug!(
            path = %path.display(),
            width = img.width(),
            height = img.height(),
            "Decoded panorama"
        );
        Panorama::from_image(img)
    }

    pub fn from_image(img: RgbaImage) -> Result<Panorama, DecodeError> {
        let (width, height) = (img.width() as usize, img.height() as usize);
        Panorama::from_rgba(width, height, img.into_raw())
    }

    pub fn from_rgba(width: usize, height: usize, pixels: Vec<u8>) -> Result<Panorama, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::Empty);
        }
        let expected = width * height * 4;
        if pixels.len() != expected {
            return Err(DecodeError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        let pixels = pixels
            .chunks_exact(4)
            .map(|p| [p[0], p[1], p[2], p[3]])
            .collect::<Vec<_>>();
        let pixels = Grid::from_vec(width, height, pixels).ok_or(DecodeError::BufferSize {
            expected,
            actual: expected,
        })?;
        Ok(Panorama { pixels })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.pixels.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        *self.pixels.val(x, y)
    }

    /// Samples with horizontal wraparound and vertical clamping.
    #[inline]
    pub fn sample(&self, x: isize, y: isize) -> [u8; 4] {
        let x = x.rem_euclid(self.width() as isize) as usize;
        let y = y.clamp(0, self.height() as isize - 1) as usize;
        self.pixel(x, y)
    }

    /// Tightly packed RGBA8 bytes.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.pixels.as_slice())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot decode {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("pixel buffer has {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("panorama has zero size")]
    Empty,
}
