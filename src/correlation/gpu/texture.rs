use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tracing::debug;

use crate::{config::FilterMode, panorama::Panorama};

use super::GpuContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    id: u64,
    width: u32,
    height: u32,
}

impl TextureHandle {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

pub struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl GpuTexture {
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Device-resident copies of panoramas, destroyed on release or when the cache drops.
pub struct TextureCache {
    context: Arc<GpuContext>,
    filter_mode: FilterMode,
    sampler: wgpu::Sampler,
    textures: HashMap<u64, Arc<GpuTexture>>,
    next_id: u64,
}

impl TextureCache {
    pub fn new(context: Arc<GpuContext>, filter_mode: FilterMode) -> TextureCache {
        let filter = match filter_mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        };
        let sampler = context.device().create_sampler(&wgpu::SamplerDescriptor {
            label: Some("panorama sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        TextureCache {
            context,
            filter_mode,
            sampler,
            textures: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn filter_mode(&self) -> FilterMode {
        self.filter_mode
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Creates a new texture for every call, even for the same panorama.
    pub fn upload(&mut self, panorama: &Panorama) -> Result<TextureHandle, UploadError> {
        let max_dimension = self.context.limits().max_texture_dimension_2d;
        let (width, height) = (panorama.width(), panorama.height());
        if width > max_dimension as usize || height > max_dimension as usize {
            return Err(UploadError::TooLarge {
                width,
                height,
                max_dimension,
            });
        }
        let (width, height) = (width as u32, height as u32);
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = self
            .context
            .capture(|device| {
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("panorama"),
                    size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                self.context.queue().write_texture(
                    texture.as_image_copy(),
                    panorama.as_bytes(),
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(4 * width),
                        rows_per_image: Some(height),
                    },
                    size,
                );
                texture
            })
            .map_err(UploadError::Device)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.next_id;
        self.next_id += 1;
        self.textures.insert(
            id,
            Arc::new(GpuTexture {
                texture,
                view,
                width,
                height,
            }),
        );
        debug!(id, width, height, "Uploaded panorama texture");
        Ok(TextureHandle { id, width, height })
    }

    pub fn texture(&self, handle: TextureHandle) -> Result<Arc<GpuTexture>, UploadError> {
        self.textures
            .get(&handle.id)
            .cloned()
            .ok_or(UploadError::UnknownHandle(handle.id))
    }

    pub fn release(&mut self, handle: TextureHandle) -> Result<(), UploadError> {
        let texture = self
            .textures
            .remove(&handle.id)
            .ok_or(UploadError::UnknownHandle(handle.id))?;
        texture.texture.destroy();
        debug!(id = handle.id, "Released panorama texture");
        Ok(())
    }
}

impl Drop for TextureCache {
    fn drop(&mut self) {
        for (_, texture) in self.textures.drain() {
            texture.texture.destroy();
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(
        "panorama {width}x{height} exceeds the maximum texture dimension {max_dimension}"
    )]
    TooLarge {
        width: usize,
        height: usize,
        max_dimension: u32,
    },
    #[error("texture creation failed: {0}")]
    Device(String),
    #[error("unknown texture handle {0}")]
    UnknownHandle(u64),
}
