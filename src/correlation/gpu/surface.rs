use std::sync::mpsc;

use thiserror::Error;

use crate::correlation::ScoreBuffer;

use super::GpuContext;

pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
/// Holds the bits of an `f32` error in its four 8-bit channels, for devices that cannot
/// render to `COLOR_FORMAT`.
pub const PACKED_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const COLOR_USAGES: wgpu::TextureUsages =
    wgpu::TextureUsages::RENDER_ATTACHMENT.union(wgpu::TextureUsages::COPY_SRC);

/// Picks the color attachment format supported by the adapter.
pub fn attachment_format(adapter: &wgpu::Adapter) -> Result<wgpu::TextureFormat, SurfaceError> {
    select_attachment_format(|format| adapter.get_texture_format_features(format).allowed_usages)
}

fn select_attachment_format<F>(allowed_usages: F) -> Result<wgpu::TextureFormat, SurfaceError>
where
    F: Fn(wgpu::TextureFormat) -> wgpu::TextureUsages,
{
    if !allowed_usages(DEPTH_FORMAT).contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
        return Err(SurfaceError::UnsupportedAttachment(DEPTH_FORMAT));
    }
    [COLOR_FORMAT, PACKED_COLOR_FORMAT]
        .into_iter()
        .find(|&format| allowed_usages(format).contains(COLOR_USAGES))
        .ok_or(SurfaceError::UnsupportedAttachment(COLOR_FORMAT))
}

/// Square offscreen render target that receives per-pixel errors.
pub struct ComparisonSurface {
    size: u32,
    format: wgpu::TextureFormat,
    color: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    slots: usize,
}

/// An open render pass on a comparison surface; the pass ends when this is dropped.
pub struct SurfaceBinding<'e> {
    pass: wgpu::RenderPass<'e>,
}

impl<'e> SurfaceBinding<'e> {
    pub fn pass(&mut self) -> &mut wgpu::RenderPass<'e> {
        &mut self.pass
    }
}

impl ComparisonSurface {
    pub fn new(context: &GpuContext, size: u32) -> Result<ComparisonSurface, SurfaceError> {
        if size == 0 {
            return Err(SurfaceError::ZeroSize);
        }
        let max_dimension = context.limits().max_texture_dimension_2d;
        if size > max_dimension {
            return Err(SurfaceError::TooLarge {
                size,
                max_dimension,
            });
        }
        let format = attachment_format(context.adapter())?;

        let extent = wgpu::Extent3d {
            width: size,
            height: size,
            depth_or_array_layers: 1,
        };
        let (color, depth, readback) = context
            .capture(|device| {
                let attachment = |label, format, usage| {
                    device.create_texture(&wgpu::TextureDescriptor {
                        label: Some(label),
                        size: extent,
                        mip_level_count: 1,
                        sample_count: 1,
                        dimension: wgpu::TextureDimension::D2,
                        format,
                        usage,
                        view_formats: &[],
                    })
                };
                let color = attachment("comparison color", format, COLOR_USAGES);
                let depth = attachment(
                    "comparison depth",
                    DEPTH_FORMAT,
                    wgpu::TextureUsages::RENDER_ATTACHMENT,
                );
                let readback = readback_buffer(device, slot_size(size));
                (color, depth, readback)
            })
            .map_err(SurfaceError::Device)?;
        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(ComparisonSurface {
            size,
            format,
            color,
            color_view,
            depth_view,
            readback,
            slots: 1,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    /// Starts a render pass that clears both attachments.
    pub fn bind<'e>(&self, encoder: &'e mut wgpu::CommandEncoder) -> SurfaceBinding<'e> {
        let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("comparison"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Discard,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        SurfaceBinding { pass }
    }

    /// Grows the readback buffer to hold at least `slots` copies of the color attachment.
    pub fn reserve_slots(&mut self, context: &GpuContext, slots: usize) -> Result<(), SurfaceError> {
        if slots <= self.slots {
            return Ok(());
        }
        let readback = context
            .capture(|device| readback_buffer(device, slots as u64 * slot_size(self.size)))
            .map_err(SurfaceError::Device)?;
        self.readback.destroy();
        self.readback = readback;
        self.slots = slots;
        Ok(())
    }

    /// Copies the color attachment into readback slot `slot`.
    pub fn copy_to_slot(&self, encoder: &mut wgpu::CommandEncoder, slot: usize) {
        encoder.copy_texture_to_buffer(
            self.color.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &self.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: slot as u64 * slot_size(self.size),
                    bytes_per_row: Some(padded_bytes_per_row(self.size)),
                    rows_per_image: Some(self.size),
                },
            },
            wgpu::Extent3d {
                width: self.size,
                height: self.size,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Maps the first `count` readback slots; the copies must already have been submitted.
    pub fn read_slots(
        &self,
        context: &GpuContext,
        count: usize,
    ) -> Result<Vec<ScoreBuffer>, SurfaceError> {
        let count = count.min(self.slots);
        if count == 0 {
            return Ok(vec![]);
        }
        let slot_size = slot_size(self.size);
        let slice = self.readback.slice(..count as u64 * slot_size);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = sender.send(v);
        });
        context.device().poll(wgpu::Maintain::Wait);
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(SurfaceError::Readback(err.to_string())),
            Err(err) => return Err(SurfaceError::Readback(err.to_string())),
        }

        let buffers = {
            let mapped = slice.get_mapped_range();
            mapped
                .chunks_exact(slot_size as usize)
                .map(|slot| unpad(slot, self.size))
                .collect::<Option<Vec<_>>>()
        };
        self.readback.unmap();
        buffers.ok_or_else(|| SurfaceError::Readback("unexpected readback size".to_string()))
    }

    /// Copies the color attachment to host memory.
    pub fn readback(&self, context: &GpuContext) -> Result<ScoreBuffer, SurfaceError> {
        let mut encoder = context
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        self.copy_to_slot(&mut encoder, 0);
        context
            .submit_and_wait(encoder)
            .map_err(SurfaceError::Readback)?;
        self.read_slots(context, 1)?
            .pop()
            .ok_or_else(|| SurfaceError::Readback("no data".to_string()))
    }
}

impl Drop for ComparisonSurface {
    fn drop(&mut self) {
        self.readback.destroy();
    }
}

fn readback_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("comparison readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Row stride of a readback slot, padded to the copy alignment.
pub fn padded_bytes_per_row(size: u32) -> u32 {
    let unpadded = size * std::mem::size_of::<f32>() as u32;
    unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

pub fn slot_size(size: u32) -> u64 {
    padded_bytes_per_row(size) as u64 * size as u64
}

/// Strips row padding from one readback slot. Both color formats hold four little-endian
/// bytes per texel.
fn unpad(slot: &[u8], size: u32) -> Option<ScoreBuffer> {
    let row_bytes = size as usize * std::mem::size_of::<f32>();
    let values = slot
        .chunks_exact(padded_bytes_per_row(size) as usize)
        .flat_map(|row| {
            row[..row_bytes]
                .chunks_exact(4)
                .map(|v| f32::from_le_bytes([v[0], v[1], v[2], v[3]]))
        })
        .collect::<Vec<_>>();
    ScoreBuffer::new(size as usize, values)
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("comparison surface must not be empty")]
    ZeroSize,
    #[error("comparison surface size {size} exceeds the maximum texture dimension {max_dimension}")]
    TooLarge { size: u32, max_dimension: u32 },
    #[error("device cannot render to {0:?}")]
    UnsupportedAttachment(wgpu::TextureFormat),
    #[error("surface creation failed: {0}")]
    Device(String),
    #[error("readback failed: {0}")]
    Readback(String),
}
