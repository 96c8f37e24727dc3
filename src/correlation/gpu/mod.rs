mod program;
mod surface;
mod texture;

use std::sync::{Arc, Mutex};

use pollster::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info};

pub use program::{MatchParams, MatchingProgram, ProgramBindings, QuadVertex, Sampling};
pub use surface::{
    COLOR_FORMAT, ComparisonSurface, PACKED_COLOR_FORMAT, SurfaceBinding, SurfaceError,
    attachment_format,
};
pub use texture::{GpuTexture, TextureCache, TextureHandle, UploadError};

use crate::config::{HardwareMode, SearchConfig};

use super::{Block, BlockScorer, CandidateError, ScoreError};

/// Headless device and queue.
pub struct GpuContext {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    device_name: String,
    // Error scopes are a stack shared by every thread using the device.
    scope_lock: Mutex<()>,
}

impl GpuContext {
    pub fn new(hardware_mode: HardwareMode) -> Result<GpuContext, GpuError> {
        let low_power = matches!(hardware_mode, HardwareMode::GpuLowPower);
        let instance = wgpu::Instance::default();
        let adapter_options = wgpu::RequestAdapterOptions {
            power_preference: if low_power {
                wgpu::PowerPreference::LowPower
            } else {
                wgpu::PowerPreference::HighPerformance
            },
            force_fallback_adapter: false,
            compatible_surface: None,
        };
        let adapter = instance
            .request_adapter(&adapter_options)
            .block_on()
            .ok_or(GpuError::AdapterNotFound)?;

        // Keep the adapter's texture size limits so that full-size panoramas fit.
        let limits = wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits());
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("stacked360"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .block_on()
            .map_err(|err| GpuError::Device(err.to_string()))?;

        device.on_uncaptured_error(Box::new(|err: wgpu::Error| {
            error!("Uncaptured GPU error: {}", err);
        }));

        let info = adapter.get_info();
        let device_name = format!("{:?} - {}", info.backend, info.name);
        info!(device = %device_name, "Acquired GPU device");

        Ok(GpuContext {
            adapter,
            device,
            queue,
            device_name,
            scope_lock: Mutex::new(()),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Submits the encoded commands and blocks until the queue is idle. Errors raised by
    /// this submission are returned instead of reaching the uncaptured error handler.
    pub fn submit_and_wait(&self, encoder: wgpu::CommandEncoder) -> Result<(), String> {
        self.capture(|device| {
            self.queue.submit(Some(encoder.finish()));
            device.poll(wgpu::Maintain::Wait);
        })
    }

    /// Runs `f` inside validation and out-of-memory error scopes. Only one scope is open at a
    /// time, so concurrent callers never see each other's errors.
    pub fn capture<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&wgpu::Device) -> T,
    {
        let _scope = match self.scope_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = f(&self.device);
        let validation = self.device.pop_error_scope().block_on();
        let out_of_memory = self.device.pop_error_scope().block_on();
        match validation.or(out_of_memory) {
            Some(err) => Err(err.to_string()),
            None => Ok(result),
        }
    }
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("Adapter not found")]
    AdapterNotFound,
    #[error("cannot create device: {0}")]
    Device(String),
    #[error("cannot create matching program: {0}")]
    Program(String),
}

/// Scores blocks by rendering them into a private comparison surface.
pub struct GpuScorer {
    context: Arc<GpuContext>,
    program: Arc<MatchingProgram>,
    bindings: ProgramBindings,
    surface: ComparisonSurface,
}

impl GpuScorer {
    /// Up to `capacity` candidates of a block are rendered per submission. Filtering follows
    /// the cache's sampler.
    pub fn new(
        context: Arc<GpuContext>,
        program: Arc<MatchingProgram>,
        cache: &TextureCache,
        (source, target): (TextureHandle, TextureHandle),
        config: &SearchConfig,
        capacity: usize,
    ) -> Result<GpuScorer, ScorerError> {
        let surface = ComparisonSurface::new(&context, config.block_size as u32)?;
        let source = cache.texture(source)?;
        let target = cache.texture(target)?;
        let sampling = Sampling {
            metric: config.metric,
            filter_mode: cache.filter_mode(),
            subpixel: config.candidate_range.subpixel,
        };
        let bindings = program.bind_textures(
            &context,
            &source,
            &target,
            cache.sampler(),
            sampling,
            capacity,
        )?;
        debug!(
            block_size = config.block_size,
            capacity,
            color_format = ?surface.format(),
            "Created GPU scorer"
        );
        Ok(GpuScorer {
            context,
            program,
            bindings,
            surface,
        })
    }
}

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Program(#[from] GpuError),
}

impl BlockScorer for GpuScorer {
    fn score(&mut self, block: &Block, offset: i32) -> Result<f32, ScoreError> {
        let buffer = self.program.score(
            &self.context,
            &mut self.surface,
            &self.bindings,
            block,
            offset,
        )?;
        Ok(buffer.mean_over(block.width, block.height))
    }

    /// Failures name the candidates of the failing submission.
    fn score_candidates(
        &mut self,
        block: &Block,
        offsets: &[i32],
    ) -> Result<Vec<f32>, CandidateError> {
        let buffers = self.program.score_batch(
            &self.context,
            &mut self.surface,
            &self.bindings,
            block,
            offsets,
        )?;
        Ok(buffers
            .iter()
            .map(|buffer| buffer.mean_over(block.width, block.height))
            .collect())
    }
}
