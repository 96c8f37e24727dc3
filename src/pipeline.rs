use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use tracing::{info, warn};

use crate::{
    config::{ConfigurationError, HardwareMode, SearchConfig},
    correlation::{
        BlockResults, BlockScorer, CancellationToken, DisparitySearch, ProgressListener,
        SearchDirection,
        cpu::CpuScorer,
        gpu::{
            GpuContext, GpuScorer, MatchingProgram, TextureCache, TextureHandle,
            attachment_format,
        },
    },
    depthmap::{DepthMap, OutputFormat, output_path},
    error::DepthError,
    panorama::Panorama,
};

#[derive(Debug, Clone)]
pub struct DepthMaps {
    /// Referenced to the bottom panorama.
    pub bottom: DepthMap,
    /// Referenced to the top panorama.
    pub top: DepthMap,
}

struct GpuResources {
    context: Arc<GpuContext>,
    program: Arc<MatchingProgram>,
    cache: TextureCache,
}

/// Resources of a single run; GPU textures are released when this is dropped.
pub struct PipelineContext {
    gpu: Option<GpuResources>,
    selected_hardware: String,
}

/// Maps a listener's `[0, 1]` range into `[start, start + span]`.
struct ScaledProgress<'a, PL: ProgressListener> {
    inner: Option<&'a PL>,
    start: f32,
    span: f32,
}

impl<PL: ProgressListener> ProgressListener for ScaledProgress<'_, PL> {
    fn report_status(&self, pos: f32) {
        if let Some(pl) = self.inner {
            pl.report_status(self.start + pos * self.span);
        }
    }
}

impl PipelineContext {
    pub fn new(
        hardware_mode: HardwareMode,
        config: &SearchConfig,
    ) -> Result<PipelineContext, DepthError> {
        if matches!(hardware_mode, HardwareMode::Cpu) {
            return Ok(PipelineContext {
                gpu: None,
                selected_hardware: "CPU".to_string(),
            });
        }
        PipelineContext::with_gpu(GpuResources::new(hardware_mode, config))
    }

    fn with_gpu(gpu: Result<GpuResources, DepthError>) -> Result<PipelineContext, DepthError> {
        match gpu {
            Ok(gpu) => {
                let selected_hardware = format!("GPU {}", gpu.context.device_name());
                Ok(PipelineContext {
                    gpu: Some(gpu),
                    selected_hardware,
                })
            }
            Err(err) if err.is_gpu_unavailable() => {
                warn!("GPU is unavailable, falling back to CPU: {}", err);
                Ok(PipelineContext {
                    gpu: None,
                    selected_hardware: format!("CPU fallback ({})", err),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn selected_hardware(&self) -> &str {
        &self.selected_hardware
    }

    /// Computes bottom- and top-referenced depth maps.
    pub fn estimate_depth<PL: ProgressListener>(
        &mut self,
        bottom: &Panorama,
        top: &Panorama,
        config: &SearchConfig,
        workers: usize,
        progress_listener: Option<&PL>,
        cancel: &CancellationToken,
    ) -> Result<DepthMaps, DepthError> {
        check_dimensions(bottom, top)?;
        if let Some(gpu) = &self.gpu {
            check_filter_mode(&gpu.cache, config)?;
        }
        let dimensions = bottom.dimensions();
        let mut bottom_search = DisparitySearch::new(
            config,
            dimensions,
            SearchDirection::BottomToTop,
            cancel.clone(),
        )?;
        let mut top_search = DisparitySearch::new(
            config,
            dimensions,
            SearchDirection::TopToBottom,
            cancel.clone(),
        )?;
        let workers = workers.max(1);
        info!(hardware = %self.selected_hardware, workers, "Estimating depth");

        let start_time = SystemTime::now();
        let (bottom_results, top_results) = match &mut self.gpu {
            Some(gpu) => {
                let bottom_handle = gpu.cache.upload(bottom)?;
                let top_handle = gpu.cache.upload(top)?;
                let results = gpu.search_both(
                    [&mut bottom_search, &mut top_search],
                    (bottom_handle, top_handle),
                    config,
                    workers,
                    progress_listener,
                );
                gpu.cache.release(bottom_handle)?;
                gpu.cache.release(top_handle)?;
                results?
            }
            None => {
                let bottom_results = search(
                    &mut bottom_search,
                    &mut cpu_scorers(bottom, top, config, workers),
                    progress(progress_listener, 0),
                )?;
                let top_results = search(
                    &mut top_search,
                    &mut cpu_scorers(top, bottom, config, workers),
                    progress(progress_listener, 1),
                )?;
                (bottom_results, top_results)
            }
        };

        let maps = DepthMaps {
            bottom: DepthMap::assemble(&bottom_results),
            top: DepthMap::assemble(&top_results),
        };
        if let Ok(t) = start_time.elapsed() {
            info!("Estimated depth in {:.3} seconds", t.as_secs_f32());
        }
        Ok(maps)
    }
}

impl GpuResources {
    fn new(hardware_mode: HardwareMode, config: &SearchConfig) -> Result<GpuResources, DepthError> {
        let context = Arc::new(GpuContext::new(hardware_mode)?);
        let color_format = attachment_format(context.adapter())?;
        let program = Arc::new(MatchingProgram::new(&context, color_format)?);
        let cache = TextureCache::new(context.clone(), config.filter_mode);
        Ok(GpuResources {
            context,
            program,
            cache,
        })
    }

    fn search_both<PL: ProgressListener>(
        &self,
        searches: [&mut DisparitySearch; 2],
        (bottom, top): (TextureHandle, TextureHandle),
        config: &SearchConfig,
        workers: usize,
        progress_listener: Option<&PL>,
    ) -> Result<(BlockResults, BlockResults), DepthError> {
        let [bottom_search, top_search] = searches;
        let mut scorers = self.scorers(bottom, top, config, bottom_search.offsets().len(), workers)?;
        let bottom_results = search(bottom_search, &mut scorers, progress(progress_listener, 0))?;
        let mut scorers = self.scorers(top, bottom, config, top_search.offsets().len(), workers)?;
        let top_results = search(top_search, &mut scorers, progress(progress_listener, 1))?;
        Ok((bottom_results, top_results))
    }

    fn scorers(
        &self,
        source: TextureHandle,
        target: TextureHandle,
        config: &SearchConfig,
        candidates: usize,
        workers: usize,
    ) -> Result<Vec<GpuScorer>, DepthError> {
        (0..workers)
            .map(|_| {
                GpuScorer::new(
                    self.context.clone(),
                    self.program.clone(),
                    &self.cache,
                    (source, target),
                    config,
                    candidates,
                )
                .map_err(DepthError::from)
            })
            .collect()
    }
}

fn cpu_scorers<'a>(
    source: &'a Panorama,
    target: &'a Panorama,
    config: &SearchConfig,
    workers: usize,
) -> Vec<CpuScorer<'a>> {
    (0..workers)
        .map(|_| {
            CpuScorer::new(source, target, config.metric)
                .with_sampling(config.filter_mode, config.candidate_range.subpixel)
        })
        .collect()
}

fn progress<PL: ProgressListener>(inner: Option<&PL>, direction: usize) -> ScaledProgress<'_, PL> {
    ScaledProgress {
        inner,
        start: 0.5 * direction as f32,
        span: 0.5,
    }
}

fn search<S: BlockScorer + Send, PL: ProgressListener>(
    disparity_search: &mut DisparitySearch,
    scorers: &mut [S],
    progress_listener: ScaledProgress<'_, PL>,
) -> Result<BlockResults, DepthError> {
    let results = match scorers {
        [scorer] => disparity_search.run(scorer, Some(&progress_listener)),
        scorers => disparity_search.run_parallel(scorers, Some(&progress_listener)),
    }?;
    Ok(results)
}

/// The sampler is built once per context, so later runs must ask for the same filtering.
fn check_filter_mode(cache: &TextureCache, config: &SearchConfig) -> Result<(), ConfigurationError> {
    if cache.filter_mode() != config.filter_mode {
        return Err(ConfigurationError::FilterModeMismatch {
            active: cache.filter_mode(),
            requested: config.filter_mode,
        });
    }
    Ok(())
}

fn check_dimensions(bottom: &Panorama, top: &Panorama) -> Result<(), ConfigurationError> {
    if bottom.dimensions() != top.dimensions() {
        return Err(ConfigurationError::DimensionMismatch {
            bottom: bottom.dimensions(),
            top: top.dimensions(),
        });
    }
    Ok(())
}

/// Validates, then runs the whole estimation with a fresh context.
pub fn estimate_depth<PL: ProgressListener>(
    bottom: &Panorama,
    top: &Panorama,
    config: &SearchConfig,
    hardware_mode: HardwareMode,
    workers: usize,
    progress_listener: Option<&PL>,
    cancel: &CancellationToken,
) -> Result<DepthMaps, DepthError> {
    config.validate()?;
    check_dimensions(bottom, top)?;
    let mut context = PipelineContext::new(hardware_mode, config)?;
    context.estimate_depth(bottom, top, config, workers, progress_listener, cancel)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub bottom: PathBuf,
    pub top: PathBuf,
    pub output: PathBuf,
    pub config: SearchConfig,
    pub hardware_mode: HardwareMode,
    pub workers: usize,
}

/// Loads both panoramas, estimates depth and writes `<stem>_bottom` and `<stem>_top` outputs.
pub fn run<PL: ProgressListener>(
    options: &RunOptions,
    progress_listener: Option<&PL>,
    cancel: &CancellationToken,
) -> Result<(), DepthError> {
    OutputFormat::from_path(&options.output)?;
    options.config.validate()?;

    let start_time = SystemTime::now();
    let bottom = load(&options.bottom)?;
    let top = load(&options.top)?;
    if let Ok(t) = start_time.elapsed() {
        info!("Loaded panoramas in {:.3} seconds", t.as_secs_f32());
    }

    let maps = estimate_depth(
        &bottom,
        &top,
        &options.config,
        options.hardware_mode,
        options.workers,
        progress_listener,
        cancel,
    )?;
    drop((bottom, top));

    maps.bottom.write(&output_path(&options.output, "bottom"))?;
    maps.top.write(&output_path(&options.output, "top"))?;
    Ok(())
}

fn load(path: &Path) -> Result<Panorama, DepthError> {
    let panorama = Panorama::load(path)?;
    info!(
        path = %path.display(),
        width = panorama.width(),
        height = panorama.height(),
        "Loaded panorama"
    );
    Ok(panorama)
}
