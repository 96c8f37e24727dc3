use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stacked360::correlation::cpu::CpuScorer;
use stacked360::correlation::gpu::{
    COLOR_FORMAT, ComparisonSurface, GpuContext, GpuScorer, MatchingProgram, PACKED_COLOR_FORMAT,
    SurfaceError, TextureCache, UploadError, attachment_format,
};
use stacked360::correlation::{BlockLayout, BlockScorer};
use stacked360::{
    CancellationToken, ConfigurationError, DepthError, ErrorMetric, FilterMode, HardwareMode,
    Panorama, PipelineContext, ProgressListener, SearchConfig, estimate_depth,
};

struct NoProgress;

impl ProgressListener for NoProgress {
    fn report_status(&self, _pos: f32) {}
}

struct Gpu {
    context: Arc<GpuContext>,
    program: Arc<MatchingProgram>,
}

/// Everything a scorer needs, or `None` if any part of it cannot be built on this machine.
fn gpu() -> Option<Gpu> {
    let setup = || -> Result<Gpu, String> {
        let context = Arc::new(GpuContext::new(HardwareMode::Gpu).map_err(|err| err.to_string())?);
        let color_format = attachment_format(context.adapter()).map_err(|err| err.to_string())?;
        let program =
            Arc::new(MatchingProgram::new(&context, color_format).map_err(|err| err.to_string())?);
        ComparisonSurface::new(&context, 8).map_err(|err| err.to_string())?;
        Ok(Gpu { context, program })
    };
    match setup() {
        Ok(gpu) => Some(gpu),
        Err(err) => {
            eprintln!("Skipping GPU test: {err}");
            None
        }
    }
}

fn scorer_config(metric: ErrorMetric, filter_mode: FilterMode, subpixel: u32) -> SearchConfig {
    let mut config = SearchConfig::default();
    config.block_size = 8;
    config.metric = metric;
    config.filter_mode = filter_mode;
    config.candidate_range.subpixel = subpixel;
    config
}

fn noise(width: usize, height: usize, seed: u64) -> Panorama {
    let mut rng = StdRng::seed_from_u64(seed);
    let bytes = (0..width * height)
        .flat_map(|_| [rng.random(), rng.random(), rng.random(), 255])
        .collect();
    Panorama::from_rgba(width, height, bytes).unwrap()
}

/// Scores every block of a noise pair on both scorers and returns them side by side.
fn score_pairs(
    gpu: &Gpu,
    config: &SearchConfig,
    offsets: &[i32],
    tolerance: f32,
) -> Vec<(f32, f32)> {
    let bottom = noise(29, 22, 1);
    let top = noise(29, 22, 2);
    let mut cache = TextureCache::new(gpu.context.clone(), config.filter_mode);
    let source = cache.upload(&bottom).unwrap();
    let target = cache.upload(&top).unwrap();
    // A capacity below the candidate count splits every block into several submissions.
    let mut gpu_scorer = GpuScorer::new(
        gpu.context.clone(),
        gpu.program.clone(),
        &cache,
        (source, target),
        config,
        4,
    )
    .unwrap();
    let mut cpu = CpuScorer::new(&bottom, &top, config.metric)
        .with_sampling(config.filter_mode, config.candidate_range.subpixel);

    let mut pairs = vec![];
    for block in BlockLayout::new(29, 22, config.block_size).blocks() {
        let expected = cpu.score_candidates(&block, offsets).unwrap();
        let actual = gpu_scorer.score_candidates(&block, offsets).unwrap();
        for ((offset, expected), actual) in offsets.iter().zip(&expected).zip(&actual) {
            assert!(
                (expected - actual).abs() < tolerance,
                "block {} offset {offset}: cpu {expected} gpu {actual}",
                block.coord
            );
        }
        let single = gpu_scorer.score(&block, offsets[2]).unwrap();
        assert_eq!(single.to_bits(), actual[2].to_bits());
        pairs.extend(expected.into_iter().zip(actual));
    }
    pairs
}

#[test]
fn gpu_scores_match_cpu_scores() {
    let Some(gpu) = gpu() else {
        return;
    };
    let offsets = (-4..=4).collect::<Vec<i32>>();
    for metric in [ErrorMetric::Sad, ErrorMetric::Ssd] {
        for filter_mode in [FilterMode::Nearest, FilterMode::Linear] {
            score_pairs(&gpu, &scorer_config(metric, filter_mode, 1), &offsets, 1e-5);
        }
    }
}

#[test]
fn gpu_half_row_scores_follow_the_filter_mode() {
    let Some(gpu) = gpu() else {
        return;
    };
    // Odd offsets are half rows.
    let offsets = (-5..=5).collect::<Vec<i32>>();
    let nearest = score_pairs(
        &gpu,
        &scorer_config(ErrorMetric::Sad, FilterMode::Nearest, 2),
        &offsets,
        1e-5,
    );
    // Hardware filtering blends with reduced weight precision.
    let linear = score_pairs(
        &gpu,
        &scorer_config(ErrorMetric::Sad, FilterMode::Linear, 2),
        &offsets,
        1e-4,
    );
    let differing = nearest
        .iter()
        .zip(&linear)
        .filter(|((nearest, _), (linear, _))| (nearest - linear).abs() > 1e-3)
        .count();
    assert!(differing > 0);
}

#[test]
fn hardware_selection_reports_gpu_or_fallback() {
    let context = PipelineContext::new(HardwareMode::Gpu, &SearchConfig::default()).unwrap();
    let hardware = context.selected_hardware();
    assert!(
        hardware.starts_with("GPU ") || hardware.starts_with("CPU fallback ("),
        "{hardware}"
    );
}

#[test]
fn context_rejects_a_different_filter_mode() {
    let nearest = scorer_config(ErrorMetric::Sad, FilterMode::Nearest, 1);
    let linear = scorer_config(ErrorMetric::Sad, FilterMode::Linear, 1);
    let mut context = PipelineContext::new(HardwareMode::Gpu, &nearest).unwrap();
    if !context.selected_hardware().starts_with("GPU ") {
        eprintln!("Skipping GPU test: {}", context.selected_hardware());
        return;
    }
    let img = noise(16, 16, 6);
    let result = context.estimate_depth(
        &img,
        &img,
        &linear,
        1,
        None::<&NoProgress>,
        &CancellationToken::new(),
    );
    assert!(matches!(
        result,
        Err(DepthError::Configuration(
            ConfigurationError::FilterModeMismatch {
                active: FilterMode::Nearest,
                requested: FilterMode::Linear,
            }
        ))
    ));
    assert!(
        context
            .estimate_depth(
                &img,
                &img,
                &nearest,
                1,
                None::<&NoProgress>,
                &CancellationToken::new(),
            )
            .is_ok()
    );
}

#[test]
fn attachment_format_is_one_of_the_supported_formats() {
    let Some(gpu) = gpu() else {
        return;
    };
    let format = attachment_format(gpu.context.adapter()).unwrap();
    assert!(format == COLOR_FORMAT || format == PACKED_COLOR_FORMAT);
    let surface = ComparisonSurface::new(&gpu.context, 8).unwrap();
    assert_eq!(surface.format(), format);
}

#[test]
fn captured_errors_stay_with_their_thread() {
    let Some(gpu) = gpu() else {
        return;
    };
    let context = &gpu.context;
    std::thread::scope(|scope| {
        let failing = scope.spawn(|| {
            (0..32)
                .map(|_| {
                    context.capture(|device| {
                        // Read and write mapping together needs a feature that is never requested.
                        device.create_buffer(&wgpu::BufferDescriptor {
                            label: None,
                            size: 16,
                            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::MAP_WRITE,
                            mapped_at_creation: false,
                        })
                    })
                })
                .filter(|result| result.is_err())
                .count()
        });
        let passing = scope.spawn(|| {
            (0..32)
                .map(|_| {
                    let encoder = context
                        .device()
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
                    context.submit_and_wait(encoder)
                })
                .filter(|result| result.is_err())
                .count()
        });
        assert_eq!(failing.join().unwrap(), 32);
        assert_eq!(passing.join().unwrap(), 0);
    });
}

#[test]
fn gpu_depth_maps_match_cpu_depth_maps() {
    if gpu().is_none() {
        return;
    }
    let bottom = noise(40, 32, 3);
    let top = noise(40, 32, 4);
    let config = SearchConfig::default();
    let run = |hardware_mode, workers| {
        estimate_depth(
            &bottom,
            &top,
            &config,
            hardware_mode,
            workers,
            None::<&NoProgress>,
            &CancellationToken::new(),
        )
        .unwrap()
    };
    let cpu = run(HardwareMode::Cpu, 1);
    let gpu = run(HardwareMode::Gpu, 1);
    let gpu_parallel = run(HardwareMode::Gpu, 2);
    assert_eq!(cpu.bottom, gpu.bottom);
    assert_eq!(cpu.top, gpu.top);
    assert_eq!(gpu.bottom, gpu_parallel.bottom);
}

#[test]
fn texture_cache_tracks_handles() {
    let Some(gpu) = gpu() else {
        return;
    };
    let mut cache = TextureCache::new(gpu.context, FilterMode::Nearest);
    let img = noise(16, 8, 5);
    let first = cache.upload(&img).unwrap();
    let second = cache.upload(&img).unwrap();
    assert_ne!(first, second);
    assert_eq!((first.width(), first.height()), (16, 8));
    assert_eq!(cache.len(), 2);

    cache.release(first).unwrap();
    assert_eq!(cache.len(), 1);
    assert!(matches!(
        cache.release(first),
        Err(UploadError::UnknownHandle(_))
    ));
    assert!(cache.texture(second).is_ok());
}

#[test]
fn surface_rejects_invalid_sizes_and_reads_back_cleared() {
    let Some(gpu) = gpu() else {
        return;
    };
    let context = gpu.context;
    assert!(matches!(
        ComparisonSurface::new(&context, 0),
        Err(SurfaceError::ZeroSize)
    ));
    let too_large = context.limits().max_texture_dimension_2d + 1;
    assert!(matches!(
        ComparisonSurface::new(&context, too_large),
        Err(SurfaceError::TooLarge { .. })
    ));

    let surface = ComparisonSurface::new(&context, 4).unwrap();
    let mut encoder = context
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    drop(surface.bind(&mut encoder));
    context.submit_and_wait(encoder).unwrap();
    let buffer = surface.readback(&context).unwrap();
    assert_eq!(buffer.size(), 4);
    assert!(buffer.values().iter().all(|&v| v == 0.0));
}
