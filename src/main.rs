use std::{path::PathBuf, process::exit};

use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use stacked360::{
    CancellationToken, ErrorMetric, FilterMode, HardwareMode, ProgressListener, RunOptions,
    SearchConfig, config::Calibration, pipeline,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Gpu,
    GpuLowPower,
    Cpu,
}

impl From<ModeArg> for HardwareMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Gpu => HardwareMode::Gpu,
            ModeArg::GpuLowPower => HardwareMode::GpuLowPower,
            ModeArg::Cpu => HardwareMode::Cpu,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MetricArg {
    Sad,
    Ssd,
}

impl From<MetricArg> for ErrorMetric {
    fn from(value: MetricArg) -> Self {
        match value {
            MetricArg::Sad => ErrorMetric::Sad,
            MetricArg::Ssd => ErrorMetric::Ssd,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterArg {
    Nearest,
    Linear,
}

impl From<FilterArg> for FilterMode {
    fn from(value: FilterArg) -> Self {
        match value {
            FilterArg::Nearest => FilterMode::Nearest,
            FilterArg::Linear => FilterMode::Linear,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Estimates depth maps from vertically stacked 360° panoramas"
)]
struct Cli {
    /// JSON configuration file; other options override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Block size in pixels [default: 8]
    #[arg(long)]
    block_size: Option<usize>,
    /// Smallest vertical offset [default: -16]
    #[arg(long, allow_negative_numbers = true)]
    min_offset: Option<i32>,
    /// Largest vertical offset [default: 16]
    #[arg(long, allow_negative_numbers = true)]
    max_offset: Option<i32>,
    /// Offset step [default: 1]
    #[arg(long)]
    step: Option<i32>,
    /// Offsets are counted in 1/N rows [default: 1]
    #[arg(long)]
    subpixel: Option<u32>,
    /// Error metric [default: sad]
    #[arg(long, value_enum)]
    metric: Option<MetricArg>,
    /// Texture filtering [default: nearest]
    #[arg(long, value_enum)]
    filter: Option<FilterArg>,
    /// Depth at an offset of one pixel; depth is inversely proportional to the offset
    #[arg(long)]
    depth_scale: Option<f32>,
    /// Lower depth limit
    #[arg(long)]
    min_depth: Option<f32>,
    /// Upper depth limit, also used for a zero offset
    #[arg(long)]
    max_depth: Option<f32>,
    /// Hardware mode
    #[arg(long, value_enum, default_value = "gpu")]
    mode: ModeArg,
    /// Number of parallel scorers
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Bottom panorama
    bottom: PathBuf,
    /// Top panorama
    top: PathBuf,
    /// Output depth map (.raw, .f32, .bin, .png, .tif or .tiff)
    output: PathBuf,
}

impl Cli {
    fn search_config(&self) -> Result<SearchConfig, stacked360::ConfigurationError> {
        let mut config = match &self.config {
            Some(path) => SearchConfig::from_json_file(path)?,
            None => SearchConfig::default(),
        };
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(min) = self.min_offset {
            config.candidate_range.min = min;
        }
        if let Some(max) = self.max_offset {
            config.candidate_range.max = max;
        }
        if let Some(step) = self.step {
            config.candidate_range.step = step;
        }
        if let Some(metric) = self.metric {
            config.metric = metric.into();
        }
        if let Some(subpixel) = self.subpixel {
            config.candidate_range.subpixel = subpixel;
        }
        if let Some(filter) = self.filter {
            config.filter_mode = filter.into();
        }
        if self.depth_scale.is_some() || self.min_depth.is_some() || self.max_depth.is_some() {
            let (scale, min_depth, max_depth) = match config.calibration {
                Calibration::InverseProportional {
                    scale,
                    min_depth,
                    max_depth,
                } => (scale, min_depth, max_depth),
                _ => (1.0, 0.0, None),
            };
            config.calibration = Calibration::InverseProportional {
                scale: self.depth_scale.unwrap_or(scale),
                min_depth: self.min_depth.unwrap_or(min_depth),
                max_depth: self.max_depth.or(max_depth),
            };
        }
        Ok(config)
    }
}

struct ProgressBarListener {
    pb: ProgressBar,
}

impl ProgressBarListener {
    fn new() -> ProgressBarListener {
        let pb = ProgressBar::new(10000);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{bar:40} {percent_precise:>7}% (eta: {eta})")
        {
            pb.set_style(style);
        }
        ProgressBarListener { pb }
    }
}

impl ProgressListener for ProgressBarListener {
    fn report_status(&self, pos: f32) {
        self.pb.set_position((pos * 10000.0) as u64);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    info!(
        "stacked360 version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );

    let cli = Cli::parse();
    let config = match cli.search_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Depth estimation failed at stage configuration: {}", err);
            exit(1);
        }
    };
    let options = RunOptions {
        bottom: cli.bottom,
        top: cli.top,
        output: cli.output,
        config,
        hardware_mode: cli.mode.into(),
        workers: cli.workers,
    };

    let listener = ProgressBarListener::new();
    let result = pipeline::run(&options, Some(&listener), &CancellationToken::new());
    listener.pb.finish_and_clear();
    if let Err(err) = result {
        eprintln!("Depth estimation failed at stage {}: {}", err.stage(), err);
        exit(1);
    }
}
