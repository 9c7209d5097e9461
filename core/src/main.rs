//! RBSLAM: replay recorded IMU and camera keypoint logs through the RBPF localizer.
//!
//! - `run` merges an IMU log and an optional keypoint log, runs the filter over every tick and writes the estimated
//!   trajectory (and optionally the final landmark map) as CSV.
//! - `config` writes a configuration template (TOML/JSON/YAML) with every default filled in.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use rbslam::SlamConfig;
use rbslam::messages::{build_event_stream, read_camera_csv, read_imu_csv};
use rbslam::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};
use rbslam::sim::{LandmarkRecord, TrajectoryRecord, run_replay};

#[derive(Parser)]
#[command(author, version, about = "Rao-Blackwellized particle filter for visual-inertial localization and mapping.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Replay an IMU log and a keypoint log through the filter
    Run(RunArgs),
    /// Write a configuration template
    Config {
        /// Output file; the extension selects the format (.toml, .json, .yaml, .yml)
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// IMU CSV (timestamp_ms + 15 sensor columns, no header)
    #[arg(long)]
    imu: PathBuf,

    /// Keypoint CSV (timestamp_ms, then `nomatch` or index,x,y triples)
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Trajectory CSV to write
    #[arg(short, long)]
    output: PathBuf,

    /// Landmark map CSV of the best particle at the end of the run
    #[arg(long)]
    landmarks: Option<PathBuf>,

    /// Configuration file (TOML/JSON/YAML); defaults are used for anything missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of particles
    #[arg(long)]
    particles: Option<usize>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    resampling: Option<ParticleResamplingStrategy>,

    #[arg(long, value_enum)]
    averaging: Option<ParticleAveragingStrategy>,

    /// Process particles in parallel
    #[arg(long)]
    parallel: bool,
}

fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<SlamConfig> {
    let mut config = match &args.config {
        Some(path) => SlamConfig::from_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => SlamConfig::default(),
    };
    if let Some(n) = args.particles {
        config.rbpf.num_particles = n;
    }
    if let Some(seed) = args.seed {
        config.rbpf.seed = seed;
    }
    if let Some(strategy) = args.resampling {
        config.rbpf.resampling_strategy = strategy;
    }
    if let Some(strategy) = args.averaging {
        config.rbpf.averaging_strategy = strategy;
    }
    if args.parallel {
        config.rbpf.parallel = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run(args: &RunArgs) -> Result<()> {
    let config = load_config(args)?;
    let imu = read_imu_csv(&args.imu)
        .with_context(|| format!("reading IMU log {}", args.imu.display()))?;
    let frames = match &args.frames {
        Some(path) => read_camera_csv(path)
            .with_context(|| format!("reading keypoint log {}", path.display()))?,
        None => Vec::new(),
    };
    info!(
        "loaded {} IMU records and {} camera frames; {} particles, {:?} resampling",
        imu.len(),
        frames.len(),
        config.rbpf.num_particles,
        config.rbpf.resampling_strategy
    );

    let stream = build_event_stream(&imu, &frames);
    let result = run_replay(&config, &stream)?;

    TrajectoryRecord::to_csv(&result.trajectory, &args.output)
        .with_context(|| format!("writing trajectory {}", args.output.display()))?;
    info!("wrote {} rows to {}", result.trajectory.len(), args.output.display());

    if let Some(path) = &args.landmarks {
        LandmarkRecord::to_csv(&result.landmarks, path)
            .with_context(|| format!("writing landmarks {}", path.display()))?;
        info!("wrote {} landmarks to {}", result.landmarks.len(), path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Run(args) => run(args),
        Command::Config { output } => {
            SlamConfig::default()
                .to_file(output)
                .with_context(|| format!("writing configuration {}", output.display()))?;
            info!("wrote configuration template to {}", output.display());
            Ok(())
        }
    }
}
