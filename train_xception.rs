// train_xception.rs
// Trains the three-slice Xception classifier on preprocessed batch files.
//
// Expected input:
//   <batches-dir>/*.batch  (bincode-encoded batches, read in file-name order)
//
// Output:
//   - <checkpoint-dir>/model_checkpoint<N>.h5 every `checkpoint_interval` batches
//   - <checkpoint-dir>/model_trained_categorical.h5 if training fails
//
// A training failure is logged after the failure checkpoint is written and the
// process still exits 0. Setup errors exit 1.
//
// Logging goes to stderr; RUST_LOG overrides --log-level.

use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{error, info, warn};
use multislice_xception::architecture::{load_architecture, ArchitectureConfig};
use multislice_xception::config::{load_config, TrainingConfig};
use multislice_xception::{
    CpuBackend, FileBatchSource, ModelOptions, Result, Trainer, Weights, XceptionModel,
};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(about = "Train the multi-slice Xception classifier")]
struct Cli {
    /// level of logging details (into stderr)
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// training configuration (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// "shallow", "deep", or a path to an architecture JSON file
    #[arg(short, long, default_value = "shallow")]
    architecture: String,

    /// directory holding the batch files
    #[arg(short, long)]
    batches_dir: PathBuf,

    /// overrides `checkpoint_dir` of the training configuration
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// resume from this checkpoint instead of random initialisation
    #[arg(long)]
    resume: Option<PathBuf>,

    /// seed of the weight initialisation
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "off,multislice_xception=error,train_xception=error",
            LogLevel::Warn => "off,multislice_xception=warn,train_xception=warn",
            LogLevel::Info => "off,multislice_xception=info,train_xception=info",
            LogLevel::Debug => "off,multislice_xception=debug,train_xception=debug",
            LogLevel::Trace => "off,multislice_xception=trace,train_xception=trace",
        }
    }
}

fn resolve_architecture(arg: &str) -> Result<ArchitectureConfig> {
    match arg {
        "shallow" => Ok(ArchitectureConfig::shallow()),
        "deep" => Ok(ArchitectureConfig::deep()),
        path => load_architecture(path),
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            warn!("No training configuration given, using defaults");
            TrainingConfig::default()
        }
    };
    if let Some(dir) = cli.checkpoint_dir {
        config.checkpoint_dir = dir;
    }

    let architecture = resolve_architecture(&cli.architecture)?;
    let options = ModelOptions {
        weights: cli.resume.map_or(Weights::None, Weights::Checkpoint),
        seed: cli.seed,
        num_classes: config.num_classes,
        ..ModelOptions::default()
    };

    let backend = CpuBackend::new();
    let model = XceptionModel::build(&architecture, options, &backend)?;
    info!(
        "Built '{}' ({} parameters), output shape {:?}",
        model.name(),
        model.parameter_count(),
        model.output_shape(1)
    );

    let mut source = FileBatchSource::new(&cli.batches_dir);
    let mut trainer = Trainer::new(model, config)?;
    let report = trainer.run(&mut source)?;

    match &report.failure {
        Some(reason) => error!(
            "Training stopped after {} batches: {}; model saved to {}",
            report.batches_processed,
            reason,
            report
                .emergency_checkpoint
                .as_deref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string())
        ),
        None => info!(
            "Done: {} epochs, {} batches, {} checkpoints",
            report.epochs_completed,
            report.batches_processed,
            report.checkpoints.len()
        ),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    env_logger::init_from_env(Env::default().default_filter_or(cli.log_level.filter()));

    if let Err(e) = run(cli) {
        error!("{}", e);
        process::exit(1);
    }
}
