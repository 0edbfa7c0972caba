//! Adaptar CLI - apply LoRA adapters to GGUF models
//!
//! # Commands
//!
//! - `inspect` - Show an adapter's header and tensor records
//! - `apply` - Merge an adapter into a model and report what changed

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use adaptar::{
    apply_lora_with_options, error::Result, lora::LoraAdapterFile, LoadedModel, LoraConfig,
    MergeOptions,
};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Adaptar - load-time LoRA adapter merging
#[derive(Parser)]
#[command(name = "adaptar")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (per-tensor merges and progress)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show an adapter file's header and records
    ///
    /// Examples:
    ///   adaptar inspect ./alpaca.ggla
    Inspect {
        /// Adapter file
        #[arg(value_name = "ADAPTER")]
        adapter: PathBuf,
    },
    /// Merge an adapter into a model
    ///
    /// Examples:
    ///   adaptar apply --model llama-q8_0.gguf --lora alpaca.ggla
    ///   adaptar apply --model llama-q8_0.gguf --lora alpaca.ggla --lora-base llama-f16.gguf
    Apply {
        /// Target model (GGUF)
        #[arg(short, long)]
        model: PathBuf,

        /// Adapter file
        #[arg(short, long)]
        lora: PathBuf,

        /// Higher-precision base model (GGUF) to read base weights from
        #[arg(long)]
        lora_base: Option<PathBuf>,

        /// User scale multiplied into alpha / rank
        #[arg(short, long)]
        scale: Option<f32>,

        /// Worker threads for graph execution
        #[arg(short, long)]
        threads: Option<usize>,

        /// JSON configuration file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn inspect(path: &Path) -> Result<()> {
    let adapter = LoraAdapterFile::open(path)?;
    let header = adapter.header;
    println!("Adapter: {}", path.display());
    println!("  Version: {}", header.version);
    println!("  Rank:    {}", header.rank);
    println!("  Alpha:   {}", header.alpha);
    println!("  Scaling: {} (at scale 1.0)", header.scaling(1.0));
    println!("  Records: {}", adapter.records.len());

    let mut records: Vec<_> = adapter.records.values().collect();
    records.sort_by_key(|r| r.offset);
    for record in records {
        println!(
            "    {:<48} {:>4} [{}, {}] @ {}",
            record.name, record.desc.dtype, record.desc.ne[0], record.desc.ne[1], record.offset
        );
    }
    Ok(())
}

fn apply(
    model_path: &Path,
    lora: &Path,
    lora_base: Option<PathBuf>,
    scale: Option<f32>,
    threads: Option<usize>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => LoraConfig::from_json_file(path)?,
        None => LoraConfig::default(),
    };
    if let Some(scale) = scale {
        config = config.with_scale(scale);
    }
    if let Some(threads) = threads {
        config = config.with_threads(threads);
    }
    if let Some(base) = lora_base {
        config = config.with_base_model(base);
    }

    info!(model = %model_path.display(), "loading model");
    let mut model = LoadedModel::from_path(model_path)?;
    info!(tensors = model.len(), "model loaded");

    let options = MergeOptions::default().on_tensor_merged(|name, count| {
        tracing::trace!(tensor = name, count, "tensor merged");
    });
    let report = apply_lora_with_options(&mut model, lora, &config, options)?;

    println!("Merged:   {}", report.merged);
    println!("Skipped:  {}", report.skipped);
    println!("Scaling:  {}", report.scaling);
    println!("Elapsed:  {:.2} ms", report.elapsed.as_secs_f64() * 1000.0);
    if report.quantized_base_warned {
        println!("Warning:  merged into quantized weights; consider --lora-base");
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Inspect { adapter } => inspect(&adapter),
        Commands::Apply {
            model,
            lora,
            lora_base,
            scale,
            threads,
            config,
        } => apply(&model, &lora, lora_base, scale, threads, config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        },
    }
}
