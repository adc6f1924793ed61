//! gpu-dequant CLI
//!
//! - `check` - run the validation scenarios against the CPU reference
//! - `load` - upload every tensor of a GGUF file and print its device layout

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use gpu_dequant::gguf::{upload_all, GgufReader};
use gpu_dequant::{run_scenario, DeviceContext, DispatchConfig, GgmlType, RuntimeConfig, Scenario};

/// Dequantize GGML block-quantized tensors on the GPU
#[derive(Parser)]
#[command(name = "gpu-dequant")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Run the kernels on the host thread pool instead of a GPU
    #[arg(long, global = true)]
    host: bool,

    /// JSON runtime config (default: <config dir>/gpu-dequant/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dequantize a 1M-element ramp and a 1024x1024 ramp, compare with the CPU
    Check {
        /// Block format to test
        #[arg(short, long, value_enum, default_value = "q4_0")]
        format: Format,

        /// Maximum accepted relative error
        #[arg(short, long, default_value = "0.01")]
        tolerance: f32,
    },
    /// Upload every tensor of a GGUF file and print its device layout
    Load {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    #[value(name = "q4_0")]
    Q4_0,
    #[value(name = "q6_k")]
    Q6K,
    #[value(name = "f32")]
    F32,
}

impl From<Format> for GgmlType {
    fn from(f: Format) -> Self {
        match f {
            Format::Q4_0 => GgmlType::Q4_0,
            Format::Q6K => GgmlType::Q6_K,
            Format::F32 => GgmlType::F32,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RuntimeConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .init();

    let ctx = if cli.host {
        DeviceContext::host()
    } else {
        DeviceContext::with_options(&config.device)
    }
    .context("Failed to initialise compute device")?;
    let dispatch = config.dispatch.clamp_to(ctx.adapter());

    match cli.command {
        Commands::Check { format, tolerance } => check(&ctx, format.into(), tolerance, &dispatch),
        Commands::Load { path } => load(&ctx, &path),
    }
}

fn check(ctx: &DeviceContext, format: GgmlType, tolerance: f32, dispatch: &DispatchConfig) -> Result<()> {
    let mut failed = 0;
    for scenario in [Scenario::RANK1, Scenario::RANK2] {
        let report = run_scenario(ctx, scenario, format, dispatch)
            .with_context(|| format!("{scenario} ({format}) failed"))?;
        let verdict = if report.passes(tolerance) { "ok" } else { "FAIL" };
        println!(
            "{scenario} {format:<5} max rel err {:.3e} at [{}] cpu={} device={}  {verdict}",
            report.max_rel_error, report.index, report.cpu, report.device
        );
        if !report.passes(tolerance) {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} scenario(s) above tolerance {tolerance}");
    }
    Ok(())
}

fn load(ctx: &DeviceContext, path: &Path) -> Result<()> {
    let mut reader = GgufReader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    println!("version:     {}", reader.version());
    println!("alignment:   {}", reader.alignment());
    println!("data offset: {}", reader.data_offset());
    println!("n_kv:        {}", reader.metadata().len());
    for (i, (key, ty)) in reader.metadata().iter().enumerate() {
        println!("  kv[{i}]: {key} ({})", ty.name());
    }
    println!("n_tensors:   {}", reader.tensor_count());

    let outcomes = upload_all(ctx, &mut reader)
        .with_context(|| format!("Failed to read tensors from {}", path.display()))?;

    let mut device_bytes = 0;
    let mut skipped = 0;
    for outcome in &outcomes {
        match &outcome.tensor {
            Ok(t) => {
                device_bytes += t.device_bytes();
                println!(
                    "  {:<40} offset={:<12} {:<5} ne={:?} weight_stride={} metadata_stride={}",
                    outcome.name,
                    outcome.offset,
                    t.ggml_type(),
                    t.ne(),
                    t.weight_stride(),
                    t.metadata_stride()
                );
            }
            Err(e) => {
                skipped += 1;
                println!("  {:<40} offset={:<12} skipped: {e}", outcome.name, outcome.offset);
            }
        }
    }
    println!(
        "uploaded {} of {} tensors, {:.1} MiB on {}",
        outcomes.len() - skipped,
        outcomes.len(),
        device_bytes as f64 / (1024.0 * 1024.0),
        ctx.adapter().name
    );
    Ok(())
}
