mod config;
mod error;
mod io;
mod processing;
mod utils;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::load_config;
use processing::process_batch::process_batch;
use processing::transform::TransformMode;

/// Aligns a batch of surface meshes into a common frame using corresponding landmarks.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Transform family, overrides `settings.mode`.
    #[arg(long, value_enum)]
    mode: Option<TransformMode>,

    /// Output directory, overrides `general.output_dir`.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Transform subjects on the rayon thread pool.
    #[arg(long)]
    parallel: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?.with_overrides(cli.mode, cli.output_dir, cli.parallel);

    let report = process_batch(&config)?;
    info!(
        "Aligned {} meshes ({} mode, {} iteration(s), converged: {})",
        report.subjects.len(),
        report.mode,
        report.iterations,
        report.converged
    );
    if let Some(scale) = report.scale_factor {
        info!("Mean shape rescaled by average centroid size {:.4}", scale);
    }
    Ok(())
}
