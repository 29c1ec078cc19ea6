use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sourcebuf::config::Config;
use sourcebuf::replay::{self, Session};

/// Replays scripted frame batches through a source buffer and logs the
/// resulting buffered ranges.
#[derive(Parser, Debug)]
#[command(name = "sourcebuf", version, about)]
struct Args {
    /// Config file (defaults to ./sourcebuf.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON list of replay steps
    script: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sourcebuf=debug".parse()?))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::info!(
        gap_policy = ?config.stream.gap_policy,
        buffer_duration_ms = config.stream.default_buffer_duration_ms,
        "config loaded"
    );

    let steps = replay::load_script(&args.script)?;
    tracing::info!("loaded {} step(s) from {}", steps.len(), args.script.display());

    let mut session = Session::new(config);
    if let Err(e) = session.run(steps) {
        tracing::error!(error = %e, "replay failed");
        return Err(e.into());
    }

    tracing::info!(duration = %session.duration(), "replay complete");
    Ok(())
}
