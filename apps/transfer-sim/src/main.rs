//! Multi-channel transfer simulator.
//!
//! Usage: `transfer-sim <FILE> [CONFIG.json]`

mod app;
mod config;
mod sim;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args_os().skip(1);
    let Some(file) = args.next().map(PathBuf::from) else {
        anyhow::bail!("usage: transfer-sim <FILE> [CONFIG.json]");
    };
    let config_path = args.next().map(PathBuf::from);

    let config = config::SimConfig::load(config_path.as_deref())?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        channels = config.channels.len(),
        chunk_size = config.session.chunk_size,
        "starting transfer simulator"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(app::run(&file, config))?;

    tracing::info!(status = ?outcome.status, "simulation finished");
    outcome.into_result()?;
    Ok(())
}
