pub mod commands;
pub mod config;
pub mod rig;
pub mod serial;

use clap::Parser;

/// Headless entry point: install the logger, parse arguments, dispatch.
pub async fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = commands::Cli::parse();
    log::info!("PIPA rig controller started");
    commands::execute(cli).await
}
