//! Queue Worker - Entry Point

use clap::Parser;
use queue_worker_app::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    queue_worker_app::run(Cli::parse()).await
}
