use clap::Parser;
use std::process;
use tracekit::cli::{commands, Cli};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting tracekit v{}", tracekit::VERSION);

    if let Err(e) = commands::handle_command(cli.command).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
