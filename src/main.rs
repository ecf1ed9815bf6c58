use clap::Parser;
use envfs::cli;

#[cfg(debug_assertions)]
const MAX_LEVEL: tracing::Level = tracing::Level::TRACE;
#[cfg(not(debug_assertions))]
const MAX_LEVEL: tracing::Level = tracing::Level::INFO;

fn main() {
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::builder()
        .with_default_directive(MAX_LEVEL.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = cli::Cli::parse();
    if let Err(e) = cli.run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
