//! foundry CLI entry point

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use foundry::cli::{run, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        // Single-line summary; details live in the diagnostic bundle.
        eprintln!("Error: {e}");
        eprintln!("collect a diagnostic bundle from the cluster's generated/ directory for details");
        std::process::exit(e.exit_code());
    }
}
