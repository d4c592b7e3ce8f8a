// Canopy — Application Entry Point
//
// Parses CLI arguments, initializes structured logging (the default filter
// never emits plaintext names or message bodies), and dispatches to the
// command handler.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use canopy::cli::{execute, Cli};

fn main() {
    // RUST_LOG=canopy=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("canopy=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = execute(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
