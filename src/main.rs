use clap::Parser;
use tracing_subscriber::EnvFilter;

use sync_supervisor::cli::{self, Cli};
use sync_supervisor::errors::exit_code_for;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // -v forces debug; otherwise RUST_LOG, defaulting to warnings only
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli::dispatch(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(exit_code_for(&e));
        }
    }
}
