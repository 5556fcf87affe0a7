//! kiln server binary.

use std::path::{Path, PathBuf};

use clap::Parser;
use server::{Config, logging, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kiln-server")]
#[command(about = "In-memory RESP key/value server", version)]
struct Args {
    /// Path to the INI configuration file
    #[arg(default_value = "config.ini")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    let config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                std::process::exit(1);
            }
        }
    } else if args.config == Path::new("config.ini") {
        // The default path is optional; everything has a default.
        Config::default()
    } else {
        eprintln!("config file {} not found", args.config.display());
        std::process::exit(1);
    };

    logging::init(&config.logging.level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "kiln server starting"
    );

    let shutdown = signal::install_signal_handler();
    if let Err(e) = server::run(&config, shutdown) {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
