//! EmberKV server entry point.
//!
//! Resolves the listening port, sets up logging and runs the event loop.

use clap::Parser;
use emberkv::config::Config;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Single-threaded in-memory key-value server
#[derive(Debug, Parser)]
#[command(name = "emberkv", version)]
struct Cli {
    /// TOML config file. Without it the port comes from $PORT, then 6379.
    config: Option<PathBuf>,
}

fn print_banner(config: &Config) {
    println!(
        r#"
EmberKV v{} - Single-Threaded In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Listening on {}

Connect with redis-cli:
    $ redis-cli -p {}
"#,
        emberkv::VERSION,
        config.bind_address(),
        config.port
    );
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    print_banner(&config);
    info!(port = config.port, "Starting server");

    emberkv::serve(&config)?;
    Ok(())
}
