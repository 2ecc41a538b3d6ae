#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

use std::path::PathBuf;

use clap::Parser;

/// Service provision API server.
#[derive(Parser)]
#[command(name = "sirtep_server", version)]
struct Cli {
    /// TOML file overriding the built-in configuration.
    #[arg(long, env = "SIRTEP_CONFIG")]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let cli = Cli::parse();
    sirtep_server::run_server(cli.config.as_deref()).await?;
    Ok(())
}
