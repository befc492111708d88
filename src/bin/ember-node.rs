#![forbid(unsafe_code)]
//! Emberchain node executable

use clap::Parser;
use emberchain::config::{Cli, Config};
use emberchain::node::Node;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let node = match Node::init(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to initialize node: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = node.start().await {
        error!("node stopped with error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
