//! Configuration management
//!
//! Flags take precedence over the environment. The `.env` file is loaded at
//! startup when present; `DATA_SOURCE_NAME` backs `--dsn`, `DB_DRIVER_NAME`
//! must name sqlite (the only supported driver), and `SEED_NODES` feeds the
//! bootstrap peer list. TLS material lives at the fixed paths `cert.pem` and
//! `key.pem`; absence of either disables TLS.

use crate::discovery;
use clap::Parser;
use std::env;
use std::path::Path;

pub const DEFAULT_DSN: &str = "blockchain_db.sqlite";
pub const TLS_CERT_PATH: &str = "cert.pem";
pub const TLS_KEY_PATH: &str = "key.pem";

#[derive(Debug, Parser)]
#[command(name = "ember-node", about = "Run an Emberchain node")]
pub struct Cli {
    /// HTTP administrative port
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// P2P TCP port
    #[arg(long, default_value_t = 8080)]
    pub node_port: u16,

    /// State store location (falls back to DATA_SOURCE_NAME)
    #[arg(long)]
    pub dsn: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub node_port: u16,
    pub dsn: String,
    pub seed_nodes: Vec<String>,
    pub tls_enabled: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, String> {
        // Best-effort .env load; a missing file is not an error.
        let _ = dotenvy::dotenv();

        let driver = env::var("DB_DRIVER_NAME").unwrap_or_default();
        if !driver.is_empty() && driver != "sqlite3" && driver != "sqlite" {
            return Err(format!("unsupported DB_DRIVER_NAME: {}", driver));
        }

        let dsn = cli
            .dsn
            .or_else(|| env::var("DATA_SOURCE_NAME").ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| DEFAULT_DSN.to_string());

        let tls_enabled = Path::new(TLS_CERT_PATH).exists() && Path::new(TLS_KEY_PATH).exists();

        Ok(Config {
            http_port: cli.port,
            node_port: cli.node_port,
            dsn,
            seed_nodes: discovery::resolve_seed_nodes(),
            tls_enabled,
        })
    }

    /// The node's own P2P endpoint as peers should dial it.
    pub fn p2p_address(&self) -> String {
        format!("127.0.0.1:{}", self.node_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["ember-node"]);
        assert_eq!(cli.port, 8000);
        assert_eq!(cli.node_port, 8080);
        assert!(cli.dsn.is_none());
    }

    #[test]
    fn test_flag_overrides() {
        let cli = Cli::parse_from([
            "ember-node",
            "--port",
            "9000",
            "--node-port",
            "9090",
            "--dsn",
            "/tmp/test.sqlite",
        ]);
        assert_eq!(cli.port, 9000);
        assert_eq!(cli.node_port, 9090);
        assert_eq!(cli.dsn.as_deref(), Some("/tmp/test.sqlite"));
    }
}
