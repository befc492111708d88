//! Seed-node discovery
//!
//! Bootstrap peers come from the `SEED_NODES` environment variable as a
//! comma-separated list of `host:port` entries.

use std::env;

pub const SEED_NODES_ENV: &str = "SEED_NODES";

/// Resolves the configured seed nodes. An unset variable yields an empty
/// list.
pub fn resolve_seed_nodes() -> Vec<String> {
    parse_seed_list(&env::var(SEED_NODES_ENV).unwrap_or_default())
}

/// Splits a comma-separated seed list, trimming whitespace and dropping
/// empty entries.
pub fn parse_seed_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}
