//! Typed runtime configuration, loaded once into a process-wide `OnceCell`
//! via the `config` crate.

use std::fmt;

use once_cell::sync::OnceCell;
use serde::Deserialize;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub sources: Vec<SourceConfig>,
    pub database: DatabaseConfig,
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: u64,
    #[serde(default = "default_flush_ratio")]
    pub flush_ratio: f64,
    #[serde(default = "default_factory_address_threshold")]
    pub factory_address_threshold: u64,
    #[serde(default = "default_rpc_max_concurrency")]
    pub rpc_max_concurrency: usize,
    #[serde(default = "default_sync_events_query_size")]
    pub sync_events_query_size: usize,
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: usize,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default = "default_finality_lag")]
    pub finality_lag: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Log {
        name: String,
        chain: String,
        address: Option<String>,
        event_signatures: Vec<String>,
        start_block: u64,
        end_block: Option<u64>,
        #[serde(default)]
        factory: Option<FactorySource>,
    },
    Block {
        name: String,
        chain: String,
        interval: u64,
        offset: u64,
        start_block: u64,
        end_block: Option<u64>,
    },
    Transaction {
        name: String,
        chain: String,
        from_address: Option<String>,
        to_address: Option<String>,
        selectors: Vec<String>,
        start_block: u64,
        end_block: Option<u64>,
    },
    Trace {
        name: String,
        chain: String,
        to_address: Option<String>,
        selectors: Vec<String>,
        start_block: u64,
        end_block: Option<u64>,
    },
    Transfer {
        name: String,
        chain: String,
        from_address: Option<String>,
        to_address: Option<String>,
        start_block: u64,
        end_block: Option<u64>,
    },
}

/// Declares that a `Log` source's matching addresses are not fixed but
/// discovered at runtime: each log matching `parent_source` has a child
/// address decoded out of it at `address_location` and registered with the
/// `ChildAddressRegistry`, e.g. a factory contract's `PoolCreated` event.
#[derive(Debug, Clone, Deserialize)]
pub struct FactorySource {
    pub parent_source: String,
    /// Where to find the new address in the parent log: `topicN` for an
    /// indexed event argument, `offsetN` for a byte offset into `data`.
    pub address_location: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub dialect: Dialect,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_dir: None,
        }
    }
}

fn default_cache_bytes() -> u64 {
    1 << 30
}
fn default_flush_ratio() -> f64 {
    0.5
}
fn default_factory_address_threshold() -> u64 {
    10_000
}
fn default_rpc_max_concurrency() -> usize {
    10
}
fn default_sync_events_query_size() -> usize {
    1_000
}
fn default_reorg_depth() -> usize {
    256
}
fn default_finality_lag() -> u64 {
    0
}
fn default_bind_addr() -> String {
    "0.0.0.0:42069".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl From<config::ConfigError> for ConfigError {
    fn from(value: config::ConfigError) -> Self {
        ConfigError(value.to_string())
    }
}

/// Load config for standalone binaries/utilities, without touching the
/// global cell.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let raw = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("BLOCKINDEXER").separator("__"))
        .build()?;
    raw.try_deserialize().map_err(ConfigError::from)
}

pub fn init_global_config(path: &str) -> Result<(), ConfigError> {
    let config = load_config(path)?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| ConfigError("config already set".to_string()))
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config() {
        let raw = r#"
            [[chains]]
            name = "mainnet"
            chain_id = 1
            rpc_url = "https://example.invalid"

            [[sources]]
            kind = "log"
            name = "erc20_transfers"
            chain = "mainnet"
            event_signatures = ["Transfer(address,address,uint256)"]
            start_block = 0

            [database]
            dialect = "sqlite"
            url = "sqlite://test.db"
        "#;
        let parsed: Config = toml::from_str(raw).expect("valid config");
        assert_eq!(parsed.chains.len(), 1);
        assert_eq!(parsed.cache_bytes, default_cache_bytes());
        assert_eq!(parsed.reorg_depth, default_reorg_depth());
    }
}
