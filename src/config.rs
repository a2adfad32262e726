use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::endpoints::ChainDefaults;
use crate::indexer::span::SpanBounds;

pub const MAX_CHAINS: usize = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub tracked_tokens: Vec<TrackedTokenConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

// ============================================================
// Engine Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_min_span")]
    pub min_span: u64,
    #[serde(default = "default_max_span")]
    pub max_span: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// How far behind the tip a chain with no checkpoint and no start block
    /// begins.
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    #[serde(default = "default_max_span_attempts")]
    pub max_span_attempts: u32,
    #[serde(default = "default_config_ttl_secs")]
    pub config_ttl_secs: u64,
    #[serde(default = "default_endpoint_cooldown_secs")]
    pub endpoint_cooldown_secs: u64,
    #[serde(default = "default_rate_limit_fallback_ms")]
    pub rate_limit_fallback_ms: u64,
    #[serde(default = "default_holders_interval_ms")]
    pub holders_interval_ms: u64,
    #[serde(default = "default_block_fetch_concurrency")]
    pub block_fetch_concurrency: usize,
    /// Run one cycle per poller, then exit.
    #[serde(default)]
    pub one_shot: bool,
    /// Migrate and seed, but start no pollers.
    #[serde(default)]
    pub skip_autostart: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            confirmations: default_confirmations(),
            min_span: default_min_span(),
            max_span: default_max_span(),
            backoff_base_ms: default_backoff_base_ms(),
            lookback_blocks: default_lookback_blocks(),
            max_span_attempts: default_max_span_attempts(),
            config_ttl_secs: default_config_ttl_secs(),
            endpoint_cooldown_secs: default_endpoint_cooldown_secs(),
            rate_limit_fallback_ms: default_rate_limit_fallback_ms(),
            holders_interval_ms: default_holders_interval_ms(),
            block_fetch_concurrency: default_block_fetch_concurrency(),
            one_shot: false,
            skip_autostart: false,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_confirmations() -> u64 {
    6
}

fn default_min_span() -> u64 {
    10
}

fn default_max_span() -> u64 {
    2000
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_lookback_blocks() -> u64 {
    50_000
}

fn default_max_span_attempts() -> u32 {
    6
}

fn default_config_ttl_secs() -> u64 {
    30
}

fn default_endpoint_cooldown_secs() -> u64 {
    300
}

fn default_rate_limit_fallback_ms() -> u64 {
    2000
}

fn default_holders_interval_ms() -> u64 {
    10_000
}

fn default_block_fetch_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

// ============================================================
// Chain Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    /// Default RPC when the database has no endpoint and no override.
    pub rpc_http: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub start_block: Option<u64>,
    pub confirmations: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub min_span: Option<u64>,
    pub max_span: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub qps: Option<f64>,
    pub backfill: Option<BackfillConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSeed>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BackfillConfig {
    pub from_block: u64,
    pub to_block: Option<u64>,
}

/// Endpoint inserted into `chain_endpoints` on first start.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointSeed {
    pub url: String,
    pub label: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default)]
    pub order: i32,
    pub qps: Option<f64>,
    pub min_span: Option<u64>,
    pub max_span: Option<u64>,
}

fn default_weight() -> i32 {
    1
}

impl ChainConfig {
    /// Settings after falling back to the engine-wide defaults.
    pub fn defaults(&self, engine: &EngineConfig) -> ChainDefaults {
        ChainDefaults {
            chain_id: self.chain_id as i64,
            name: self.name.clone(),
            enabled: self.enabled,
            rpc_url: self.rpc_http.clone().filter(|url| !url.trim().is_empty()),
            qps: self.qps,
            bounds: SpanBounds::new(
                self.min_span.unwrap_or(engine.min_span),
                self.max_span.unwrap_or(engine.max_span),
            ),
            start_block: self.start_block,
            confirmations: self.confirmations.unwrap_or(engine.confirmations),
            poll_interval: Duration::from_millis(
                self.poll_interval_ms.unwrap_or(engine.poll_interval_ms),
            ),
            backoff_base: Duration::from_millis(
                self.backoff_base_ms.unwrap_or(engine.backoff_base_ms),
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackedTokenConfig {
    pub chain_id: u64,
    pub address: String,
    #[serde(default)]
    pub from_block: u64,
}

// ============================================================
// Environment overrides
// ============================================================

fn env_value<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive.
fn env_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        "" => None,
        other => {
            tracing::warn!(key, value = other, "Ignoring unparseable environment flag");
            None
        }
    }
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the file. `lookup` is
    /// `std::env::var` in production and a map in tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            self.database.url = url;
        }

        let engine = &mut self.engine;
        if let Some(v) = env_value(&lookup, "INDEXER_POLL_INTERVAL_MS") {
            engine.poll_interval_ms = v;
        }
        if let Some(v) = env_value(&lookup, "INDEXER_CONFIRMATIONS") {
            engine.confirmations = v;
        }
        if let Some(v) = env_value(&lookup, "INDEXER_MIN_SPAN") {
            engine.min_span = v;
        }
        if let Some(v) = env_value(&lookup, "INDEXER_MAX_SPAN") {
            engine.max_span = v;
        }
        if let Some(v) = env_value(&lookup, "INDEXER_BACKOFF_BASE_MS") {
            engine.backoff_base_ms = v;
        }
        if let Some(v) = env_value(&lookup, "INDEXER_LOOKBACK_BLOCKS") {
            engine.lookback_blocks = v;
        }
        if let Some(v) = env_flag(&lookup, "INDEXER_ONE_SHOT") {
            engine.one_shot = v;
        }
        if let Some(v) = env_flag(&lookup, "INDEXER_SKIP_AUTOSTART") {
            engine.skip_autostart = v;
        }

        for chain in &mut self.chains {
            let prefix = format!("CHAIN_{}_", chain.chain_id);
            let key = |suffix: &str| format!("{prefix}{suffix}");

            if let Some(url) = lookup(&key("RPC_URL")).filter(|u| !u.trim().is_empty()) {
                chain.rpc_http = Some(url);
            }
            if let Some(v) = env_value(&lookup, &key("MIN_SPAN")) {
                chain.min_span = Some(v);
            }
            if let Some(v) = env_value(&lookup, &key("MAX_SPAN")) {
                chain.max_span = Some(v);
            }
            if let Some(v) = env_value(&lookup, &key("BACKOFF_BASE_MS")) {
                chain.backoff_base_ms = Some(v);
            }
            if let Some(v) = env_value(&lookup, &key("CONFIRMATIONS")) {
                chain.confirmations = Some(v);
            }
            if let Some(v) = env_value(&lookup, &key("POLL_INTERVAL_MS")) {
                chain.poll_interval_ms = Some(v);
            }
        }
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre::eyre!(
                "Database URL must be set in [database] or DATABASE_URL"
            ));
        }
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        if self.chains.len() > MAX_CHAINS {
            return Err(eyre::eyre!(
                "At most {} chains are supported, {} configured",
                MAX_CHAINS,
                self.chains.len()
            ));
        }
        check_span("engine", self.engine.min_span, self.engine.max_span)?;

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(eyre::eyre!(
                    "Chain id {} is configured more than once",
                    chain.chain_id
                ));
            }
            check_span(
                &chain.name,
                chain.min_span.unwrap_or(self.engine.min_span),
                chain.max_span.unwrap_or(self.engine.max_span),
            )?;
            for endpoint in &chain.endpoints {
                if endpoint.url.trim().is_empty() {
                    return Err(eyre::eyre!("Chain '{}' has an endpoint without url", chain.name));
                }
                if let (Some(min), Some(max)) = (endpoint.min_span, endpoint.max_span) {
                    check_span(&chain.name, min, max)?;
                }
            }
            if let Some(backfill) = chain.backfill {
                if backfill.to_block.is_some_and(|to| to < backfill.from_block) {
                    return Err(eyre::eyre!(
                        "Chain '{}' backfill ends before it starts",
                        chain.name
                    ));
                }
            }
        }

        for token in &self.tracked_tokens {
            parse_address(&token.address)?;
            if !seen.contains(&token.chain_id) {
                return Err(eyre::eyre!(
                    "Tracked token {} references unconfigured chain {}",
                    token.address,
                    token.chain_id
                ));
            }
        }
        Ok(())
    }
}

fn check_span(scope: &str, min: u64, max: u64) -> eyre::Result<()> {
    if min == 0 || max < min {
        return Err(eyre::eyre!(
            "Invalid span bounds for '{}': need max_span >= min_span >= 1, got min {} max {}",
            scope,
            min,
            max
        ));
    }
    Ok(())
}

pub fn parse_address(raw: &str) -> eyre::Result<Address> {
    if !raw.starts_with("0x") || raw.len() != 42 {
        return Err(eyre::eyre!("Invalid token address '{}'", raw));
    }
    Address::from_str(raw).map_err(|e| eyre::eyre!("Invalid token address '{}': {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const BASE: &str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[[chains]]
name = "ethereum"
chain_id = 1
rpc_http = "http://localhost:8545"
max_span = 1000

[chains.backfill]
from_block = 100

[[chains.endpoints]]
url = "https://eth.example/v2/key"
label = "primary"
primary = true
qps = 5.0

[[chains]]
name = "polygon"
chain_id = 137

[[tracked_tokens]]
chain_id = 1
address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
from_block = 6082465
"#;

    fn parse(s: &str) -> Config {
        toml::from_str(s).unwrap()
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let config = parse(BASE);
        assert!(config.validate().is_ok());
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.engine.poll_interval_ms, 5000); // default
        assert_eq!(config.engine.lookback_blocks, 50_000); // default
        assert_eq!(config.chains[0].endpoints[0].weight, 1);
        assert!(config.chains[0].endpoints[0].primary);
        assert_eq!(
            config.chains[0].backfill,
            Some(BackfillConfig {
                from_block: 100,
                to_block: None
            })
        );
        assert!(config.chains[1].enabled);
        assert_eq!(config.tracked_tokens[0].from_block, 6_082_465);
    }

    #[test]
    fn test_chain_defaults_fall_back_to_engine() {
        let config = parse(BASE);
        let eth = config.chains[0].defaults(&config.engine);
        assert_eq!(eth.bounds, SpanBounds::new(10, 1000));
        assert_eq!(eth.confirmations, 6);
        assert_eq!(eth.poll_interval, Duration::from_millis(5000));
        let polygon = config.chains[1].defaults(&config.engine);
        assert!(polygon.rpc_url.is_none());
        assert_eq!(polygon.bounds.max, 2000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = parse(BASE);
        config.apply_env_overrides(lookup(&[
            ("DATABASE_URL", "postgres://env/db"),
            ("INDEXER_CONFIRMATIONS", "12"),
            ("INDEXER_ONE_SHOT", "true"),
            ("INDEXER_MAX_SPAN", "not-a-number"),
            ("CHAIN_137_RPC_URL", "https://polygon.example"),
            ("CHAIN_137_MAX_SPAN", "500"),
            ("CHAIN_1_POLL_INTERVAL_MS", "1500"),
        ]));

        assert_eq!(config.database.url, "postgres://env/db");
        assert_eq!(config.engine.confirmations, 12);
        assert!(config.engine.one_shot);
        assert_eq!(config.engine.max_span, 2000);
        assert_eq!(config.chains[1].rpc_http.as_deref(), Some("https://polygon.example"));
        assert_eq!(config.chains[1].max_span, Some(500));
        assert_eq!(config.chains[0].poll_interval_ms, Some(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_chains() {
        let mut config = parse(BASE);
        config.chains.clear();
        config.tracked_tokens.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_too_many_chains() {
        let mut config = parse(BASE);
        let template = config.chains[1].clone();
        config.chains = (1..=11)
            .map(|id| ChainConfig {
                chain_id: id,
                ..template.clone()
            })
            .collect();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_chain_id() {
        let mut config = parse(BASE);
        config.chains[1].chain_id = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_span_bounds() {
        let mut config = parse(BASE);
        config.chains[0].min_span = Some(2000);
        assert!(config.validate().is_err());

        let mut config = parse(BASE);
        config.engine.min_span = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tracked_tokens() {
        let mut config = parse(BASE);
        config.tracked_tokens[0].address = "0x1234".into();
        assert!(config.validate().is_err());

        let mut config = parse(BASE);
        config.tracked_tokens[0].chain_id = 56;
        assert!(config.validate().is_err());
    }
}
