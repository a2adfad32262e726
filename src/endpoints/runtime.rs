use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::pool::ChainEndpoint;
use crate::db::repository;
use crate::indexer::span::SpanBounds;

/// Per-chain settings from the config file and environment. These are the
/// fallbacks for anything the `chain_configs` row leaves NULL.
#[derive(Debug, Clone)]
pub struct ChainDefaults {
    pub chain_id: i64,
    pub name: String,
    pub enabled: bool,
    /// Environment-default RPC URL.
    pub rpc_url: Option<String>,
    pub qps: Option<f64>,
    pub bounds: SpanBounds,
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub poll_interval: Duration,
    pub backoff_base: Duration,
}

/// One row of `chain_configs`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainConfigRow {
    pub chain_id: i64,
    pub name: String,
    pub enabled: bool,
    pub rpc_url: Option<String>,
    pub qps: Option<f64>,
    pub min_span: Option<i64>,
    pub max_span: Option<i64>,
    pub start_block: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of everything a poller needs to know about a chain.
/// A refresh builds a new snapshot; nothing mutates one in place.
#[derive(Debug, Clone)]
pub struct ChainRuntime {
    pub chain_id: i64,
    pub name: String,
    pub enabled: bool,
    /// `chain_configs.rpc_url`, set by an admin.
    pub rpc_override: Option<String>,
    pub default_rpc: Option<String>,
    pub qps: Option<f64>,
    pub bounds: SpanBounds,
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub endpoints: Vec<ChainEndpoint>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChainRuntime {
    /// Overlay the stored row (admin edits) on the file defaults.
    pub fn build(
        defaults: &ChainDefaults,
        row: Option<ChainConfigRow>,
        endpoints: Vec<ChainEndpoint>,
    ) -> Self {
        let Some(row) = row else {
            return Self {
                chain_id: defaults.chain_id,
                name: defaults.name.clone(),
                enabled: defaults.enabled,
                rpc_override: None,
                default_rpc: defaults.rpc_url.clone(),
                qps: defaults.qps,
                bounds: defaults.bounds,
                start_block: defaults.start_block,
                confirmations: defaults.confirmations,
                poll_interval: defaults.poll_interval,
                backoff_base: defaults.backoff_base,
                endpoints,
                updated_at: None,
            };
        };

        let min = row.min_span.map(|v| v.max(1) as u64).unwrap_or(defaults.bounds.min);
        let max = row.max_span.map(|v| v.max(1) as u64).unwrap_or(defaults.bounds.max);

        Self {
            chain_id: row.chain_id,
            name: row.name,
            enabled: row.enabled,
            rpc_override: row.rpc_url.filter(|url| !url.trim().is_empty()),
            default_rpc: defaults.rpc_url.clone(),
            qps: row.qps.or(defaults.qps),
            bounds: SpanBounds::new(min, max),
            start_block: row
                .start_block
                .map(|b| b.max(0) as u64)
                .or(defaults.start_block),
            confirmations: defaults.confirmations,
            poll_interval: defaults.poll_interval,
            backoff_base: defaults.backoff_base,
            endpoints,
            updated_at: Some(row.updated_at),
        }
    }
}

/// Process-wide runtime config cache keyed by chain id.
///
/// Entries are reloaded from the database once older than `ttl`. Admin
/// writes call [`RuntimeConfigCache::invalidate`] so edits apply on the next
/// cycle instead of after the TTL.
#[derive(Debug)]
pub struct RuntimeConfigCache {
    ttl: Duration,
    entries: Mutex<HashMap<i64, (Instant, Arc<ChainRuntime>)>>,
}

impl RuntimeConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The cached snapshot, if still fresh.
    pub fn get(&self, chain_id: i64) -> Option<Arc<ChainRuntime>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (loaded_at, runtime) = entries.get(&chain_id)?;
        (loaded_at.elapsed() < self.ttl).then(|| runtime.clone())
    }

    pub fn insert(&self, runtime: ChainRuntime) -> Arc<ChainRuntime> {
        let runtime = Arc::new(runtime);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(runtime.chain_id, (Instant::now(), runtime.clone()));
        runtime
    }

    pub fn invalidate(&self, chain_id: i64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&chain_id);
    }

    /// Cached snapshot, or a fresh one built from `chain_configs` and
    /// `chain_endpoints`.
    pub async fn get_or_load(
        &self,
        pool: &PgPool,
        defaults: &ChainDefaults,
    ) -> eyre::Result<Arc<ChainRuntime>> {
        if let Some(runtime) = self.get(defaults.chain_id) {
            return Ok(runtime);
        }

        let row = repository::get_chain_config(pool, defaults.chain_id).await?;
        let endpoints = repository::list_chain_endpoints(pool, defaults.chain_id).await?;
        tracing::debug!(
            chain_id = defaults.chain_id,
            endpoints = endpoints.len(),
            "Refreshed chain runtime config"
        );
        Ok(self.insert(ChainRuntime::build(defaults, row, endpoints)))
    }
}
