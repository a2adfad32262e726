use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, EngineConfig};
use crate::db::repository;
use crate::endpoints::{ChainDefaults, EndpointCooldowns, RuntimeConfigCache};
use crate::indexer::chain::{ChainPoller, PollerMode};
use crate::indexer::holders::HoldersIndexer;
use crate::indexer::span::{SpanBounds, SpanController};
use crate::rpc::{EndpointHealth, RpcClientOptions};
use crate::tokens::registry::seed_tracked_tokens;

/// Sleep for `duration` unless shutdown fires first.
/// Returns `false` when the caller should stop.
pub async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// State shared by every poller: span hints, the runtime config cache and
/// endpoint cooldowns. One instance per engine, so tests can build their own.
pub struct EngineContext {
    pub pool: PgPool,
    pub engine: EngineConfig,
    pub spans: SpanController,
    pub runtime: RuntimeConfigCache,
    pub cooldowns: EndpointCooldowns,
    chains: HashMap<i64, ChainDefaults>,
}

impl EngineContext {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        let engine = config.engine.clone();
        let chains = config
            .chains
            .iter()
            .map(|chain| {
                let defaults = chain.defaults(&engine);
                (defaults.chain_id, defaults)
            })
            .collect();

        Self {
            pool,
            spans: SpanController::new(SpanBounds::new(engine.min_span, engine.max_span)),
            runtime: RuntimeConfigCache::new(Duration::from_secs(engine.config_ttl_secs)),
            cooldowns: EndpointCooldowns::new(Duration::from_secs(engine.endpoint_cooldown_secs)),
            engine,
            chains,
        }
    }

    pub fn chain(&self, chain_id: i64) -> Option<&ChainDefaults> {
        self.chains.get(&chain_id)
    }

    /// Base client options; `qps` is filled in per resolved endpoint.
    pub fn client_options(&self) -> RpcClientOptions {
        RpcClientOptions {
            rate_limit_fallback: Duration::from_millis(self.engine.rate_limit_fallback_ms),
            ..Default::default()
        }
    }

    /// Admin edits land here so the next cycle sees them without waiting
    /// for the TTL.
    pub fn invalidate_chain(&self, chain_id: i64) {
        self.runtime.invalidate(chain_id);
    }

    /// Take an endpoint out of rotation after an unauthorized or malformed
    /// response, persist what was observed, and force re-selection.
    pub async fn demote_endpoint(
        &self,
        chain_id: i64,
        endpoint_id: i64,
        health: EndpointHealth,
        err: &eyre::Report,
    ) {
        self.cooldowns.mark(endpoint_id, health, Utc::now());

        match health {
            EndpointHealth::Unauthorized => tracing::error!(
                chain_id,
                endpoint_id,
                health = health.as_str(),
                error = %err,
                "Endpoint rejected credentials, demoting"
            ),
            _ => tracing::warn!(
                chain_id,
                endpoint_id,
                health = health.as_str(),
                error = %err,
                "Endpoint returned malformed data, demoting"
            ),
        }

        if let Err(e) = repository::record_endpoint_health(&self.pool, endpoint_id, health).await {
            tracing::warn!(chain_id, endpoint_id, error = %e, "Failed to record endpoint health");
        }
        self.invalidate_chain(chain_id);
    }

    pub async fn mark_endpoint_ok(&self, chain_id: i64, endpoint_id: i64) {
        self.cooldowns.clear(endpoint_id);
        match repository::record_endpoint_health(&self.pool, endpoint_id, EndpointHealth::Ok).await {
            Ok(()) => {
                tracing::info!(chain_id, endpoint_id, "Endpoint healthy again");
                self.invalidate_chain(chain_id);
            }
            Err(e) => {
                tracing::warn!(chain_id, endpoint_id, error = %e, "Failed to record endpoint health");
            }
        }
    }
}

/// Top-level coordinator: seeds durable config, then runs one task per
/// poller plus the holders indexer.
pub struct Engine {
    ctx: Arc<EngineContext>,
    chains: Vec<(ChainDefaults, Option<crate::config::BackfillConfig>)>,
}

impl Engine {
    /// Seed chains, endpoints and tracked tokens. Rows that already exist
    /// are left alone so database edits win over the file.
    pub async fn init(pool: PgPool, config: &Config) -> eyre::Result<Self> {
        for chain in &config.chains {
            let chain_id = chain.chain_id as i64;
            let created =
                repository::seed_chain_config(&pool, chain_id, &chain.name, chain.enabled, chain.start_block)
                    .await?;
            if created {
                tracing::info!(chain = %chain.name, chain_id, "Seeded chain config");
            }

            for seed in &chain.endpoints {
                if repository::seed_chain_endpoint(&pool, chain_id, seed).await? {
                    tracing::info!(
                        chain = %chain.name,
                        endpoint = %crate::rpc::client::redact_url(&seed.url),
                        primary = seed.primary,
                        "Seeded chain endpoint"
                    );
                }
            }
        }

        let seeded = seed_tracked_tokens(&pool, &config.tracked_tokens).await?;
        if seeded > 0 {
            tracing::info!(count = seeded, "Tracked tokens seeded");
        }

        let ctx = Arc::new(EngineContext::new(pool, config));
        let chains = config
            .chains
            .iter()
            .map(|chain| (chain.defaults(&config.engine), chain.backfill))
            .collect();

        Ok(Self { ctx, chains })
    }

    /// Spawn every poller. Disabled chains still get a task: it idles in
    /// not-ready until an admin enables the chain.
    pub fn spawn(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for (defaults, backfill) in &self.chains {
            let live = ChainPoller::new(self.ctx.clone(), defaults.clone(), PollerMode::Live);
            handles.push(tokio::spawn(live.run(shutdown.clone())));

            if let Some(backfill) = backfill {
                let poller =
                    ChainPoller::new(self.ctx.clone(), defaults.clone(), PollerMode::Backfill(*backfill));
                handles.push(tokio::spawn(poller.run(shutdown.clone())));
            }
        }

        let holders = HoldersIndexer::new(self.ctx.clone());
        handles.push(tokio::spawn(holders.run(shutdown.clone())));

        tracing::info!(tasks = handles.len(), "Engine started");
        handles
    }
}
