use alloy::primitives::Address;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::db::repository;
use crate::endpoints::{resolve_rpc, ClientSlot};
use crate::engine::{pause, EngineContext};
use crate::indexer::chain::{failure_delay, target_block};
use crate::indexer::decoder::{self, aggregate_deltas, transfer_topic};
use crate::indexer::fetch::{fetch_range, RangePolicy};
use crate::indexer::mapper;
use crate::indexer::types::{CursorAdvance, TokenCursor};
use crate::rpc::{classify, ErrorClass, RpcClient};

#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub cursors: usize,
    pub batches: usize,
    pub chains_skipped: usize,
}

/// Why a chain's remaining cursors were abandoned for this tick.
enum ChainStop {
    RateLimited(std::time::Duration),
    EndpointFailed,
}

/// Tails each tracked `(chain, token)` pair with address-scoped
/// `eth_getLogs`, keeping that token's holder balances and cursor in step.
pub struct HoldersIndexer {
    ctx: Arc<EngineContext>,
    slots: HashMap<i64, ClientSlot>,
}

impl HoldersIndexer {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            slots: HashMap::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let interval = std::time::Duration::from_millis(self.ctx.engine.holders_interval_ms);
        tracing::info!(interval_ms = self.ctx.engine.holders_interval_ms, "Starting holders indexer");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let wait = match self.tick(&shutdown).await {
                Ok(stats) => {
                    if stats.batches > 0 {
                        tracing::info!(
                            cursors = stats.cursors,
                            batches = stats.batches,
                            chains_skipped = stats.chains_skipped,
                            "Holders tick complete"
                        );
                    }
                    interval
                }
                Err(e) => {
                    tracing::error!(error = %e, "Holders tick failed");
                    interval
                }
            };

            if self.ctx.engine.one_shot {
                break;
            }
            if !pause(wait, &shutdown).await {
                break;
            }
        }

        tracing::info!("Holders indexer stopped");
    }

    /// One pass over every tracked cursor.
    pub async fn tick(&mut self, shutdown: &CancellationToken) -> eyre::Result<TickStats> {
        let cursors = repository::list_token_cursors(&self.ctx.pool).await?;
        let mut stats = TickStats {
            cursors: cursors.len(),
            ..Default::default()
        };

        let mut by_chain: BTreeMap<i64, Vec<TokenCursor>> = BTreeMap::new();
        for cursor in cursors {
            by_chain.entry(cursor.chain_id).or_default().push(cursor);
        }

        for (chain_id, cursors) in by_chain {
            if shutdown.is_cancelled() {
                break;
            }
            match self.sync_chain(chain_id, &cursors, shutdown).await {
                Ok(Some(batches)) => stats.batches += batches,
                Ok(None) => stats.chains_skipped += 1,
                Err(stop) => {
                    stats.chains_skipped += 1;
                    if let ChainStop::RateLimited(wait) = stop {
                        if !pause(wait, shutdown).await {
                            break;
                        }
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Returns `Ok(None)` when the chain is skipped (unknown, disabled, no
    /// RPC) and `Err` when an RPC failure ended the chain's turn early.
    async fn sync_chain(
        &mut self,
        chain_id: i64,
        cursors: &[TokenCursor],
        shutdown: &CancellationToken,
    ) -> Result<Option<usize>, ChainStop> {
        let ctx = self.ctx.clone();
        let Some(defaults) = ctx.chain(chain_id) else {
            tracing::debug!(chain_id, "Skipping cursors of unconfigured chain");
            return Ok(None);
        };

        let runtime = match ctx.runtime.get_or_load(&ctx.pool, defaults).await {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(chain = %defaults.name, error = %e, "Failed to load chain config");
                return Ok(None);
            }
        };
        if !runtime.enabled {
            return Ok(None);
        }
        let Some(resolved) = resolve_rpc(&runtime, &ctx.cooldowns, Utc::now()) else {
            return Ok(None);
        };

        ctx.spans.set_bounds(chain_id, resolved.bounds);
        let slot = self.slots.entry(chain_id).or_default();
        let client = match slot.client_for(&resolved, &ctx.client_options()) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(chain = %defaults.name, error = %e, "Failed to build RPC client");
                return Ok(None);
            }
        };

        let policy = RangePolicy {
            max_attempts: ctx.engine.max_span_attempts,
            retry_delay: runtime.backoff_base,
        };

        let latest = match client.block_number().await {
            Ok(latest) => latest,
            Err(e) => {
                let err = eyre::Report::new(e);
                tracing::warn!(chain = %defaults.name, error = %err, "Failed to read chain head");
                let stop = self.react(chain_id, resolved.endpoint_id, runtime.backoff_base, &err).await;
                return stop.map_or(Ok(None), Err);
            }
        };
        let target = target_block(latest, runtime.confirmations);

        let mut batches = 0;
        for cursor in cursors {
            if shutdown.is_cancelled() {
                break;
            }
            let Some(token) = cursor.token() else {
                tracing::warn!(chain_id, "Skipping cursor with malformed token address");
                continue;
            };

            match sync_cursor(&ctx, &client, &policy, cursor, token, target, shutdown).await {
                Ok(n) => batches += n,
                Err(err) => {
                    tracing::warn!(
                        chain = %defaults.name,
                        token = %token,
                        error = %err,
                        "Token sync failed"
                    );
                    let stop = self.react(chain_id, resolved.endpoint_id, runtime.backoff_base, &err).await;
                    if let Some(stop) = stop {
                        return Err(stop);
                    }
                }
            }
        }

        Ok(Some(batches))
    }

    /// Applies the shared failure policy. Rate limits and endpoint faults end
    /// the chain's turn; anything else only skips the failing cursor.
    async fn react(
        &mut self,
        chain_id: i64,
        endpoint_id: Option<i64>,
        backoff_base: std::time::Duration,
        err: &eyre::Report,
    ) -> Option<ChainStop> {
        let class = classify(err);
        match class {
            ErrorClass::RateLimited(_) => Some(ChainStop::RateLimited(failure_delay(class, backoff_base, 1))),
            ErrorClass::Endpoint(health) => {
                if let Some(slot) = self.slots.get_mut(&chain_id) {
                    slot.reset();
                }
                if let Some(id) = endpoint_id {
                    self.ctx.demote_endpoint(chain_id, id, health, err).await;
                }
                Some(ChainStop::EndpointFailed)
            }
            ErrorClass::RangeTooLarge | ErrorClass::Other => None,
        }
    }
}

/// Advance one cursor towards `target`, one adaptive range at a time.
/// Returns how many batches were committed.
async fn sync_cursor(
    ctx: &EngineContext,
    client: &Arc<RpcClient>,
    policy: &RangePolicy,
    cursor: &TokenCursor,
    token: Address,
    target: u64,
    shutdown: &CancellationToken,
) -> eyre::Result<usize> {
    let chain_id = cursor.chain_id;
    let mut from = cursor.from_block.max(0) as u64;
    let mut batches = 0;

    while from <= target && !shutdown.is_cancelled() {
        let fetched = fetch_range(&ctx.spans, chain_id, from, target, policy, |lo, hi| {
            let client = client.clone();
            async move {
                client
                    .get_logs_range(lo, hi, Some(token), Some(vec![Some(transfer_topic())]))
                    .await
                    .map_err(eyre::Report::new)
            }
        })
        .await?;

        let transfers: Vec<_> = decoder::decode_transfers(&fetched.value)?
            .into_iter()
            .filter(|t| t.token == token)
            .collect();
        let deltas = aggregate_deltas(&transfers);
        let rows: Vec<_> = transfers
            .iter()
            .map(|t| mapper::map_transfer(chain_id, t))
            .collect();
        let advance = CursorAdvance::after_scan(fetched.from, fetched.to);

        let applied =
            repository::persist_token_batch(&ctx.pool, chain_id, token, &advance, &rows, &deltas)
                .await?;
        let Some(ledger) = applied else {
            tracing::info!(
                chain_id,
                token = %token,
                expected_from = advance.expected_from,
                "Cursor moved by a reindex, batch discarded"
            );
            return Ok(batches);
        };

        tracing::debug!(
            chain_id,
            token = %token,
            from = fetched.from,
            to = fetched.to,
            span = fetched.span(),
            transfers = transfers.len(),
            holders_upserted = ledger.upserted,
            holders_deleted = ledger.deleted,
            "Token range indexed"
        );

        batches += 1;
        from = fetched.to + 1;
    }

    Ok(batches)
}
