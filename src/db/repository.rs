use alloy::primitives::Address;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;

use super::ledger::{self, LedgerStats};
use crate::config::EndpointSeed;
use crate::endpoints::{pool::ChainEndpoint, runtime::ChainConfigRow};
use crate::indexer::types::{
    BlockRow, ChainBatch, Checkpoint, CursorAdvance, HolderDelta, Job, LogRow, ReceiptRow,
    TokenCursor, TokenDeltas, TokenTransferRow, TransactionRow,
};
use crate::rpc::EndpointHealth;

/// Rows per multi-row INSERT. Keeps every statement well under PostgreSQL's
/// bind parameter limit.
const CHUNK_SIZE: usize = 1000;

// ============================================================
// Chain config and endpoints
// ============================================================

pub async fn get_chain_config(pool: &PgPool, chain_id: i64) -> eyre::Result<Option<ChainConfigRow>> {
    let row = sqlx::query_as::<_, ChainConfigRow>(
        "SELECT chain_id, name, enabled, rpc_url, qps, min_span, max_span, start_block, updated_at
         FROM chain_configs WHERE chain_id = $1",
    )
    .bind(chain_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| eyre::eyre!("Failed to load chain config {}: {}", chain_id, e))?;

    Ok(row)
}

pub async fn list_chain_endpoints(pool: &PgPool, chain_id: i64) -> eyre::Result<Vec<ChainEndpoint>> {
    let rows = sqlx::query_as::<_, ChainEndpoint>(
        "SELECT id, chain_id, url, label, is_primary, enabled, qps, min_span, max_span,
                weight, order_index, last_health, last_checked_at, updated_at
         FROM chain_endpoints WHERE chain_id = $1 ORDER BY id",
    )
    .bind(chain_id)
    .fetch_all(pool)
    .await
    .map_err(|e| eyre::eyre!("Failed to load endpoints for chain {}: {}", chain_id, e))?;

    Ok(rows)
}

/// Persist the latest observed health. Leaves `updated_at` alone: that column
/// tracks admin edits, which lift cooldowns.
pub async fn record_endpoint_health(
    pool: &PgPool,
    endpoint_id: i64,
    health: EndpointHealth,
) -> eyre::Result<()> {
    sqlx::query(
        "UPDATE chain_endpoints SET last_health = $2, last_checked_at = NOW() WHERE id = $1",
    )
    .bind(endpoint_id)
    .bind(health.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

/// Seed a chain from the config file. Existing rows are left untouched so
/// admin edits survive restarts.
pub async fn seed_chain_config(
    pool: &PgPool,
    chain_id: i64,
    name: &str,
    enabled: bool,
    start_block: Option<u64>,
) -> eyre::Result<bool> {
    let result = sqlx::query(
        "INSERT INTO chain_configs (chain_id, name, enabled, start_block, updated_at)
         VALUES ($1, $2, $3, $4, NOW())
         ON CONFLICT (chain_id) DO NOTHING",
    )
    .bind(chain_id)
    .bind(name)
    .bind(enabled)
    .bind(start_block.map(|b| b as i64))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn seed_chain_endpoint(
    pool: &PgPool,
    chain_id: i64,
    seed: &EndpointSeed,
) -> eyre::Result<bool> {
    let result = sqlx::query(
        "INSERT INTO chain_endpoints
            (chain_id, url, label, is_primary, enabled, qps, min_span, max_span, weight, order_index, updated_at)
         VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7, $8, $9, NOW())
         ON CONFLICT (chain_id, url) DO NOTHING",
    )
    .bind(chain_id)
    .bind(&seed.url)
    .bind(&seed.label)
    .bind(seed.primary)
    .bind(seed.qps)
    .bind(seed.min_span.map(|v| v as i64))
    .bind(seed.max_span.map(|v| v as i64))
    .bind(seed.weight)
    .bind(seed.order)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================
// Checkpoints
// ============================================================

pub async fn get_checkpoint(pool: &PgPool, chain_id: i64, job: Job) -> eyre::Result<Option<Checkpoint>> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT first_block, last_block_scanned FROM job_checkpoints
         WHERE chain_id = $1 AND job = $2",
    )
    .bind(chain_id)
    .bind(job.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(first, last)| Checkpoint {
        first_block: first.max(0) as u64,
        last_block: last.max(0) as u64,
    }))
}

/// Never moves a checkpoint backwards. `first_block` is only written by the
/// insert that creates the row.
async fn advance_checkpoint(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: i64,
    job: Job,
    first_block: u64,
    last_block: u64,
) -> eyre::Result<()> {
    sqlx::query(
        "INSERT INTO job_checkpoints (chain_id, job, first_block, last_block_scanned, updated_at)
         VALUES ($1, $2, $3, $4, NOW())
         ON CONFLICT (chain_id, job) DO UPDATE
         SET last_block_scanned = GREATEST(job_checkpoints.last_block_scanned, EXCLUDED.last_block_scanned),
             updated_at = NOW()",
    )
    .bind(chain_id)
    .bind(job.as_str())
    .bind(first_block as i64)
    .bind(last_block as i64)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// ============================================================
// Execution rows
// ============================================================

async fn insert_blocks(tx: &mut Transaction<'_, Postgres>, rows: &[BlockRow]) -> eyre::Result<()> {
    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO blocks (chain_id, number, hash, parent_hash, timestamp, miner, \
             gas_used, gas_limit, base_fee_per_gas, tx_count) ",
        );
        query_builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.chain_id)
                .push_bind(r.number)
                .push_bind(&r.hash)
                .push_bind(&r.parent_hash)
                .push_bind(r.timestamp)
                .push_bind(&r.miner)
                .push_bind(&r.gas_used)
                .push_bind(&r.gas_limit)
                .push_bind(&r.base_fee_per_gas)
                .push_bind(r.tx_count);
        });
        query_builder.push(" ON CONFLICT (chain_id, number) DO NOTHING");
        query_builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_transactions(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[TransactionRow],
) -> eyre::Result<()> {
    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO transactions (chain_id, hash, block_number, tx_index, from_address, \
             to_address, value, gas, gas_price, nonce, input) ",
        );
        query_builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.chain_id)
                .push_bind(&r.hash)
                .push_bind(r.block_number)
                .push_bind(r.tx_index)
                .push_bind(&r.from_address)
                .push_bind(&r.to_address)
                .push_bind(&r.value)
                .push_bind(&r.gas)
                .push_bind(&r.gas_price)
                .push_bind(&r.nonce)
                .push_bind(&r.input);
        });
        query_builder.push(" ON CONFLICT (chain_id, hash) DO NOTHING");
        query_builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_receipts(tx: &mut Transaction<'_, Postgres>, rows: &[ReceiptRow]) -> eyre::Result<()> {
    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO receipts (chain_id, tx_hash, block_number, tx_index, status, gas_used, \
             cumulative_gas_used, effective_gas_price, contract_address) ",
        );
        query_builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.chain_id)
                .push_bind(&r.tx_hash)
                .push_bind(r.block_number)
                .push_bind(r.tx_index)
                .push_bind(r.status)
                .push_bind(&r.gas_used)
                .push_bind(&r.cumulative_gas_used)
                .push_bind(&r.effective_gas_price)
                .push_bind(&r.contract_address);
        });
        query_builder.push(" ON CONFLICT (chain_id, tx_hash) DO NOTHING");
        query_builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_logs(tx: &mut Transaction<'_, Postgres>, rows: &[LogRow]) -> eyre::Result<()> {
    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO logs (chain_id, tx_hash, log_index, block_number, address, \
             topic0, topic1, topic2, topic3, data) ",
        );
        query_builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.chain_id)
                .push_bind(&r.tx_hash)
                .push_bind(r.log_index)
                .push_bind(r.block_number)
                .push_bind(&r.address)
                .push_bind(&r.topic0)
                .push_bind(&r.topic1)
                .push_bind(&r.topic2)
                .push_bind(&r.topic3)
                .push_bind(&r.data);
        });
        query_builder.push(" ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING");
        query_builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_token_transfers(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[TokenTransferRow],
) -> eyre::Result<()> {
    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut query_builder: sqlx::QueryBuilder<Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO token_transfers (chain_id, tx_hash, log_index, block_number, \
             token_address, from_address, to_address, value) ",
        );
        query_builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.chain_id)
                .push_bind(&r.tx_hash)
                .push_bind(r.log_index)
                .push_bind(r.block_number)
                .push_bind(&r.token_address)
                .push_bind(&r.from_address)
                .push_bind(&r.to_address)
                .push_bind(&r.value);
        });
        query_builder.push(" ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING");
        query_builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

/// Serialises changes of ledger ownership (a token gaining a cursor) against
/// chain batches that apply deltas. Batches share the lock, ownership changes
/// take it exclusively, so a batch never applies deltas for a token whose
/// cursor was created after the batch checked for it.
async fn lock_ledger_ownership(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: i64,
    exclusive: bool,
) -> eyre::Result<()> {
    let sql = if exclusive {
        "SELECT pg_advisory_xact_lock($1)"
    } else {
        "SELECT pg_advisory_xact_lock_shared($1)"
    };
    sqlx::query(sql).bind(chain_id).execute(&mut **tx).await?;
    Ok(())
}

/// Which token deltas a chain batch may apply. Backfill batches cover blocks
/// below ones the live job has already applied, so they never touch the
/// ledger; their tokens are rebuilt in order once the backfill completes.
/// Live batches skip tokens owned by a cursor.
pub fn ledger_deltas<'a>(
    job: Job,
    deltas: &'a [TokenDeltas],
    owned: &HashSet<Vec<u8>>,
) -> (Vec<&'a TokenDeltas>, usize) {
    match job {
        Job::Backfill => (Vec::new(), deltas.len()),
        Job::Live => {
            let applied: Vec<_> = deltas
                .iter()
                .filter(|d| !owned.contains(d.token.as_slice()))
                .collect();
            let skipped = deltas.len() - applied.len();
            (applied, skipped)
        }
    }
}

/// Tokens whose balances belong to the holders indexer on this chain.
async fn cursor_owned_tokens(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: i64,
    tokens: &[Vec<u8>],
) -> eyre::Result<HashSet<Vec<u8>>> {
    if tokens.is_empty() {
        return Ok(HashSet::new());
    }
    let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
        "SELECT token_address FROM token_index_cursor
         WHERE chain_id = $1 AND token_address = ANY($2)",
    )
    .bind(chain_id)
    .bind(tokens)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows.into_iter().map(|(t,)| t).collect())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PersistStats {
    pub rows: usize,
    pub tokens_applied: usize,
    pub tokens_skipped: usize,
    pub ledger: LedgerStats,
}

/// Write a chain poller batch and advance the job checkpoint, all in one
/// transaction. Nothing is visible until every row is in.
pub async fn persist_chain_batch(pool: &PgPool, batch: &ChainBatch, job: Job) -> eyre::Result<PersistStats> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| eyre::eyre!("Failed to begin transaction: {}", e))?;

    insert_blocks(&mut tx, &batch.blocks).await?;
    insert_transactions(&mut tx, &batch.transactions).await?;
    insert_receipts(&mut tx, &batch.receipts).await?;
    insert_logs(&mut tx, &batch.logs).await?;
    insert_token_transfers(&mut tx, &batch.transfers).await?;

    let mut stats = PersistStats {
        rows: batch.row_count(),
        ..Default::default()
    };

    let owned = match job {
        Job::Live => {
            lock_ledger_ownership(&mut tx, batch.chain_id, false).await?;
            let tokens: Vec<Vec<u8>> = batch.deltas.iter().map(|d| d.token.to_vec()).collect();
            cursor_owned_tokens(&mut tx, batch.chain_id, &tokens).await?
        }
        Job::Backfill => HashSet::new(),
    };

    let (apply, skipped) = ledger_deltas(job, &batch.deltas, &owned);
    stats.tokens_skipped = skipped;
    for token_deltas in apply {
        let applied =
            ledger::apply_deltas(&mut tx, batch.chain_id, token_deltas.token, &token_deltas.deltas)
                .await?;
        stats.tokens_applied += 1;
        stats.ledger.upserted += applied.upserted;
        stats.ledger.deleted += applied.deleted;
    }

    advance_checkpoint(&mut tx, batch.chain_id, job, batch.from_block, batch.to_block).await?;

    tx.commit()
        .await
        .map_err(|e| eyre::eyre!("Failed to commit batch: {}", e))?;

    Ok(stats)
}

// ============================================================
// Token cursors
// ============================================================

pub async fn list_token_cursors(pool: &PgPool) -> eyre::Result<Vec<TokenCursor>> {
    let rows = sqlx::query_as::<_, TokenCursor>(
        "SELECT chain_id, token_address, from_block, to_block, updated_at
         FROM token_index_cursor ORDER BY chain_id, token_address",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Start tracking a token. Returns false if a cursor already exists.
///
/// A new cursor rescans the token from `from_block`, so any balances the
/// chain poller wrote for it are dropped in the same transaction.
pub async fn track_token(pool: &PgPool, chain_id: i64, token: Address, from_block: u64) -> eyre::Result<bool> {
    let mut tx = pool.begin().await?;
    lock_ledger_ownership(&mut tx, chain_id, true).await?;

    let created = sqlx::query(
        "INSERT INTO token_index_cursor (chain_id, token_address, from_block, to_block, updated_at)
         VALUES ($1, $2, $3, NULL, NOW())
         ON CONFLICT (chain_id, token_address) DO NOTHING",
    )
    .bind(chain_id)
    .bind(token.as_slice())
    .bind(from_block as i64)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        > 0;

    if created {
        sqlx::query("DELETE FROM token_holders WHERE chain_id = $1 AND token_address = $2")
            .bind(chain_id)
            .bind(token.as_slice())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(created)
}

/// Give every token seen in a finished backfill range a cursor starting at
/// `from_block`, so the holders indexer rebuilds its balances in block order.
/// Tokens that already have a cursor keep it. Returns how many were handed off.
pub async fn hand_off_backfilled_tokens(
    pool: &PgPool,
    chain_id: i64,
    from_block: u64,
    to_block: u64,
) -> eyre::Result<usize> {
    let mut tx = pool.begin().await?;
    lock_ledger_ownership(&mut tx, chain_id, true).await?;

    let created: Vec<(Vec<u8>,)> = sqlx::query_as(
        "INSERT INTO token_index_cursor (chain_id, token_address, from_block, to_block, updated_at)
         SELECT DISTINCT $1::BIGINT, token_address, $2::BIGINT, NULL::BIGINT, NOW()
         FROM token_transfers
         WHERE chain_id = $1 AND block_number BETWEEN $2 AND $3
         ON CONFLICT (chain_id, token_address) DO NOTHING
         RETURNING token_address",
    )
    .bind(chain_id)
    .bind(from_block as i64)
    .bind(to_block as i64)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| eyre::eyre!("Failed to hand off backfilled tokens: {}", e))?;

    let tokens: Vec<Vec<u8>> = created.into_iter().map(|(t,)| t).collect();
    if !tokens.is_empty() {
        sqlx::query("DELETE FROM token_holders WHERE chain_id = $1 AND token_address = ANY($2)")
            .bind(chain_id)
            .bind(&tokens)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(tokens.len())
}

/// Rebuild a token's balances from `from_block`: resets the cursor (creating
/// it if needed) and drops the token's holder rows, atomically.
pub async fn enqueue_reindex(pool: &PgPool, chain_id: i64, token: Address, from_block: u64) -> eyre::Result<()> {
    let mut tx = pool.begin().await?;
    lock_ledger_ownership(&mut tx, chain_id, true).await?;

    // Cursor first: the holders indexer locks the cursor before the holder
    // rows, so both sides take locks in the same order.
    sqlx::query(
        "INSERT INTO token_index_cursor (chain_id, token_address, from_block, to_block, updated_at)
         VALUES ($1, $2, $3, NULL, NOW())
         ON CONFLICT (chain_id, token_address) DO UPDATE
         SET from_block = EXCLUDED.from_block, to_block = NULL, updated_at = NOW()",
    )
    .bind(chain_id)
    .bind(token.as_slice())
    .bind(from_block as i64)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM token_holders WHERE chain_id = $1 AND token_address = $2")
        .bind(chain_id)
        .bind(token.as_slice())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Apply one holders-indexer batch: guarded cursor advance, transfer rows and
/// balance deltas in one transaction.
///
/// Returns `None` (and writes nothing) when the cursor no longer sits at
/// `advance.expected_from`, i.e. a reindex moved it while the batch was in
/// flight.
pub async fn persist_token_batch(
    pool: &PgPool,
    chain_id: i64,
    token: Address,
    advance: &CursorAdvance,
    transfers: &[TokenTransferRow],
    deltas: &[HolderDelta],
) -> eyre::Result<Option<LedgerStats>> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| eyre::eyre!("Failed to begin transaction: {}", e))?;

    let moved = sqlx::query(
        "UPDATE token_index_cursor
         SET from_block = $4, to_block = $5, updated_at = NOW()
         WHERE chain_id = $1 AND token_address = $2 AND from_block = $3",
    )
    .bind(chain_id)
    .bind(token.as_slice())
    .bind(advance.expected_from)
    .bind(advance.from_block)
    .bind(advance.to_block)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if moved == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    insert_token_transfers(&mut tx, transfers).await?;
    let stats = ledger::apply_deltas(&mut tx, chain_id, token, deltas).await?;

    tx.commit()
        .await
        .map_err(|e| eyre::eyre!("Failed to commit token batch: {}", e))?;

    Ok(Some(stats))
}
