use alloy::primitives::Address;
use bigdecimal::{BigDecimal, Zero};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;

use crate::indexer::types::HolderDelta;

/// What to do with one holder row after applying its delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceWrite {
    Upsert { holder: Address, balance: BigDecimal },
    Delete { holder: Address },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    pub upserted: usize,
    pub deleted: usize,
}

/// `next = current + delta` for each touched holder. A missing row counts as
/// zero. A result of zero or below deletes the row: negative balances are
/// never stored, and an absent row means a zero balance.
pub fn plan_balance_writes(
    current: &HashMap<Address, BigDecimal>,
    deltas: &[HolderDelta],
) -> Vec<BalanceWrite> {
    deltas
        .iter()
        .map(|d| {
            let next = match current.get(&d.holder) {
                Some(balance) => balance + &d.delta,
                None => d.delta.clone(),
            };
            if next <= BigDecimal::zero() {
                BalanceWrite::Delete { holder: d.holder }
            } else {
                BalanceWrite::Upsert {
                    holder: d.holder,
                    balance: next,
                }
            }
        })
        .collect()
}

/// Apply net deltas for one token inside the caller's transaction.
///
/// Only the touched holders are read (and locked), so the cost follows the
/// batch, not the size of the balance table.
pub async fn apply_deltas(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: i64,
    token: Address,
    deltas: &[HolderDelta],
) -> eyre::Result<LedgerStats> {
    if deltas.is_empty() {
        return Ok(LedgerStats::default());
    }

    let holders: Vec<Vec<u8>> = deltas.iter().map(|d| d.holder.to_vec()).collect();
    let rows: Vec<(Vec<u8>, BigDecimal)> = sqlx::query_as(
        "SELECT holder_address, balance FROM token_holders
         WHERE chain_id = $1 AND token_address = $2 AND holder_address = ANY($3)
         FOR UPDATE",
    )
    .bind(chain_id)
    .bind(token.as_slice())
    .bind(&holders)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| eyre::eyre!("Failed to read holder balances: {}", e))?;

    let current: HashMap<Address, BigDecimal> = rows
        .into_iter()
        .filter(|(holder, _)| holder.len() == 20)
        .map(|(holder, balance)| (Address::from_slice(&holder), balance))
        .collect();

    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    for write in plan_balance_writes(&current, deltas) {
        match write {
            BalanceWrite::Upsert { holder, balance } => upserts.push((holder, balance)),
            BalanceWrite::Delete { holder } => deletes.push(holder.to_vec()),
        }
    }

    for chunk in upserts.chunks(1000) {
        let mut query_builder: sqlx::QueryBuilder<Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO token_holders (chain_id, token_address, holder_address, balance, updated_at) ",
        );
        query_builder.push_values(chunk, |mut b, (holder, balance)| {
            b.push_bind(chain_id)
                .push_bind(token.to_vec())
                .push_bind(holder.to_vec())
                .push_bind(balance)
                .push("NOW()");
        });
        query_builder.push(
            " ON CONFLICT (chain_id, token_address, holder_address) DO UPDATE \
             SET balance = EXCLUDED.balance, updated_at = EXCLUDED.updated_at",
        );
        query_builder
            .build()
            .execute(&mut **tx)
            .await
            .map_err(|e| eyre::eyre!("Failed to upsert holder balances: {}", e))?;
    }

    if !deletes.is_empty() {
        sqlx::query(
            "DELETE FROM token_holders
             WHERE chain_id = $1 AND token_address = $2 AND holder_address = ANY($3)",
        )
        .bind(chain_id)
        .bind(token.as_slice())
        .bind(&deletes)
        .execute(&mut **tx)
        .await
        .map_err(|e| eyre::eyre!("Failed to delete emptied holders: {}", e))?;
    }

    Ok(LedgerStats {
        upserted: upserts.len(),
        deleted: deletes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::decoder::{aggregate_deltas, DecodedTransfer};
    use alloy::primitives::{B256, U256};

    fn delta(holder: Address, value: i64) -> HolderDelta {
        HolderDelta {
            holder,
            delta: BigDecimal::from(value),
        }
    }

    /// Apply planned writes to an in-memory table, the way the SQL does.
    fn apply(table: &mut HashMap<Address, BigDecimal>, deltas: &[HolderDelta]) {
        for write in plan_balance_writes(table, deltas) {
            match write {
                BalanceWrite::Upsert { holder, balance } => {
                    table.insert(holder, balance);
                }
                BalanceWrite::Delete { holder } => {
                    table.remove(&holder);
                }
            }
        }
    }

    #[test]
    fn test_zero_balance_removes_row_and_compensation_restores_it() {
        let x = Address::repeat_byte(1);
        let mut table = HashMap::new();

        apply(&mut table, &[delta(x, 50)]);
        assert_eq!(table.get(&x), Some(&BigDecimal::from(50)));

        apply(&mut table, &[delta(x, -50)]);
        assert!(!table.contains_key(&x));

        apply(&mut table, &[delta(x, 20)]);
        assert_eq!(table.get(&x), Some(&BigDecimal::from(20)));
    }

    #[test]
    fn test_negative_result_is_never_stored() {
        let x = Address::repeat_byte(1);
        let mut current = HashMap::new();
        current.insert(x, BigDecimal::from(5));
        assert_eq!(
            plan_balance_writes(&current, &[delta(x, -9)]),
            vec![BalanceWrite::Delete { holder: x }]
        );
        // A debit against a holder we have never seen is also a delete.
        let y = Address::repeat_byte(2);
        assert_eq!(
            plan_balance_writes(&HashMap::new(), &[delta(y, -1)]),
            vec![BalanceWrite::Delete { holder: y }]
        );
    }

    #[test]
    fn test_mint_then_transfer_balances() {
        let x = Address::repeat_byte(0xaa);
        let y = Address::repeat_byte(0xbb);
        let transfer = |from, to, value: u64| DecodedTransfer {
            token: Address::repeat_byte(0xcc),
            from,
            to,
            value: U256::from(value),
            tx_hash: B256::ZERO,
            log_index: 0,
            block_number: 1,
        };
        let deltas = aggregate_deltas(&[transfer(Address::ZERO, x, 100), transfer(x, y, 40)]);

        let mut table = HashMap::new();
        apply(&mut table, &deltas);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&x), Some(&BigDecimal::from(60)));
        assert_eq!(table.get(&y), Some(&BigDecimal::from(40)));
        assert!(!table.contains_key(&Address::ZERO));
    }

    async fn stored(pool: &sqlx::PgPool, token: Address) -> eyre::Result<HashMap<Address, BigDecimal>> {
        let rows: Vec<(Vec<u8>, BigDecimal)> = sqlx::query_as(
            "SELECT holder_address, balance FROM token_holders
             WHERE chain_id = 1 AND token_address = $1",
        )
        .bind(token.as_slice())
        .fetch_all(pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(h, b)| (Address::from_slice(&h), b))
            .collect())
    }

    #[sqlx::test]
    async fn test_apply_deltas_upserts_and_deletes(pool: sqlx::PgPool) -> eyre::Result<()> {
        let token = Address::repeat_byte(0xcc);
        let x = Address::repeat_byte(1);
        let y = Address::repeat_byte(2);

        let mut tx = pool.begin().await?;
        let stats = apply_deltas(&mut tx, 1, token, &[delta(x, 100), delta(y, 40)]).await?;
        tx.commit().await?;
        assert_eq!(stats, LedgerStats { upserted: 2, deleted: 0 });

        let mut tx = pool.begin().await?;
        let stats = apply_deltas(&mut tx, 1, token, &[delta(x, -100), delta(y, 10)]).await?;
        tx.commit().await?;
        assert_eq!(stats, LedgerStats { upserted: 1, deleted: 1 });

        let table = stored(&pool, token).await?;
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&y), Some(&BigDecimal::from(50)));

        // Rolled back writes leave no trace.
        let mut tx = pool.begin().await?;
        apply_deltas(&mut tx, 1, token, &[delta(y, 1000)]).await?;
        tx.rollback().await?;
        assert_eq!(stored(&pool, token).await?.get(&y), Some(&BigDecimal::from(50)));

        let mut tx = pool.begin().await?;
        assert_eq!(apply_deltas(&mut tx, 1, token, &[]).await?, LedgerStats::default());
        Ok(())
    }
}
