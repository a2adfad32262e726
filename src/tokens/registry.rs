use sqlx::PgPool;

use crate::config::{parse_address, TrackedTokenConfig};
use crate::db::repository;

/// Create a `token_index_cursor` row for every tracked token that does not
/// have one yet (idempotent). Returns how many cursors were created.
pub async fn seed_tracked_tokens(pool: &PgPool, tokens: &[TrackedTokenConfig]) -> eyre::Result<usize> {
    let mut created = 0;
    for token in tokens {
        let address = parse_address(&token.address)
            .map_err(|e| eyre::eyre!("Invalid tracked token '{}': {}", token.address, e))?;

        if repository::track_token(pool, token.chain_id as i64, address, token.from_block).await? {
            created += 1;
            tracing::debug!(
                chain_id = token.chain_id,
                token = %address,
                from_block = token.from_block,
                "Seeded token cursor"
            );
        }
    }

    Ok(created)
}
