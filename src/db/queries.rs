use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::models::StrategyDefinition;
use crate::utils::errors::StoreError;

/// Read-only view of watchlists and custom strategies, refreshed once per cycle.
#[async_trait]
pub trait WatchlistStore: Send + Sync {
    /// Distinct symbols across every watchlist.
    async fn list_tracked_symbols(&self) -> Result<Vec<String>, StoreError>;
    async fn list_strategy_definitions(&self) -> Result<Vec<StrategyDefinition>, StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatchlistStore for PgStore {
    async fn list_tracked_symbols(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT DISTINCT symbol
                 FROM watchlist_items
                ORDER BY symbol"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn list_strategy_definitions(&self) -> Result<Vec<StrategyDefinition>, StoreError> {
        Ok(sqlx::query_as::<_, StrategyDefinition>(
            r#"SELECT id, name, field, operator, value, signal
                 FROM custom_strategies
                WHERE active = true
                ORDER BY created_at, id"#,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
