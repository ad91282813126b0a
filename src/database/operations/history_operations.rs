use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

pub struct HistoryOperations;

impl HistoryOperations {
    /// 价格快照 append-only，(chain_id, token, timestamp) 唯一，重复投递落空
    pub async fn insert_snapshot(
        pool: &PgPool,
        chain_id: i32,
        token_address: &str,
        price: &str,
        market_cap: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_history (chain_id, token_address, price, market_cap, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chain_id, token_address, timestamp) DO NOTHING
            "#,
        )
        .bind(chain_id)
        .bind(token_address)
        .bind(price)
        .bind(market_cap)
        .bind(timestamp)
        .execute(pool)
        .await?;

        Ok(())
    }
}
