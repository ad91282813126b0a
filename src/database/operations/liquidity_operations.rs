use crate::types::LiquidityEvent;
use anyhow::Result;
use sqlx::PgPool;

// 流动性事件类型常量
pub const LIQUIDITY_KIND_GRADUATED: &str = "Graduated";
pub const LIQUIDITY_KIND_ADD: &str = "Add_liquidity";
pub const LIQUIDITY_KIND_REMOVE: &str = "Remove_liquidity";

pub struct LiquidityOperations;

impl LiquidityOperations {
    /// 幂等插入，返回 false 表示重复投递
    pub async fn insert_liquidity_event(pool: &PgPool, event: &LiquidityEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO liquidity_events
            (chain_id, tx_hash, token_address, kind, block_number, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (chain_id, tx_hash) DO NOTHING
            "#,
        )
        .bind(event.chain_id)
        .bind(&event.tx_hash)
        .bind(&event.token_address)
        .bind(&event.kind)
        .bind(event.block_number)
        .bind(event.timestamp)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
