use crate::types::Transaction;
use anyhow::Result;
use sqlx::PgPool;

pub struct TransactionOperations;

impl TransactionOperations {
    /// 插入交易记录，(chain_id, tx_hash) 为投影闸门：
    /// 监听与回填两条路径重复投递同一事件时只有一条插入成功，
    /// 返回 false 表示重复投递，调用方视为成功的空操作
    pub async fn insert_transaction(pool: &PgPool, tx: &Transaction) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions
            (chain_id, tx_hash, token_address, trader_address, tx_type, quote_amount, base_amount, price, block_number, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6::numeric, $7::numeric, $8, $9, $10)
            ON CONFLICT (chain_id, tx_hash) DO NOTHING
            "#,
        )
        .bind(tx.chain_id)
        .bind(&tx.tx_hash)
        .bind(&tx.token_address)
        .bind(&tx.trader_address)
        .bind(&tx.tx_type)
        .bind(&tx.quote_amount)
        .bind(&tx.base_amount)
        .bind(&tx.price)
        .bind(tx.block_number)
        .bind(tx.timestamp)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
