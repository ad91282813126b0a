pub mod cursor_operations;
pub mod history_operations;
pub mod holder_operations;
pub mod liquidity_operations;
pub mod token_operations;
pub mod transaction_operations;

pub use cursor_operations::*;
pub use history_operations::*;
pub use holder_operations::*;
pub use liquidity_operations::*;
pub use token_operations::*;
pub use transaction_operations::*;

use anyhow::Result;
use sqlx::PgPool;

/// 创建五个核心集合 + 回填游标表
/// 唯一索引是整个管线真正的并发控制手段：
/// 监听与回填两条路径并发写入时由唯一键裁决谁先写成功
pub async fn create_tables(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tokens (
            id UUID NOT NULL DEFAULT gen_random_uuid(),
            chain_id INTEGER NOT NULL,
            address VARCHAR(42) NOT NULL,
            name VARCHAR(100) NOT NULL,
            symbol VARCHAR(20) NOT NULL,
            metadata_uri TEXT,
            description TEXT,
            creator VARCHAR(42) NOT NULL,
            total_supply DECIMAL(78, 0) NOT NULL DEFAULT 0,
            price VARCHAR(80) NOT NULL DEFAULT '0',
            price_usd DECIMAL(36, 18) NOT NULL DEFAULT 0,
            market_cap DECIMAL(36, 8) NOT NULL DEFAULT 0,
            graduation_progress DECIMAL(7, 2) NOT NULL DEFAULT 0,
            on_curve BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (chain_id, address)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            chain_id INTEGER NOT NULL,
            tx_hash VARCHAR(66) NOT NULL,
            token_address VARCHAR(42) NOT NULL,
            trader_address VARCHAR(42) NOT NULL,
            tx_type VARCHAR(20) NOT NULL,
            quote_amount DECIMAL(78, 0) NOT NULL DEFAULT 0,
            base_amount DECIMAL(78, 0) NOT NULL DEFAULT 0,
            price VARCHAR(80) NOT NULL DEFAULT '0',
            block_number BIGINT NOT NULL,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (chain_id, tx_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS token_holders (
            chain_id INTEGER NOT NULL,
            token_address VARCHAR(42) NOT NULL,
            holder_address VARCHAR(42) NOT NULL,
            balance DECIMAL(78, 0) NOT NULL DEFAULT 0,
            percentage DECIMAL(7, 2) NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (chain_id, token_address, holder_address)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS liquidity_events (
            chain_id INTEGER NOT NULL,
            tx_hash VARCHAR(66) NOT NULL,
            token_address VARCHAR(42) NOT NULL,
            kind VARCHAR(20) NOT NULL,
            block_number BIGINT NOT NULL,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (chain_id, tx_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS token_history (
            chain_id INTEGER NOT NULL,
            token_address VARCHAR(42) NOT NULL,
            price VARCHAR(80) NOT NULL DEFAULT '0',
            market_cap DECIMAL(36, 8) NOT NULL DEFAULT 0,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (chain_id, token_address, timestamp)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backfill_cursors (
            chain_id INTEGER NOT NULL,
            next_block BIGINT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (chain_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    create_indexes(pool).await?;

    Ok(())
}

async fn create_indexes(pool: &PgPool) -> Result<()> {
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_token ON transactions(chain_id, token_address)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_timestamp ON transactions(timestamp DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_token_holders_token ON token_holders(chain_id, token_address)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_token_history_token ON token_history(chain_id, token_address, timestamp DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_liquidity_events_token ON liquidity_events(chain_id, token_address)")
        .execute(pool)
        .await?;

    Ok(())
}
