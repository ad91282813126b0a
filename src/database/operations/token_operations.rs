use crate::types::Token;
use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::PgPool;

pub struct TokenOperations;

impl TokenOperations {
    /// 代币行懒创建：链上 TokenCreated 事件与外部 API 写入可能竞争，
    /// 两条路径靠唯一键 + 冲突合并收敛到同一行。
    /// 冲突时只覆盖链上权威的静态字段，绝不回写 price / market_cap，
    /// 否则回填迟到的 TokenCreated 会把行情重置回初始值
    pub async fn upsert_token(
        pool: &PgPool,
        chain_id: i32,
        address: &str,
        name: &str,
        symbol: &str,
        metadata_uri: &str,
        description: &str,
        creator: &str,
        total_supply: &str,
        initial_price: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens
            (chain_id, address, name, symbol, metadata_uri, description, creator, total_supply, price)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::numeric, $9)
            ON CONFLICT (chain_id, address)
            DO UPDATE SET
                name = EXCLUDED.name,
                symbol = EXCLUDED.symbol,
                metadata_uri = EXCLUDED.metadata_uri,
                description = EXCLUDED.description,
                creator = EXCLUDED.creator,
                total_supply = EXCLUDED.total_supply,
                updated_at = NOW()
            "#,
        )
        .bind(chain_id)
        .bind(address)
        .bind(name)
        .bind(symbol)
        .bind(metadata_uri)
        .bind(description)
        .bind(creator)
        .bind(total_supply)
        .bind(initial_price)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_token(pool: &PgPool, chain_id: i32, address: &str) -> Result<Option<Token>> {
        let token = sqlx::query_as::<_, Token>(
            r#"
            SELECT id, chain_id, address, name, symbol, metadata_uri, description, creator,
                   total_supply::text AS total_supply, price, price_usd, market_cap,
                   graduation_progress, on_curve, created_at, updated_at
            FROM tokens
            WHERE chain_id = $1 AND address = $2
            "#,
        )
        .bind(chain_id)
        .bind(address)
        .fetch_optional(pool)
        .await?;

        Ok(token)
    }

    /// 用交易携带的储备快照刷新派生行情字段
    pub async fn update_market_state(
        pool: &PgPool,
        chain_id: i32,
        address: &str,
        price: &str,
        price_usd: Decimal,
        market_cap: Decimal,
        graduation_progress: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tokens
            SET price = $3,
                price_usd = $4,
                market_cap = $5,
                graduation_progress = $6,
                updated_at = NOW()
            WHERE chain_id = $1 AND address = $2
            "#,
        )
        .bind(chain_id)
        .bind(address)
        .bind(price)
        .bind(price_usd)
        .bind(market_cap)
        .bind(graduation_progress)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// 毕业后定价来源离开联合曲线，此后行情不再由本管线推导
    pub async fn mark_graduated(pool: &PgPool, chain_id: i32, address: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tokens
            SET on_curve = FALSE,
                graduation_progress = 100,
                updated_at = NOW()
            WHERE chain_id = $1 AND address = $2
            "#,
        )
        .bind(chain_id)
        .bind(address)
        .execute(pool)
        .await?;

        Ok(())
    }
}
