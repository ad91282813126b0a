use crate::types::TokenHolder;
use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::PgPool;

pub struct HolderOperations;

impl HolderOperations {
    /// 代币创建时为曲线合约地址播种 100% 持仓
    /// DO NOTHING：TokenCreated 被回填重复投递时不能把交易后的余额重置
    pub async fn seed_curve_holder(
        pool: &PgPool,
        chain_id: i32,
        token_address: &str,
        curve_address: &str,
        total_supply: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_holders (chain_id, token_address, holder_address, balance, percentage)
            VALUES ($1, $2, $3, $4::numeric, 100)
            ON CONFLICT (chain_id, token_address, holder_address) DO NOTHING
            "#,
        )
        .bind(chain_id)
        .bind(token_address)
        .bind(curve_address)
        .bind(total_supply)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// 单语句原子余额增减，下限截断为零（绝不为负）
    /// delta 为带符号的十进制整数字符串，如 "-1000000000000000000"
    pub async fn apply_balance_delta(
        pool: &PgPool,
        chain_id: i32,
        token_address: &str,
        holder_address: &str,
        delta: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_holders (chain_id, token_address, holder_address, balance)
            VALUES ($1, $2, $3, GREATEST($4::numeric, 0))
            ON CONFLICT (chain_id, token_address, holder_address)
            DO UPDATE SET
                balance = GREATEST(token_holders.balance + $4::numeric, 0),
                updated_at = NOW()
            "#,
        )
        .bind(chain_id)
        .bind(token_address)
        .bind(holder_address)
        .bind(delta)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// 全量加载某代币的持仓行（含余额为零的行，重算占比需要完整集合）
    pub async fn get_holders(
        pool: &PgPool,
        chain_id: i32,
        token_address: &str,
    ) -> Result<Vec<TokenHolder>> {
        let holders = sqlx::query_as::<_, TokenHolder>(
            r#"
            SELECT chain_id, token_address, holder_address,
                   balance::text AS balance, percentage, updated_at
            FROM token_holders
            WHERE chain_id = $1 AND token_address = $2
            "#,
        )
        .bind(chain_id)
        .bind(token_address)
        .fetch_all(pool)
        .await?;

        Ok(holders)
    }

    /// 余额为零的行查询时被过滤，不物理删除
    pub async fn get_active_holders(
        pool: &PgPool,
        chain_id: i32,
        token_address: &str,
    ) -> Result<Vec<TokenHolder>> {
        let holders = sqlx::query_as::<_, TokenHolder>(
            r#"
            SELECT chain_id, token_address, holder_address,
                   balance::text AS balance, percentage, updated_at
            FROM token_holders
            WHERE chain_id = $1 AND token_address = $2 AND balance > 0
            ORDER BY balance DESC
            "#,
        )
        .bind(chain_id)
        .bind(token_address)
        .fetch_all(pool)
        .await?;

        Ok(holders)
    }

    /// 批量回写重算后的占比
    /// 与并发交易事件 last-write-wins：占比只是展示辅助，不是账本事实
    pub async fn update_percentages(
        pool: &PgPool,
        chain_id: i32,
        token_address: &str,
        percentages: &[(String, Decimal)],
    ) -> Result<()> {
        for (holder_address, percentage) in percentages {
            sqlx::query(
                r#"
                UPDATE token_holders
                SET percentage = $4, updated_at = NOW()
                WHERE chain_id = $1 AND token_address = $2 AND holder_address = $3
                "#,
            )
            .bind(chain_id)
            .bind(token_address)
            .bind(holder_address)
            .bind(percentage)
            .execute(pool)
            .await?;
        }

        Ok(())
    }
}
