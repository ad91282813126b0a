use anyhow::Result;
use sqlx::PgPool;

pub struct CursorOperations;

impl CursorOperations {
    /// 游标初始化（已存在则不动，断点续扫）
    pub async fn initialize_cursor(pool: &PgPool, chain_id: i32, start_block: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backfill_cursors (chain_id, next_block)
            VALUES ($1, $2)
            ON CONFLICT (chain_id) DO NOTHING
            "#,
        )
        .bind(chain_id)
        .bind(start_block as i64)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_cursor(pool: &PgPool, chain_id: i32) -> Result<u64> {
        let result = sqlx::query_scalar::<_, i64>(
            "SELECT next_block FROM backfill_cursors WHERE chain_id = $1",
        )
        .bind(chain_id)
        .fetch_optional(pool)
        .await?;

        Ok(result.unwrap_or(0) as u64)
    }

    /// 游标只进不退：扫描失败不落库，同一窗口下个 tick 重试
    pub async fn advance_cursor(pool: &PgPool, chain_id: i32, next_block: u64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE backfill_cursors
            SET next_block = GREATEST(next_block, $2), updated_at = NOW()
            WHERE chain_id = $1
            "#,
        )
        .bind(chain_id)
        .bind(next_block as i64)
        .execute(pool)
        .await?;

        Ok(())
    }
}
