use crate::connection::ConnectionManager;
use crate::database::{CursorOperations, Database};
use crate::listener::meta::LogEnvelope;
use crate::listener::{curve_event_filter, dispatch_envelope};
use crate::projector::EventProjector;
use anyhow::Result;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::Address;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// 固定扫描节拍: 10秒
const BACKFILL_TICK_SECS: u64 = 10;

/// 计算本轮扫描窗口 [cursor, end]
/// 游标只进不退；已越过链头返回 None（该链回填完成）
pub fn scan_window(cursor: u64, window: u64, head: u64) -> Option<(u64, u64)> {
    if cursor > head {
        return None;
    }
    Some((cursor, cursor.saturating_add(window).min(head)))
}

/// 历史回填扫描器：每条链一个独立定时器，
/// 逐窗口把持久化游标推进到链头，重放实时路径可能错过的区间
///
/// 一次性追平而非持续跟尾 —— 持续覆盖是实时监听器的职责。
/// 与同链监听器并发写入，不互斥，投影层的幂等 upsert 负责吸收重叠
pub struct BackfillScanner {
    chain_id: u64,
    curve_address: Address,
    window: u64,
    start_block: u64,
    connections: Arc<ConnectionManager>,
    database: Arc<Database>,
    projector: Arc<EventProjector>,
}

impl BackfillScanner {
    pub fn new(
        chain_id: u64,
        curve_address: Address,
        window: u64,
        start_block: u64,
        connections: Arc<ConnectionManager>,
        database: Arc<Database>,
        projector: Arc<EventProjector>,
    ) -> Self {
        Self {
            chain_id,
            curve_address,
            window,
            start_block,
            connections,
            database,
            projector,
        }
    }

    pub async fn run(self) {
        info!(
            "🚀 启动链 {} 的回填扫描 (起始区块: {}, 窗口: {})",
            self.chain_id, self.start_block, self.window
        );

        let provider = match self.connections.http_provider(self.chain_id) {
            Ok(provider) => provider,
            Err(e) => {
                error!("❌ 链 {}: 回填无法构建 RPC 客户端: {}", self.chain_id, e);
                return;
            }
        };

        if let Err(e) = CursorOperations::initialize_cursor(
            self.database.pool(),
            self.chain_id as i32,
            self.start_block,
        )
        .await
        {
            error!("❌ 链 {}: 初始化回填游标失败: {}", self.chain_id, e);
            return;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(BACKFILL_TICK_SECS));

        loop {
            interval.tick().await;

            match self.tick(&provider).await {
                Ok(true) => {
                    // 一次性追平：到达链头后调度自取消
                    info!("✅ 链 {}: 回填已追平链头，扫描结束", self.chain_id);
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    // 游标未动，同一窗口下个 tick 重试（至少一次覆盖）
                    warn!("⚠️ 链 {}: 回填扫描失败，下轮重试: {}", self.chain_id, e);
                }
            }
        }
    }

    /// 单轮扫描；返回 Ok(true) 表示已追平链头
    async fn tick(&self, provider: &Arc<Provider<Http>>) -> Result<bool> {
        let pool = self.database.pool();
        let cursor = CursorOperations::get_cursor(pool, self.chain_id as i32).await?;
        let head = provider.get_block_number().await?.as_u64();

        let (from_block, to_block) = match scan_window(cursor, self.window, head) {
            Some(window) => window,
            None => return Ok(true),
        };

        debug!(
            "🔍 链 {}: 回填扫描区块 {} 到 {} (链头: {})",
            self.chain_id, from_block, to_block, head
        );

        self.scan_range(provider, from_block, to_block).await?;

        CursorOperations::advance_cursor(pool, self.chain_id as i32, to_block + 1).await?;

        Ok(to_block >= head)
    }

    /// 重放一个区块窗口内的全部曲线事件
    async fn scan_range(
        &self,
        provider: &Arc<Provider<Http>>,
        from_block: u64,
        to_block: u64,
    ) -> Result<()> {
        let filter = curve_event_filter(self.curve_address)
            .from_block(from_block)
            .to_block(to_block);

        let logs = provider.get_logs(&filter).await?;

        if !logs.is_empty() {
            info!(
                "🏭 链 {}: 区块 {}-{} 回填发现 {} 个事件",
                self.chain_id,
                from_block,
                to_block,
                logs.len()
            );
        }

        for (index, log) in logs.into_iter().enumerate() {
            if let Err(e) = dispatch_envelope(
                provider.as_ref(),
                &self.projector,
                self.chain_id,
                self.curve_address,
                LogEnvelope::from_log(log),
            )
            .await
            {
                error!(
                    "❌ 链 {}: 回填处理第 {} 个事件失败: {}",
                    self.chain_id,
                    index + 1,
                    e
                );
                // 继续处理其他事件，不要因为一个事件失败就停止
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_window_basic() {
        // end = min(cursor + window, head)
        assert_eq!(scan_window(100, 50, 1000), Some((100, 150)));
        assert_eq!(scan_window(980, 50, 1000), Some((980, 1000)));
    }

    #[test]
    fn test_scan_window_never_exceeds_head() {
        let (_, end) = scan_window(0, u64::MAX, 12345).unwrap();
        assert_eq!(end, 12345);
    }

    #[test]
    fn test_scan_window_done_past_head() {
        // 游标越过链头后不再产生窗口，该链调度自取消
        assert_eq!(scan_window(1001, 50, 1000), None);
    }

    #[test]
    fn test_scan_window_at_head() {
        // 游标恰好在链头：还有最后一个单区块窗口
        assert_eq!(scan_window(1000, 50, 1000), Some((1000, 1000)));
    }

    #[test]
    fn test_cursor_advances_forward_only() {
        // 处理完 [cursor, end] 后游标推进到 end + 1
        let (from, end) = scan_window(0, 2000, 500).unwrap();
        assert_eq!(from, 0);
        let next = end + 1;
        assert!(next > from);
        assert_eq!(scan_window(next, 2000, 500), None);
    }
}
