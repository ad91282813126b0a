use crate::config::ChainConfig;
use anyhow::{anyhow, Result};
use ethers::providers::{Http, Provider, Ws};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 限速退避基数: 180秒
const RATE_LIMIT_BASE_MS: u64 = 180_000;
/// 限速退避上限: 1小时
const RATE_LIMIT_MAX_MS: u64 = 3_600_000;
/// 指数上限，防止移位溢出
const RATE_LIMIT_MAX_EXP: u32 = 6;

/// 连接创建限速退避窗口: min(180s * 2^min(attempts, 6), 3600s)
///
/// 注意这与监听端的 reconnect_delay 是两套独立策略：
/// 本策略管连接创建时的限速冷却，常数更长、次数不设上限；
/// 后者管 socket 断开后的重连节奏。两者有意保持分离。
pub fn rate_limit_backoff(attempts: u32) -> Duration {
    let exp = attempts.min(RATE_LIMIT_MAX_EXP);
    let ms = RATE_LIMIT_BASE_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(RATE_LIMIT_MAX_MS))
}

/// 第三方 socket 提供商的限速信号判定
pub fn is_rate_limit_error(err: &impl std::fmt::Display) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("429") || text.contains("too many requests") || text.contains("rate limit")
}

/// 连接关闭原因，决定是否记入限速退避表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 显式的主动关闭，不触发任何惩罚
    Normal,
    /// 限速关闭，记入退避表
    RateLimited,
    /// 其它异常关闭，驱逐缓存但不惩罚
    Abnormal,
}

#[derive(Debug, Clone, Copy, Default)]
struct BackoffEntry {
    attempts: u32,
    backoff_until: Option<Instant>,
}

/// 每条链的连接生命周期管理
///
/// socket 缓存与限速退避表都是以 chain_id 为键、由单个运行时对象持有的
/// 显式状态（非模块级全局）；每个键只被该链自己的任务写入，结构上避免争用。
/// 缓存里只存活跃连接：监听端在 socket 关闭时回调 mark_closed 驱逐，
/// 所以存在即可复用
pub struct ConnectionManager {
    chains: HashMap<u64, ChainConfig>,
    sockets: Mutex<HashMap<u64, Arc<Provider<Ws>>>>,
    backoff: Mutex<HashMap<u64, BackoffEntry>>,
}

impl ConnectionManager {
    pub fn new(chains: HashMap<u64, ChainConfig>) -> Self {
        Self {
            chains,
            sockets: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.get(&chain_id)
    }

    /// 构建链锁定的 HTTP 读客户端
    /// 未配置的链在配置加载阶段已被排除，这里直接报错
    pub fn http_provider(&self, chain_id: u64) -> Result<Arc<Provider<Http>>> {
        let chain = self
            .chains
            .get(&chain_id)
            .ok_or_else(|| anyhow!("链 {} 未配置", chain_id))?;

        let provider = Provider::<Http>::try_from(chain.rpc_url.as_str())?;
        Ok(Arc::new(provider))
    }

    /// 获取缓存的 socket 连接，没有缓存时重建。
    /// 返回 Ok(None) 表示该链处于限速退避窗口内，
    /// 调用方应视为"暂时不可用"跳过本轮，而不是错误
    pub async fn socket_provider(&self, chain_id: u64) -> Result<Option<Arc<Provider<Ws>>>> {
        {
            let sockets = self.sockets.lock().await;
            if let Some(provider) = sockets.get(&chain_id) {
                return Ok(Some(Arc::clone(provider)));
            }
        }

        // 创建前先查退避表
        {
            let backoff = self.backoff.lock().await;
            if let Some(entry) = backoff.get(&chain_id) {
                if let Some(until) = entry.backoff_until {
                    if Instant::now() < until {
                        return Ok(None);
                    }
                }
            }
        }

        let chain = self
            .chains
            .get(&chain_id)
            .ok_or_else(|| anyhow!("链 {} 未配置", chain_id))?;

        info!("🔗 链 {}: 创建 socket 连接 ...", chain_id);
        let ws = match Ws::connect(chain.ws_url.as_str()).await {
            Ok(ws) => ws,
            Err(e) => {
                if is_rate_limit_error(&e) {
                    self.register_rate_limit(chain_id).await;
                }
                return Err(anyhow!("链 {} socket 连接失败: {}", chain_id, e));
            }
        };

        let provider = Arc::new(Provider::new(ws));

        {
            let mut sockets = self.sockets.lock().await;
            sockets.insert(chain_id, Arc::clone(&provider));
        }

        // 连接成功后清零限速计数
        {
            let mut backoff = self.backoff.lock().await;
            backoff.remove(&chain_id);
        }

        info!("✅ 链 {}: socket 连接已建立", chain_id);
        Ok(Some(provider))
    }

    /// 监听端检测到 socket 关闭后回调：驱逐缓存，
    /// 限速关闭额外记入退避表，其它关闭不惩罚
    pub async fn mark_closed(&self, chain_id: u64, reason: CloseReason) {
        {
            let mut sockets = self.sockets.lock().await;
            sockets.remove(&chain_id);
        }

        if reason == CloseReason::RateLimited {
            self.register_rate_limit(chain_id).await;
        }
    }

    /// 记一次限速：以当前计数为指数计算新窗口，再把计数 +1 落表
    async fn register_rate_limit(&self, chain_id: u64) {
        let mut backoff = self.backoff.lock().await;
        let entry = backoff.entry(chain_id).or_default();
        let window = rate_limit_backoff(entry.attempts);
        entry.backoff_until = Some(Instant::now() + window);
        entry.attempts += 1;
        warn!(
            "🚧 链 {}: 触发限速，第 {} 次，退避 {:?}",
            chain_id, entry.attempts, window
        );
    }

    /// 该链当前是否处于退避窗口内
    pub async fn backoff_active(&self, chain_id: u64) -> bool {
        let backoff = self.backoff.lock().await;
        backoff
            .get(&chain_id)
            .and_then(|e| e.backoff_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain(chain_id: u64) -> ChainConfig {
        ChainConfig {
            chain_id,
            name: "Test".to_string(),
            rpc_url: "http://127.0.0.1:1".to_string(),
            ws_url: "ws://127.0.0.1:1".to_string(),
            curve_address: "0x0000000000000000000000000000000000000001".to_string(),
            start_block: 0,
            backfill_window: 2000,
            graduation_threshold: "4000000000000000000".to_string(),
        }
    }

    #[test]
    fn test_rate_limit_backoff_schedule() {
        // min(180000 * 2^min(c, 6), 3600000)
        assert_eq!(rate_limit_backoff(0), Duration::from_millis(180_000));
        assert_eq!(rate_limit_backoff(1), Duration::from_millis(360_000));
        assert_eq!(rate_limit_backoff(3), Duration::from_millis(1_440_000));
        // 2^5 * 180s = 5760s > 3600s，封顶
        assert_eq!(rate_limit_backoff(5), Duration::from_millis(3_600_000));
        assert_eq!(rate_limit_backoff(6), Duration::from_millis(3_600_000));
        // 指数在6处截断，计数再大也不变
        assert_eq!(rate_limit_backoff(100), Duration::from_millis(3_600_000));
    }

    #[test]
    fn test_is_rate_limit_error() {
        assert!(is_rate_limit_error(&"HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_error(&"provider rate limit exceeded"));
        assert!(!is_rate_limit_error(&"connection reset by peer"));
    }

    #[tokio::test]
    async fn test_backoff_gate_returns_none() {
        let mut chains = HashMap::new();
        chains.insert(56u64, test_chain(56));
        let manager = ConnectionManager::new(chains);

        // 首次限速后窗口 ≈ now + 180s
        manager.register_rate_limit(56).await;
        assert!(manager.backoff_active(56).await);

        // 窗口内的创建调用不碰网络，直接返回 None
        let result = manager.socket_provider(56).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_backoff_isolated_per_chain() {
        let mut chains = HashMap::new();
        chains.insert(56u64, test_chain(56));
        chains.insert(8453u64, test_chain(8453));
        let manager = ConnectionManager::new(chains);

        manager.register_rate_limit(56).await;
        assert!(manager.backoff_active(56).await);
        // 链 56 的退避不影响链 8453
        assert!(!manager.backoff_active(8453).await);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_cache() {
        let mut chains = HashMap::new();
        chains.insert(56u64, test_chain(56));
        let manager = ConnectionManager::new(chains);

        // 本地不可达端口，连接立即被拒绝
        assert!(manager.socket_provider(56).await.is_err());
        // 连接拒绝不是限速信号，不记退避；失败也不落缓存，
        // 下一次调用重新走创建路径
        assert!(!manager.backoff_active(56).await);
        assert!(manager.socket_provider(56).await.is_err());
    }

    #[tokio::test]
    async fn test_normal_close_no_penalty() {
        let mut chains = HashMap::new();
        chains.insert(56u64, test_chain(56));
        let manager = ConnectionManager::new(chains);

        manager.mark_closed(56, CloseReason::Normal).await;
        assert!(!manager.backoff_active(56).await);

        manager.mark_closed(56, CloseReason::Abnormal).await;
        assert!(!manager.backoff_active(56).await);

        manager.mark_closed(56, CloseReason::RateLimited).await;
        assert!(manager.backoff_active(56).await);
    }
}
