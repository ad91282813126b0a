pub mod meta;

use crate::connection::{is_rate_limit_error, CloseReason, ConnectionManager};
use crate::projector::EventProjector;
use anyhow::Result;
use ethers::{
    contract::{abigen, EthEvent, EthLogDecode},
    core::abi::RawLog,
    providers::{Middleware, Provider, Ws},
    types::{Address, Filter},
};
use futures_util::StreamExt;
use meta::LogEnvelope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

abigen!(
    BondingCurve,
    r#"[
        event TokenCreated(address indexed token, address indexed creator, string name, string symbol, string metadataUri, string description, uint256 totalSupply, uint256 virtualQuoteReserve, uint256 virtualBaseReserve, uint256 timestamp)
        event TokenBought(address indexed token, address indexed buyer, uint256 quoteAmount, uint256 baseAmount, uint256 fee, uint256 virtualQuoteReserve, uint256 virtualBaseReserve, uint256 timestamp)
        event TokenSold(address indexed token, address indexed seller, uint256 quoteAmount, uint256 baseAmount, uint256 fee, uint256 virtualQuoteReserve, uint256 virtualBaseReserve, uint256 timestamp)
        event TokenGraduated(address indexed token, uint256 timestamp)
    ]"#
);

/// 重连退避基数: 2秒
const RECONNECT_BASE_MS: u64 = 2_000;
/// 重连退避上限: 60秒
const RECONNECT_MAX_MS: u64 = 60_000;
/// 最多调度10次重连（attempt ∈ [0,9]），之后该链退出活跃跟踪
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// 处于限速退避窗口内时跳过本轮的等待时长
const BACKOFF_SKIP_SECS: u64 = 15;

/// socket 断开重连延迟: min(2000ms * 2^attempt, 60000ms)
///
/// 与 connection::rate_limit_backoff 是有意分离的两套策略，
/// 本策略只管断线重连的节奏，见 DESIGN.md
pub fn reconnect_delay(attempt: u32) -> Duration {
    let ms = RECONNECT_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(RECONNECT_MAX_MS))
}

/// 订阅四类联合曲线事件的过滤器
pub(crate) fn curve_event_filter(curve_address: Address) -> Filter {
    Filter::new().address(curve_address).topic0(vec![
        TokenCreatedFilter::signature(),
        TokenBoughtFilter::signature(),
        TokenSoldFilter::signature(),
        TokenGraduatedFilter::signature(),
    ])
}

/// 解析元数据、解码并派发一条日志到投影器
/// 元数据无法解析或解码失败的事件丢弃并记日志，绝不内联重试
pub(crate) async fn dispatch_envelope<M: Middleware>(
    provider: &M,
    projector: &EventProjector,
    chain_id: u64,
    curve_address: Address,
    envelope: LogEnvelope,
) -> Result<()> {
    let event_meta = match meta::resolve_meta(provider, curve_address, &envelope).await? {
        Some(m) => m,
        None => {
            warn!(
                "⚠️ 链 {}: 事件元数据无法解析，丢弃 (回填扫描会独立恢复): topics={:?}",
                chain_id, envelope.log.topics
            );
            return Ok(());
        }
    };

    let raw = RawLog {
        topics: envelope.log.topics.clone(),
        data: envelope.log.data.to_vec(),
    };
    let event = match BondingCurveEvents::decode_log(&raw) {
        Ok(event) => event,
        Err(e) => {
            warn!("⚠️ 链 {}: 无法解码事件日志，丢弃: {}", chain_id, e);
            return Ok(());
        }
    };

    projector.apply(chain_id, &event_meta, event).await
}

/// 每条链一个实时监听器，彼此完全独立：
/// 链 A 的 socket 故障对链 B 零影响
pub struct RealTimeListener {
    chain_id: u64,
    curve_address: Address,
    connections: Arc<ConnectionManager>,
    projector: Arc<EventProjector>,
    shutdown: Arc<AtomicBool>,
}

impl RealTimeListener {
    pub fn new(
        chain_id: u64,
        curve_address: Address,
        connections: Arc<ConnectionManager>,
        projector: Arc<EventProjector>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain_id,
            curve_address,
            connections,
            projector,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("🚀 启动链 {} 的实时事件监听...", self.chain_id);

        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("🛑 链 {}: 收到关闭信号，正常退出", self.chain_id);
                break;
            }

            let provider = match self.connections.socket_provider(self.chain_id).await {
                Ok(Some(provider)) => provider,
                Ok(None) => {
                    // 限速退避窗口内：跳过本轮，不消耗重连次数
                    debug!("⏸️ 链 {}: 处于限速退避窗口，跳过本轮", self.chain_id);
                    sleep(Duration::from_secs(BACKOFF_SKIP_SECS)).await;
                    continue;
                }
                Err(e) => {
                    error!("❌ 链 {}: 获取 socket 连接失败: {}", self.chain_id, e);
                    if !self.schedule_reconnect(&mut attempt).await {
                        break;
                    }
                    continue;
                }
            };

            let reason = self.subscribe_and_consume(provider, &mut attempt).await;
            self.connections.mark_closed(self.chain_id, reason).await;

            if reason == CloseReason::Normal {
                // 显式主动关闭不触发重连
                info!("🛑 链 {}: 正常关闭，不再重连", self.chain_id);
                break;
            }

            if !self.schedule_reconnect(&mut attempt).await {
                break;
            }
        }
    }

    /// 调度一次重连退避；超过次数上限时返回 false，
    /// 链退出活跃跟踪（需要外部重启）
    async fn schedule_reconnect(&self, attempt: &mut u32) -> bool {
        if *attempt >= MAX_RECONNECT_ATTEMPTS {
            error!(
                "💀 链 {}: 连续 {} 次重连失败，移出活跃跟踪（需外部重启）",
                self.chain_id, MAX_RECONNECT_ATTEMPTS
            );
            return false;
        }
        let delay = reconnect_delay(*attempt);
        warn!(
            "🔄 链 {}: 第 {} 次重连，{:?} 后重试",
            self.chain_id,
            *attempt + 1,
            delay
        );
        *attempt += 1;
        sleep(delay).await;
        true
    }

    /// 订阅并消费事件流直到 socket 关闭，返回关闭原因
    ///
    /// 队列结构：泵任务把原始日志帧推入 mpsc 队列，
    /// 每条链一个消费循环负责解析、解码、派发 —— 顺序与背压都是显式的
    async fn subscribe_and_consume(
        &self,
        provider: Arc<Provider<Ws>>,
        attempt: &mut u32,
    ) -> CloseReason {
        let filter = curve_event_filter(self.curve_address);

        let mut stream = match provider.subscribe_logs(&filter).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("❌ 链 {}: 订阅事件失败: {}", self.chain_id, e);
                return if is_rate_limit_error(&e) {
                    CloseReason::RateLimited
                } else {
                    CloseReason::Abnormal
                };
            }
        };

        info!(
            "📡 链 {}: 已订阅 TokenCreated / TokenBought / TokenSold / TokenGraduated",
            self.chain_id
        );
        // 成功重开后计数清零，处理继续且不回放 —— 空洞由回填扫描负责
        *attempt = 0;

        let (frame_tx, frame_rx) = mpsc::channel::<LogEnvelope>(1024);
        let consumer = tokio::spawn(Self::consume_loop(
            frame_rx,
            Arc::clone(&provider),
            Arc::clone(&self.projector),
            self.chain_id,
            self.curve_address,
        ));

        while let Some(log) = stream.next().await {
            if frame_tx.send(LogEnvelope::from_log(log)).await.is_err() {
                break;
            }
        }
        drop(frame_tx);
        let _ = consumer.await;

        if self.shutdown.load(Ordering::Relaxed) {
            CloseReason::Normal
        } else {
            warn!("🔌 链 {}: 事件流中断", self.chain_id);
            CloseReason::Abnormal
        }
    }

    /// 每条链的消费循环：单个事件失败只记日志，绝不中断后续事件
    async fn consume_loop(
        mut frame_rx: mpsc::Receiver<LogEnvelope>,
        provider: Arc<Provider<Ws>>,
        projector: Arc<EventProjector>,
        chain_id: u64,
        curve_address: Address,
    ) {
        while let Some(envelope) = frame_rx.recv().await {
            if let Err(e) =
                dispatch_envelope(provider.as_ref(), &projector, chain_id, curve_address, envelope)
                    .await
            {
                error!("❌ 链 {}: 处理事件失败: {}", chain_id, e);
                // 继续处理其他事件
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::ValueOrArray;

    #[test]
    fn test_reconnect_delay_schedule() {
        // min(2000 * 2^n, 60000)
        assert_eq!(reconnect_delay(0), Duration::from_millis(2_000));
        assert_eq!(reconnect_delay(1), Duration::from_millis(4_000));
        assert_eq!(reconnect_delay(4), Duration::from_millis(32_000));
        // 2000 * 2^5 = 64000 > 60000，封顶
        assert_eq!(reconnect_delay(5), Duration::from_millis(60_000));
        assert_eq!(reconnect_delay(9), Duration::from_millis(60_000));
    }

    #[test]
    fn test_reconnect_attempt_bound() {
        // 第10次之后不再调度
        assert_eq!(MAX_RECONNECT_ATTEMPTS, 10);
    }

    #[test]
    fn test_event_filter_covers_four_events() {
        let filter = curve_event_filter(Address::zero());
        match filter.topics[0] {
            Some(ValueOrArray::Array(ref topics)) => assert_eq!(topics.len(), 4),
            _ => panic!("expected four topic0 signatures"),
        }
    }
}
