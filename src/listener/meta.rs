use anyhow::{anyhow, Result};
use ethers::providers::Middleware;
use ethers::types::{Address, Filter, Log, H256};

/// socket 层推入队列的原始帧
/// 第三方提供商回调包装对象的形状不一致：交易哈希/区块号可能嵌在
/// log 内部，也可能只出现在包装对象的顶层属性上
#[derive(Debug, Clone)]
pub struct LogEnvelope {
    pub log: Log,
    /// 包装对象顶层的交易哈希（部分提供商的形状）
    pub tx_hash: Option<H256>,
    /// 包装对象顶层的区块号
    pub block_number: Option<u64>,
}

impl LogEnvelope {
    pub fn from_log(log: Log) -> Self {
        Self {
            log,
            tx_hash: None,
            block_number: None,
        }
    }
}

/// 归一化后的事件元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMeta {
    pub tx_hash: H256,
    pub block_number: u64,
}

/// 回查窗口：最近10个区块
const LOOKBACK_BLOCKS: u64 = 10;

/// 本地解析阶段（不触网），优先级：
/// (a) log 内嵌元数据 > (b) 包装对象顶层属性
pub fn resolve_local(envelope: &LogEnvelope) -> (Option<H256>, Option<u64>) {
    let tx_hash = envelope.log.transaction_hash.or(envelope.tx_hash);
    let block_number = envelope
        .log
        .block_number
        .map(|b| b.as_u64())
        .or(envelope.block_number);
    (tx_hash, block_number)
}

/// 元数据归一化，按固定优先级逐级回退：
/// (a) log 内嵌字段
/// (b) 包装对象顶层属性
/// (c) 最近10个区块内按 topic 过滤的回查
/// (d) 已知哈希但缺区块号时查交易回执
///
/// 所有路径都失败返回 Ok(None)：事件被丢弃并记日志，
/// 绝不猜测、不在线重试 —— 回填扫描会从不可变的链上独立恢复
pub async fn resolve_meta<M: Middleware>(
    provider: &M,
    contract: Address,
    envelope: &LogEnvelope,
) -> Result<Option<EventMeta>> {
    let (mut tx_hash, mut block_number) = resolve_local(envelope);

    if tx_hash.is_none() {
        if let Some((hash, block)) = lookback_query(provider, contract, envelope).await? {
            tx_hash = Some(hash);
            block_number = block_number.or(Some(block));
        }
    }

    let tx_hash = match tx_hash {
        Some(hash) => hash,
        None => return Ok(None),
    };

    let block_number = match block_number {
        Some(block) => block,
        None => match provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| anyhow!("查询交易回执失败: {}", e))?
        {
            Some(receipt) => match receipt.block_number {
                Some(block) => block.as_u64(),
                None => return Ok(None),
            },
            None => return Ok(None),
        },
    };

    Ok(Some(EventMeta {
        tx_hash,
        block_number,
    }))
}

/// 阶段(c)：在最近几个区块内按事件的 topic 回查，
/// 找到 topics 和 data 都一致且携带完整元数据的日志
async fn lookback_query<M: Middleware>(
    provider: &M,
    contract: Address,
    envelope: &LogEnvelope,
) -> Result<Option<(H256, u64)>> {
    let latest = provider
        .get_block_number()
        .await
        .map_err(|e| anyhow!("查询最新区块失败: {}", e))?
        .as_u64();
    let from_block = latest.saturating_sub(LOOKBACK_BLOCKS);

    let mut filter = Filter::new()
        .address(contract)
        .from_block(from_block)
        .to_block(latest);
    if let Some(topic0) = envelope.log.topics.first() {
        filter = filter.topic0(*topic0);
    }
    if let Some(topic1) = envelope.log.topics.get(1) {
        filter = filter.topic1(*topic1);
    }

    let logs = provider
        .get_logs(&filter)
        .await
        .map_err(|e| anyhow!("回查日志失败: {}", e))?;

    for log in logs {
        if log.topics == envelope.log.topics && log.data == envelope.log.data {
            if let (Some(hash), Some(block)) = (log.transaction_hash, log.block_number) {
                return Ok(Some((hash, block.as_u64())));
            }
        }
    }

    Ok(None)
}
