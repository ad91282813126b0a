use rust_decimal::Decimal;
use serde::Serialize;

/// 广播事件：投影成功后推送到 broadcast channel，由外部 API 层扇出
/// 该核心只负责产生 payload，不管理订阅者投递

#[derive(Debug, Clone, Serialize)]
pub struct HolderSnapshot {
    pub address: String,
    pub balance: String,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenCreatedPayload {
    pub event: &'static str,
    pub chain_id: u64,
    pub token_address: String,
    pub creator: String,
    pub name: String,
    pub symbol: String,
    pub total_supply: String,
    pub price: String,
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradePayload {
    pub event: &'static str,
    pub chain_id: u64,
    pub token_address: String,
    pub trader_address: String,
    pub tx_type: String,
    pub quote_amount: String,
    pub base_amount: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub price: String,
    pub price_usd: Decimal,
    pub market_cap: Decimal,
    pub graduation_progress: Decimal,
    pub holders: Vec<HolderSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraduationPayload {
    pub event: &'static str,
    pub chain_id: u64,
    pub token_address: String,
    pub tx_hash: String,
    pub block_number: u64,
}

pub const EVENT_TOKEN_CREATED: &str = "token_created";
pub const EVENT_TRADE: &str = "trade";
pub const EVENT_GRADUATED: &str = "graduated";
