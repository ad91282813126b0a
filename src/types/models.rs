use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// 交易类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Bought,
    Sold,
    #[serde(rename = "Add_liquidity")]
    AddLiquidity,
    #[serde(rename = "Remove_liquidity")]
    RemoveLiquidity,
    Transfer,
    Mint,
    Burn,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Bought => "Bought",
            TransactionType::Sold => "Sold",
            TransactionType::AddLiquidity => "Add_liquidity",
            TransactionType::RemoveLiquidity => "Remove_liquidity",
            TransactionType::Transfer => "Transfer",
            TransactionType::Mint => "Mint",
            TransactionType::Burn => "Burn",
        }
    }
}

/// 代币行：每个 (chain_id, address) 唯一
/// price / market_cap 等派生字段只是合约最新观测状态的缓存
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub chain_id: i32,
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub metadata_uri: Option<String>,
    pub description: Option<String>,
    pub creator: String,
    /// 总供应量，base-unit 整数字符串
    pub total_supply: String,
    /// 原生币计价，18位小数字符串
    pub price: String,
    pub price_usd: Decimal,
    pub market_cap: Decimal,
    pub graduation_progress: Decimal,
    pub on_curve: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 交易记录：append-only，(chain_id, tx_hash) 唯一，写入后不再修改
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub chain_id: i32,
    pub tx_hash: String,
    pub token_address: String,
    pub trader_address: String,
    pub tx_type: String,
    pub quote_amount: String,
    pub base_amount: String,
    pub price: String,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
}

/// 持仓行：每个 (chain_id, token, holder) 唯一
/// balance 为 base-unit 整数字符串；percentage 由全量重算得出
/// 余额归零后行保留（查询时过滤），不删除
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TokenHolder {
    pub chain_id: i32,
    pub token_address: String,
    pub holder_address: String,
    pub balance: String,
    pub percentage: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// 流动性事件：append-only，(chain_id, tx_hash) 唯一
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LiquidityEvent {
    pub chain_id: i32,
    pub tx_hash: String,
    pub token_address: String,
    pub kind: String,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
}

/// 价格快照：append-only 时间序列，(chain_id, token, timestamp) 唯一
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TokenHistory {
    pub chain_id: i32,
    pub token_address: String,
    pub price: String,
    pub market_cap: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// 回填扫描游标，每条链一行
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BackfillCursor {
    pub chain_id: i32,
    pub next_block: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_type_as_str() {
        assert_eq!(TransactionType::Bought.as_str(), "Bought");
        assert_eq!(TransactionType::Sold.as_str(), "Sold");
        assert_eq!(TransactionType::AddLiquidity.as_str(), "Add_liquidity");
        assert_eq!(TransactionType::RemoveLiquidity.as_str(), "Remove_liquidity");
    }

    #[test]
    fn test_transaction_type_serde_rename() {
        // 序列化格式必须与历史数据中的类型字符串一致
        let json = serde_json::to_string(&TransactionType::AddLiquidity).unwrap();
        assert_eq!(json, "\"Add_liquidity\"");
        let back: TransactionType = serde_json::from_str("\"Remove_liquidity\"").unwrap();
        assert_eq!(back, TransactionType::RemoveLiquidity);
    }
}
