use anyhow::{anyhow, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// 缓存有效期: 5分钟
const PRICE_TTL_SECS: u64 = 300;
/// 从未成功取到价时的兜底汇率
const DEFAULT_USD_RATE: u64 = 2000;

const COINGECKO_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=ethereum&vs_currencies=usd";
const BINANCE_URL: &str = "https://api.binance.com/api/v3/ticker/price?symbol=ETHUSDT";

#[derive(Debug, Deserialize)]
struct CoingeckoResponse {
    ethereum: CoingeckoPrice,
}

#[derive(Debug, Deserialize)]
struct CoingeckoPrice {
    usd: f64,
}

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    symbol: String,
    price: String,
}

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    rate: Decimal,
    fetched_at: Instant,
}

impl CachedRate {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// USD/ETH 汇率缓存，双源回退
///
/// 刻意选择可用性优先于新鲜度：下游的美元计价字段
/// 绝不能因为价格源故障而阻塞，宁可用陈旧值
pub struct PriceOracle {
    client: reqwest::Client,
    cache: RwLock<Option<CachedRate>>,
    ttl: Duration,
    primary_url: String,
    fallback_url: String,
}

impl PriceOracle {
    pub fn new() -> Self {
        Self::with_endpoints(COINGECKO_URL, BINANCE_URL)
    }

    pub fn with_endpoints(primary_url: impl Into<String>, fallback_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            cache: RwLock::new(None),
            ttl: Duration::from_secs(PRICE_TTL_SECS),
            primary_url: primary_url.into(),
            fallback_url: fallback_url.into(),
        }
    }

    /// 5分钟内的缓存直接返回；过期后依次尝试两个价格源；
    /// 双源都失败时返回最后已知值（可能陈旧）；
    /// 从未缓存过任何值才回退到硬编码兜底
    pub async fn usd_price(&self) -> Decimal {
        if let Some(cached) = *self.cache.read().await {
            if cached.is_fresh(self.ttl) {
                return cached.rate;
            }
        }

        match self.fetch_primary().await {
            Ok(rate) => {
                self.store(rate).await;
                return rate;
            }
            Err(e) => {
                warn!("⚠️ 主价格源失败，切换备用源: {}", e);
            }
        }

        match self.fetch_fallback().await {
            Ok(rate) => {
                self.store(rate).await;
                return rate;
            }
            Err(e) => {
                warn!("⚠️ 备用价格源也失败: {}", e);
            }
        }

        if let Some(cached) = *self.cache.read().await {
            warn!("⚠️ 双价格源均不可用，沿用过期缓存: {}", cached.rate);
            return cached.rate;
        }

        warn!("⚠️ 从未取到汇率，使用兜底值: {}", DEFAULT_USD_RATE);
        Decimal::from(DEFAULT_USD_RATE)
    }

    async fn fetch_primary(&self) -> Result<Decimal> {
        let response = self
            .client
            .get(&self.primary_url)
            .header("User-Agent", "LaunchpadMonitor/1.0")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("API请求失败: {}", response.status()));
        }

        let body: CoingeckoResponse = response.json().await?;
        let rate = Decimal::from_f64(body.ethereum.usd)
            .ok_or_else(|| anyhow!("价格解析失败: {}", body.ethereum.usd))?;

        if rate <= Decimal::ZERO {
            return Err(anyhow!("无效的价格数据: {}", rate));
        }

        Ok(rate)
    }

    async fn fetch_fallback(&self) -> Result<Decimal> {
        let response = self
            .client
            .get(&self.fallback_url)
            .header("User-Agent", "LaunchpadMonitor/1.0")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("API请求失败: {}", response.status()));
        }

        let ticker: BinanceTicker = response.json().await?;
        let rate =
            Decimal::from_str(&ticker.price).map_err(|e| anyhow!("价格解析失败: {}", e))?;

        if rate <= Decimal::ZERO {
            return Err(anyhow!("无效的价格数据: {}", rate));
        }

        Ok(rate)
    }

    async fn store(&self, rate: Decimal) {
        let mut cache = self.cache.write().await;
        *cache = Some(CachedRate {
            rate,
            fetched_at: Instant::now(),
        });
        info!("✅ USD汇率已刷新: {}", rate);
    }
}

impl Default for PriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 连接立即被拒绝的地址，测试不触外网
    const DEAD_URL: &str = "http://127.0.0.1:9";

    #[test]
    fn test_cached_rate_freshness() {
        let cached = CachedRate {
            rate: Decimal::from(2000),
            fetched_at: Instant::now(),
        };
        assert!(cached.is_fresh(Duration::from_secs(300)));
        assert!(!cached.is_fresh(Duration::from_secs(0)));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_upstream() {
        // 5分钟内的两次调用返回同一缓存值，不触发上游请求
        // （上游地址不可达，任何请求都会失败，返回正确值即证明没发请求）
        let oracle = PriceOracle::with_endpoints(DEAD_URL, DEAD_URL);
        oracle.store(Decimal::from(1234)).await;

        assert_eq!(oracle.usd_price().await, Decimal::from(1234));
        assert_eq!(oracle.usd_price().await, Decimal::from(1234));
    }

    #[tokio::test]
    async fn test_stale_cache_survives_outage() {
        // 双源都失败时返回最后已知值，而不是报错
        let oracle = PriceOracle::with_endpoints(DEAD_URL, DEAD_URL);
        {
            let mut cache = oracle.cache.write().await;
            let stale = Instant::now()
                .checked_sub(Duration::from_secs(3600))
                .unwrap_or_else(Instant::now);
            *cache = Some(CachedRate {
                rate: Decimal::from(1777),
                fetched_at: stale,
            });
        }

        assert_eq!(oracle.usd_price().await, Decimal::from(1777));
    }

    #[tokio::test]
    async fn test_default_only_when_never_cached() {
        let oracle = PriceOracle::with_endpoints(DEAD_URL, DEAD_URL);
        assert_eq!(oracle.usd_price().await, Decimal::from(DEFAULT_USD_RATE));
    }
}
