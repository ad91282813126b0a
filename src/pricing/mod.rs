use ethers::types::U256;
use rust_decimal::Decimal;
use std::str::FromStr;

/// 联合曲线价格计算
/// price = quote_reserve * 10^18 / base_reserve，渲染为18位小数字符串
pub struct CurvePrice;

impl CurvePrice {
    /// 价格合法区间上限（原生币计价）
    const MAX_PRICE_UNITS: u64 = 1000;

    /// 从虚拟储备推导价格
    /// 分母为零、U256溢出、或结果落在 (0, 1000] 之外时返回 "0"
    /// 宁可写入占位零，也不输出一个貌似合理但错误的数字
    pub fn from_reserves(quote_reserve: U256, base_reserve: U256) -> String {
        if base_reserve.is_zero() {
            return "0".to_string();
        }

        let scaled = match quote_reserve.checked_mul(U256::exp10(18)) {
            Some(v) => v / base_reserve,
            None => return "0".to_string(),
        };

        if scaled.is_zero() {
            return "0".to_string();
        }

        let upper = U256::from(Self::MAX_PRICE_UNITS) * U256::exp10(18);
        if scaled > upper {
            return "0".to_string();
        }

        Self::format_units_18(scaled)
    }

    /// base-unit 值渲染为18位小数字符串
    pub fn format_units_18(value: U256) -> String {
        let scale = U256::exp10(18);
        let int_part = value / scale;
        let frac_part = value % scale;
        let frac = frac_part.to_string();
        format!("{}.{}{}", int_part, "0".repeat(18 - frac.len()), frac)
    }

    /// 18位小数字符串解析为 Decimal，失败回退为零
    pub fn parse_price(price: &str) -> Decimal {
        Decimal::from_str(price).unwrap_or(Decimal::ZERO)
    }

    /// 持仓占比: balance / total_supply * 100，保留2位小数
    pub fn holder_percentage(balance: U256, total_supply: U256) -> Decimal {
        if total_supply.is_zero() {
            return Decimal::ZERO;
        }
        // 先放大1万倍取整，再降2位小数，避免大整数除法精度丢失
        let bp = match balance.checked_mul(U256::from(10_000u64)) {
            Some(v) => v / total_supply,
            None => return Decimal::ZERO,
        };
        // 并发写入期间占比可能短暂超过100%，封顶防止溢出
        let bp = bp.min(U256::from(1_000_000u64)).low_u64();
        Decimal::new(bp as i64, 2)
    }

    /// 毕业进度: 虚拟报价储备 / 毕业阈值 * 100，封顶100
    pub fn graduation_progress(virtual_quote_reserve: U256, threshold: U256) -> Decimal {
        if threshold.is_zero() {
            return Decimal::ZERO;
        }
        let bp = match virtual_quote_reserve.checked_mul(U256::from(10_000u64)) {
            Some(v) => v / threshold,
            None => return Decimal::new(10_000, 2),
        };
        let bp = bp.min(U256::from(10_000u64)).low_u64();
        Decimal::new(bp as i64, 2)
    }

    /// 美元市值: price(原生币) * total_supply(代币数) * usd_rate
    pub fn market_cap_usd(price: &str, total_supply: U256, usd_rate: Decimal) -> Decimal {
        let price_dec = Self::parse_price(price);
        if price_dec.is_zero() {
            return Decimal::ZERO;
        }
        let supply_dec = Decimal::from_str(&Self::format_units_18(total_supply))
            .unwrap_or(Decimal::ZERO)
            .round_dp(6);
        (price_dec * supply_dec * usd_rate).round_dp(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_denominator() {
        // 分母为零直接返回占位零
        let price = CurvePrice::from_reserves(U256::exp10(17), U256::zero());
        assert_eq!(price, "0");
    }

    #[test]
    fn test_zero_numerator() {
        let price = CurvePrice::from_reserves(U256::zero(), U256::exp10(24));
        assert_eq!(price, "0");
    }

    #[test]
    fn test_price_above_range_rejected() {
        // 1001 > 1000，超出 (0, 1000] 区间
        let price = CurvePrice::from_reserves(U256::from(1001u64) * U256::exp10(18), U256::exp10(18));
        assert_eq!(price, "0");
    }

    #[test]
    fn test_price_at_upper_bound_accepted() {
        // 区间是开闭区间，1000 恰好合法
        let price = CurvePrice::from_reserves(U256::from(1000u64) * U256::exp10(18), U256::exp10(18));
        assert_eq!(price, "1000.000000000000000000");
    }

    #[test]
    fn test_overflow_rejected() {
        let price = CurvePrice::from_reserves(U256::MAX, U256::exp10(18));
        assert_eq!(price, "0");
    }

    #[test]
    fn test_initial_price_scenario() {
        // 创建场景: virtualQuoteReserve = 1e17, virtualBaseReserve = 1e24
        // price = 1e17 * 1e18 / 1e24 = 1e11 base units
        let price = CurvePrice::from_reserves(U256::exp10(17), U256::exp10(24));
        assert_eq!(price, "0.000000100000000000");
    }

    #[test]
    fn test_format_units_18_padding() {
        assert_eq!(CurvePrice::format_units_18(U256::from(1u64)), "0.000000000000000001");
        assert_eq!(CurvePrice::format_units_18(U256::exp10(18)), "1.000000000000000000");
        assert_eq!(
            CurvePrice::format_units_18(U256::from(1_500_000_000_000_000_000u64)),
            "1.500000000000000000"
        );
    }

    #[test]
    fn test_holder_percentage_full() {
        let total = U256::exp10(24);
        assert_eq!(CurvePrice::holder_percentage(total, total), Decimal::new(10_000, 2));
    }

    #[test]
    fn test_holder_percentage_sums_to_100() {
        // 总供应量 = 各持仓之和时，非零占比之和等于100（舍入误差内）
        let total = U256::from(1_000_000u64) * U256::exp10(18);
        let balances = [
            U256::from(500_000u64) * U256::exp10(18),
            U256::from(300_000u64) * U256::exp10(18),
            U256::from(200_000u64) * U256::exp10(18),
        ];
        let sum: Decimal = balances
            .iter()
            .map(|b| CurvePrice::holder_percentage(*b, total))
            .sum();
        assert_eq!(sum, Decimal::new(10_000, 2));
    }

    #[test]
    fn test_holder_percentage_zero_supply() {
        assert_eq!(
            CurvePrice::holder_percentage(U256::exp10(18), U256::zero()),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_graduation_progress_clamped() {
        let threshold = U256::from(4u64) * U256::exp10(18);
        assert_eq!(
            CurvePrice::graduation_progress(U256::from(2u64) * U256::exp10(18), threshold),
            Decimal::new(5_000, 2)
        );
        // 超过阈值封顶100
        assert_eq!(
            CurvePrice::graduation_progress(U256::from(8u64) * U256::exp10(18), threshold),
            Decimal::new(10_000, 2)
        );
    }

    #[test]
    fn test_market_cap_usd() {
        // price = 0.0000001, supply = 1,000,000 代币, rate = 2000
        // 市值 = 0.0000001 * 1000000 * 2000 = 200
        let total = U256::from(1_000_000u64) * U256::exp10(18);
        let cap = CurvePrice::market_cap_usd("0.000000100000000000", total, Decimal::from(2000));
        assert_eq!(cap, Decimal::from(200));
    }
}
