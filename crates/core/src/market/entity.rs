use crate::market::error::MarketError;
use serde::{Deserialize, Serialize};

/// # Summary
/// 单根 K 线数据实体，记录特定周期内的行情波动。
///
/// # Invariants
/// - `open_time` 为毫秒时间戳，在同一个窗口内全局唯一，作为索引键。
/// - 实体一经构造即不可变，窗口内不存在原地修改。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    // K 线开始时间 (毫秒)
    pub open_time: i64,
    // 开盘价
    pub open: f64,
    // 最高价
    pub high: f64,
    // 最低价
    pub low: f64,
    // 收盘价
    pub close: f64,
    // 成交量 (基础资产)
    pub volume: f64,
    // K 线结束时间 (毫秒)
    pub close_time: i64,
    // 成交额 (计价资产)
    pub quote_asset_volume: f64,
    // 成交笔数
    pub trade_count: i64,
    // 主动买入成交量 (基础资产)
    pub taker_buy_base_volume: f64,
    // 主动买入成交额 (计价资产)
    pub taker_buy_quote_volume: f64,
}

/// # Summary
/// 交易所原始 K 线记录，价格与成交量字段保持上游的十进制字符串形式。
///
/// # Invariants
/// - 只有通过 [`Candle::try_from`] 转换后才能进入窗口。
/// - `is_final` 表示该周期已经收盘。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandle {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
    pub quote_asset_volume: String,
    pub trade_count: i64,
    pub taker_buy_base_volume: String,
    pub taker_buy_quote_volume: String,
    pub is_final: bool,
}

fn parse_field(field: &'static str, value: &str) -> Result<f64, MarketError> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(MarketError::Conversion {
            field,
            value: value.to_string(),
        }),
    }
}

impl TryFrom<&RawCandle> for Candle {
    type Error = MarketError;

    /// # Summary
    /// 将原始记录转换为强类型 K 线。
    ///
    /// # Logic
    /// 逐字段解析十进制字符串，遇到第一个非法字段立即返回 `Conversion` 错误。
    ///
    /// # Arguments
    /// * `raw`: 上游原始记录。
    ///
    /// # Returns
    /// 转换后的 Candle 或 MarketError::Conversion。
    fn try_from(raw: &RawCandle) -> Result<Self, Self::Error> {
        Ok(Candle {
            open_time: raw.open_time,
            open: parse_field("open", &raw.open)?,
            high: parse_field("high", &raw.high)?,
            low: parse_field("low", &raw.low)?,
            close: parse_field("close", &raw.close)?,
            volume: parse_field("volume", &raw.volume)?,
            close_time: raw.close_time,
            quote_asset_volume: parse_field("quote_asset_volume", &raw.quote_asset_volume)?,
            trade_count: raw.trade_count,
            taker_buy_base_volume: parse_field("taker_buy_base_volume", &raw.taker_buy_base_volume)?,
            taker_buy_quote_volume: parse_field(
                "taker_buy_quote_volume",
                &raw.taker_buy_quote_volume,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(open: &str) -> RawCandle {
        RawCandle {
            open_time: 1_700_000_000_000,
            open: open.to_string(),
            high: "101.5".to_string(),
            low: "99.0".to_string(),
            close: "100.25".to_string(),
            volume: "12.5".to_string(),
            close_time: 1_700_000_000_999,
            quote_asset_volume: "1250.0".to_string(),
            trade_count: 42,
            taker_buy_base_volume: "6.0".to_string(),
            taker_buy_quote_volume: "600.0".to_string(),
            is_final: true,
        }
    }

    #[test]
    fn test_convert_raw_candle() {
        let candle = Candle::try_from(&raw("100.0")).unwrap();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.close, 100.25);
        assert_eq!(candle.trade_count, 42);
        assert_eq!(candle.taker_buy_quote_volume, 600.0);
    }

    #[test]
    fn test_convert_rejects_malformed_field() {
        let err = Candle::try_from(&raw("1.2.3")).unwrap_err();
        match err {
            MarketError::Conversion { field, value } => {
                assert_eq!(field, "open");
                assert_eq!(value, "1.2.3");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(Candle::try_from(&raw("NaN")).is_err());
    }

    #[test]
    fn test_candle_serde_shape() {
        let candle = Candle::try_from(&raw("100.0")).unwrap();
        let json = serde_json::to_value(candle).unwrap();
        assert_eq!(json["open_time"], 1_700_000_000_000i64);
        assert_eq!(json["trade_count"], 42);
    }
}
