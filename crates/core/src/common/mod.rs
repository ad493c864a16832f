use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// # Summary
/// K 线周期枚举，取值与交易所接口使用的字符串一致。
///
/// # Invariants
/// - 每个周期对应固定的毫秒跨度，见 [`Interval::millis`]。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Interval {
    #[serde(rename = "1s")]
    Second1,
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
}

impl Interval {
    /// # Summary
    /// 返回单根 K 线覆盖的毫秒数。
    ///
    /// # Returns
    /// 周期长度（毫秒）。
    pub fn millis(self) -> i64 {
        const SECOND: i64 = 1_000;
        const MINUTE: i64 = 60 * SECOND;
        const HOUR: i64 = 60 * MINUTE;
        match self {
            Interval::Second1 => SECOND,
            Interval::Minute1 => MINUTE,
            Interval::Minute3 => 3 * MINUTE,
            Interval::Minute5 => 5 * MINUTE,
            Interval::Minute15 => 15 * MINUTE,
            Interval::Minute30 => 30 * MINUTE,
            Interval::Hour1 => HOUR,
            Interval::Hour2 => 2 * HOUR,
            Interval::Hour4 => 4 * HOUR,
            Interval::Hour6 => 6 * HOUR,
            Interval::Hour8 => 8 * HOUR,
            Interval::Hour12 => 12 * HOUR,
            Interval::Day1 => 24 * HOUR,
        }
    }

    /// 交易所接口使用的周期字符串。
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Second1 => "1s",
            Interval::Minute1 => "1m",
            Interval::Minute3 => "3m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour2 => "2h",
            Interval::Hour4 => "4h",
            Interval::Hour6 => "6h",
            Interval::Hour8 => "8h",
            Interval::Hour12 => "12h",
            Interval::Day1 => "1d",
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1s" => Ok(Interval::Second1),
            "1m" => Ok(Interval::Minute1),
            "3m" => Ok(Interval::Minute3),
            "5m" => Ok(Interval::Minute5),
            "15m" => Ok(Interval::Minute15),
            "30m" => Ok(Interval::Minute30),
            "1h" => Ok(Interval::Hour1),
            "2h" => Ok(Interval::Hour2),
            "4h" => Ok(Interval::Hour4),
            "6h" => Ok(Interval::Hour6),
            "8h" => Ok(Interval::Hour8),
            "12h" => Ok(Interval::Hour12),
            "1d" => Ok(Interval::Day1),
            _ => Err(format!("Unknown Interval: {}", s)),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
