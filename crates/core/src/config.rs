use crate::common::Interval;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 全局应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: RunMode,
    pub feed: FeedConfig,
    pub playback: PlaybackConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

/// 运行模式：实时窗口或历史回放
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Live,
    Playback,
}

/// # Summary
/// 实时窗口服务配置。
///
/// # Invariants
/// - `length` 为目标窗口长度，回填与淘汰都以它为准。
/// - 所有时间间隔以毫秒配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    // 交易对代码，例如 BTCUSDT
    pub symbol: String,
    // K 线周期
    pub interval: Interval,
    // 目标窗口长度
    pub length: usize,
    // 轮询间隔
    pub poll_interval_ms: u64,
    // 每次轮询请求的最近 K 线根数
    pub poll_limit: usize,
    // 回填单页上限
    pub backfill_page_size: usize,
    // 回填翻页之间的节流延迟
    pub backfill_throttle_ms: u64,
    // 淘汰周期
    pub eviction_interval_ms: u64,
    // 是否启用推送订阅
    pub live_enabled: bool,
    // 推送断线后的重连退避
    pub live_backoff_ms: u64,
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backfill_throttle(&self) -> Duration {
        Duration::from_millis(self.backfill_throttle_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    pub fn live_backoff(&self) -> Duration {
        Duration::from_millis(self.live_backoff_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::Second1,
            length: 3600,
            poll_interval_ms: 1000,
            poll_limit: 5,
            backfill_page_size: 1000,
            backfill_throttle_ms: 200,
            eviction_interval_ms: 1000,
            live_enabled: true,
            live_backoff_ms: 1000,
        }
    }
}

/// 历史回放配置，时间均为毫秒开盘时间
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub start: i64,
    pub end: i64,
    // 相邻两根 K 线之间的推送延迟，0 表示不限速
    pub sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: String,
    // 是否将实时窗口记录到存储中
    pub record: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            record: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    // 默认过滤级别，可被 RUST_LOG 覆盖
    pub level: String,
    // 滚动日志目录，未设置时只输出到终端
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}
