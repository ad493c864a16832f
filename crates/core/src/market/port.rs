use crate::common::Interval;
use crate::market::entity::RawCandle;
use crate::market::error::MarketError;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// # Summary
/// 原始 K 线推送流别名。
///
/// # Invariants
/// - 流结束即表示连接断开 (done)，丢弃流即表示主动停止 (stop)。
/// - `Err` 项代表推送过程中的错误事件，并不一定意味着连接已断开。
pub type RawCandleStream = Pin<Box<dyn Stream<Item = Result<RawCandle, MarketError>> + Send>>;

/// # Summary
/// 历史 K 线请求范围。所有时间均为毫秒，未设置的字段交由数据源决定。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchRange {
    // 起始开盘时间 (包含)
    pub start: Option<i64>,
    // 截止开盘时间 (包含)
    pub end: Option<i64>,
    // 返回条数上限
    pub limit: Option<usize>,
}

impl FetchRange {
    /// 最近 `limit` 根 K 线。
    pub fn latest(limit: usize) -> Self {
        Self {
            start: None,
            end: None,
            limit: Some(limit),
        }
    }

    /// 截止到 `end` (包含) 的最近 `limit` 根 K 线。
    pub fn ending_at(end: i64, limit: usize) -> Self {
        Self {
            start: None,
            end: Some(end),
            limit: Some(limit),
        }
    }
}

/// # Summary
/// 交易所行情能力接口（原始数据源）。
///
/// # Invariants
/// - `fetch_candles` 返回的列表按开盘时间升序排列。
/// - 实现者不负责重连，断线后由调用方按固定退避重新订阅。
#[async_trait]
pub trait KlineProvider: Send + Sync {
    /// # Summary
    /// 获取指定交易对在请求范围内的 K 线。
    ///
    /// # Logic
    /// 1. 按 `range` 构建数据源请求。
    /// 2. 执行网络请求并解析为原始记录。
    ///
    /// # Arguments
    /// * `symbol`: 交易对代码。
    /// * `interval`: K 线周期。
    /// * `range`: 时间范围与条数上限。
    ///
    /// # Returns
    /// 成功返回按时间升序的原始 K 线列表，网络失败返回 `MarketError::Transport`。
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        range: FetchRange,
    ) -> Result<Vec<RawCandle>, MarketError>;

    /// # Summary
    /// 建立实时 K 线推送订阅。
    ///
    /// # Logic
    /// 默认实现表示数据源不支持推送，调用方应仅依赖轮询。
    ///
    /// # Arguments
    /// * `symbol`: 交易对代码。
    /// * `interval`: K 线周期。
    ///
    /// # Returns
    /// 成功返回原始推送流。
    async fn subscribe_live(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<RawCandleStream, MarketError> {
        Err(MarketError::Unsupported(format!(
            "live subscription for {}@{}",
            symbol, interval
        )))
    }
}
