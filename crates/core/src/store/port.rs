use super::error::StoreError;
use crate::market::entity::Candle;
use async_trait::async_trait;

/// # Summary
/// 分页参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    // 跳过的记录数
    pub offset: u64,
    // 单页记录数
    pub size: u64,
}

/// # Summary
/// 历史 K 线存储接口，为回放提供数据，也用于记录实时窗口。
///
/// # Invariants
/// - 单个存储实例只对应一个交易对与周期。
/// - 以开盘时间为主键，重复写入覆盖旧值。
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// # Summary
    /// 批量保存 K 线数据。
    ///
    /// # Logic
    /// 1. 以开盘时间为主键批量写入。
    /// 2. 已存在的记录被覆盖。
    ///
    /// # Arguments
    /// * `candles`: 待保存的数据列表。
    ///
    /// # Returns
    /// 成功返回 Ok，失败返回 `StoreError`。
    async fn save_candles(&self, candles: &[Candle]) -> Result<(), StoreError>;

    /// # Summary
    /// 按开盘时间闭区间查询 K 线。
    ///
    /// # Logic
    /// 1. 筛选 `start <= open_time <= end` 的记录，按开盘时间升序。
    /// 2. 若提供分页参数，则只返回对应页。
    ///
    /// # Arguments
    /// * `start`: 起始开盘时间 (毫秒)。
    /// * `end`: 截止开盘时间 (毫秒)。
    /// * `page`: 可选分页。
    ///
    /// # Returns
    /// 升序的 K 线列表。
    async fn query_candles(
        &self,
        start: i64,
        end: i64,
        page: Option<Page>,
    ) -> Result<Vec<Candle>, StoreError>;

    /// 统计闭区间内的记录数。
    async fn count_candles(&self, start: i64, end: i64) -> Result<u64, StoreError>;
}
