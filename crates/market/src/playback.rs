use async_trait::async_trait;
use dashmap::DashMap;
use klinefeed_core::common::Interval;
use klinefeed_core::feed::error::{BufferError, ServiceError};
use klinefeed_core::feed::port::{CandleSink, KlineFeed, ServiceStatus};
use klinefeed_core::market::entity::Candle;
use klinefeed_core::store::port::{CandleStore, Page};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

/// 单个回放窗口覆盖的开盘时间跨度 (一小时)。
const REPLAY_WINDOW_MS: i64 = 3_600_000;
/// 读取存储时的分页大小。
const QUERY_PAGE_SIZE: u64 = 1000;

/// # Summary
/// 历史回放源：以与实时服务相同的查询面，重放存储中一段固定区间的 K 线。
///
/// # Invariants
/// - 状态恒为 `Running`，不依赖任何网络数据源。
/// - 每个订阅者拥有独立的回放任务，退订即中止对应任务。
/// - 订阅 id 单调递增且永不复用。
pub struct PlaybackFeed {
    symbol: String,
    interval: Interval,
    store: Arc<dyn CandleStore>,
    // 回放区间 (闭区间，毫秒)
    start: i64,
    end: i64,
    // 每根 K 线之间的间隔，为零时不等待
    pace: Duration,
    next_id: AtomicI64,
    replays: Arc<DashMap<i64, AbortHandle>>,
}

impl PlaybackFeed {
    /// # Summary
    /// 创建回放源。
    ///
    /// # Arguments
    /// * `symbol`: 交易对代码。
    /// * `interval`: K 线周期。
    /// * `store`: 历史数据存储。
    /// * `start` / `end`: 回放的开盘时间闭区间。
    /// * `pace`: 每根 K 线之间的等待时间。
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        store: Arc<dyn CandleStore>,
        start: i64,
        end: i64,
        pace: Duration,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            store,
            start,
            end,
            pace,
            next_id: AtomicI64::new(0),
            replays: Arc::new(DashMap::new()),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// 中止全部回放任务。
    pub fn stop(&self) {
        for entry in self.replays.iter() {
            entry.value().abort();
        }
        self.replays.clear();
    }

    /// # Summary
    /// 按小时窗口逐页读取存储并回调订阅者。
    ///
    /// # Logic
    /// 1. 把区间切分为一小时的窗口。
    /// 2. 每个窗口内按页读取，页不满即进入下一个窗口。
    /// 3. 每根 K 线回调后按 `pace` 等待。
    async fn replay(
        store: Arc<dyn CandleStore>,
        sink: Arc<dyn CandleSink>,
        start: i64,
        end: i64,
        pace: Duration,
    ) -> usize {
        let mut replayed = 0;
        let mut window_start = start;
        while window_start <= end {
            let window_end = window_start
                .saturating_add(REPLAY_WINDOW_MS - 1)
                .min(end);
            let mut offset = 0;
            loop {
                let page = Page {
                    offset,
                    size: QUERY_PAGE_SIZE,
                };
                let candles = match store.query_candles(window_start, window_end, Some(page)).await {
                    Ok(candles) => candles,
                    Err(e) => {
                        error!(window_start, window_end, error = %e, "failed to read replay page");
                        return replayed;
                    }
                };
                for candle in &candles {
                    sink.on_candle(candle);
                    replayed += 1;
                    if !pace.is_zero() {
                        tokio::time::sleep(pace).await;
                    }
                }
                let full = u64::try_from(candles.len()).is_ok_and(|n| n >= QUERY_PAGE_SIZE);
                if !full {
                    break;
                }
                offset += QUERY_PAGE_SIZE;
            }
            if window_end == i64::MAX {
                break;
            }
            window_start = window_end + 1;
        }
        replayed
    }

    async fn first_at(&self, offset: u64) -> Result<Option<Candle>, ServiceError> {
        let page = Page { offset, size: 1 };
        let mut candles = self.store.query_candles(self.start, self.end, Some(page)).await?;
        Ok(candles.pop())
    }
}

#[async_trait]
impl KlineFeed for PlaybackFeed {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    /// 回放区间按周期计算的 K 线根数。
    fn length(&self) -> usize {
        if self.end < self.start {
            return 0;
        }
        let span = (self.end - self.start) / self.interval.millis() + 1;
        usize::try_from(span).unwrap_or(usize::MAX)
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus::Running
    }

    async fn head(&self) -> Result<Candle, ServiceError> {
        self.first_at(0).await?.ok_or(BufferError::Empty.into())
    }

    async fn tail(&self) -> Result<Candle, ServiceError> {
        let count = self.store.count_candles(self.start, self.end).await?;
        if count == 0 {
            return Err(BufferError::Empty.into());
        }
        self.first_at(count - 1).await?.ok_or(BufferError::Empty.into())
    }

    async fn size(&self) -> Result<usize, ServiceError> {
        let count = self.store.count_candles(self.start, self.end).await?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    /// # Summary
    /// 注册订阅者并立即开始一次独立的回放。
    ///
    /// # Logic
    /// 回放任务先等待登记完成再开始，保证结束时的自我清理发生在登记之后。
    fn subscribe(&self, sink: Arc<dyn CandleSink>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let store = self.store.clone();
        let replays = self.replays.clone();
        let (start, end, pace) = (self.start, self.end, self.pace);

        let handle = tokio::spawn(async move {
            if registered_rx.await.is_err() {
                debug!(subscriber = id, "replay registration dropped");
            }
            let replayed = Self::replay(store, sink, start, end, pace).await;
            info!(subscriber = id, replayed, "replay finished");
            replays.remove(&id);
        });
        self.replays.insert(id, handle.abort_handle());
        if registered_tx.send(()).is_err() {
            debug!(subscriber = id, "replay task already gone");
        }
        info!(subscriber = id, start, end, "replay started");
        id
    }

    fn subscribe_from_start(&self, sink: Arc<dyn CandleSink>) -> i64 {
        self.subscribe(sink)
    }

    fn unsubscribe(&self, id: i64) -> bool {
        match self.replays.remove(&id) {
            Some((_, handle)) => {
                handle.abort();
                info!(subscriber = id, "replay cancelled");
                true
            }
            None => false,
        }
    }

    fn list_subscribers(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.replays.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// # Summary
    /// 分页读取存储并按周期校验连续性。
    ///
    /// # Logic
    /// 1. 第一根必须位于 `start`，之后每根恰好晚一个周期。
    /// 2. 读取结束时仍未覆盖到 `end`，以第一个缺失的键返回 `NotFound`。
    async fn query(
        &self,
        start: i64,
        end: i64,
        handler: &mut (dyn for<'c> FnMut(&'c Candle) + Send),
    ) -> Result<(), ServiceError> {
        if start > end {
            return Ok(());
        }
        let step = self.interval.millis();
        let mut expected = start;
        let mut offset = 0;
        loop {
            let page = Page {
                offset,
                size: QUERY_PAGE_SIZE,
            };
            let candles = self.store.query_candles(start, end, Some(page)).await?;
            for candle in &candles {
                if candle.open_time != expected {
                    return Err(BufferError::NotFound(expected).into());
                }
                handler(candle);
                expected = expected.saturating_add(step);
            }
            let full = u64::try_from(candles.len()).is_ok_and(|n| n >= QUERY_PAGE_SIZE);
            if !full {
                break;
            }
            offset += QUERY_PAGE_SIZE;
        }
        if expected <= end {
            return Err(BufferError::NotFound(expected).into());
        }
        Ok(())
    }
}
