use crate::window::{Window, ingest_latest};
use futures::StreamExt;
use klinefeed_core::common::Interval;
use klinefeed_core::feed::error::{BufferError, TaskFailure};
use klinefeed_core::market::entity::Candle;
use klinefeed_core::market::error::MarketError;
use klinefeed_core::market::port::{FetchRange, KlineProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 交易所单次历史请求的条数上限。
const MAX_PAGE_SIZE: usize = 1000;

/// 交易对与周期，所有生产者共用。
#[derive(Clone)]
pub(crate) struct Source {
    pub(crate) symbol: String,
    pub(crate) interval: Interval,
    pub(crate) provider: Arc<dyn KlineProvider>,
}

/// # Summary
/// 轮询生产者：按固定节拍请求最近 N 根 K 线并追加到尾部。
///
/// # Invariants
/// - 网络失败只记录日志，等待下一个节拍重试，从不终止任务。
pub(crate) struct Poller {
    pub(crate) source: Source,
    pub(crate) window: Arc<Window>,
    pub(crate) period: Duration,
    pub(crate) limit: usize,
    pub(crate) shutdown: CancellationToken,
}

impl Poller {
    /// # Summary
    /// 启动轮询循环。
    ///
    /// # Logic
    /// 1. 每个节拍请求最近 `limit` 根 K 线。
    /// 2. 转换并追加，重复键静默吸收。
    /// 3. 有新插入时通知发布任务。
    ///
    /// # Returns
    /// 只在收到停机信号后返回 Ok。
    pub(crate) async fn run(self) -> Result<(), TaskFailure> {
        info!(symbol = %self.source.symbol, interval = %self.source.interval, "poller started");
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = self.source.provider.fetch_candles(
                    &self.source.symbol,
                    self.source.interval,
                    FetchRange::latest(self.limit),
                ) => r,
            };

            let raws = match fetched {
                Ok(raws) => raws,
                Err(e) => {
                    warn!(error = %e, "failed to poll latest candles");
                    continue;
                }
            };

            if ingest_latest(&self.window, &raws, "poller") > 0 {
                self.window.notify_new_data();
            }
        }

        info!("poller stopped");
        Ok(())
    }
}

/// # Summary
/// 回填生产者：启动时一次性地向前补齐窗口到目标长度。
///
/// # Invariants
/// - 只在发布游标播种之后运行，窗口非空，前插的数据永不发布。
/// - 只通过 `prepend` 插入，键严格早于当前头部。
/// - 翻页之间固定节流，尊重上游限频。
pub(crate) struct Backfill {
    pub(crate) source: Source,
    pub(crate) window: Arc<Window>,
    pub(crate) target: usize,
    pub(crate) page_size: usize,
    pub(crate) throttle: Duration,
    pub(crate) done: Option<oneshot::Sender<usize>>,
    pub(crate) shutdown: CancellationToken,
}

impl Backfill {
    /// # Summary
    /// 执行回填。
    ///
    /// # Logic
    /// 1. 读取当前长度与头部键，长度达到目标即结束。
    /// 2. 请求截止到头部之前的一页历史数据 (条数不超过仍需的数量)。
    /// 3. 从新到旧逐根 `prepend`。
    /// 4. 网络失败在节流后重试；空页或整页无新数据说明上游已无更早的历史，提前结束。
    /// 5. 通过一次性通道发出完成信号，携带最终长度。
    ///
    /// # Returns
    /// 窗口在回填前为空时返回 TaskFailure。
    pub(crate) async fn run(mut self) -> Result<(), TaskFailure> {
        info!(target = self.target, "backfill started");
        loop {
            let (len, head_key) = {
                let buffer = self.window.buffer();
                (buffer.len(), buffer.head().map(|c| c.open_time))
            };
            if len >= self.target {
                break;
            }
            let head_key = head_key.map_err(|_| TaskFailure {
                task: "backfill",
                reason: "window is empty, nothing to backfill from".to_string(),
            })?;

            let limit = (self.target - len).min(self.page_size).min(MAX_PAGE_SIZE);
            let range = FetchRange::ending_at(head_key - 1, limit);
            let fetched = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                r = self.source.provider.fetch_candles(&self.source.symbol, self.source.interval, range) => r,
            };

            match fetched {
                Ok(raws) if raws.is_empty() => {
                    warn!(len, head_key, "upstream has no older history, backfill stops early");
                    break;
                }
                Ok(raws) => {
                    let inserted = self.prepend_page(&raws);
                    debug!(inserted, len = len + inserted, "backfill page inserted");
                    if inserted == 0 {
                        warn!(head_key, "backfill page contained no older candles, stopping");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to fetch backfill page, retrying"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.throttle) => {}
            }
        }

        let len = self.window.buffer().len();
        info!(len, "backfill complete");
        if let Some(done) = self.done.take()
            && done.send(len).is_err()
        {
            debug!("backfill completion receiver already dropped");
        }
        Ok(())
    }

    /// 从新到旧逐根前插一页升序数据，返回插入根数。
    fn prepend_page(&self, raws: &[klinefeed_core::market::entity::RawCandle]) -> usize {
        let mut inserted = 0;
        for raw in raws.iter().rev() {
            if !raw.is_final {
                continue;
            }
            let candle = match Candle::try_from(raw) {
                Ok(c) => c,
                Err(e) => {
                    warn!(key = raw.open_time, error = %e, "dropping malformed historical candle");
                    continue;
                }
            };
            match self.window.prepend(candle) {
                Ok(()) => inserted += 1,
                Err(BufferError::DuplicateKey(_)) | Err(BufferError::OutOfOrder { .. }) => {}
                Err(e) => warn!(key = candle.open_time, error = %e, "prepend failed"),
            }
        }
        inserted
    }
}

/// # Summary
/// 推送生产者：维持一条实时订阅，断线后固定退避重连。
///
/// # Invariants
/// - 任何错误都不会终止任务，只计入失败事件。
/// - 数据源不支持推送时正常退出，窗口只依赖轮询。
pub(crate) struct LiveFeed {
    pub(crate) source: Source,
    pub(crate) window: Arc<Window>,
    pub(crate) backoff: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl LiveFeed {
    /// # Summary
    /// 启动订阅与重连循环。
    ///
    /// # Logic
    /// 1. 建立订阅；失败则记录失败事件并退避。
    /// 2. 逐条消费推送：`Ok` 转换并追加，`Err` 记录失败事件。
    /// 3. 流结束视为断线，退避后重连。
    ///
    /// # Returns
    /// 收到停机信号或数据源不支持推送时返回 Ok。
    pub(crate) async fn run(self) -> Result<(), TaskFailure> {
        info!(symbol = %self.source.symbol, "live feed started");
        loop {
            let subscribed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = self.source.provider.subscribe_live(&self.source.symbol, self.source.interval) => r,
            };

            match subscribed {
                Err(MarketError::Unsupported(what)) => {
                    info!(what, "provider has no push delivery, relying on polling");
                    return Ok(());
                }
                Err(e) => {
                    let failures = self.window.record_live_failure();
                    warn!(error = %e, failures, "live subscription failed");
                }
                Ok(mut stream) => {
                    info!("live feed connected");
                    loop {
                        let item = tokio::select! {
                            _ = self.shutdown.cancelled() => {
                                info!("live feed stopped");
                                return Ok(());
                            }
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(raw)) => {
                                if ingest_latest(&self.window, std::slice::from_ref(&raw), "live") > 0 {
                                    self.window.notify_new_data();
                                }
                            }
                            Some(Err(e)) => {
                                let failures = self.window.record_live_failure();
                                warn!(error = %e, failures, "live feed error event");
                            }
                            None => {
                                warn!("live feed disconnected, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        info!("live feed stopped");
        Ok(())
    }
}
