use crate::buffer::TimeIndexedBuffer;
use crate::window::Window;
use klinefeed_core::feed::error::{BufferError, TaskFailure};
use klinefeed_core::market::entity::Candle;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// # Summary
/// 发布任务：持有唯一的前向游标，把窗口中的新 K 线按链顺序推送给订阅者。
///
/// # Invariants
/// - 订阅者观察到的序列严格递增、链上相邻且不重复，与插入来自哪个生产者无关。
/// - 缓冲区锁只在单次 `next`/`get` 期间持有，回调订阅者时不持有。
/// - 游标只由本任务推进，并镜像到窗口的已发布水位。
/// - 游标第一次落定时发出一次性播种信号，携带种子键。
pub(crate) struct Publisher {
    pub(crate) window: Arc<Window>,
    pub(crate) shutdown: CancellationToken,
    // 最近一次发布的键，None 表示尚未播种
    cursor: Option<i64>,
    // 播种通知，发出后置空
    seeded: Option<oneshot::Sender<i64>>,
}

impl Publisher {
    pub(crate) fn new(window: Arc<Window>, shutdown: CancellationToken) -> Self {
        Self {
            window,
            shutdown,
            cursor: None,
            seeded: None,
        }
    }

    /// 在游标第一次落定时通过 `tx` 发出种子键。
    pub(crate) fn on_seed(mut self, tx: oneshot::Sender<i64>) -> Self {
        self.seeded = Some(tx);
        self
    }

    /// # Summary
    /// 等待新数据信号并排空窗口，直到收到停机信号。
    pub(crate) async fn run(mut self) -> Result<(), TaskFailure> {
        info!("publisher started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.window.new_data() => {}
            }
            let published = self.drain();
            if published > 0 {
                debug!(published, cursor = ?self.cursor, "published new candles");
            }
        }
        info!("publisher stopped");
        Ok(())
    }

    /// # Summary
    /// 从游标开始逐根推送，直到到达尾部。
    ///
    /// # Logic
    /// 1. 每一步先获取发布闸门，与 "回放并注册" 互斥。
    /// 2. 短暂加锁取出下一根 K 线后立即释放缓冲区锁。
    /// 3. 投递给全部订阅者，再推进游标与已发布水位。
    /// 4. 首次推进游标时发出播种信号。
    ///
    /// # Returns
    /// 本轮推送的根数。
    pub(crate) fn drain(&mut self) -> usize {
        let mut published = 0;
        loop {
            let _gate = self.window.gate();
            let candle = {
                let buffer = self.window.buffer();
                self.next_candle(&buffer)
            };
            let Some(candle) = candle else {
                break;
            };
            self.window.deliver(&candle);
            self.cursor = Some(candle.open_time);
            self.window.set_delivered(candle.open_time);
            if let Some(tx) = self.seeded.take() {
                debug!(seed = candle.open_time, "publisher seeded");
                if tx.send(candle.open_time).is_err() {
                    debug!("seed receiver already dropped");
                }
            }
            published += 1;
        }
        published
    }

    /// # Summary
    /// 计算游标之后应发布的 K 线。
    ///
    /// # Logic
    /// 1. 未播种时以头部为种子，种子本身也会被发布。
    /// 2. 已播种时取链上的下一个键；位于尾部则返回 None。
    /// 3. 游标所在的键已不存在时，改用第一个晚于游标的键重新播种。
    fn next_candle(&self, buffer: &TimeIndexedBuffer<Candle>) -> Option<Candle> {
        let Some(cursor) = self.cursor else {
            return buffer.head().ok().copied();
        };
        match buffer.next(cursor) {
            Ok(key) => buffer.get(key).ok().copied(),
            Err(BufferError::NoNeighbor(_)) => None,
            Err(e) => {
                let reseed = buffer
                    .iter()
                    .find(|(key, _)| *key > cursor)
                    .map(|(_, candle)| *candle);
                warn!(
                    cursor,
                    error = %e,
                    reseed = ?reseed.map(|c| c.open_time),
                    "publisher cursor vanished, reseeding"
                );
                reseed
            }
        }
    }
}
