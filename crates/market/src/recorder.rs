use klinefeed_core::feed::port::CandleSink;
use klinefeed_core::market::entity::Candle;
use klinefeed_core::store::port::CandleStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// # Summary
/// 把实时窗口发布的 K 线写入历史存储的订阅者，供日后回放。
///
/// # Invariants
/// - 回调只做一次无阻塞的通道发送，落盘在后台任务中批量进行。
/// - 停机时先写完缓冲中的剩余数据再退出。
#[derive(Clone)]
pub struct StoreRecorder {
    tx: mpsc::UnboundedSender<Candle>,
}

impl StoreRecorder {
    /// # Summary
    /// 创建记录器并启动后台写入任务。
    ///
    /// # Arguments
    /// * `store`: 目标存储。
    /// * `batch_size`: 攒满多少根立即写入。
    /// * `flush_every`: 未攒满时的定时写入周期。
    /// * `shutdown`: 停机信号。
    ///
    /// # Returns
    /// (记录器, 后台任务句柄)。
    pub fn spawn(
        store: Arc<dyn CandleStore>,
        batch_size: usize,
        flush_every: Duration,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::persist(store, rx, batch_size.max(1), flush_every, shutdown));
        (Self { tx }, handle)
    }

    async fn persist(
        store: Arc<dyn CandleStore>,
        mut rx: mpsc::UnboundedReceiver<Candle>,
        batch_size: usize,
        flush_every: Duration,
        shutdown: CancellationToken,
    ) {
        info!(batch_size, "store recorder started");
        let mut batch = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => Self::flush(store.as_ref(), &mut batch).await,
                candle = rx.recv() => match candle {
                    Some(candle) => {
                        batch.push(candle);
                        if batch.len() >= batch_size {
                            Self::flush(store.as_ref(), &mut batch).await;
                        }
                    }
                    None => break,
                },
            }
        }
        while let Ok(candle) = rx.try_recv() {
            batch.push(candle);
        }
        Self::flush(store.as_ref(), &mut batch).await;
        info!("store recorder stopped");
    }

    async fn flush(store: &dyn CandleStore, batch: &mut Vec<Candle>) {
        if batch.is_empty() {
            return;
        }
        match store.save_candles(batch.as_slice()).await {
            Ok(()) => debug!(count = batch.len(), "recorded candles"),
            Err(e) => error!(count = batch.len(), error = %e, "failed to record candles"),
        }
        batch.clear();
    }
}

impl CandleSink for StoreRecorder {
    fn on_candle(&self, candle: &Candle) {
        if self.tx.send(*candle).is_err() {
            trace!(key = candle.open_time, "store recorder already stopped");
        }
    }
}
