use crate::buffer::TimeIndexedBuffer;
use crate::registry::SubscriptionRegistry;
use klinefeed_core::feed::error::BufferError;
use klinefeed_core::feed::port::{CandleSink, ServiceStatus};
use klinefeed_core::market::entity::{Candle, RawCandle};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, warn};

/// 发布游标尚未播种时的水位值。
pub(crate) const UNSEEDED: i64 = i64::MIN;

/// # Summary
/// 服务状态单元，只允许向前迁移。
///
/// # Invariants
/// - 基于 `watch` 通道，读取无锁竞争，且可以等待目标状态。
pub(crate) struct StatusCell {
    tx: watch::Sender<ServiceStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ServiceStatus::Created);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ServiceStatus {
        *self.tx.borrow()
    }

    /// # Summary
    /// 尝试迁移到 `to`。
    ///
    /// # Returns
    /// 只有 `to` 严格晚于当前状态时才会迁移并返回 true。
    pub(crate) fn advance(&self, to: ServiceStatus) -> bool {
        self.tx.send_if_modified(|cur| {
            if to > *cur {
                *cur = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.tx.subscribe()
    }
}

/// # Summary
/// 单交易对窗口的共享状态，被所有后台任务以 `Arc` 持有。
///
/// # Invariants
/// - 缓冲区的一切修改都经过同一把互斥锁，锁只在单次结构操作期间持有，从不跨越 `.await`。
/// - `delivered` 是发布游标的只读镜像，只由发布任务写入。
/// - `publish_gate` 串行化 "发布一根 K 线" 与 "回放并注册"，保证拼接点不丢不重。
pub(crate) struct Window {
    buffer: Mutex<TimeIndexedBuffer<Candle>>,
    pub(crate) registry: SubscriptionRegistry,
    // 合并型新数据信号：多次通知在被消费前只保留一个许可
    new_data: Notify,
    pub(crate) status: StatusCell,
    delivered: AtomicI64,
    publish_gate: Mutex<()>,
    live_failures: AtomicU64,
}

impl Window {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(TimeIndexedBuffer::with_capacity(capacity)),
            registry: SubscriptionRegistry::new(),
            new_data: Notify::new(),
            status: StatusCell::new(),
            delivered: AtomicI64::new(UNSEEDED),
            publish_gate: Mutex::new(()),
            live_failures: AtomicU64::new(0),
        })
    }

    pub(crate) fn buffer(&self) -> MutexGuard<'_, TimeIndexedBuffer<Candle>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn gate(&self) -> MutexGuard<'_, ()> {
        self.publish_gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// # Summary
    /// 在尾部追加一根 K 线。
    ///
    /// # Logic
    /// 1. 键已存在返回 `DuplicateKey`。
    /// 2. 键早于当前尾部返回 `OutOfOrder`，避免破坏链的升序。
    /// 3. 否则 `push_back`。
    pub(crate) fn append(&self, candle: Candle) -> Result<(), BufferError> {
        let mut buffer = self.buffer();
        let key = candle.open_time;
        if buffer.contains(key) {
            return Err(BufferError::DuplicateKey(key));
        }
        if let Ok(tail) = buffer.tail()
            && key < tail.open_time
        {
            return Err(BufferError::OutOfOrder {
                key,
                bound: tail.open_time,
            });
        }
        buffer.push_back(key, candle)
    }

    /// 在头部前插一根 K 线，键必须早于当前头部。
    pub(crate) fn prepend(&self, candle: Candle) -> Result<(), BufferError> {
        let mut buffer = self.buffer();
        let key = candle.open_time;
        if buffer.contains(key) {
            return Err(BufferError::DuplicateKey(key));
        }
        if let Ok(head) = buffer.head()
            && key > head.open_time
        {
            return Err(BufferError::OutOfOrder {
                key,
                bound: head.open_time,
            });
        }
        buffer.push_front(key, candle)
    }

    /// 通知发布任务有新数据。
    pub(crate) fn notify_new_data(&self) {
        self.new_data.notify_one();
    }

    pub(crate) async fn new_data(&self) {
        self.new_data.notified().await
    }

    pub(crate) fn delivered(&self) -> i64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub(crate) fn set_delivered(&self, key: i64) {
        self.delivered.store(key, Ordering::Release);
    }

    pub(crate) fn record_live_failure(&self) -> u64 {
        self.live_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn live_failures(&self) -> u64 {
        self.live_failures.load(Ordering::Relaxed)
    }

    /// # Summary
    /// 将一根 K 线交给一个订阅者，隔离订阅者的 panic。
    ///
    /// # Returns
    /// 订阅者 panic 时返回 false。
    fn invoke(id: i64, sink: &dyn CandleSink, candle: &Candle) -> bool {
        match catch_unwind(AssertUnwindSafe(|| sink.on_candle(candle))) {
            Ok(()) => true,
            Err(_) => {
                error!(subscriber = id, key = candle.open_time, "subscriber panicked, removing it");
                false
            }
        }
    }

    /// # Summary
    /// 将一根 K 线投递给当前全部订阅者。
    ///
    /// # Logic
    /// 1. 取注册表快照，回调期间不持有注册表锁。
    /// 2. 逐个回调；panic 的订阅者被移除。
    pub(crate) fn deliver(&self, candle: &Candle) {
        for (id, sink) in self.registry.snapshot() {
            if !Self::invoke(id, sink.as_ref(), candle) {
                self.registry.unsubscribe(id);
            }
        }
    }

    /// # Summary
    /// 回放窗口中已发布的 K 线后注册订阅者。
    ///
    /// # Logic
    /// 1. 获取发布闸门，期间发布任务无法推进游标。
    /// 2. 收集从头部到已发布水位 (含) 的全部 K 线并逐根回调。
    /// 3. 注册订阅者后释放闸门，下一根由发布任务实时推送。
    ///
    /// # Arguments
    /// * `sink`: 订阅者能力。不能在订阅者回调内部调用本方法。
    ///
    /// # Returns
    /// 新分配的订阅 id。
    pub(crate) fn subscribe_from_start(&self, sink: Arc<dyn CandleSink>) -> i64 {
        let _gate = self.gate();
        let watermark = self.delivered();
        if watermark != UNSEEDED {
            let history: Vec<Candle> = self
                .buffer()
                .iter()
                .take_while(|(key, _)| *key <= watermark)
                .map(|(_, candle)| *candle)
                .collect();
            debug!(count = history.len(), watermark, "replaying window to new subscriber");
            for candle in &history {
                sink.on_candle(candle);
            }
        }
        self.registry.subscribe(sink)
    }
}

/// # Summary
/// 转换并追加一批原始 K 线，供轮询与推送两个生产者共用。
///
/// # Logic
/// 1. 未收盘的 K 线跳过。
/// 2. 转换失败只丢弃该根并记录日志。
/// 3. `DuplicateKey` 与 `OutOfOrder` 属于生产者重叠的正常现象，静默吸收。
///
/// # Arguments
/// * `window`: 共享窗口。
/// * `raws`: 按时间升序的原始记录。
/// * `source`: 生产者名称，用于日志。
///
/// # Returns
/// 成功插入的根数。
pub(crate) fn ingest_latest(window: &Window, raws: &[RawCandle], source: &'static str) -> usize {
    let mut inserted = 0;
    for raw in raws {
        if !raw.is_final {
            continue;
        }
        let candle = match Candle::try_from(raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(source, key = raw.open_time, error = %e, "dropping malformed candle");
                continue;
            }
        };
        match window.append(candle) {
            Ok(()) => {
                debug!(source, key = candle.open_time, "candle appended");
                inserted += 1;
            }
            Err(BufferError::DuplicateKey(_)) | Err(BufferError::OutOfOrder { .. }) => {}
            Err(e) => warn!(source, key = candle.open_time, error = %e, "append failed"),
        }
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(open_time: i64, is_final: bool) -> RawCandle {
        RawCandle {
            open_time,
            open: "1.0".into(),
            high: "2.0".into(),
            low: "0.5".into(),
            close: "1.5".into(),
            volume: "10".into(),
            close_time: open_time + 999,
            quote_asset_volume: "15".into(),
            trade_count: 3,
            taker_buy_base_volume: "4".into(),
            taker_buy_quote_volume: "6".into(),
            is_final,
        }
    }

    #[test]
    fn test_status_only_moves_forward() {
        let status = StatusCell::new();
        assert_eq!(status.get(), ServiceStatus::Created);
        assert!(status.advance(ServiceStatus::Initializing));
        assert!(status.advance(ServiceStatus::Running));
        assert!(!status.advance(ServiceStatus::Initializing));
        assert!(status.advance(ServiceStatus::Error));
        assert!(!status.advance(ServiceStatus::Running));
        assert_eq!(status.get(), ServiceStatus::Error);
    }

    #[test]
    fn test_ingest_skips_duplicates_stale_and_malformed() {
        let window = Window::new(8);
        let batch = vec![raw(1000, true), raw(2000, true), raw(3000, false)];
        assert_eq!(ingest_latest(&window, &batch, "test"), 2);

        let mut bad = raw(4000, true);
        bad.close = "oops".into();
        let overlap = vec![raw(2000, true), raw(1500, true), bad, raw(5000, true)];
        assert_eq!(ingest_latest(&window, &overlap, "test"), 1);
        assert_eq!(window.buffer().keys(), vec![1000, 2000, 5000]);
    }

    #[test]
    fn test_prepend_rejects_newer_than_head() {
        let window = Window::new(8);
        let candle = |k| Candle::try_from(&raw(k, true)).unwrap();
        window.append(candle(5000)).unwrap();
        window.prepend(candle(4000)).unwrap();
        assert_eq!(
            window.prepend(candle(6000)),
            Err(BufferError::OutOfOrder { key: 6000, bound: 4000 })
        );
        assert_eq!(window.prepend(candle(5000)), Err(BufferError::DuplicateKey(5000)));
    }

    #[test]
    fn test_panicking_subscriber_is_removed() {
        let window = Window::new(1);
        let good = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = good.clone();
        window.registry.subscribe(Arc::new(|c: &Candle| {
            if c.open_time > 0 {
                panic!("boom");
            }
        }));
        window.registry.subscribe(Arc::new(move |_: &Candle| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let candle = Candle::try_from(&raw(1000, true)).unwrap();
        window.deliver(&candle);
        window.deliver(&candle);
        assert_eq!(good.load(Ordering::SeqCst), 2);
        assert_eq!(window.registry.len(), 1);
    }
}
