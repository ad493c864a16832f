use async_trait::async_trait;
use klinefeed_core::common::Interval;
use klinefeed_core::config::FeedConfig;
use klinefeed_core::feed::error::{BufferError, ServiceError};
use klinefeed_core::feed::port::{ChannelSink, KlineFeed, ServiceStatus};
use klinefeed_core::market::entity::{Candle, RawCandle};
use klinefeed_core::market::error::MarketError;
use klinefeed_core::market::port::{FetchRange, KlineProvider, RawCandleStream};
use klinefeed_market::service::KlineService;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const STEP: i64 = 1000;

fn raw(open_time: i64, is_final: bool) -> RawCandle {
    RawCandle {
        open_time,
        open: "100.0".into(),
        high: "101.0".into(),
        low: "99.0".into(),
        close: "100.5".into(),
        volume: "3.5".into(),
        close_time: open_time + STEP - 1,
        quote_asset_volume: "351.75".into(),
        trade_count: 12,
        taker_buy_base_volume: "1.5".into(),
        taker_buy_quote_volume: "150.75".into(),
        is_final,
    }
}

/// # Summary
/// 为测试提供的模拟行情驱动。
///
/// # Logic
/// 历史数据是 `[earliest, latest]` 之间每秒一根的连续序列，`latest` 可在测试中推进。
struct MockProvider {
    // 最新一根已收盘 K 线的开盘时间
    latest: AtomicI64,
    // 上游可提供的最早开盘时间
    earliest: i64,
    // 推送通道，None 表示不支持推送
    live: Option<Mutex<Option<mpsc::UnboundedReceiver<Result<RawCandle, MarketError>>>>>,
    // 回填请求时 panic，用于模拟任务崩溃
    panic_on_backfill: bool,
}

impl MockProvider {
    fn new(earliest: i64, latest: i64) -> Self {
        Self {
            latest: AtomicI64::new(latest),
            earliest,
            live: None,
            panic_on_backfill: false,
        }
    }

    fn with_live(mut self) -> (Self, mpsc::UnboundedSender<Result<RawCandle, MarketError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.live = Some(Mutex::new(Some(rx)));
        (self, tx)
    }

    fn advance_to(&self, latest: i64) {
        self.latest.store(latest, Ordering::SeqCst);
    }
}

#[async_trait]
impl KlineProvider for MockProvider {
    async fn fetch_candles(
        &self,
        _: &str,
        _: Interval,
        range: FetchRange,
    ) -> Result<Vec<RawCandle>, MarketError> {
        if range.end.is_some() && self.panic_on_backfill {
            panic!("history endpoint exploded");
        }
        let latest = self.latest.load(Ordering::SeqCst);
        let top = range.end.map_or(latest, |end| end.min(latest));
        let top = top - (top - self.earliest).rem_euclid(STEP);
        if top < self.earliest {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(range.limit.unwrap_or(500)).unwrap();
        let first = (top - (limit - 1) * STEP).max(self.earliest);
        Ok((first..=top)
            .step_by(1000)
            .map(|k| raw(k, true))
            .collect())
    }

    async fn subscribe_live(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<RawCandleStream, MarketError> {
        let Some(live) = &self.live else {
            return Err(MarketError::Unsupported(format!("{}@{}", symbol, interval)));
        };
        let Some(mut rx) = live.lock().unwrap().take() else {
            return Err(MarketError::Transport("connection refused".into()));
        };
        let s = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(s))
    }
}

fn config(length: usize) -> FeedConfig {
    FeedConfig {
        symbol: "BTCUSDT".into(),
        interval: Interval::Second1,
        length,
        poll_interval_ms: 1000,
        poll_limit: 5,
        backfill_page_size: 20,
        backfill_throttle_ms: 10,
        eviction_interval_ms: 500,
        live_enabled: true,
        live_backoff_ms: 1000,
    }
}

async fn recv_keys(rx: &mut mpsc::UnboundedReceiver<Candle>, count: usize) -> Vec<i64> {
    let mut keys = Vec::with_capacity(count);
    while keys.len() < count {
        let candle = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for candle")
            .expect("channel closed");
        keys.push(candle.open_time);
    }
    keys
}

fn assert_contiguous(keys: &[i64]) {
    assert!(
        keys.windows(2).all(|w| w[1] - w[0] == STEP),
        "sequence has gaps or duplicates: {:?}",
        keys
    );
}

#[tokio::test(start_paused = true)]
async fn test_startup_reaches_running_with_full_window() {
    let provider = Arc::new(MockProvider::new(0, 100 * STEP));
    let service = KlineService::new(config(50), provider);
    assert_eq!(service.status(), ServiceStatus::Created);

    service.run().unwrap();
    assert!(matches!(service.run(), Err(ServiceError::AlreadyStarted)));

    let status = service.wait_for_status(ServiceStatus::Running).await;
    assert_eq!(status, ServiceStatus::Running);
    assert_eq!(service.size().await.unwrap(), 50);
    assert_eq!(service.head().await.unwrap().open_time, 51 * STEP);
    assert_eq!(service.tail().await.unwrap().open_time, 100 * STEP);

    let mut visited = Vec::new();
    service
        .query(51 * STEP, 100 * STEP, &mut |c: &Candle| visited.push(c.open_time))
        .await
        .unwrap();
    assert_eq!(visited.len(), 50);
    assert_contiguous(&visited);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backfill_stops_early_when_history_runs_out() {
    let provider = Arc::new(MockProvider::new(90 * STEP, 100 * STEP));
    let service = KlineService::new(config(50), provider);
    service.run().unwrap();

    assert_eq!(
        service.wait_for_status(ServiceStatus::Running).await,
        ServiceStatus::Running
    );
    assert_eq!(service.size().await.unwrap(), 11);
    assert_eq!(service.head().await.unwrap().open_time, 90 * STEP);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_see_gap_free_sequence_under_interleaved_inserts() {
    let (provider, live) = MockProvider::new(0, 100 * STEP).with_live();
    let provider = Arc::new(provider);
    let service = KlineService::new(config(30), provider.clone());
    service.run().unwrap();
    service.wait_for_status(ServiceStatus::Running).await;

    let (sink, mut rx) = ChannelSink::channel();
    let id = service.subscribe(Arc::new(sink));
    assert_eq!(service.list_subscribers(), vec![id]);

    // 推送与轮询交错插入同一段数据
    live.send(Ok(raw(101 * STEP, true))).unwrap();
    live.send(Ok(raw(102 * STEP, false))).unwrap();
    live.send(Ok(raw(102 * STEP, true))).unwrap();
    live.send(Err(MarketError::Parse("garbled frame".into()))).unwrap();
    live.send(Ok(raw(103 * STEP, true))).unwrap();
    provider.advance_to(105 * STEP);

    let mut keys = recv_keys(&mut rx, 5).await;
    live.send(Ok(raw(104 * STEP, true))).unwrap();
    live.send(Ok(raw(106 * STEP, true))).unwrap();
    keys.extend(recv_keys(&mut rx, 1).await);
    assert_eq!(keys, (101..=106).map(|k| k * STEP).collect::<Vec<_>>());
    assert!(service.live_failures() >= 1);

    assert!(service.unsubscribe(id));
    assert!(!service.unsubscribe(id));
    assert!(service.list_subscribers().is_empty());
    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_query_gap_returns_not_found() {
    let provider = Arc::new(MockProvider::new(0, 100 * STEP));
    let mut cfg = config(20);
    cfg.live_enabled = false;
    let service = KlineService::new(cfg, provider);
    service.run().unwrap();
    service.wait_for_status(ServiceStatus::Running).await;

    let tail = service.tail().await.unwrap().open_time;

    let err = service
        .query(tail + STEP, tail + 5 * STEP, &mut |_: &Candle| {})
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Buffer(BufferError::NotFound(k)) if k == tail + STEP));

    // 途经的 K 线已回调，不回滚
    let mut visited = 0;
    let err = service
        .query(tail - 2 * STEP, tail + 3 * STEP, &mut |_: &Candle| visited += 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Buffer(BufferError::NotFound(k)) if k == tail + STEP));
    assert_eq!(visited, 3);

    let mut none = 0;
    service
        .query(tail, tail - STEP, &mut |_: &Candle| none += 1)
        .await
        .unwrap();
    assert_eq!(none, 0);

    assert_eq!(service.get(tail).unwrap().open_time, tail);
    assert!(service.get(tail + 7).is_err());
    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_from_start_replays_then_goes_live() {
    let provider = Arc::new(MockProvider::new(0, 100 * STEP));
    let mut cfg = config(30);
    cfg.live_enabled = false;
    let service = KlineService::new(cfg, provider.clone());
    service.run().unwrap();
    service.wait_for_status(ServiceStatus::Running).await;
    // 让发布任务追上种子
    tokio::time::sleep(Duration::from_millis(100)).await;

    let head = service.head().await.unwrap().open_time;
    let (sink, mut rx) = ChannelSink::channel();
    service.subscribe_from_start(Arc::new(sink));

    let mut replayed = Vec::new();
    while let Ok(candle) = rx.try_recv() {
        replayed.push(candle.open_time);
    }
    assert_eq!(replayed.first(), Some(&head));
    assert_eq!(replayed.last(), Some(&(100 * STEP)));
    assert_contiguous(&replayed);

    provider.advance_to(103 * STEP);
    let live = recv_keys(&mut rx, 3).await;
    assert_eq!(live, vec![101 * STEP, 102 * STEP, 103 * STEP]);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_eviction_keeps_window_at_target_length() {
    let provider = Arc::new(MockProvider::new(0, 100 * STEP));
    let mut cfg = config(10);
    cfg.live_enabled = false;
    let service = KlineService::new(cfg, provider.clone());
    service.run().unwrap();
    service.wait_for_status(ServiceStatus::Running).await;

    provider.advance_to(104 * STEP);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(service.size().await.unwrap(), 10);
    assert_eq!(service.tail().await.unwrap().open_time, 104 * STEP);
    assert_eq!(service.head().await.unwrap().open_time, 95 * STEP);
    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_early_subscriber_never_sees_backfilled_history() {
    let provider = Arc::new(MockProvider::new(0, 100 * STEP));
    let mut cfg = config(40);
    cfg.live_enabled = false;
    let service = KlineService::new(cfg, provider.clone());

    let (sink, mut rx) = ChannelSink::channel();
    service.subscribe(Arc::new(sink));
    service.run().unwrap();
    service.wait_for_status(ServiceStatus::Running).await;
    assert_eq!(service.head().await.unwrap().open_time, 61 * STEP);

    provider.advance_to(102 * STEP);
    let keys = recv_keys(&mut rx, 7).await;
    // 种子是轮询的第一批数据，回填的历史不会推送
    assert_eq!(keys, (96..=102).map(|k| k * STEP).collect::<Vec<_>>());

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_task_failure_moves_status_to_error_and_window_stays_bounded() {
    let mut provider = MockProvider::new(0, 100 * STEP);
    provider.panic_on_backfill = true;
    let provider = Arc::new(provider);
    let mut cfg = config(10);
    cfg.live_enabled = false;
    let service = KlineService::new(cfg, provider.clone());
    service.run().unwrap();

    assert_eq!(
        service.wait_for_status(ServiceStatus::Error).await,
        ServiceStatus::Error
    );

    // 回填崩溃后轮询继续，淘汰任务仍把窗口约束在目标长度
    for k in 101..=130 {
        provider.advance_to(k * STEP);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(service.tail().await.unwrap().open_time, 130 * STEP);
    assert_eq!(service.size().await.unwrap(), 10);
    assert_eq!(service.head().await.unwrap().open_time, 121 * STEP);
    assert_eq!(service.status(), ServiceStatus::Error);

    service.shutdown().await;
}
