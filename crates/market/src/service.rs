use crate::eviction::Evictor;
use crate::pipeline::{Backfill, LiveFeed, Poller, Source};
use crate::publisher::Publisher;
use crate::window::Window;
use async_trait::async_trait;
use klinefeed_core::common::Interval;
use klinefeed_core::config::FeedConfig;
use klinefeed_core::feed::error::{BufferError, ServiceError, TaskFailure};
use klinefeed_core::feed::port::{CandleSink, KlineFeed, ServiceStatus};
use klinefeed_core::market::entity::Candle;
use klinefeed_core::market::port::KlineProvider;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// # Summary
/// 单交易对 K 线窗口服务，协调全部后台任务并对外提供查询面。
///
/// # Invariants
/// - 状态只向前迁移：Created → Initializing → Running → Error。
/// - 启动顺序固定：发布游标播种 → 回填结束 → 淘汰与推送开始。
/// - 任一后台任务终止性失败时进入 `Error`，其余任务继续运行，失败的任务不重启。
/// - `run` 只能调用一次。
pub struct KlineService {
    config: FeedConfig,
    provider: Arc<dyn KlineProvider>,
    window: Arc<Window>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl KlineService {
    /// # Summary
    /// 创建服务，不启动任何任务。
    ///
    /// # Arguments
    /// * `config`: 窗口与各任务的参数。
    /// * `provider`: 行情数据源。
    ///
    /// # Returns
    /// 处于 `Created` 状态的服务。
    pub fn new(config: FeedConfig, provider: Arc<dyn KlineProvider>) -> Arc<Self> {
        let window = Window::new(config.length);
        Arc::new(Self {
            config,
            provider,
            window,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn interval(&self) -> Interval {
        self.config.interval
    }

    /// 推送连接累计的失败事件数。
    pub fn live_failures(&self) -> u64 {
        self.window.live_failures()
    }

    /// 按键读取一根 K 线。
    pub fn get(&self, key: i64) -> Result<Candle, ServiceError> {
        Ok(*self.window.buffer().get(key)?)
    }

    fn source(&self) -> Source {
        Source {
            symbol: self.config.symbol.clone(),
            interval: self.config.interval,
            provider: self.provider.clone(),
        }
    }

    /// # Summary
    /// 启动服务。
    ///
    /// # Logic
    /// 1. 状态迁移到 `Initializing`，启动失败监控。
    /// 2. 启动发布任务与轮询任务，等待发布游标播种。
    /// 3. 启动回填任务并等待其结束。
    /// 4. 启动淘汰任务与推送任务，状态迁移到 `Running`。
    ///
    /// 启动序列在后台执行，本方法立即返回；可通过 [`KlineService::wait_for_status`] 等待。
    /// 必须在 Tokio 运行时内调用。
    ///
    /// # Returns
    /// 重复调用返回 `AlreadyStarted`。
    pub fn run(self: &Arc<Self>) -> Result<(), ServiceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyStarted);
        }
        self.window.status.advance(ServiceStatus::Initializing);
        info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            length = self.config.length,
            "kline service initializing"
        );

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        self.tracker.spawn(Self::monitor(
            self.window.clone(),
            failures_rx,
            self.shutdown.clone(),
        ));

        let this = self.clone();
        self.tracker.spawn(async move {
            if let Err(failure) = this.startup(failures_tx.clone()).await
                && failures_tx.send(failure).is_err()
            {
                warn!("failure monitor already stopped");
            }
        });
        Ok(())
    }

    /// # Summary
    /// 按固定顺序拉起各后台任务。
    ///
    /// # Logic
    /// 1. 发布任务带播种通道启动，随后启动轮询任务。
    /// 2. 等待发布游标落定在轮询的第一批数据上，之后才允许回填前插历史。
    /// 3. 回填无论成功与否结束后都启动淘汰任务，保证窗口有界。
    /// 4. 回填成功时迁移到 `Running`，否则把失败交给监控。
    async fn startup(
        &self,
        failures: mpsc::UnboundedSender<TaskFailure>,
    ) -> Result<(), TaskFailure> {
        let source = self.source();

        let (seed_tx, seed_rx) = oneshot::channel();
        let publisher = Publisher::new(self.window.clone(), self.shutdown.clone()).on_seed(seed_tx);
        self.spawn_supervised("publisher", publisher.run(), failures.clone());

        let poller = Poller {
            source: source.clone(),
            window: self.window.clone(),
            period: self.config.poll_interval(),
            limit: self.config.poll_limit,
            shutdown: self.shutdown.clone(),
        };
        self.spawn_supervised("poller", poller.run(), failures.clone());

        let seed = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            r = seed_rx => r.map_err(|_| TaskFailure {
                task: "startup",
                reason: "publisher stopped before seeding its cursor".to_string(),
            })?,
        };
        info!(seed, "publisher seeded, starting backfill");

        let (done_tx, done_rx) = oneshot::channel();
        let backfill = Backfill {
            source: source.clone(),
            window: self.window.clone(),
            target: self.config.length,
            page_size: self.config.backfill_page_size,
            throttle: self.config.backfill_throttle(),
            done: Some(done_tx),
            shutdown: self.shutdown.clone(),
        };
        self.spawn_supervised("backfill", backfill.run(), failures.clone());

        let backfilled = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            r = done_rx => r,
        };

        let evictor = Evictor {
            window: self.window.clone(),
            target: self.config.length,
            period: self.config.eviction_interval(),
            shutdown: self.shutdown.clone(),
        };
        self.spawn_supervised("evictor", evictor.run(), failures.clone());

        if self.config.live_enabled {
            let live = LiveFeed {
                source,
                window: self.window.clone(),
                backoff: self.config.live_backoff(),
                shutdown: self.shutdown.clone(),
            };
            self.spawn_supervised("live", live.run(), failures);
        }

        let len = backfilled.map_err(|_| TaskFailure {
            task: "startup",
            reason: "backfill stopped before completion".to_string(),
        })?;
        if self.window.status.advance(ServiceStatus::Running) {
            info!(len, "kline service running");
        }
        Ok(())
    }

    /// # Summary
    /// 在监督下启动一个后台任务。
    ///
    /// # Logic
    /// 1. 任务本体返回 `Err` 时上报该失败。
    /// 2. 任务 panic 时转换为 `TaskFailure` 上报；因停机被取消的任务不上报。
    fn spawn_supervised<F>(
        &self,
        task: &'static str,
        fut: F,
        failures: mpsc::UnboundedSender<TaskFailure>,
    ) where
        F: Future<Output = Result<(), TaskFailure>> + Send + 'static,
    {
        let inner = tokio::spawn(fut);
        self.tracker.spawn(async move {
            let failure = match inner.await {
                Ok(Ok(())) => return,
                Ok(Err(failure)) => failure,
                Err(e) if e.is_cancelled() => return,
                Err(e) => TaskFailure {
                    task,
                    reason: format!("panicked: {}", e),
                },
            };
            if failures.send(failure).is_err() {
                warn!(task, "failure monitor already stopped");
            }
        });
    }

    /// 消费失败通道，把服务状态迁移到 `Error`。
    async fn monitor(
        window: Arc<Window>,
        mut failures: mpsc::UnboundedReceiver<TaskFailure>,
        shutdown: CancellationToken,
    ) {
        loop {
            let failure = tokio::select! {
                _ = shutdown.cancelled() => break,
                f = failures.recv() => f,
            };
            let Some(failure) = failure else {
                break;
            };
            error!(task = failure.task, reason = %failure.reason, "background task failed");
            if window.status.advance(ServiceStatus::Error) {
                warn!("kline service entered error state, remaining tasks keep running");
            }
        }
    }

    /// # Summary
    /// 等待服务到达 `target` 或更晚的状态。
    ///
    /// # Returns
    /// 到达时的实际状态。
    pub async fn wait_for_status(&self, target: ServiceStatus) -> ServiceStatus {
        let mut rx = self.window.status.subscribe();
        match rx.wait_for(|s| *s >= target).await {
            Ok(s) => *s,
            Err(_) => self.window.status.get(),
        }
    }

    /// # Summary
    /// 停止全部后台任务并等待其退出。
    pub async fn shutdown(&self) {
        info!(symbol = %self.config.symbol, "kline service shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("kline service stopped");
    }
}

#[async_trait]
impl KlineFeed for KlineService {
    fn symbol(&self) -> &str {
        &self.config.symbol
    }

    fn length(&self) -> usize {
        self.config.length
    }

    fn status(&self) -> ServiceStatus {
        self.window.status.get()
    }

    async fn head(&self) -> Result<Candle, ServiceError> {
        Ok(*self.window.buffer().head()?)
    }

    async fn tail(&self) -> Result<Candle, ServiceError> {
        Ok(*self.window.buffer().tail()?)
    }

    async fn size(&self) -> Result<usize, ServiceError> {
        Ok(self.window.buffer().len())
    }

    fn subscribe(&self, sink: Arc<dyn CandleSink>) -> i64 {
        let id = self.window.registry.subscribe(sink);
        info!(subscriber = id, "subscriber registered");
        id
    }

    fn subscribe_from_start(&self, sink: Arc<dyn CandleSink>) -> i64 {
        let id = self.window.subscribe_from_start(sink);
        info!(subscriber = id, "subscriber registered with replay");
        id
    }

    fn unsubscribe(&self, id: i64) -> bool {
        let removed = self.window.registry.unsubscribe(id);
        if removed {
            info!(subscriber = id, "subscriber removed");
        }
        removed
    }

    fn list_subscribers(&self) -> Vec<i64> {
        self.window.registry.ids()
    }

    /// # Summary
    /// 沿链遍历 `[start, end]`，并按周期校验连续性。
    ///
    /// # Logic
    /// 1. `start > end` 时不做任何回调直接返回。
    /// 2. 每一步单独加锁读取当前键，释放锁后回调。
    /// 3. 下一个键必须恰好晚一个周期，否则以缺失的键返回 `NotFound`。
    async fn query(
        &self,
        start: i64,
        end: i64,
        handler: &mut (dyn for<'c> FnMut(&'c Candle) + Send),
    ) -> Result<(), ServiceError> {
        let step = self.config.interval.millis();
        let mut key = start;
        while key <= end {
            let (candle, next) = {
                let buffer = self.window.buffer();
                let candle = *buffer.get(key)?;
                (candle, buffer.next(key).ok())
            };
            handler(&candle);
            if key == end {
                break;
            }
            let expected = key + step;
            if expected > end {
                break;
            }
            match next {
                Some(n) if n == expected => key = n,
                _ => return Err(BufferError::NotFound(expected).into()),
            }
        }
        Ok(())
    }
}
