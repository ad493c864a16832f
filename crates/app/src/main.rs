mod settings;

use anyhow::Context;
use klinefeed_core::config::{AppConfig, LogConfig, RunMode};
use klinefeed_core::feed::port::KlineFeed;
use klinefeed_core::market::entity::Candle;
use klinefeed_feed::binance::BinanceProvider;
use klinefeed_market::playback::PlaybackFeed;
use klinefeed_market::recorder::StoreRecorder;
use klinefeed_market::service::KlineService;
use klinefeed_store::candle::SqliteCandleStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// 记录器攒批大小。
const RECORD_BATCH: usize = 500;
/// 记录器定时落盘周期。
const RECORD_FLUSH: Duration = Duration::from_secs(5);

/// # Summary
/// 初始化全局日志。
///
/// # Logic
/// 1. 过滤级别优先取 `RUST_LOG`，否则取配置。
/// 2. 终端输出始终开启；配置了目录时额外写入按天滚动的日志文件。
///
/// # Returns
/// 文件写入线程的守卫，需要保持到进程退出。
fn init_logging(cfg: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let (file_layer, guard) = match &cfg.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "klinefeed.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

/// 把每根发布的 K 线写入日志的订阅者。
fn log_sink(candle: &Candle) {
    info!(
        open_time = candle.open_time,
        open = candle.open,
        high = candle.high,
        low = candle.low,
        close = candle.close,
        volume = candle.volume,
        "candle"
    );
}

/// # Summary
/// 实时模式：维护单交易对窗口直到收到退出信号。
///
/// # Logic
/// 1. 实例化数据源与窗口服务。
/// 2. 按需挂载存储记录器，再挂载日志订阅者。
/// 3. 启动服务，等待 Ctrl-C 后依次停止服务与记录器。
async fn run_live(cfg: AppConfig) -> anyhow::Result<()> {
    let provider = Arc::new(BinanceProvider::new()?);
    let service = KlineService::new(cfg.feed.clone(), provider);
    let shutdown = CancellationToken::new();

    let recorder = if cfg.store.record {
        let store = SqliteCandleStore::open(&cfg.store.data_dir, &cfg.feed.symbol, cfg.feed.interval)
            .await
            .context("failed to open candle store")?;
        info!(path = %store.path().display(), "recording live window");
        let (recorder, handle) =
            StoreRecorder::spawn(Arc::new(store), RECORD_BATCH, RECORD_FLUSH, shutdown.clone());
        service.subscribe(Arc::new(recorder));
        Some(handle)
    } else {
        None
    };
    service.subscribe(Arc::new(log_sink));

    service.run()?;
    info!("Kline service started. Waiting for signals...");

    tokio::signal::ctrl_c().await?;
    info!(status = %service.status(), "Shutdown signal received. Exiting...");
    service.shutdown().await;
    shutdown.cancel();
    if let Some(handle) = recorder {
        handle.await?;
    }
    Ok(())
}

/// # Summary
/// 回放模式：把存储中的一段历史按节奏重放给日志订阅者。
async fn run_playback(cfg: AppConfig) -> anyhow::Result<()> {
    let store = SqliteCandleStore::open(&cfg.store.data_dir, &cfg.feed.symbol, cfg.feed.interval)
        .await
        .context("failed to open candle store")?;
    let feed = PlaybackFeed::new(
        cfg.feed.symbol.clone(),
        cfg.feed.interval,
        Arc::new(store),
        cfg.playback.start,
        cfg.playback.end,
        Duration::from_millis(cfg.playback.sleep_ms),
    );

    let size = feed.size().await?;
    if size == 0 {
        warn!(start = cfg.playback.start, end = cfg.playback.end, "no stored candles in playback range");
    }
    info!(symbol = feed.symbol(), size, length = feed.length(), "Playback started. Waiting for signals...");
    feed.subscribe(Arc::new(log_sink));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting...");
    feed.stop();
    Ok(())
}

/// # Summary
/// 应用启动入口，纯粹的 DI 容器。
/// 负责加载配置、实例化具体实现组件并按运行模式组装。
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = settings::load().context("failed to load configuration")?;
    let _guard = init_logging(&cfg.log);

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    info!(mode = ?cfg.mode, symbol = %cfg.feed.symbol, interval = %cfg.feed.interval, "klinefeed starting...");
    match cfg.mode {
        RunMode::Live => run_live(cfg).await,
        RunMode::Playback => run_playback(cfg).await,
    }
}
