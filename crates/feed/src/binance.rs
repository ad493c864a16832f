use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use klinefeed_core::common::Interval;
use klinefeed_core::market::entity::RawCandle;
use klinefeed_core::market::error::MarketError;
use klinefeed_core::market::port::{FetchRange, KlineProvider, RawCandleStream};
use reqwest::Client;
use serde::Deserialize;
use serde::de::IgnoredAny;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// REST 接口地址。
pub const DEFAULT_REST_URL: &str = "https://api.binance.com";
/// 推送接口地址。
pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443";
/// 单次 K 线请求的条数上限。
const MAX_LIMIT: usize = 1000;

/// # Summary
/// Binance 现货行情提供者实现。
///
/// # Invariants
/// - 历史数据使用 `reqwest` 异步客户端请求 REST 接口。
/// - 实时数据使用 WebSocket K 线流，每次订阅对应一条独立连接。
#[derive(Clone)]
pub struct BinanceProvider {
    // 内部使用的 HTTP 客户端
    client: Client,
    rest_url: String,
    ws_url: String,
}

impl BinanceProvider {
    /// # Summary
    /// 创建连接官方地址的 BinanceProvider。
    ///
    /// # Returns
    /// HTTP 客户端构建失败时返回 `MarketError::Transport`。
    pub fn new() -> Result<Self, MarketError> {
        Self::with_endpoints(DEFAULT_REST_URL, DEFAULT_WS_URL)
    }

    /// # Summary
    /// 使用自定义地址创建 BinanceProvider，便于接入测试网或代理。
    ///
    /// # Logic
    /// 1. 配置 10 秒超时。
    /// 2. 初始化 reqwest 客户端。
    ///
    /// # Arguments
    /// * `rest_url`: REST 根地址。
    /// * `ws_url`: WebSocket 根地址。
    pub fn with_endpoints(rest_url: &str, ws_url: &str) -> Result<Self, MarketError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MarketError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
        })
    }
}

/// # Summary
/// REST K 线接口返回的单行数据，固定 12 个元素。
#[derive(Deserialize, Debug)]
struct RestKline(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
    String,
    String,
    IgnoredAny,
);

impl RestKline {
    /// 以 `close_time < now` 判断是否已收盘。
    fn into_raw(self, now: i64) -> RawCandle {
        RawCandle {
            open_time: self.0,
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
            close_time: self.6,
            quote_asset_volume: self.7,
            trade_count: self.8,
            taker_buy_base_volume: self.9,
            taker_buy_quote_volume: self.10,
            is_final: self.6 < now,
        }
    }
}

/// # Summary
/// WebSocket 推送事件外层结构。
#[derive(Deserialize, Debug)]
struct WsEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "k")]
    kline: Option<WsKline>,
}

/// # Summary
/// WebSocket K 线事件主体。
#[derive(Deserialize, Debug)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    trade_count: i64,
    // 该周期是否已收盘
    #[serde(rename = "x")]
    is_final: bool,
    #[serde(rename = "q")]
    quote_asset_volume: String,
    #[serde(rename = "V")]
    taker_buy_base_volume: String,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: String,
}

impl From<WsKline> for RawCandle {
    fn from(k: WsKline) -> Self {
        RawCandle {
            open_time: k.open_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            close_time: k.close_time,
            quote_asset_volume: k.quote_asset_volume,
            trade_count: k.trade_count,
            taker_buy_base_volume: k.taker_buy_base_volume,
            taker_buy_quote_volume: k.taker_buy_quote_volume,
            is_final: k.is_final,
        }
    }
}

/// # Summary
/// 解析 REST K 线响应体。
///
/// # Arguments
/// * `body`: 响应 JSON 文本。
/// * `now`: 当前毫秒时间戳，用于判断是否收盘。
///
/// # Returns
/// 按开盘时间升序的原始记录，格式不符返回 `MarketError::Parse`。
pub fn parse_rest_klines(body: &str, now: i64) -> Result<Vec<RawCandle>, MarketError> {
    let rows: Vec<RestKline> =
        serde_json::from_str(body).map_err(|e| MarketError::Parse(e.to_string()))?;
    Ok(rows.into_iter().map(|r| r.into_raw(now)).collect())
}

/// # Summary
/// 解析一条 WebSocket 文本帧。
///
/// # Returns
/// K 线事件返回 `Some`，其它事件返回 `None`，无法解析返回 `MarketError::Parse`。
pub fn parse_ws_event(text: &str) -> Result<Option<RawCandle>, MarketError> {
    let event: WsEvent =
        serde_json::from_str(text).map_err(|e| MarketError::Parse(e.to_string()))?;
    if event.event != "kline" {
        return Ok(None);
    }
    event
        .kline
        .map(|k| Some(k.into()))
        .ok_or(MarketError::Parse("kline event without payload".into()))
}

#[async_trait]
impl KlineProvider for BinanceProvider {
    /// # Summary
    /// 从 REST 接口抓取 K 线。
    ///
    /// # Logic
    /// 1. 把请求范围映射为 `startTime`/`endTime`/`limit` 查询参数，条数不超过接口上限。
    /// 2. 发起异步请求并解析 12 元素数组。
    /// 3. 根据当前时间标记是否收盘。
    ///
    /// # Arguments
    /// * `symbol`: 交易对代码。
    /// * `interval`: 周期。
    /// * `range`: 请求范围。
    ///
    /// # Returns
    /// 成功返回升序原始记录，失败返回 MarketError。
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        range: FetchRange,
    ) -> Result<Vec<RawCandle>, MarketError> {
        let url = format!("{}/api/v3/klines", self.rest_url);
        let mut params = vec![
            ("symbol", symbol.to_uppercase()),
            ("interval", interval.as_str().to_string()),
        ];
        if let Some(start) = range.start {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = range.end {
            params.push(("endTime", end.to_string()));
        }
        if let Some(limit) = range.limit {
            params.push(("limit", limit.min(MAX_LIMIT).to_string()));
        }

        let resp = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| MarketError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(MarketError::Transport(format!("HTTP {}", resp.status())));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| MarketError::Transport(e.to_string()))?;
        let candles = parse_rest_klines(&body, Utc::now().timestamp_millis())?;
        debug!(symbol, interval = %interval, count = candles.len(), "fetched klines");
        Ok(candles)
    }

    /// # Summary
    /// 订阅 WebSocket K 线流。
    ///
    /// # Logic
    /// 1. 建立到 `<symbol>@kline_<interval>` 的连接。
    /// 2. 文本帧解析为原始记录，解析失败作为 `Err` 项产出。
    /// 3. 服务端关闭或读取出错时结束流，由调用方负责重连。
    ///
    /// # Returns
    /// 连接失败返回 `MarketError::Transport`。
    async fn subscribe_live(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<RawCandleStream, MarketError> {
        let url = format!(
            "{}/ws/{}@kline_{}",
            self.ws_url,
            symbol.to_lowercase(),
            interval.as_str()
        );
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| MarketError::Transport(e.to_string()))?;
        info!(url, "connected to kline stream");

        let s = async_stream::stream! {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => match parse_ws_event(&text) {
                        Ok(Some(raw)) => yield Ok(raw),
                        Ok(None) => {}
                        Err(e) => yield Err(e),
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "kline stream closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "kline stream read failed");
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(s))
    }
}
