use crate::feed::error::ServiceError;
use crate::market::entity::Candle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// # Summary
/// 订阅者能力接口，每根新发布的 K 线调用一次。
///
/// # Invariants
/// - 调用发生在发布协程中，实现者不应长时间阻塞。
/// - 回调内部允许再次订阅或退订。
pub trait CandleSink: Send + Sync {
    /// 接收一根 K 线。
    fn on_candle(&self, candle: &Candle);
}

impl<F> CandleSink for F
where
    F: Fn(&Candle) + Send + Sync,
{
    fn on_candle(&self, candle: &Candle) {
        self(candle)
    }
}

/// # Summary
/// 将 K 线转发到无界通道的订阅者，便于传输层以流的方式消费。
///
/// # Invariants
/// - 接收端被丢弃后静默丢弃后续 K 线，由持有者负责退订。
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Candle>,
}

impl ChannelSink {
    /// # Summary
    /// 创建通道订阅者及对应的接收端。
    ///
    /// # Returns
    /// (订阅者, 接收端)。
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Candle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CandleSink for ChannelSink {
    fn on_candle(&self, candle: &Candle) {
        if self.tx.send(*candle).is_err() {
            trace!(key = candle.open_time, "channel sink receiver dropped");
        }
    }
}

/// # Summary
/// 服务运行状态。
///
/// # Invariants
/// - 只允许向前迁移：Created → Initializing → Running → Error。
/// - `Error` 为终态，不会回到 `Running`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Created,
    Initializing,
    Running,
    Error,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Created => write!(f, "created"),
            ServiceStatus::Initializing => write!(f, "initializing"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Error => write!(f, "error"),
        }
    }
}

/// # Summary
/// 单交易对 K 线窗口的对外查询面，供传输层消费。
///
/// # Invariants
/// - 实时服务与历史回放共享这一接口。
/// - 订阅 id 单调递增且永不复用。
#[async_trait]
pub trait KlineFeed: Send + Sync {
    /// 交易对代码。
    fn symbol(&self) -> &str;

    /// 目标窗口长度 (K 线根数)。
    fn length(&self) -> usize;

    /// 当前运行状态。
    fn status(&self) -> ServiceStatus;

    /// # Summary
    /// 获取窗口中最早的 K 线。
    ///
    /// # Returns
    /// 窗口为空时返回 `BufferError::Empty`。
    async fn head(&self) -> Result<Candle, ServiceError>;

    /// # Summary
    /// 获取窗口中最新的 K 线。
    ///
    /// # Returns
    /// 窗口为空时返回 `BufferError::Empty`。
    async fn tail(&self) -> Result<Candle, ServiceError>;

    /// 窗口中当前的 K 线数量。
    async fn size(&self) -> Result<usize, ServiceError>;

    /// # Summary
    /// 注册订阅者，只接收注册之后发布的 K 线。
    ///
    /// # Arguments
    /// * `sink`: 订阅者能力。
    ///
    /// # Returns
    /// 新分配的订阅 id。
    fn subscribe(&self, sink: Arc<dyn CandleSink>) -> i64;

    /// # Summary
    /// 注册订阅者，并先回放窗口中已发布的 K 线。
    ///
    /// # Logic
    /// 回放与转入实时推送之间不丢失、不重复任何一根 K 线。
    ///
    /// # Arguments
    /// * `sink`: 订阅者能力。
    ///
    /// # Returns
    /// 新分配的订阅 id。
    fn subscribe_from_start(&self, sink: Arc<dyn CandleSink>) -> i64;

    /// 移除订阅者，id 不存在时为空操作。返回是否确实移除。
    fn unsubscribe(&self, id: i64) -> bool;

    /// 当前全部订阅 id，升序。
    fn list_subscribers(&self) -> Vec<i64>;

    /// # Summary
    /// 按链顺序遍历 `[start, end]` 闭区间的 K 线。
    ///
    /// # Logic
    /// 1. 从 `start` 开始依次调用 `handler`。
    /// 2. 途中任何一个键缺失即中止并返回 `NotFound`，已回调的结果不回滚。
    ///
    /// # Arguments
    /// * `start`: 起始开盘时间。
    /// * `end`: 截止开盘时间。
    /// * `handler`: 每根 K 线的回调。
    ///
    /// # Returns
    /// 完整遍历返回 Ok。
    async fn query(
        &self,
        start: i64,
        end: i64,
        handler: &mut (dyn for<'c> FnMut(&'c Candle) + Send),
    ) -> Result<(), ServiceError>;
}
