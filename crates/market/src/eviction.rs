use crate::buffer::TimeIndexedBuffer;
use crate::window::{UNSEEDED, Window};
use klinefeed_core::feed::error::TaskFailure;
use klinefeed_core::market::entity::Candle;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// # Summary
/// 从头部淘汰超出目标长度的 K 线。
///
/// # Invariants
/// - 只淘汰键严格小于 `floor` 的 K 线，发布游标所在节点及其之后的节点永不被淘汰。
/// - `floor` 为 None 时不淘汰任何节点 (游标尚未播种)。
///
/// # Arguments
/// * `buffer`: 已加锁的缓冲区。
/// * `target`: 目标长度。
/// * `floor`: 淘汰下界 (不含)，通常为已发布水位。
///
/// # Returns
/// 实际淘汰的根数。
pub(crate) fn evict_excess(
    buffer: &mut TimeIndexedBuffer<Candle>,
    target: usize,
    floor: Option<i64>,
) -> usize {
    let Some(floor) = floor else {
        return 0;
    };
    let mut evicted = 0;
    while buffer.len() > target {
        match buffer.head_key(0) {
            Ok(key) if key < floor => {}
            _ => break,
        }
        if buffer.pop_front().is_err() {
            break;
        }
        evicted += 1;
    }
    evicted
}

/// # Summary
/// 淘汰任务：周期性地把窗口裁剪回目标长度。
pub(crate) struct Evictor {
    pub(crate) window: Arc<Window>,
    pub(crate) target: usize,
    pub(crate) period: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl Evictor {
    pub(crate) async fn run(self) -> Result<(), TaskFailure> {
        info!(target = self.target, "evictor started");
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let watermark = self.window.delivered();
            let floor = (watermark != UNSEEDED).then_some(watermark);
            let (evicted, len) = {
                let mut buffer = self.window.buffer();
                let evicted = evict_excess(&mut buffer, self.target, floor);
                (evicted, buffer.len())
            };
            if evicted > 0 {
                debug!(evicted, len, "evicted candles from head");
            }
        }
        info!("evictor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64) -> Candle {
        Candle {
            open_time,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            close_time: open_time + 999,
            quote_asset_volume: 1.0,
            trade_count: 1,
            taker_buy_base_volume: 1.0,
            taker_buy_quote_volume: 1.0,
        }
    }

    fn filled(keys: std::ops::Range<i64>) -> TimeIndexedBuffer<Candle> {
        let mut buffer = TimeIndexedBuffer::new();
        for k in keys {
            buffer.push_back(k, candle(k)).unwrap();
        }
        buffer
    }

    #[test]
    fn test_evicts_down_to_target() {
        let mut buffer = filled(0..10);
        assert_eq!(evict_excess(&mut buffer, 4, Some(100)), 6);
        assert_eq!(buffer.keys(), vec![6, 7, 8, 9]);
        assert_eq!(evict_excess(&mut buffer, 4, Some(100)), 0);
    }

    #[test]
    fn test_never_evicts_cursor_or_later() {
        let mut buffer = filled(0..10);
        assert_eq!(evict_excess(&mut buffer, 2, Some(3)), 3);
        assert_eq!(buffer.head_key(0), Ok(3));
        assert_eq!(buffer.len(), 7);
    }

    #[test]
    fn test_unseeded_cursor_blocks_eviction() {
        let mut buffer = filled(0..10);
        assert_eq!(evict_excess(&mut buffer, 2, None), 0);
        assert_eq!(buffer.len(), 10);
    }
}
