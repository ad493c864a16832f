use dashmap::DashMap;
use klinefeed_core::feed::port::CandleSink;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// # Summary
/// 订阅者注册表：订阅 id 到订阅者能力的并发映射。
///
/// # Invariants
/// - id 来自单调递增计数器，永不复用。
/// - 基于 `DashMap` 分片读写锁，增删与发布时的遍历互不阻塞网络任务。
/// - 发布时先取快照再回调，回调中可以安全地增删订阅。
pub struct SubscriptionRegistry {
    // 下一个待分配的订阅 id
    next_id: AtomicI64,
    // 活跃订阅者
    sinks: DashMap<i64, Arc<dyn CandleSink>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(0),
            sinks: DashMap::new(),
        }
    }

    /// # Summary
    /// 注册订阅者。
    ///
    /// # Logic
    /// 1. 原子递增计数器得到新 id。
    /// 2. 存入映射。
    ///
    /// # Arguments
    /// * `sink`: 订阅者能力。
    ///
    /// # Returns
    /// 新分配的订阅 id。
    pub fn subscribe(&self, sink: Arc<dyn CandleSink>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sinks.insert(id, sink);
        id
    }

    /// 移除订阅者，返回是否确实移除。
    pub fn unsubscribe(&self, id: i64) -> bool {
        self.sinks.remove(&id).is_some()
    }

    /// 当前全部订阅 id，升序。
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sinks.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// 当前订阅者快照，持有期间不占用任何分片锁。
    pub fn snapshot(&self) -> Vec<(i64, Arc<dyn CandleSink>)> {
        self.sinks
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klinefeed_core::market::entity::Candle;

    fn noop() -> Arc<dyn CandleSink> {
        Arc::new(|_: &Candle| {})
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let registry = SubscriptionRegistry::new();
        let a = registry.subscribe(noop());
        let b = registry.subscribe(noop());
        assert!(b > a);
        assert!(registry.unsubscribe(a));
        assert!(!registry.unsubscribe(a));
        let c = registry.subscribe(noop());
        assert!(c > b);
        assert_eq!(registry.ids(), vec![b, c]);
    }

    #[test]
    fn test_concurrent_subscribe_unsubscribe() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut issued = Vec::new();
                    for i in 0..200 {
                        let id = registry.subscribe(noop());
                        if i % 2 == 0 {
                            registry.unsubscribe(id);
                        }
                        let _snapshot = registry.snapshot();
                        issued.push(id);
                    }
                    issued
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let issued = handle.join().unwrap();
            assert!(issued.windows(2).all(|w| w[0] < w[1]));
            all.extend(issued);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8 * 200);
        assert_eq!(registry.len(), 8 * 100);
    }
}
