//! 单交易对 K 线窗口：时间索引缓冲区、订阅注册表、数据摄入、淘汰、发布与服务控制。

pub mod buffer;
mod eviction;
mod pipeline;
pub mod playback;
mod publisher;
pub mod recorder;
pub mod registry;
pub mod service;
mod window;
