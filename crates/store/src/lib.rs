//! 历史 K 线的 SQLite 持久化。

pub mod candle;
