//! 交易所行情数据源实现。

pub mod binance;
