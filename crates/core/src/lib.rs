//! klinefeed 领域核心：实体、错误与端口 (Port) 定义。
//!
//! 本 crate 不包含任何具体实现，只描述各层之间的契约。

pub mod common;
pub mod config;

pub mod market {
    pub mod entity;
    pub mod error;
    pub mod port;
}

pub mod feed {
    pub mod error;
    pub mod port;
}

pub mod store {
    pub mod error;
    pub mod port;
}
