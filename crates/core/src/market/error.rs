use thiserror::Error;

/// # Summary
/// 行情数据域错误枚举，处理网络、解析、字段转换等问题。
///
/// # Invariants
/// - 必须通过 `thiserror` 派生 `Error` trait。
/// - 这些错误只影响单次请求或单根 K 线，从不直接改变服务状态。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    // 传输层错误，包含底层 HTTP / WebSocket 客户端错误信息
    #[error("Transport error: {0}")]
    Transport(String),
    // 数据解析错误，如 JSON 格式不匹配
    #[error("Parse error: {0}")]
    Parse(String),
    // 单个数值字段无法转换
    #[error("Conversion error: field `{field}` has malformed value `{value}`")]
    Conversion { field: &'static str, value: String },
    // 数据源不支持该能力 (例如不支持推送订阅)
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
