use crate::store::error::StoreError;
use thiserror::Error;

/// # Summary
/// 时间索引缓冲区的操作错误。
///
/// # Invariants
/// - 任何返回错误的操作都不会修改缓冲区。
/// - 由调用方就地处理 (重试、跳过或中止)，从不直接影响服务状态。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    // 插入的键已存在
    #[error("Duplicate key: {0}")]
    DuplicateKey(i64),
    // 缓冲区为空
    #[error("Buffer is empty")]
    Empty,
    // 键不存在
    #[error("Key not found: {0}")]
    NotFound(i64),
    // 链长度不足以向内走 `step` 步
    #[error("Step {step} out of range for buffer of size {len}")]
    StepOutOfRange { step: usize, len: usize },
    // 键位于链的端点，没有对应方向的邻居
    #[error("No neighbor for key: {0}")]
    NoNeighbor(i64),
    // 插入位置与键的大小关系不符 (追加不晚于尾部，或前插不早于头部)
    #[error("Key {key} is out of order relative to {bound}")]
    OutOfOrder { key: i64, bound: i64 },
}

impl BufferError {
    /// 是否属于 "未找到" 一类 (缺失的键或越界的步数)。
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BufferError::NotFound(_) | BufferError::StepOutOfRange { .. }
        )
    }
}

/// # Summary
/// 对外查询面的统一错误类型。
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Service already started")]
    AlreadyStarted,
}

/// # Summary
/// 后台任务的终止性失败，经由专用失败通道上报。
///
/// # Invariants
/// - 上报后服务状态进入 `Error`，兄弟任务不受影响。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Task `{task}` failed: {reason}")]
pub struct TaskFailure {
    // 任务名称
    pub task: &'static str,
    // 失败原因
    pub reason: String,
}
