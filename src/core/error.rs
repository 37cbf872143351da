//! 编排引擎错误类型
//!
//! 校验 / 未找到 / 非法状态迁移直接以原操作名义返回；Agent Runner 的 resume 失败不走错误，
//! 而是记录为 `ResumeFailed` 事件（需要跨重启计数）。

use thiserror::Error;

use crate::profiles::ProfileError;
use crate::runner::RunnerError;

/// 引擎统一错误
#[derive(Error, Debug)]
pub enum HydraError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for task {task_id}: {detail}")]
    InvalidTransition { task_id: String, detail: String },

    #[error("Task already running: {0}")]
    AlreadyRunning(String),

    #[error("Task {task_id} is not resumable (status {status})")]
    NotResumable { task_id: String, status: String },

    /// 同一任务已有 resume 在进行中（single-flight）
    #[error("Resume already in flight for task {0}")]
    ResumeBusy(String),

    /// 乐观并发冲突：expected 与当前 head 不一致，未追加任何事件
    #[error("Sequence conflict on stream {stream_id}: expected {expected}, head is {actual}")]
    Conflict {
        stream_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// 回放时发现序号缺口或无法解析的事件；仅影响该 stream
    #[error("Corrupt stream {stream_id} at sequence {sequence_no}: {detail}")]
    Corruption {
        stream_id: String,
        sequence_no: u64,
        detail: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Agent runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Config error: {0}")]
    Config(String),

    /// blocking 线程池上的存储任务 panic 或被取消
    #[error("Background task failed: {0}")]
    Background(#[from] tokio::task::JoinError),
}

impl HydraError {
    pub fn invalid_transition(task_id: &str, detail: impl Into<String>) -> Self {
        Self::InvalidTransition {
            task_id: task_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn corruption(stream_id: &str, sequence_no: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            stream_id: stream_id.to_string(),
            sequence_no,
            detail: detail.into(),
        }
    }

    /// 是否为可重读重试的并发冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, HydraError>;
