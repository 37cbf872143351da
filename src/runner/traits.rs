//! Agent Runner 能力接口
//!
//! 所有外部 agent 后端（Codex CLI / 脚本化测试替身）实现 AgentRunner：spawn、resume、terminate，
//! 每次调用都显式带超时参数。

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::profiles::AgentProfile;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    #[error("Agent runner unavailable: {0}")]
    Unavailable(String),

    #[error("Agent runner timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent process failed: {0}")]
    Process(String),
}

/// spawn 请求
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub profile: AgentProfile,
    pub brief: String,
    pub inputs: Option<Value>,
    pub flags: Vec<String>,
}

/// spawn 结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnResult {
    pub session_id: String,
    pub returncode: i32,
    pub output_preview: String,
}

/// resume 的业务结果；进程级错误走 RunnerError
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeReport {
    Success,
    Failure(String),
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest, timeout: Duration) -> Result<SpawnResult, RunnerError>;

    async fn resume(&self, session_id: &str, timeout: Duration) -> Result<ResumeReport, RunnerError>;

    async fn terminate(&self, session_id: &str, reason: &str, timeout: Duration) -> Result<(), RunnerError>;

    /// 用于 status 展示的后端名
    fn name(&self) -> &'static str {
        "unknown"
    }
}
