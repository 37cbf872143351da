//! 状态定义：Task / Session / Worktree / AlertRecord 聚合与对外快照
//!
//! 聚合只由事件折叠（projector）产生，不直接修改；对外操作返回的都是克隆出的快照。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Running,
    /// resume 失败或被取消，等待外部再次触发
    ResumePending,
    /// 失败次数达到告警阈值，仍可 resume
    ResumeFailed,
    Completed,
    Failed,
    /// 回放时 stream 损坏；排除在自动 resume 之外
    Degraded,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::ResumePending | TaskStatus::ResumeFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::ResumePending => "RESUME_PENDING",
            TaskStatus::ResumeFailed => "RESUME_FAILED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Degraded => "DEGRADED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Terminated,
}

/// 任务聚合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub profile_id: String,
    pub brief: String,
    pub context_package: Option<Value>,
    pub metadata: Option<Value>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 最近一次会话
    pub session_id: Option<String>,
    pub worktree_id: Option<String>,
    pub summary: Option<String>,
    pub resume_failure_count: u32,
    pub last_resume_attempt_at: Option<DateTime<Utc>>,
    pub last_alert_id: Option<String>,
    /// 未被 ResumeSucceeded 解除的告警
    pub active_alert_id: Option<String>,
    /// 已发出 ResumeAttempted 但尚无结果的 attempt
    pub resume_in_flight: Option<String>,
    pub resume_attempts_total: u64,
    pub resume_failures_total: u64,
}

impl Task {
    /// 无法折叠出任何事件的损坏 stream 的占位任务
    pub fn degraded_placeholder(task_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.to_string(),
            profile_id: String::new(),
            brief: String::new(),
            context_package: None,
            metadata: None,
            status: TaskStatus::Degraded,
            created_at: at,
            updated_at: at,
            session_id: None,
            worktree_id: None,
            summary: None,
            resume_failure_count: 0,
            last_resume_attempt_at: None,
            last_alert_id: None,
            active_alert_id: None,
            resume_in_flight: None,
            resume_attempts_total: 0,
            resume_failures_total: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub task_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub returncode: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worktree {
    pub worktree_id: String,
    pub task_id: String,
    pub path: String,
    pub branch: Option<String>,
    pub status: String,
    pub registered_at: DateTime<Utc>,
}

/// 告警记录：永久历史，ResumeSucceeded 只解除「活跃」状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: String,
    pub task_id: String,
    pub session_id: Option<String>,
    pub failure_count_at_alert: u32,
    pub threshold: u32,
    pub created_at: DateTime<Utc>,
    /// 所在 stream 的序号，用于同一时间戳下的稳定排序
    pub sequence_no: u64,
}

/// task_status 返回的快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub task: Task,
    pub session: Option<Session>,
    pub worktree: Option<Worktree>,
    pub most_recent_alert: Option<AlertRecord>,
}

/// 回放健康度
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HydrationReport {
    pub completed: bool,
    pub streams_replayed: usize,
    pub events_applied: usize,
    pub unknown_events_skipped: usize,
    pub degraded_streams: Vec<String>,
    /// 回放结束时仍有未决 attempt 的任务
    pub interrupted_attempts: Vec<String>,
    pub warnings: Vec<String>,
}

/// status() 返回值：只读内存状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub tasks_total: usize,
    pub counts_by_status: BTreeMap<TaskStatus, usize>,
    pub active_alert_count: usize,
    pub most_recent_alert: Option<AlertRecord>,
    pub alert_threshold: u32,
    pub hydration_health: HydrationReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub task_count_by_status: BTreeMap<TaskStatus, usize>,
    pub active_alert_count: usize,
    pub resume_attempts_total: u64,
    pub resume_failures_total: u64,
}

/// 自动 resume 候选
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeCandidate {
    pub task_id: String,
    pub status: TaskStatus,
    pub resume_failure_count: u32,
    pub last_resume_attempt_at: Option<DateTime<Utc>>,
}

/// 任务时间线条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub sequence_no: u64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTimeline {
    pub task_id: String,
    pub event_count: usize,
    pub latest_event: Option<TimelineEntry>,
    /// full=true 时为完整时间线，否则为前 5 条
    pub timeline: Vec<TimelineEntry>,
}
