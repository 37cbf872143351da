//! 领域事件：封闭的带标签枚举，每种事件有类型化 payload
//!
//! 持久化形态为 `RecordedEvent { stream_id, sequence_no, event_type, timestamp, payload }`，
//! `event_type` 保留原始字符串，以便回放时识别未知类型（前向兼容）。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::state::{SessionStatus, TaskStatus};

/// 已持久化的事件（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: String,
    /// 每个 stream 从 1 开始严格递增、无缺口
    pub sequence_no: u64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl RecordedEvent {
    /// 解码为领域事件；未知类型返回 `Ok(None)`，payload 不合法返回 Err
    pub fn decode(&self) -> Result<Option<DomainEvent>, serde_json::Error> {
        if self.event_type.parse::<EventType>().is_err() {
            return Ok(None);
        }
        let tagged = serde_json::json!({
            "event_type": self.event_type,
            "payload": self.payload,
        });
        serde_json::from_value(tagged).map(Some)
    }
}

/// 事件类型名（与 `DomainEvent` 变体一一对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TaskCreated,
    TaskStatusChanged,
    SessionStarted,
    SessionEnded,
    WorktreeRegistered,
    ResumeAttempted,
    ResumeSucceeded,
    ResumeFailed,
    ResumeCancelled,
    ResumeAlertRaised,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::TaskCreated,
        EventType::TaskStatusChanged,
        EventType::SessionStarted,
        EventType::SessionEnded,
        EventType::WorktreeRegistered,
        EventType::ResumeAttempted,
        EventType::ResumeSucceeded,
        EventType::ResumeFailed,
        EventType::ResumeCancelled,
        EventType::ResumeAlertRaised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "TaskCreated",
            EventType::TaskStatusChanged => "TaskStatusChanged",
            EventType::SessionStarted => "SessionStarted",
            EventType::SessionEnded => "SessionEnded",
            EventType::WorktreeRegistered => "WorktreeRegistered",
            EventType::ResumeAttempted => "ResumeAttempted",
            EventType::ResumeSucceeded => "ResumeSucceeded",
            EventType::ResumeFailed => "ResumeFailed",
            EventType::ResumeCancelled => "ResumeCancelled",
            EventType::ResumeAlertRaised => "ResumeAlertRaised",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// 领域事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum DomainEvent {
    TaskCreated {
        profile_id: String,
        brief: String,
        #[serde(default)]
        context_package: Option<Value>,
        #[serde(default)]
        metadata: Option<Value>,
    },
    TaskStatusChanged {
        status: TaskStatus,
        #[serde(default)]
        summary: Option<String>,
    },
    SessionStarted {
        session_id: String,
        #[serde(default)]
        returncode: Option<i32>,
        #[serde(default)]
        output_preview: Option<String>,
    },
    SessionEnded {
        session_id: String,
        status: SessionStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    WorktreeRegistered {
        worktree_id: String,
        path: String,
        #[serde(default)]
        branch: Option<String>,
        status: String,
    },
    ResumeAttempted {
        attempt_id: String,
        session_id: String,
    },
    ResumeSucceeded {
        attempt_id: String,
    },
    ResumeFailed {
        attempt_id: String,
        reason: String,
    },
    ResumeCancelled {
        attempt_id: String,
        reason: String,
    },
    ResumeAlertRaised {
        alert_id: String,
        failure_count: u32,
        threshold: u32,
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DomainEvent::TaskCreated { .. } => EventType::TaskCreated,
            DomainEvent::TaskStatusChanged { .. } => EventType::TaskStatusChanged,
            DomainEvent::SessionStarted { .. } => EventType::SessionStarted,
            DomainEvent::SessionEnded { .. } => EventType::SessionEnded,
            DomainEvent::WorktreeRegistered { .. } => EventType::WorktreeRegistered,
            DomainEvent::ResumeAttempted { .. } => EventType::ResumeAttempted,
            DomainEvent::ResumeSucceeded { .. } => EventType::ResumeSucceeded,
            DomainEvent::ResumeFailed { .. } => EventType::ResumeFailed,
            DomainEvent::ResumeCancelled { .. } => EventType::ResumeCancelled,
            DomainEvent::ResumeAlertRaised { .. } => EventType::ResumeAlertRaised,
        }
    }

    /// 拆分为 (event_type, payload)，供 EventLog 持久化
    pub fn encode(&self) -> Result<(String, Value), serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Object(Default::default()));
        Ok((self.event_type().as_str().to_string(), payload))
    }
}
