//! 告警：连续 resume 失败达到阈值时产生 `ResumeAlertRaised`
//!
//! 同一任务已有未解除的告警时不会重复产生；`ResumeSucceeded` 解除告警但保留历史记录。

use tracing::warn;

use crate::core::events::DomainEvent;
use crate::core::projector::Registry;
use crate::core::state::{AlertRecord, Task};

#[derive(Debug, Clone, Copy)]
pub struct AlertEmitter {
    threshold: u32,
}

impl AlertEmitter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// 在一次失败之后调用：`failure_count` 为计入本次失败后的连续失败次数
    pub fn evaluate(&self, task: &Task, failure_count: u32) -> Option<DomainEvent> {
        if failure_count < self.threshold || task.active_alert_id.is_some() {
            return None;
        }
        let alert_id = uuid::Uuid::new_v4().to_string();
        warn!(
            task_id = %task.task_id,
            alert_id = %alert_id,
            failure_count,
            threshold = self.threshold,
            "Resume failures exceeded threshold"
        );
        Some(DomainEvent::ResumeAlertRaised {
            alert_id,
            failure_count,
            threshold: self.threshold,
            session_id: task.session_id.clone(),
        })
    }

    /// 告警历史，新的在前
    pub fn list_alerts(&self, registry: &Registry, task_id: Option<&str>, limit: usize) -> Vec<AlertRecord> {
        registry
            .alerts_newest_first(task_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn active_alert_count(&self, registry: &Registry) -> usize {
        registry.active_alert_count()
    }

    pub fn most_recent_alert(&self, registry: &Registry) -> Option<AlertRecord> {
        registry.most_recent_alert().cloned()
    }
}
