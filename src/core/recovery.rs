//! Resume 协调器
//!
//! 一次 attempt：校验状态 → 登记 in-flight → 追加 `ResumeAttempted` → 在超时内调用 runner.resume →
//! 追加结果事件（`ResumeSucceeded` / `ResumeFailed` / `ResumeCancelled`）。失败达到阈值时告警事件与
//! `ResumeFailed` 在同一次追加中写入。
//!
//! attempt 的 future 在结果落盘前被丢弃时，`AttemptGuard` 会补写 `ResumeCancelled`，
//! 因此日志里每个 `ResumeAttempted` 都有最终结果。结果写入失败时同样补写；补写也失败的话，
//! 投影里残留的 in-flight 标记（supervisor 已不持有）会在下一次 resume 时先被结算。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::alerts::AlertEmitter;
use crate::core::error::{HydraError, Result};
use crate::core::events::DomainEvent;
use crate::core::journal::Journal;
use crate::core::projector::Registry;
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::TaskStatus;
use crate::runner::{AgentRunner, ResumeReport, RunnerError};

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_CANCELLED: &str = "cancelled by caller";
pub const REASON_SHUTDOWN: &str = "cancelled by shutdown";
pub const REASON_ABANDONED: &str = "attempt abandoned";
pub const REASON_RESTART: &str = "interrupted by restart";

/// 单次 attempt 的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    Succeeded,
    Failed { reason: String },
    Cancelled { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeOutcome {
    pub task_id: String,
    pub attempt_id: String,
    #[serde(flatten)]
    pub result: AttemptResult,
    pub status: TaskStatus,
    pub resume_failure_count: u32,
    /// 本次 attempt 新产生的告警
    pub alert_id: Option<String>,
}

/// attempt 仍未结算时生成 `ResumeCancelled`；已有结果则为空
fn settle_open_attempt(registry: &Registry, task_id: &str, attempt_id: &str, reason: &str) -> Vec<DomainEvent> {
    let still_open = registry
        .task(task_id)
        .and_then(|t| t.resume_in_flight.as_deref())
        == Some(attempt_id);
    if still_open {
        vec![DomainEvent::ResumeCancelled {
            attempt_id: attempt_id.to_string(),
            reason: reason.to_string(),
        }]
    } else {
        Vec::new()
    }
}

/// 结果落盘前被丢弃时补写 `ResumeCancelled`
struct AttemptGuard {
    journal: Arc<Journal>,
    supervisor: Arc<SessionSupervisor>,
    task_id: String,
    attempt_id: String,
    armed: bool,
}

impl AttemptGuard {
    fn disarm(&mut self) {
        self.armed = false;
        self.supervisor.finish(&self.task_id, &self.attempt_id);
    }

    fn abandon(journal: &Journal, supervisor: &SessionSupervisor, task_id: &str, attempt_id: &str) {
        let result = journal.commit(task_id, |registry| {
            Ok(settle_open_attempt(registry, task_id, attempt_id, REASON_ABANDONED))
        });
        if let Err(e) = result {
            warn!(task_id, attempt_id, "Failed to record abandoned resume attempt: {}", e);
        }
        supervisor.finish(task_id, attempt_id);
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let journal = Arc::clone(&self.journal);
        let supervisor = Arc::clone(&self.supervisor);
        let task_id = std::mem::take(&mut self.task_id);
        let attempt_id = std::mem::take(&mut self.attempt_id);
        // in-flight 标记在补写完成后才释放，期间同一任务的 resume 返回 ResumeBusy
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    Self::abandon(&journal, &supervisor, &task_id, &attempt_id)
                });
            }
            Err(_) => Self::abandon(&journal, &supervisor, &task_id, &attempt_id),
        }
    }
}

pub struct ResumeCoordinator {
    journal: Arc<Journal>,
    supervisor: Arc<SessionSupervisor>,
    runner: Arc<dyn AgentRunner>,
    alerts: AlertEmitter,
}

impl ResumeCoordinator {
    pub fn new(
        journal: Arc<Journal>,
        supervisor: Arc<SessionSupervisor>,
        runner: Arc<dyn AgentRunner>,
        alerts: AlertEmitter,
    ) -> Self {
        Self {
            journal,
            supervisor,
            runner,
            alerts,
        }
    }

    pub async fn resume(&self, task_id: &str, timeout: Duration) -> Result<ResumeOutcome> {
        let attempt_id = uuid::Uuid::new_v4().to_string();

        let (session_id, token) = {
            let _lock = self.journal.lock_task(task_id).await;
            let (session_id, stale) = self.journal.read(|registry| {
                let task = registry
                    .task(task_id)
                    .ok_or_else(|| HydraError::NotFound(task_id.to_string()))?;
                let not_resumable = || HydraError::NotResumable {
                    task_id: task_id.to_string(),
                    status: task.status.to_string(),
                };
                if !task.status.is_resumable() {
                    return Err(not_resumable());
                }
                if task.resume_in_flight.is_some() && self.supervisor.is_in_flight(task_id) {
                    return Err(HydraError::ResumeBusy(task_id.to_string()));
                }
                let session_id = task.session_id.clone().ok_or_else(not_resumable)?;
                Ok((session_id, task.resume_in_flight.clone()))
            })?;

            let token = self
                .supervisor
                .try_begin(task_id, &attempt_id)
                .ok_or_else(|| HydraError::ResumeBusy(task_id.to_string()))?;

            // 之前的结果未能落盘：先结算遗留的 attempt，再开始新的
            let mut events = Vec::new();
            if let Some(stale) = stale {
                warn!(task_id, attempt_id = %stale, "Settling resume attempt left open by a failed write");
                events.push(DomainEvent::ResumeCancelled {
                    attempt_id: stale,
                    reason: REASON_ABANDONED.to_string(),
                });
            }
            events.push(DomainEvent::ResumeAttempted {
                attempt_id: attempt_id.clone(),
                session_id: session_id.clone(),
            });
            if let Err(e) = self.journal.commit_async(task_id, |_| Ok(events.clone())).await {
                self.supervisor.finish(task_id, &attempt_id);
                return Err(e);
            }
            (session_id, token)
        };

        let mut guard = AttemptGuard {
            journal: self.journal.clone(),
            supervisor: self.supervisor.clone(),
            task_id: task_id.to_string(),
            attempt_id: attempt_id.clone(),
            armed: true,
        };
        info!(task_id, attempt_id = %attempt_id, session_id = %session_id, "Resume attempt started");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => AttemptResult::Cancelled {
                reason: if self.supervisor.is_shutting_down() {
                    REASON_SHUTDOWN.to_string()
                } else {
                    REASON_CANCELLED.to_string()
                },
            },
            res = tokio::time::timeout(timeout, self.runner.resume(&session_id, timeout)) => match res {
                Err(_) | Ok(Err(RunnerError::Timeout(_))) => AttemptResult::Failed {
                    reason: REASON_TIMEOUT.to_string(),
                },
                Ok(Ok(ResumeReport::Success)) => AttemptResult::Succeeded,
                Ok(Ok(ResumeReport::Failure(reason))) => AttemptResult::Failed { reason },
                Ok(Err(e)) => AttemptResult::Failed { reason: e.to_string() },
            },
        };

        let _lock = self.journal.lock_task(task_id).await;
        let mut alert_id = None;
        let committed = self
            .journal
            .commit_async(task_id, |registry| {
                alert_id = None;
                let event = match &result {
                    AttemptResult::Succeeded => DomainEvent::ResumeSucceeded {
                        attempt_id: attempt_id.clone(),
                    },
                    AttemptResult::Failed { reason } => DomainEvent::ResumeFailed {
                        attempt_id: attempt_id.clone(),
                        reason: reason.clone(),
                    },
                    AttemptResult::Cancelled { reason } => DomainEvent::ResumeCancelled {
                        attempt_id: attempt_id.clone(),
                        reason: reason.clone(),
                    },
                };
                let mut events = vec![event];
                if let (AttemptResult::Failed { .. }, Some(task)) = (&result, registry.task(task_id)) {
                    if let Some(alert) = self.alerts.evaluate(task, task.resume_failure_count + 1) {
                        if let DomainEvent::ResumeAlertRaised { alert_id: id, .. } = &alert {
                            alert_id = Some(id.clone());
                        }
                        events.push(alert);
                    }
                }
                Ok(events)
            })
            .await;
        if let Err(e) = &committed {
            warn!(task_id, attempt_id = %attempt_id, "Failed to record resume outcome: {}", e);
            let settled = self
                .journal
                .commit_async(task_id, |registry| {
                    Ok(settle_open_attempt(registry, task_id, &attempt_id, REASON_ABANDONED))
                })
                .await;
            // 补写也失败时标记留在投影里，下一次 resume 会先结算它
            if let Err(e) = settled {
                warn!(task_id, attempt_id = %attempt_id, "Failed to settle resume attempt: {}", e);
            }
        }
        guard.disarm();
        committed?;

        let (status, resume_failure_count) = self.journal.read(|registry| {
            registry
                .task(task_id)
                .map(|t| (t.status, t.resume_failure_count))
                .unwrap_or((TaskStatus::Degraded, 0))
        });
        match &result {
            AttemptResult::Succeeded => info!(task_id, attempt_id = %attempt_id, "Resume succeeded"),
            AttemptResult::Failed { reason } => warn!(
                task_id,
                attempt_id = %attempt_id,
                resume_failure_count,
                "Resume failed: {}",
                reason
            ),
            AttemptResult::Cancelled { reason } => {
                info!(task_id, attempt_id = %attempt_id, "Resume cancelled: {}", reason)
            }
        }

        Ok(ResumeOutcome {
            task_id: task_id.to_string(),
            attempt_id,
            result,
            status,
            resume_failure_count,
            alert_id,
        })
    }

    /// 请求取消进行中的 attempt
    pub fn cancel(&self, task_id: &str) -> bool {
        self.supervisor.cancel(task_id)
    }
}
