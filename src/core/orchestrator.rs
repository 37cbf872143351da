//! 编排门面（Orchestrator）
//!
//! 启动时先完整回放日志（`bootstrap` 返回前不接受任何操作），补写上次进程遗留的未决 attempt，
//! 之后所有查询直接读内存注册表，所有变更经 `Journal` 追加事件后再折叠。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::core::alerts::AlertEmitter;
use crate::core::error::{HydraError, Result};
use crate::core::events::DomainEvent;
use crate::core::journal::Journal;
use crate::core::projector::{hydrate, Registry};
use crate::core::recovery::{ResumeCoordinator, ResumeOutcome, REASON_RESTART};
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::{
    AlertRecord, HydrationReport, Metrics, ResumeCandidate, Session, SessionStatus, StatusReport,
    Task, TaskSnapshot, TaskStatus, TaskTimeline, TimelineEntry, Worktree,
};
use crate::profiles::{ProfileError, ProfileRegistry};
use crate::runner::{AgentRunner, SpawnRequest, SpawnResult};
use crate::storage::EventLog;

const TIMELINE_PREVIEW: usize = 5;

/// complete_task 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Completed,
    Failed,
}

impl TaskOutcome {
    fn task_status(self) -> TaskStatus {
        match self {
            TaskOutcome::Completed => TaskStatus::Completed,
            TaskOutcome::Failed => TaskStatus::Failed,
        }
    }

    fn session_status(self) -> SessionStatus {
        match self {
            TaskOutcome::Completed => SessionStatus::Completed,
            TaskOutcome::Failed => SessionStatus::Failed,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_status().as_str())
    }
}

impl FromStr for TaskOutcome {
    type Err = HydraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" => Ok(TaskOutcome::Completed),
            "FAILED" => Ok(TaskOutcome::Failed),
            other => Err(HydraError::Validation(format!(
                "outcome must be COMPLETED or FAILED, got {other}"
            ))),
        }
    }
}

/// start_task 的返回
#[derive(Debug, Clone, Serialize)]
pub struct StartedTask {
    pub task: TaskSnapshot,
    pub spawn_result: SpawnResult,
}

pub struct Orchestrator {
    settings: EngineSettings,
    journal: Arc<Journal>,
    supervisor: Arc<SessionSupervisor>,
    coordinator: ResumeCoordinator,
    alerts: AlertEmitter,
    profiles: Arc<dyn ProfileRegistry>,
    runner: Arc<dyn AgentRunner>,
}

impl Orchestrator {
    /// 回放日志并结算遗留的未决 attempt；返回即代表可以接受操作
    pub fn bootstrap(
        settings: EngineSettings,
        log: Arc<dyn EventLog>,
        profiles: Arc<dyn ProfileRegistry>,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<Self> {
        let registry = hydrate(log.as_ref())?;
        let dangling = registry.dangling_attempts();

        let journal = Arc::new(Journal::new(log, registry, settings.conflict_retries));
        for (task_id, attempt_id) in dangling {
            journal.commit(&task_id, |_| {
                Ok(vec![DomainEvent::ResumeCancelled {
                    attempt_id: attempt_id.clone(),
                    reason: REASON_RESTART.to_string(),
                }])
            })?;
            warn!(task_id = %task_id, attempt_id = %attempt_id, "Settled resume attempt interrupted by restart");
        }

        let supervisor = Arc::new(SessionSupervisor::new());
        let alerts = AlertEmitter::new(settings.alert_threshold);
        let coordinator =
            ResumeCoordinator::new(journal.clone(), supervisor.clone(), runner.clone(), alerts);

        info!(
            runner = runner.name(),
            alert_threshold = alerts.threshold(),
            "Orchestrator ready"
        );
        Ok(Self {
            settings,
            journal,
            supervisor,
            coordinator,
            alerts,
            profiles,
            runner,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn create_task(
        &self,
        profile_id: &str,
        brief: &str,
        context_package: Option<Value>,
        metadata: Option<Value>,
    ) -> Result<Task> {
        if brief.trim().is_empty() {
            return Err(HydraError::Validation("brief must not be empty".to_string()));
        }
        match self.profiles.get(profile_id) {
            Ok(_) => {}
            Err(ProfileError::NotFound(id)) => {
                return Err(HydraError::Validation(format!("unknown profile '{id}'")))
            }
            Err(e) => return Err(e.into()),
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let _lock = self.journal.lock_task(&task_id).await;
        let created = DomainEvent::TaskCreated {
            profile_id: profile_id.to_string(),
            brief: brief.to_string(),
            context_package,
            metadata,
        };
        self.journal.commit_async(&task_id, |registry| {
            if registry.task(&task_id).is_some() {
                return Err(HydraError::Validation(format!("task {task_id} already exists")));
            }
            Ok(vec![created.clone()])
        })
        .await?;

        info!(task_id = %task_id, profile_id, "Task created");
        self.journal
            .read(|r| r.task(&task_id).cloned())
            .ok_or(HydraError::NotFound(task_id))
    }

    pub async fn start_task(&self, task_id: &str) -> Result<StartedTask> {
        let _lock = self.journal.lock_task(task_id).await;
        let task = self.journal.read(|r| {
            let task = r
                .task(task_id)
                .cloned()
                .ok_or_else(|| HydraError::NotFound(task_id.to_string()))?;
            check_startable(&task)?;
            Ok::<_, HydraError>(task)
        })?;

        let profile = self.profiles.get(&task.profile_id)?;
        let request = SpawnRequest {
            profile,
            brief: task.brief.clone(),
            inputs: task.context_package.clone(),
            flags: Vec::new(),
        };
        let spawn_timeout = self.settings.spawn_timeout;
        let spawn_result = tokio::time::timeout(spawn_timeout, self.runner.spawn(request, spawn_timeout))
            .await
            .map_err(|_| HydraError::Timeout(format!("spawn for task {task_id}")))??;

        self.journal.commit_async(task_id, |r| {
            let task = r
                .task(task_id)
                .ok_or_else(|| HydraError::NotFound(task_id.to_string()))?;
            check_startable(task)?;
            Ok(vec![
                DomainEvent::SessionStarted {
                    session_id: spawn_result.session_id.clone(),
                    returncode: Some(spawn_result.returncode),
                    output_preview: Some(spawn_result.output_preview.clone()),
                },
                DomainEvent::TaskStatusChanged {
                    status: TaskStatus::Running,
                    summary: None,
                },
            ])
        })
        .await?;

        info!(task_id, session_id = %spawn_result.session_id, "Task started");
        Ok(StartedTask {
            task: self.task_status(task_id)?,
            spawn_result,
        })
    }

    pub fn task_status(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.journal
            .read(|r| r.snapshot(task_id))
            .ok_or_else(|| HydraError::NotFound(task_id.to_string()))
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        summary: Option<String>,
    ) -> Result<TaskSnapshot> {
        let _lock = self.journal.lock_task(task_id).await;
        if self.supervisor.is_in_flight(task_id) {
            return Err(HydraError::ResumeBusy(task_id.to_string()));
        }
        self.journal.commit_async(task_id, |r| {
            let task = r
                .task(task_id)
                .ok_or_else(|| HydraError::NotFound(task_id.to_string()))?;
            check_not_closed(task)?;
            let mut events = Vec::new();
            if let Some(session) = open_session(r, task) {
                events.push(DomainEvent::SessionEnded {
                    session_id: session.session_id.clone(),
                    status: outcome.session_status(),
                    reason: summary.clone(),
                });
            }
            events.push(DomainEvent::TaskStatusChanged {
                status: outcome.task_status(),
                summary: summary.clone(),
            });
            Ok(events)
        })
        .await?;

        info!(task_id, %outcome, "Task closed");
        self.task_status(task_id)
    }

    /// 终止任务：通知 runner 终止当前会话，任务置为 FAILED
    pub async fn terminate_task(&self, task_id: &str, reason: &str) -> Result<TaskSnapshot> {
        let _lock = self.journal.lock_task(task_id).await;
        if self.supervisor.is_in_flight(task_id) {
            return Err(HydraError::ResumeBusy(task_id.to_string()));
        }
        let session_id = self.journal.read(|r| {
            let task = r
                .task(task_id)
                .ok_or_else(|| HydraError::NotFound(task_id.to_string()))?;
            check_not_closed(task)?;
            Ok::<_, HydraError>(open_session(r, task).map(|s| s.session_id.clone()))
        })?;

        if let Some(session_id) = &session_id {
            if let Err(e) = self
                .runner
                .terminate(session_id, reason, self.settings.spawn_timeout)
                .await
            {
                warn!(task_id, session_id = %session_id, "Runner terminate failed: {}", e);
            }
        }

        self.journal.commit_async(task_id, |r| {
            let task = r
                .task(task_id)
                .ok_or_else(|| HydraError::NotFound(task_id.to_string()))?;
            check_not_closed(task)?;
            let mut events = Vec::new();
            if let Some(session) = open_session(r, task) {
                events.push(DomainEvent::SessionEnded {
                    session_id: session.session_id.clone(),
                    status: SessionStatus::Terminated,
                    reason: Some(reason.to_string()),
                });
            }
            events.push(DomainEvent::TaskStatusChanged {
                status: TaskStatus::Failed,
                summary: Some(reason.to_string()),
            });
            Ok(events)
        })
        .await?;

        info!(task_id, reason, "Task terminated");
        self.task_status(task_id)
    }

    pub async fn register_worktree(
        &self,
        task_id: &str,
        path: &str,
        branch: Option<String>,
    ) -> Result<Worktree> {
        if path.trim().is_empty() {
            return Err(HydraError::Validation("worktree path must not be empty".to_string()));
        }
        let worktree_id = uuid::Uuid::new_v4().to_string();
        let _lock = self.journal.lock_task(task_id).await;
        self.journal.commit_async(task_id, |r| {
            let task = r
                .task(task_id)
                .ok_or_else(|| HydraError::NotFound(task_id.to_string()))?;
            if task.status == TaskStatus::Degraded {
                return Err(HydraError::invalid_transition(task_id, "task is DEGRADED"));
            }
            Ok(vec![DomainEvent::WorktreeRegistered {
                worktree_id: worktree_id.clone(),
                path: path.to_string(),
                branch: branch.clone(),
                status: "registered".to_string(),
            }])
        })
        .await?;

        self.journal
            .read(|r| r.worktrees().find(|w| w.worktree_id == worktree_id).cloned())
            .ok_or(HydraError::NotFound(worktree_id))
    }

    pub async fn resume_task(&self, task_id: &str) -> Result<ResumeOutcome> {
        self.resume_task_with_timeout(task_id, self.settings.resume_timeout)
            .await
    }

    pub async fn resume_task_with_timeout(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<ResumeOutcome> {
        self.coordinator.resume(task_id, timeout).await
    }

    /// 请求取消进行中的 resume；没有进行中的 attempt 时返回 false
    pub fn cancel_resume(&self, task_id: &str) -> bool {
        self.coordinator.cancel(task_id)
    }

    /// 只读内存状态，不做 I/O
    pub fn status(&self) -> StatusReport {
        self.journal.read(|r| StatusReport {
            tasks_total: r.tasks().count(),
            counts_by_status: r.counts_by_status(),
            active_alert_count: self.alerts.active_alert_count(r),
            most_recent_alert: self.alerts.most_recent_alert(r),
            alert_threshold: self.alerts.threshold(),
            hydration_health: r.report().clone(),
        })
    }

    pub fn list_alerts(&self, task_id: Option<&str>, limit: usize) -> Vec<AlertRecord> {
        self.journal
            .read(|r| self.alerts.list_alerts(r, task_id, limit))
    }

    pub fn get_metrics(&self) -> Metrics {
        self.journal.read(Registry::metrics)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.journal.read(|r| {
            r.tasks()
                .filter(|t| status.map_or(true, |s| t.status == s))
                .cloned()
                .collect()
        })
    }

    pub fn list_sessions(&self, task_id: Option<&str>) -> Vec<Session> {
        self.journal.read(|r| {
            r.sessions()
                .filter(|s| task_id.map_or(true, |id| s.task_id == id))
                .cloned()
                .collect()
        })
    }

    pub fn list_worktrees(&self, task_id: Option<&str>) -> Vec<Worktree> {
        self.journal.read(|r| {
            r.worktrees()
                .filter(|w| task_id.map_or(true, |id| w.task_id == id))
                .cloned()
                .collect()
        })
    }

    /// 任务事件时间线；`full = false` 时只返回前 5 条
    pub fn task_timeline(&self, task_id: &str, full: bool) -> Result<TaskTimeline> {
        let events = self.journal.log().read_stream(task_id)?;
        if events.is_empty() {
            return Err(HydraError::NotFound(task_id.to_string()));
        }
        let entries: Vec<TimelineEntry> = events
            .into_iter()
            .map(|e| TimelineEntry {
                sequence_no: e.sequence_no,
                event_type: e.event_type,
                timestamp: e.timestamp,
                payload: e.payload,
            })
            .collect();
        let event_count = entries.len();
        let latest_event = entries.last().cloned();
        let timeline = if full {
            entries
        } else {
            entries.into_iter().take(TIMELINE_PREVIEW).collect()
        };
        Ok(TaskTimeline {
            task_id: task_id.to_string(),
            event_count,
            latest_event,
            timeline,
        })
    }

    pub fn resume_candidates(&self) -> Vec<ResumeCandidate> {
        let candidates = self.journal.read(Registry::resume_candidates);
        candidates
            .into_iter()
            .filter(|c| !self.supervisor.is_in_flight(&c.task_id))
            .collect()
    }

    pub fn hydration_report(&self) -> HydrationReport {
        self.journal.read(|r| r.report().clone())
    }

    pub fn counts_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        self.journal.read(Registry::counts_by_status)
    }

    pub fn in_flight_count(&self) -> usize {
        self.supervisor.in_flight_count()
    }

    /// 取消所有进行中的 attempt，等待其结果落盘后 flush 日志
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.supervisor.cancel_all();
        let deadline = tokio::time::Instant::now() + grace;
        while self.supervisor.in_flight_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.supervisor.in_flight_count();
        if remaining > 0 {
            warn!(remaining, "Resume attempts still in flight at shutdown");
        }
        let log = Arc::clone(self.journal.log());
        tokio::task::spawn_blocking(move || log.flush()).await??;
        info!("Orchestrator shut down");
        Ok(())
    }
}

fn check_startable(task: &Task) -> Result<()> {
    match task.status {
        TaskStatus::Created => Ok(()),
        TaskStatus::Running => Err(HydraError::AlreadyRunning(task.task_id.clone())),
        other => Err(HydraError::invalid_transition(
            &task.task_id,
            format!("cannot start from {other}"),
        )),
    }
}

fn check_not_closed(task: &Task) -> Result<()> {
    if task.status.is_terminal() || task.status == TaskStatus::Degraded {
        return Err(HydraError::invalid_transition(
            &task.task_id,
            format!("task is already {}", task.status),
        ));
    }
    Ok(())
}

fn open_session<'a>(registry: &'a Registry, task: &Task) -> Option<&'a Session> {
    task.session_id
        .as_deref()
        .and_then(|id| registry.session(id))
        .filter(|s| s.status == SessionStatus::Active)
}
