//! 状态投影 / 回放引擎
//!
//! `Registry` 是所有聚合的唯一内存来源：事件经 `apply` 逐条折叠进来，`hydrate` 从空状态
//! 按序回放每个 stream。折叠只使用事件自身的时间戳与 payload，因此同一份日志回放两次结果完全一致。
//!
//! 单个 stream 出现序号缺口、payload 无法解析、或在 TaskCreated 之前出现其它事件时，
//! 只有该 stream 停止折叠并把任务标记为 DEGRADED，其余 stream 继续回放。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::error::{HydraError, Result};
use crate::core::events::{DomainEvent, EventType, RecordedEvent};
use crate::core::state::{
    AlertRecord, HydrationReport, Metrics, ResumeCandidate, Session, SessionStatus, Task,
    TaskSnapshot, TaskStatus, Worktree,
};
use crate::storage::EventLog;

/// 单条事件的折叠结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Folded(EventType),
    /// 未知事件类型：只推进 head，不改变聚合
    Skipped,
}

/// 内存注册表：由 `hydrate()` 构建，归 Orchestrator 所有
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    tasks: BTreeMap<String, Task>,
    heads: BTreeMap<String, u64>,
    sessions: BTreeMap<String, Session>,
    worktrees: BTreeMap<String, Worktree>,
    alerts: Vec<AlertRecord>,
    report: HydrationReport,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某 stream 已折叠的最后序号（未知 stream 为 0）
    pub fn head(&self, stream_id: &str) -> u64 {
        self.heads.get(stream_id).copied().unwrap_or(0)
    }

    /// 回放计数只统计 `hydrate` 期间；之后的提交与冲突重读不再计入
    fn replaying(&self) -> bool {
        !self.report.completed
    }

    /// 折叠一条事件
    pub fn apply(&mut self, event: &RecordedEvent) -> Result<Applied> {
        let stream_id = event.stream_id.as_str();
        let expected = self.head(stream_id) + 1;
        if event.sequence_no != expected {
            return Err(HydraError::corruption(
                stream_id,
                event.sequence_no,
                format!("sequence gap: expected {expected}"),
            ));
        }

        let decoded = event
            .decode()
            .map_err(|e| HydraError::corruption(stream_id, event.sequence_no, e.to_string()))?;

        let Some(domain) = decoded else {
            warn!(
                stream_id,
                sequence_no = event.sequence_no,
                event_type = %event.event_type,
                "Skipping unknown event type during replay"
            );
            if self.replaying() {
                self.report.unknown_events_skipped += 1;
                self.report.warnings.push(format!(
                    "skipped unknown event type {} at {}#{}",
                    event.event_type, stream_id, event.sequence_no
                ));
            }
            self.heads.insert(stream_id.to_string(), event.sequence_no);
            return Ok(Applied::Skipped);
        };

        let event_type = domain.event_type();
        self.fold(event, domain)?;
        self.heads.insert(stream_id.to_string(), event.sequence_no);
        if self.replaying() {
            self.report.events_applied += 1;
        }
        debug!(stream_id, sequence_no = event.sequence_no, %event_type, "applied event");
        Ok(Applied::Folded(event_type))
    }

    fn fold(&mut self, event: &RecordedEvent, domain: DomainEvent) -> Result<()> {
        let at = event.timestamp;
        let stream_id = event.stream_id.as_str();

        let task = match self.tasks.get_mut(stream_id) {
            Some(task) => task,
            None => return self.fold_created(event, domain),
        };
        task.updated_at = at;

        match domain {
            DomainEvent::TaskCreated { .. } => {
                return Err(HydraError::corruption(
                    stream_id,
                    event.sequence_no,
                    "duplicate TaskCreated",
                ))
            }
            DomainEvent::TaskStatusChanged { status, summary } => {
                task.status = status;
                if summary.is_some() {
                    task.summary = summary;
                }
            }
            DomainEvent::SessionStarted {
                session_id,
                returncode,
                ..
            } => {
                task.session_id = Some(session_id.clone());
                self.sessions.insert(
                    session_id.clone(),
                    Session {
                        session_id,
                        task_id: stream_id.to_string(),
                        status: SessionStatus::Active,
                        started_at: at,
                        ended_at: None,
                        reason: None,
                        returncode,
                    },
                );
            }
            DomainEvent::SessionEnded {
                session_id,
                status,
                reason,
            } => match self.sessions.get_mut(&session_id) {
                Some(session) if session.task_id == stream_id => {
                    session.status = status;
                    session.ended_at = Some(at);
                    session.reason = reason;
                }
                _ => {
                    return Err(HydraError::corruption(
                        stream_id,
                        event.sequence_no,
                        format!("SessionEnded for unknown session {session_id}"),
                    ))
                }
            },
            DomainEvent::WorktreeRegistered {
                worktree_id,
                path,
                branch,
                status,
            } => {
                task.worktree_id = Some(worktree_id.clone());
                self.worktrees.insert(
                    worktree_id.clone(),
                    Worktree {
                        worktree_id,
                        task_id: stream_id.to_string(),
                        path,
                        branch,
                        status,
                        registered_at: at,
                    },
                );
            }
            DomainEvent::ResumeAttempted { attempt_id, .. } => {
                task.resume_in_flight = Some(attempt_id);
                task.last_resume_attempt_at = Some(at);
                task.resume_attempts_total += 1;
            }
            DomainEvent::ResumeSucceeded { .. } => {
                task.resume_in_flight = None;
                task.resume_failure_count = 0;
                task.active_alert_id = None;
                task.status = TaskStatus::Running;
            }
            DomainEvent::ResumeFailed { .. } => {
                task.resume_in_flight = None;
                task.resume_failure_count += 1;
                task.resume_failures_total += 1;
                task.status = if task.active_alert_id.is_some() {
                    TaskStatus::ResumeFailed
                } else {
                    TaskStatus::ResumePending
                };
            }
            DomainEvent::ResumeCancelled { .. } => {
                task.resume_in_flight = None;
                // 取消不计失败，也不解除告警
                task.status = if task.active_alert_id.is_some() {
                    TaskStatus::ResumeFailed
                } else {
                    TaskStatus::ResumePending
                };
            }
            DomainEvent::ResumeAlertRaised {
                alert_id,
                failure_count,
                threshold,
                session_id,
            } => {
                task.last_alert_id = Some(alert_id.clone());
                task.active_alert_id = Some(alert_id.clone());
                task.status = TaskStatus::ResumeFailed;
                self.alerts.push(AlertRecord {
                    alert_id,
                    task_id: stream_id.to_string(),
                    session_id,
                    failure_count_at_alert: failure_count,
                    threshold,
                    created_at: at,
                    sequence_no: event.sequence_no,
                });
            }
        }
        Ok(())
    }

    /// stream 的第一条有效事件必须是 `TaskCreated`
    fn fold_created(&mut self, event: &RecordedEvent, domain: DomainEvent) -> Result<()> {
        let stream_id = event.stream_id.as_str();
        let event_type = domain.event_type();
        let DomainEvent::TaskCreated {
            profile_id,
            brief,
            context_package,
            metadata,
        } = domain
        else {
            return Err(HydraError::corruption(
                stream_id,
                event.sequence_no,
                format!("{event_type} before TaskCreated"),
            ));
        };
        let mut task = Task::degraded_placeholder(stream_id, event.timestamp);
        task.profile_id = profile_id;
        task.brief = brief;
        task.context_package = context_package;
        task.metadata = metadata;
        task.status = TaskStatus::Created;
        self.tasks.insert(stream_id.to_string(), task);
        Ok(())
    }

    /// 把 stream 标记为损坏：已有任务置 DEGRADED，否则插入占位任务
    pub fn mark_degraded(&mut self, stream_id: &str, detail: &str, at: DateTime<Utc>) {
        warn!(stream_id, detail, "Stream marked DEGRADED");
        let task = self
            .tasks
            .entry(stream_id.to_string())
            .or_insert_with(|| Task::degraded_placeholder(stream_id, at));
        task.status = TaskStatus::Degraded;
        task.resume_in_flight = None;
        if !self.report.degraded_streams.iter().any(|s| s == stream_id) {
            self.report.degraded_streams.push(stream_id.to_string());
        }
        self.report
            .warnings
            .push(format!("stream {stream_id} degraded: {detail}"));
    }

    /// 丢弃某 stream 的全部投影并用给定事件重新折叠（冲突后重读）
    pub fn refold_stream(&mut self, stream_id: &str, events: &[RecordedEvent]) -> Result<()> {
        self.tasks.remove(stream_id);
        self.heads.remove(stream_id);
        self.sessions.retain(|_, s| s.task_id != stream_id);
        self.worktrees.retain(|_, w| w.task_id != stream_id);
        self.alerts.retain(|a| a.task_id != stream_id);
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    pub fn report(&self) -> &HydrationReport {
        &self.report
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn worktrees(&self) -> impl Iterator<Item = &Worktree> {
        self.worktrees.values()
    }

    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        let task = self.tasks.get(task_id)?;
        Some(TaskSnapshot {
            session: task
                .session_id
                .as_ref()
                .and_then(|id| self.sessions.get(id))
                .cloned(),
            worktree: task
                .worktree_id
                .as_ref()
                .and_then(|id| self.worktrees.get(id))
                .cloned(),
            most_recent_alert: self.alerts_newest_first(Some(task_id)).next().cloned(),
            task: task.clone(),
        })
    }

    /// 告警历史，按创建时间倒序
    pub fn alerts_newest_first<'a>(
        &'a self,
        task_id: Option<&'a str>,
    ) -> impl Iterator<Item = &'a AlertRecord> + 'a {
        let mut alerts: Vec<&AlertRecord> = self
            .alerts
            .iter()
            .filter(|a| task_id.map_or(true, |id| a.task_id == id))
            .collect();
        alerts.sort_by(|a, b| {
            (b.created_at, &b.task_id, b.sequence_no).cmp(&(a.created_at, &a.task_id, a.sequence_no))
        });
        alerts.into_iter()
    }

    pub fn active_alert_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.active_alert_id.is_some())
            .count()
    }

    pub fn most_recent_alert(&self) -> Option<&AlertRecord> {
        self.alerts_newest_first(None).next()
    }

    pub fn counts_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            task_count_by_status: self.counts_by_status(),
            active_alert_count: self.active_alert_count(),
            resume_attempts_total: self.tasks.values().map(|t| t.resume_attempts_total).sum(),
            resume_failures_total: self.tasks.values().map(|t| t.resume_failures_total).sum(),
        }
    }

    /// 可自动 resume 的任务：RUNNING / RESUME_PENDING，且无未决 attempt
    pub fn resume_candidates(&self) -> Vec<ResumeCandidate> {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Running | TaskStatus::ResumePending))
            .filter(|t| t.resume_in_flight.is_none() && t.session_id.is_some())
            .map(|t| ResumeCandidate {
                task_id: t.task_id.clone(),
                status: t.status,
                resume_failure_count: t.resume_failure_count,
                last_resume_attempt_at: t.last_resume_attempt_at,
            })
            .collect()
    }

    /// 回放结束时仍有未决 attempt 的 (task_id, attempt_id)
    pub fn dangling_attempts(&self) -> Vec<(String, String)> {
        self.tasks
            .values()
            .filter_map(|t| {
                t.resume_in_flight
                    .as_ref()
                    .map(|attempt| (t.task_id.clone(), attempt.clone()))
            })
            .collect()
    }
}

/// 从空状态回放整个日志；单个 stream 损坏不会中断其它 stream
pub fn hydrate(log: &dyn EventLog) -> Result<Registry> {
    let mut registry = Registry::new();

    for stream_id in log.stream_ids()? {
        registry.report.streams_replayed += 1;
        let events = match log.read_stream(&stream_id) {
            Ok(events) => events,
            Err(err @ HydraError::Corruption { .. }) => {
                registry.mark_degraded(&stream_id, &err.to_string(), DateTime::<Utc>::default());
                continue;
            }
            Err(err) => return Err(err),
        };
        for event in &events {
            if let Err(err) = registry.apply(event) {
                registry.mark_degraded(&stream_id, &err.to_string(), event.timestamp);
                break;
            }
        }
    }

    registry.report.interrupted_attempts = registry
        .dangling_attempts()
        .into_iter()
        .map(|(task_id, _)| task_id)
        .collect();
    registry.report.completed = true;

    info!(
        streams = registry.report.streams_replayed,
        events = registry.report.events_applied,
        skipped = registry.report.unknown_events_skipped,
        degraded = registry.report.degraded_streams.len(),
        "Hydration completed"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    use crate::storage::InMemoryEventLog;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(stream: &str, seq: u64, event: DomainEvent) -> RecordedEvent {
        let (event_type, payload) = event.encode().unwrap();
        RecordedEvent {
            stream_id: stream.to_string(),
            sequence_no: seq,
            event_type,
            timestamp: at(seq as i64),
            payload,
        }
    }

    fn created() -> DomainEvent {
        DomainEvent::TaskCreated {
            profile_id: "generalist".to_string(),
            brief: "Resume me".to_string(),
            context_package: None,
            metadata: None,
        }
    }

    fn failed(n: u32) -> DomainEvent {
        DomainEvent::ResumeFailed {
            attempt_id: format!("a{n}"),
            reason: "exit code 1".to_string(),
        }
    }

    #[test]
    fn test_hydrate_reconstructs_running_task() {
        let log = InMemoryEventLog::from_records(vec![
            record("t1", 1, created()),
            record(
                "t1",
                2,
                DomainEvent::TaskStatusChanged {
                    status: TaskStatus::Running,
                    summary: None,
                },
            ),
            record(
                "t1",
                3,
                DomainEvent::SessionStarted {
                    session_id: "s1".to_string(),
                    returncode: Some(0),
                    output_preview: None,
                },
            ),
        ]);

        let registry = hydrate(&log).unwrap();
        let task = registry.task("t1").unwrap();
        assert_eq!(task.task_id, "t1");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.session_id.as_deref(), Some("s1"));
        assert_eq!(registry.head("t1"), 3);
        assert!(registry.report().completed);
    }

    #[test]
    fn test_hydrate_is_deterministic() {
        let log = InMemoryEventLog::from_records(vec![
            record("t1", 1, created()),
            record("t1", 2, failed(1)),
            record("t2", 1, created()),
            record("t1", 3, failed(2)),
        ]);
        let first = hydrate(&log).unwrap();
        let second = hydrate(&log).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.snapshot("t1"), second.snapshot("t1"));
    }

    #[test]
    fn test_alert_raised_and_resolved_by_success() {
        let mut registry = Registry::new();
        registry.apply(&record("t1", 1, created())).unwrap();
        for seq in 2..=4 {
            registry.apply(&record("t1", seq, failed(seq as u32))).unwrap();
        }
        registry
            .apply(&record(
                "t1",
                5,
                DomainEvent::ResumeAlertRaised {
                    alert_id: "al-1".to_string(),
                    failure_count: 3,
                    threshold: 3,
                    session_id: None,
                },
            ))
            .unwrap();
        assert_eq!(registry.active_alert_count(), 1);
        assert_eq!(registry.task("t1").unwrap().status, TaskStatus::ResumeFailed);

        registry
            .apply(&record(
                "t1",
                6,
                DomainEvent::ResumeSucceeded {
                    attempt_id: "a5".to_string(),
                },
            ))
            .unwrap();
        let task = registry.task("t1").unwrap();
        assert_eq!(task.resume_failure_count, 0);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(registry.active_alert_count(), 0);
        // 历史告警保留
        assert_eq!(registry.alerts_newest_first(Some("t1")).count(), 1);
        assert_eq!(task.last_alert_id.as_deref(), Some("al-1"));
    }

    #[test]
    fn test_unknown_event_skipped_with_warning() {
        let mut unknown = record("t1", 2, created());
        unknown.event_type = "TaskArchived".to_string();
        unknown.payload = json!({"why": "future"});
        let log = InMemoryEventLog::from_records(vec![
            record("t1", 1, created()),
            unknown,
            record("t1", 3, failed(1)),
        ]);
        let registry = hydrate(&log).unwrap();
        assert_eq!(registry.report().unknown_events_skipped, 1);
        assert_eq!(registry.report().warnings.len(), 1);
        assert_eq!(registry.task("t1").unwrap().resume_failure_count, 1);
        assert_eq!(registry.head("t1"), 3);
    }

    #[test]
    fn test_sequence_gap_degrades_only_that_stream() {
        let log = InMemoryEventLog::from_records(vec![
            record("t1", 1, created()),
            record("t1", 3, failed(1)),
            record("t2", 1, created()),
            record("t2", 2, failed(1)),
        ]);
        let registry = hydrate(&log).unwrap();
        assert_eq!(registry.task("t1").unwrap().status, TaskStatus::Degraded);
        assert_eq!(registry.report().degraded_streams, vec!["t1".to_string()]);
        let t2 = registry.task("t2").unwrap();
        assert_eq!(t2.status, TaskStatus::ResumePending);
        assert_eq!(t2.resume_failure_count, 1);
    }

    #[test]
    fn test_bad_payload_on_first_event_yields_placeholder() {
        let mut broken = record("t1", 1, created());
        broken.payload = json!({"brief": 42});
        let log = InMemoryEventLog::from_records(vec![broken]);
        let registry = hydrate(&log).unwrap();
        let task = registry.task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Degraded);
        assert!(task.profile_id.is_empty());
    }

    #[test]
    fn test_event_before_task_created_is_corruption() {
        let mut registry = Registry::new();
        let err = registry.apply(&record("t1", 1, failed(1))).unwrap_err();
        assert!(matches!(err, HydraError::Corruption { .. }));
    }

    #[test]
    fn test_dangling_attempt_reported() {
        let log = InMemoryEventLog::from_records(vec![
            record("t1", 1, created()),
            record(
                "t1",
                2,
                DomainEvent::ResumeAttempted {
                    attempt_id: "a1".to_string(),
                    session_id: "s1".to_string(),
                },
            ),
        ]);
        let registry = hydrate(&log).unwrap();
        assert_eq!(registry.report().interrupted_attempts, vec!["t1".to_string()]);
        assert_eq!(registry.metrics().resume_attempts_total, 1);
    }

    #[test]
    fn test_refold_stream_replaces_projection() {
        let mut registry = Registry::new();
        registry.apply(&record("t1", 1, created())).unwrap();
        registry.apply(&record("t1", 2, failed(1))).unwrap();

        let fresh = vec![record("t1", 1, created())];
        registry.refold_stream("t1", &fresh).unwrap();
        assert_eq!(registry.head("t1"), 1);
        assert_eq!(registry.task("t1").unwrap().resume_failure_count, 0);
    }

    #[test]
    fn test_cancel_keeps_alerted_task_failed() {
        let mut registry = Registry::new();
        registry.apply(&record("t1", 1, created())).unwrap();
        registry.apply(&record("t1", 2, failed(1))).unwrap();
        registry
            .apply(&record(
                "t1",
                3,
                DomainEvent::ResumeAlertRaised {
                    alert_id: "al-1".to_string(),
                    failure_count: 1,
                    threshold: 1,
                    session_id: None,
                },
            ))
            .unwrap();
        for (seq, event) in [
            (
                4,
                DomainEvent::ResumeAttempted {
                    attempt_id: "a2".to_string(),
                    session_id: "s1".to_string(),
                },
            ),
            (
                5,
                DomainEvent::ResumeCancelled {
                    attempt_id: "a2".to_string(),
                    reason: "cancelled by caller".to_string(),
                },
            ),
        ] {
            registry.apply(&record("t1", seq, event)).unwrap();
        }

        let task = registry.task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::ResumeFailed);
        assert_eq!(task.resume_failure_count, 1);
        assert!(task.resume_in_flight.is_none());
        assert_eq!(registry.active_alert_count(), 1);
    }

    #[test]
    fn test_duplicate_task_created_is_corruption() {
        let mut registry = Registry::new();
        registry.apply(&record("t1", 1, created())).unwrap();
        let err = registry.apply(&record("t1", 2, created())).unwrap_err();
        assert!(matches!(err, HydraError::Corruption { sequence_no: 2, .. }));
    }

    #[test]
    fn test_runtime_refold_keeps_replay_counters() {
        let log = InMemoryEventLog::from_records(vec![
            record("t1", 1, created()),
            record("t1", 2, failed(1)),
        ]);
        let mut registry = hydrate(&log).unwrap();
        let replayed = registry.report().clone();
        assert_eq!(replayed.events_applied, 2);

        registry.apply(&record("t1", 3, failed(2))).unwrap();
        let fresh = vec![
            record("t1", 1, created()),
            record("t1", 2, failed(1)),
            record("t1", 3, failed(2)),
        ];
        registry.refold_stream("t1", &fresh).unwrap();

        assert_eq!(registry.task("t1").unwrap().resume_failure_count, 2);
        assert_eq!(registry.report(), &replayed);
    }
}
