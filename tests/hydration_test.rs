//! 重启回放集成测试：SQLite 持久化、未决 attempt 结算、损坏 stream、乐观并发、启动扫描

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hydra::config::EngineSettings;
use hydra::core::{
    hydrate, DomainEvent, HydraError, Orchestrator, RecordedEvent, ResumeSweep, TaskStatus,
};
use hydra::profiles::StaticProfiles;
use hydra::runner::{ScriptedResume, ScriptedRunner};
use hydra::storage::{append_domain, EventFilter, EventLog, InMemoryEventLog, SqliteEventLog};
use tokio_util::sync::CancellationToken;

fn profiles() -> Arc<StaticProfiles> {
    Arc::new(StaticProfiles::new([StaticProfiles::minimal("generalist")]))
}

fn boot(log: Arc<dyn EventLog>, runner: ScriptedRunner) -> Orchestrator {
    Orchestrator::bootstrap(EngineSettings::default(), log, profiles(), Arc::new(runner)).unwrap()
}

fn record(stream: &str, seq: u64, event: DomainEvent) -> RecordedEvent {
    let (event_type, payload) = event.encode().unwrap();
    RecordedEvent {
        stream_id: stream.to_string(),
        sequence_no: seq,
        event_type,
        timestamp: Utc::now(),
        payload,
    }
}

fn created() -> DomainEvent {
    DomainEvent::TaskCreated {
        profile_id: "generalist".to_string(),
        brief: "brief".to_string(),
        context_package: None,
        metadata: None,
    }
}

fn running() -> DomainEvent {
    DomainEvent::TaskStatusChanged {
        status: TaskStatus::Running,
        summary: None,
    }
}

fn session(id: &str) -> DomainEvent {
    DomainEvent::SessionStarted {
        session_id: id.to_string(),
        returncode: Some(0),
        output_preview: None,
    }
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hydra.db");

    let task_id = {
        let log: Arc<dyn EventLog> = Arc::new(SqliteEventLog::open(&path).unwrap());
        let orch = boot(
            log,
            ScriptedRunner::new().with_default_resume(ScriptedResume::Fail("exit code 1".into())),
        );
        let task = orch
            .create_task("generalist", "Resume me", None, None)
            .await
            .unwrap();
        orch.start_task(&task.task_id).await.unwrap();
        for _ in 0..3 {
            orch.resume_task(&task.task_id).await.unwrap();
        }
        orch.shutdown(Duration::from_millis(100)).await.unwrap();
        task.task_id
    };

    let log: Arc<dyn EventLog> = Arc::new(SqliteEventLog::open(&path).unwrap());
    let orch = boot(log.clone(), ScriptedRunner::new());
    let snap = orch.task_status(&task_id).unwrap();
    assert_eq!(snap.task.status, TaskStatus::ResumeFailed);
    assert_eq!(snap.task.resume_failure_count, 3);
    assert!(snap.session.is_some());

    let status = orch.status();
    assert!(status.hydration_health.completed);
    assert_eq!(status.active_alert_count, 1);
    assert_eq!(status.most_recent_alert.unwrap().task_id, task_id);

    // 同一份日志回放两次结果一致
    assert_eq!(hydrate(log.as_ref()).unwrap(), hydrate(log.as_ref()).unwrap());

    // 告警仍有效，重启后一次成功解除
    orch.resume_task(&task_id).await.unwrap();
    assert_eq!(orch.status().active_alert_count, 0);
    assert_eq!(orch.task_status(&task_id).unwrap().task.resume_failure_count, 0);
}

#[tokio::test]
async fn test_interrupted_attempt_settled_at_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hydra.db");
    {
        let log = SqliteEventLog::open(&path).unwrap();
        append_domain(
            &log,
            "t1",
            &[
                created(),
                session("s1"),
                running(),
                DomainEvent::ResumeAttempted {
                    attempt_id: "a1".to_string(),
                    session_id: "s1".to_string(),
                },
            ],
            Some(0),
        )
        .unwrap();
    }

    let log: Arc<dyn EventLog> = Arc::new(SqliteEventLog::open(&path).unwrap());
    let orch = boot(log.clone(), ScriptedRunner::new());

    assert_eq!(orch.hydration_report().interrupted_attempts, vec!["t1".to_string()]);
    let cancelled = log
        .read_all(&EventFilter::event_type("ResumeCancelled"))
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].sequence_no, 5);
    assert_eq!(cancelled[0].payload["reason"], "interrupted by restart");

    let snap = orch.task_status("t1").unwrap();
    assert_eq!(snap.task.status, TaskStatus::ResumePending);
    assert!(snap.task.resume_in_flight.is_none());
    assert_eq!(orch.resume_candidates().len(), 1);
}

#[test]
fn test_conflicting_append_leaves_stream_unchanged() {
    let log = InMemoryEventLog::new();
    append_domain(&log, "t1", &[created(), running(), session("s1")], None).unwrap();
    assert_eq!(log.head("t1").unwrap(), 3);

    let err = log
        .append("t1", "TaskStatusChanged", serde_json::json!({"status": "FAILED"}), Some(2))
        .unwrap_err();
    assert!(matches!(
        err,
        HydraError::Conflict {
            expected: 2,
            actual: 3,
            ..
        }
    ));
    assert_eq!(log.read_stream("t1").unwrap().len(), 3);
}

#[test]
fn test_hydrate_reconstructs_running_task() {
    let log = InMemoryEventLog::from_records(vec![
        record("t1", 1, created()),
        record("t1", 2, running()),
        record("t1", 3, session("s1")),
    ]);
    let registry = hydrate(&log).unwrap();
    let task = registry.task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.session_id.as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_degraded_stream_excluded_from_resume() {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::from_records(vec![
        record("t1", 1, created()),
        record("t1", 2, session("s1")),
        record("t1", 4, running()),
        record("t2", 1, created()),
        record("t2", 2, session("s2")),
        record("t2", 3, running()),
    ]));
    let orch = boot(log, ScriptedRunner::new());

    let report = orch.hydration_report();
    assert_eq!(report.degraded_streams, vec!["t1".to_string()]);
    assert_eq!(orch.task_status("t1").unwrap().task.status, TaskStatus::Degraded);

    let candidates: Vec<String> = orch
        .resume_candidates()
        .into_iter()
        .map(|c| c.task_id)
        .collect();
    assert_eq!(candidates, vec!["t2".to_string()]);
    assert!(matches!(
        orch.resume_task("t1").await.unwrap_err(),
        HydraError::NotResumable { .. }
    ));
    assert_eq!(orch.status().counts_by_status.get(&TaskStatus::Degraded), Some(&1));
}

#[tokio::test]
async fn test_startup_sweep_resumes_candidates() {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::from_records(vec![
        record("t1", 1, created()),
        record("t1", 2, session("s1")),
        record("t1", 3, running()),
        record("t2", 1, created()),
        record("t2", 2, session("s2")),
        record("t2", 3, running()),
        record("t3", 1, created()),
    ]));
    let runner = ScriptedRunner::new().with_resume_results([
        ScriptedResume::Succeed,
        ScriptedResume::Fail("exit code 2".into()),
    ]);
    let orch = boot(log, runner);

    let report = ResumeSweep::new(1)
        .run(&orch, &CancellationToken::new())
        .await;
    assert_eq!(report.candidates, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(orch.get_metrics().resume_attempts_total, 2);
}

#[tokio::test]
async fn test_sweep_skips_after_shutdown_requested() {
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::from_records(vec![
        record("t1", 1, created()),
        record("t1", 2, session("s1")),
        record("t1", 3, running()),
    ]));
    let orch = boot(log, ScriptedRunner::new());
    let token = CancellationToken::new();
    token.cancel();

    let report = ResumeSweep::new(2).run(&orch, &token).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(orch.get_metrics().resume_attempts_total, 0);
}
