//! 提交路径：事件先落盘，再折叠进内存注册表
//!
//! 每个任务一把异步锁（按 task_id 懒创建，空闲后回收），同一任务的变更串行执行，
//! 不同任务互不阻塞。追加时总是带上 expected = 当前 head；冲突时从日志重读该 stream 并有限次重试。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::core::error::{HydraError, Result};
use crate::core::events::{DomainEvent, RecordedEvent};
use crate::core::projector::Registry;
use crate::storage::{append_domain, EventLog};

type TaskLock = tokio::sync::Mutex<()>;

pub struct Journal {
    log: Arc<dyn EventLog>,
    registry: RwLock<Registry>,
    locks: Mutex<HashMap<String, Weak<TaskLock>>>,
    conflict_retries: u32,
}

impl Journal {
    pub fn new(log: Arc<dyn EventLog>, registry: Registry, conflict_retries: u32) -> Self {
        Self {
            log,
            registry: RwLock::new(registry),
            locks: Mutex::new(HashMap::new()),
            conflict_retries,
        }
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// 获取任务锁；持有期间同一任务的其它变更等待
    pub async fn lock_task(&self, task_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(task_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(TaskLock::new(()));
                    locks.insert(task_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// 只读访问注册表
    pub fn read<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f(&registry)
    }

    /// 由当前投影生成事件并追加到 `task_id` 的 stream（同步版本，供回放结算与 Drop 使用）
    ///
    /// `build` 在每次重试前都会基于最新投影重新调用；返回空列表表示无需写入。
    pub fn commit<F>(&self, task_id: &str, mut build: F) -> Result<Vec<RecordedEvent>>
    where
        F: FnMut(&Registry) -> Result<Vec<DomainEvent>>,
    {
        let mut attempt = 0;
        loop {
            let Some((head, events)) = self.prepare(task_id, &mut build)? else {
                return Ok(Vec::new());
            };
            let appended = append_domain(self.log.as_ref(), task_id, &events, Some(head));
            if let Some(recorded) = self.settle(task_id, appended, &mut attempt)? {
                return Ok(recorded);
            }
            let events = self.log.read_stream(task_id)?;
            self.refold(task_id, &events);
        }
    }

    /// 异步版本：fsync 追加与冲突重读放到 blocking 线程池，不占用 runtime 的 worker
    pub async fn commit_async<F>(&self, task_id: &str, mut build: F) -> Result<Vec<RecordedEvent>>
    where
        F: FnMut(&Registry) -> Result<Vec<DomainEvent>>,
    {
        let mut attempt = 0;
        loop {
            let Some((head, events)) = self.prepare(task_id, &mut build)? else {
                return Ok(Vec::new());
            };
            let log = Arc::clone(&self.log);
            let stream_id = task_id.to_string();
            let appended = tokio::task::spawn_blocking(move || {
                append_domain(log.as_ref(), &stream_id, &events, Some(head))
            })
            .await?;
            if let Some(recorded) = self.settle(task_id, appended, &mut attempt)? {
                return Ok(recorded);
            }
            let log = Arc::clone(&self.log);
            let stream_id = task_id.to_string();
            let events = tokio::task::spawn_blocking(move || log.read_stream(&stream_id)).await??;
            self.refold(task_id, &events);
        }
    }

    fn prepare<F>(&self, task_id: &str, build: &mut F) -> Result<Option<(u64, Vec<DomainEvent>)>>
    where
        F: FnMut(&Registry) -> Result<Vec<DomainEvent>>,
    {
        let (head, events) = self.read(|registry| {
            build(registry).map(|events| (registry.head(task_id), events))
        })?;
        Ok((!events.is_empty()).then_some((head, events)))
    }

    /// 成功则折叠并返回；可重试的冲突返回 `None`，由调用方重读 stream
    fn settle(
        &self,
        task_id: &str,
        appended: Result<Vec<RecordedEvent>>,
        attempt: &mut u32,
    ) -> Result<Option<Vec<RecordedEvent>>> {
        match appended {
            Ok(recorded) => {
                self.fold(task_id, &recorded);
                Ok(Some(recorded))
            }
            Err(err) if err.is_conflict() && *attempt < self.conflict_retries => {
                *attempt += 1;
                warn!(task_id, attempt = *attempt, "Append conflict, rereading stream: {}", err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn fold(&self, task_id: &str, recorded: &[RecordedEvent]) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        for event in recorded {
            if let Err(err) = registry.apply(event) {
                registry.mark_degraded(task_id, &err.to_string(), event.timestamp);
                break;
            }
        }
    }

    /// 丢弃 stream 投影并用日志中的事件重新折叠
    fn refold(&self, task_id: &str, events: &[RecordedEvent]) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Err(err @ HydraError::Corruption { .. }) = registry.refold_stream(task_id, events) {
            let at = events.last().map(|e| e.timestamp).unwrap_or_default();
            registry.mark_degraded(task_id, &err.to_string(), at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::TaskStatus;
    use crate::storage::InMemoryEventLog;

    fn created() -> DomainEvent {
        DomainEvent::TaskCreated {
            profile_id: "generalist".to_string(),
            brief: "b".to_string(),
            context_package: None,
            metadata: None,
        }
    }

    #[test]
    fn test_commit_appends_and_folds() {
        let journal = Journal::new(Arc::new(InMemoryEventLog::new()), Registry::new(), 3);
        let recorded = journal.commit("t1", |_| Ok(vec![created()])).unwrap();
        assert_eq!(recorded[0].sequence_no, 1);
        assert_eq!(
            journal.read(|r| r.task("t1").map(|t| t.status)),
            Some(TaskStatus::Created)
        );
    }

    #[test]
    fn test_conflict_retried_after_external_append() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let journal = Journal::new(log.clone(), Registry::new(), 3);
        journal.commit("t1", |_| Ok(vec![created()])).unwrap();

        // 另一个写者绕过 journal 追加
        append_domain(
            log.as_ref(),
            "t1",
            &[DomainEvent::TaskStatusChanged {
                status: TaskStatus::Running,
                summary: None,
            }],
            Some(1),
        )
        .unwrap();

        let mut builds = 0;
        let recorded = journal
            .commit("t1", |registry| {
                builds += 1;
                assert!(registry.task("t1").is_some());
                Ok(vec![DomainEvent::TaskStatusChanged {
                    status: TaskStatus::Completed,
                    summary: Some("done".to_string()),
                }])
            })
            .unwrap();

        assert_eq!(builds, 2);
        assert_eq!(recorded[0].sequence_no, 3);
        assert_eq!(journal.read(|r| r.head("t1")), 3);
    }

    #[test]
    fn test_conflict_surfaces_when_retries_exhausted() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let journal = Journal::new(log.clone(), Registry::new(), 0);
        journal.commit("t1", |_| Ok(vec![created()])).unwrap();
        append_domain(
            log.as_ref(),
            "t1",
            &[DomainEvent::TaskStatusChanged {
                status: TaskStatus::Running,
                summary: None,
            }],
            None,
        )
        .unwrap();

        let err = journal
            .commit("t1", |_| {
                Ok(vec![DomainEvent::TaskStatusChanged {
                    status: TaskStatus::Failed,
                    summary: None,
                }])
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(log.head("t1").unwrap(), 2);
    }

    #[test]
    fn test_empty_build_writes_nothing() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let journal = Journal::new(log.clone(), Registry::new(), 3);
        assert!(journal.commit("t1", |_| Ok(Vec::new())).unwrap().is_empty());
        assert_eq!(log.head("t1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_task_lock_serializes_same_task() {
        let journal = Journal::new(Arc::new(InMemoryEventLog::new()), Registry::new(), 3);
        let guard = journal.lock_task("t1").await;
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            journal.lock_task("t1"),
        )
        .await;
        assert!(other.is_err());
        // 其它任务不受影响
        let _t2 = journal.lock_task("t2").await;
        drop(guard);
        let _again = journal.lock_task("t1").await;
    }

    #[tokio::test]
    async fn test_commit_async_retries_conflict() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let journal = Journal::new(log.clone(), Registry::new(), 3);
        journal.commit_async("t1", |_| Ok(vec![created()])).await.unwrap();
        append_domain(
            log.as_ref(),
            "t1",
            &[DomainEvent::TaskStatusChanged {
                status: TaskStatus::Running,
                summary: None,
            }],
            Some(1),
        )
        .unwrap();

        let recorded = journal
            .commit_async("t1", |registry| {
                let status = registry.task("t1").map(|t| t.status);
                Ok(if status == Some(TaskStatus::Running) {
                    vec![DomainEvent::TaskStatusChanged {
                        status: TaskStatus::Completed,
                        summary: None,
                    }]
                } else {
                    vec![DomainEvent::TaskStatusChanged {
                        status: TaskStatus::Running,
                        summary: None,
                    }]
                })
            })
            .await
            .unwrap();

        assert_eq!(recorded[0].sequence_no, 3);
        assert_eq!(
            journal.read(|r| r.task("t1").map(|t| t.status)),
            Some(TaskStatus::Completed)
        );
    }
}
