//! 脚本化 Runner（用于测试，不启动子进程）
//!
//! resume 结果按队列依次弹出，队列空时使用默认结果；可设置每次 resume 的延迟或永久挂起，
//! 用于覆盖超时、取消与并发 single-flight 场景。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::runner::{AgentRunner, ResumeReport, RunnerError, SpawnRequest, SpawnResult};

/// 单次 resume 的脚本化结果
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedResume {
    Succeed,
    Fail(String),
    Error(RunnerError),
    /// 永不返回，等待超时或取消
    Hang,
}

pub struct ScriptedRunner {
    spawn_returncode: i32,
    spawn_error: Option<RunnerError>,
    resume_script: Mutex<VecDeque<ScriptedResume>>,
    default_resume: ScriptedResume,
    resume_delay: Duration,
    spawned: AtomicUsize,
    resume_calls: Mutex<Vec<String>>,
    terminated: Mutex<Vec<(String, String)>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            spawn_returncode: 0,
            spawn_error: None,
            resume_script: Mutex::new(VecDeque::new()),
            default_resume: ScriptedResume::Succeed,
            resume_delay: Duration::ZERO,
            spawned: AtomicUsize::new(0),
            resume_calls: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resume_results(self, results: impl IntoIterator<Item = ScriptedResume>) -> Self {
        *lock(&self.resume_script) = results.into_iter().collect();
        self
    }

    pub fn with_default_resume(mut self, outcome: ScriptedResume) -> Self {
        self.default_resume = outcome;
        self
    }

    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    pub fn with_spawn_error(mut self, error: RunnerError) -> Self {
        self.spawn_error = Some(error);
        self
    }

    pub fn with_spawn_returncode(mut self, returncode: i32) -> Self {
        self.spawn_returncode = returncode;
        self
    }

    /// 追加后续 resume 结果
    pub fn push_resume(&self, outcome: ScriptedResume) {
        lock(&self.resume_script).push_back(outcome);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// 被调用过 resume 的 session id（按调用顺序）
    pub fn resume_calls(&self) -> Vec<String> {
        lock(&self.resume_calls).clone()
    }

    pub fn terminated(&self) -> Vec<(String, String)> {
        lock(&self.terminated).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn spawn(&self, request: SpawnRequest, _timeout: Duration) -> Result<SpawnResult, RunnerError> {
        if let Some(err) = &self.spawn_error {
            return Err(err.clone());
        }
        let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SpawnResult {
            session_id: format!("{}-session-{n}", request.profile.id),
            returncode: self.spawn_returncode,
            output_preview: format!("spawned for: {}", request.brief),
        })
    }

    async fn resume(&self, session_id: &str, _timeout: Duration) -> Result<ResumeReport, RunnerError> {
        lock(&self.resume_calls).push(session_id.to_string());
        let outcome = lock(&self.resume_script)
            .pop_front()
            .unwrap_or_else(|| self.default_resume.clone());

        if !self.resume_delay.is_zero() {
            tokio::time::sleep(self.resume_delay).await;
        }

        match outcome {
            ScriptedResume::Succeed => Ok(ResumeReport::Success),
            ScriptedResume::Fail(reason) => Ok(ResumeReport::Failure(reason)),
            ScriptedResume::Error(err) => Err(err),
            ScriptedResume::Hang => std::future::pending().await,
        }
    }

    async fn terminate(&self, session_id: &str, reason: &str, _timeout: Duration) -> Result<(), RunnerError> {
        lock(&self.terminated).push((session_id.to_string(), reason.to_string()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::StaticProfiles;

    #[tokio::test]
    async fn test_script_then_default() {
        let runner = ScriptedRunner::new()
            .with_resume_results([ScriptedResume::Fail("boom".to_string())])
            .with_default_resume(ScriptedResume::Succeed);
        let t = Duration::from_secs(1);

        assert_eq!(
            runner.resume("s1", t).await.unwrap(),
            ResumeReport::Failure("boom".to_string())
        );
        assert_eq!(runner.resume("s1", t).await.unwrap(), ResumeReport::Success);
        assert_eq!(runner.resume_calls(), vec!["s1", "s1"]);
    }

    #[tokio::test]
    async fn test_spawn_session_ids() {
        let runner = ScriptedRunner::new();
        let request = SpawnRequest {
            profile: StaticProfiles::minimal("generalist"),
            brief: "b".to_string(),
            inputs: None,
            flags: Vec::new(),
        };
        let first = runner.spawn(request.clone(), Duration::from_secs(1)).await.unwrap();
        let second = runner.spawn(request, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.session_id, "generalist-session-1");
        assert_eq!(second.session_id, "generalist-session-2");
        assert_eq!(runner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_hang_never_resolves() {
        let runner = ScriptedRunner::new().with_default_resume(ScriptedResume::Hang);
        let res = tokio::time::timeout(
            Duration::from_millis(20),
            runner.resume("s1", Duration::from_secs(1)),
        )
        .await;
        assert!(res.is_err());
    }
}
