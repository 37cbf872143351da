//! Codex CLI 后端
//!
//! `codex exec <prompt>` 启动会话，`codex resume <session_id>` 重新挂接；子进程环境剔除 Python 虚拟环境变量，
//! 超时后子进程随 future 一起被 kill。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::runner::{AgentRunner, ResumeReport, RunnerError, SpawnRequest, SpawnResult};
use crate::profiles::AgentProfile;

const SANITIZED_VARS: [&str; 4] = [
    "PYTHONHOME",
    "PYTHONPATH",
    "VIRTUAL_ENV",
    "PIP_RESPECT_VIRTUALENV",
];

/// 一次 CLI 调用的结果
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn ok(&self) -> bool {
        self.returncode == 0
    }
}

pub struct CodexRunner {
    executable: PathBuf,
    default_model: Option<String>,
    preview_chars: usize,
}

impl CodexRunner {
    /// 解析可执行文件：显式路径必须存在，否则在 PATH 中查找 `codex`
    pub fn new(
        explicit: Option<&Path>,
        default_model: Option<String>,
        preview_chars: usize,
    ) -> Result<Self, RunnerError> {
        let executable = resolve_executable(explicit)?;
        Ok(Self {
            executable,
            default_model,
            preview_chars,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    async fn invoke(&self, args: Vec<String>, timeout: Duration) -> Result<ExecutionResult, RunnerError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in SANITIZED_VARS {
            cmd.env_remove(var);
        }

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| RunnerError::Timeout(timeout))?
            .map_err(|e| RunnerError::Process(e.to_string()))?;

        Ok(ExecutionResult {
            returncode: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn command_flags(&self, flags: &[String]) -> Vec<String> {
        let mut command_flags = Vec::new();
        if let Some(model) = &self.default_model {
            if !flags.iter().any(|f| f == "--model") {
                command_flags.push("--model".to_string());
                command_flags.push(model.clone());
            }
        }
        command_flags.extend(flags.iter().cloned());
        command_flags
    }
}

fn resolve_executable(explicit: Option<&Path>) -> Result<PathBuf, RunnerError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(RunnerError::Unavailable(format!(
            "Codex executable not found at {}",
            path.display()
        )));
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join("codex"))
                .find(|candidate| candidate.is_file())
        })
        .ok_or_else(|| RunnerError::Unavailable("Codex CLI executable not found on PATH".to_string()))
}

/// 由 profile 与任务描述拼出提示词
pub fn build_prompt(profile: &AgentProfile, brief: &str, inputs: Option<&serde_json::Value>) -> String {
    let goals = if profile.goalset.is_empty() {
        "- Follow the system prompt".to_string()
    } else {
        bullet_list(profile.goalset.iter())
    };

    let mut sections = vec![
        profile.system_prompt.trim().to_string(),
        format!("Task Brief:\n{}", brief.trim()),
        format!("Goals:\n{goals}"),
    ];
    if !profile.constraints.is_empty() {
        sections.push(format!("Constraints:\n{}", bullet_list(profile.constraints.iter())));
    }
    if !profile.checklist_template.is_empty() {
        let items = profile.checklist_template.iter().map(|c| &c.description);
        sections.push(format!("Checklist Expectations:\n{}", bullet_list(items)));
    }
    if let Some(inputs) = inputs {
        sections.push(format!("Inputs:\n{inputs}"));
    }
    sections.join("\n\n")
}

fn bullet_list<'a>(items: impl Iterator<Item = &'a String>) -> String {
    items
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `{profile}-{YYYYmmddHHMMSS}-{6 位 hex}`
pub fn new_session_id(profile_id: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("{profile_id}-{stamp}-{suffix}")
}

#[async_trait]
impl AgentRunner for CodexRunner {
    async fn spawn(&self, request: SpawnRequest, timeout: Duration) -> Result<SpawnResult, RunnerError> {
        let prompt = build_prompt(&request.profile, &request.brief, request.inputs.as_ref());
        let session_id = new_session_id(&request.profile.id);

        let mut args = self.command_flags(&request.flags);
        args.push("exec".to_string());
        args.push(prompt);

        let result = self.invoke(args, timeout).await?;
        tracing::info!(
            session_id = %session_id,
            profile = %request.profile.id,
            returncode = result.returncode,
            "Spawned agent"
        );
        Ok(SpawnResult {
            session_id,
            returncode: result.returncode,
            output_preview: result.stdout.chars().take(self.preview_chars).collect(),
        })
    }

    async fn resume(&self, session_id: &str, timeout: Duration) -> Result<ResumeReport, RunnerError> {
        let result = self
            .invoke(vec!["resume".to_string(), session_id.to_string()], timeout)
            .await?;
        if result.ok() {
            return Ok(ResumeReport::Success);
        }
        let stderr = result.stderr.trim();
        Ok(ResumeReport::Failure(if stderr.is_empty() {
            format!("exit code {}", result.returncode)
        } else {
            stderr.chars().take(500).collect()
        }))
    }

    async fn terminate(&self, session_id: &str, reason: &str, _timeout: Duration) -> Result<(), RunnerError> {
        // CLI 没有 terminate 子命令：exec/resume 调用本身随超时或 drop 结束
        tracing::info!(session_id, reason, "Terminate requested for Codex session");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "codex"
    }
}

/// Codex 不可用时的占位后端：所有调用返回 Unavailable
pub struct UnavailableRunner {
    reason: String,
}

impl UnavailableRunner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AgentRunner for UnavailableRunner {
    async fn spawn(&self, _request: SpawnRequest, _timeout: Duration) -> Result<SpawnResult, RunnerError> {
        Err(RunnerError::Unavailable(self.reason.clone()))
    }

    async fn resume(&self, _session_id: &str, _timeout: Duration) -> Result<ResumeReport, RunnerError> {
        Err(RunnerError::Unavailable(self.reason.clone()))
    }

    async fn terminate(&self, _session_id: &str, _reason: &str, _timeout: Duration) -> Result<(), RunnerError> {
        Err(RunnerError::Unavailable(self.reason.clone()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
