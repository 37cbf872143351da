//! Agent Runner：外部 agent 会话的 spawn / resume / terminate

pub mod codex;
pub mod mock;
pub mod traits;

use std::sync::Arc;

pub use codex::{CodexRunner, UnavailableRunner};
pub use mock::{ScriptedResume, ScriptedRunner};
pub use traits::{AgentRunner, ResumeReport, RunnerError, SpawnRequest, SpawnResult};

use crate::config::RunnerSection;

/// 按配置创建 Runner；找不到 Codex CLI 时退化为 UnavailableRunner（此时 spawn/resume 调用报错，其余操作照常）
pub fn create_runner(section: &RunnerSection) -> Arc<dyn AgentRunner> {
    match CodexRunner::new(
        section.codex_path.as_deref(),
        section.default_model.clone(),
        section.output_preview_chars,
    ) {
        Ok(runner) => {
            tracing::info!(executable = %runner.executable().display(), "Using Codex runner");
            Arc::new(runner)
        }
        Err(e) => {
            tracing::warn!("Codex runner unavailable: {}", e);
            Arc::new(UnavailableRunner::new(e.to_string()))
        }
    }
}
