//! Hydra 宿主进程
//!
//! 加载配置 → 初始化日志 → 打开事件日志 → 回放 → 启动 resume 扫描 → 等待关闭信号 → 清理。
//! 用法：`hydra [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hydra::config::load_config;
use hydra::core::{drain_engine, Orchestrator, ResumeSweep, ShutdownSignal};
use hydra::observability;
use hydra::profiles::{ProfileLoader, ProfileRegistry};
use hydra::runner::create_runner;
use hydra::storage::open_event_log;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    cfg.validate().context("Invalid config")?;

    observability::init(&cfg.app.log_level);

    let log = open_event_log(&cfg.store).context("Failed to open event log")?;

    let profiles = Arc::new(ProfileLoader::new(cfg.profiles.paths.clone()));
    if let Err(e) = profiles.load_all() {
        tracing::warn!("Profile loading failed: {}", e);
    }
    tracing::info!("Available profiles: {:?}", profiles.ids());

    let runner = create_runner(&cfg.runner);

    // 回放整库是阻塞 I/O，放到 blocking 线程池
    let settings = cfg.engine_settings();
    let orchestrator = Arc::new(
        tokio::task::spawn_blocking(move || Orchestrator::bootstrap(settings, log, profiles, runner))
            .await?
            .context("Hydration failed")?,
    );

    let shutdown = Arc::new(ShutdownSignal::new());
    shutdown.listen_for_signals();

    if cfg.resume.resume_on_startup {
        let sweep = ResumeSweep::new(cfg.resume.startup_concurrency);
        let token = shutdown.token();
        tokio::select! {
            report = sweep.run(&orchestrator, &token) => {
                tracing::info!("Startup sweep: {}", serde_json::to_string(&report)?);
            }
            _ = token.cancelled() => {}
        }
    }

    let status = orchestrator.status();
    tracing::info!("Status: {}", serde_json::to_string(&status)?);

    let reason = shutdown.wait().await;
    let grace = Duration::from_secs(cfg.resume.timeout_secs.min(10));
    let report = drain_engine(&orchestrator, reason, grace, grace + Duration::from_secs(5)).await;
    tracing::info!("Shutdown: {}", serde_json::to_string(&report)?);

    Ok(())
}
