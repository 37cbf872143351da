//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HYDRA__*` 覆盖（双下划线表示嵌套，如 `HYDRA__STORE__BACKEND=memory`）。
//! 另外兼容裸环境变量 `RESUME_ALERT_THRESHOLD`，覆盖 `resume.alert_threshold`。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::HydraError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub store: StoreSection,
    pub resume: ResumeSection,
    pub runner: RunnerSection,
    pub profiles: ProfilesSection,
    pub orchestrator: OrchestratorSection,
}

/// [app] 段：应用名、日志级别
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// RUST_LOG 未设置时的默认级别
    pub log_level: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            log_level: "info".to_string(),
        }
    }
}

/// [store] 段：事件日志后端（sqlite / memory）与数据库路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: String,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: PathBuf::from("storage/hydra.db"),
        }
    }
}

/// [resume] 段：告警阈值、单次 resume 超时、启动时是否自动 resume
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResumeSection {
    /// 连续失败多少次后告警（>= 1）
    pub alert_threshold: u32,
    pub timeout_secs: u64,
    pub resume_on_startup: bool,
    pub startup_concurrency: usize,
}

impl Default for ResumeSection {
    fn default() -> Self {
        Self {
            alert_threshold: 3,
            timeout_secs: 300,
            resume_on_startup: true,
            startup_concurrency: 2,
        }
    }
}

/// [runner] 段：Codex CLI 路径、默认模型、spawn 超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// 未设置时在 PATH 中查找 `codex`
    pub codex_path: Option<PathBuf>,
    pub default_model: Option<String>,
    pub spawn_timeout_secs: u64,
    pub output_preview_chars: usize,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            codex_path: None,
            default_model: None,
            spawn_timeout_secs: 600,
            output_preview_chars: 2000,
        }
    }
}

/// [profiles] 段：profile 目录，后面的目录覆盖前面的同名 id
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfilesSection {
    pub paths: Vec<PathBuf>,
}

impl Default for ProfilesSection {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("config/profiles")],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 追加冲突时内部重读重试的次数上限
    pub conflict_retries: u32,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            conflict_retries: 3,
        }
    }
}

/// Orchestrator 运行参数（从 AppConfig 派生，测试里可直接构造）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub alert_threshold: u32,
    pub resume_timeout: Duration,
    pub spawn_timeout: Duration,
    pub conflict_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        AppConfig::default().engine_settings()
    }
}

impl AppConfig {
    /// 校验取值范围
    pub fn validate(&self) -> Result<(), HydraError> {
        if self.resume.alert_threshold < 1 {
            return Err(HydraError::Config(
                "resume.alert_threshold must be >= 1".to_string(),
            ));
        }
        if self.resume.timeout_secs == 0 || self.runner.spawn_timeout_secs == 0 {
            return Err(HydraError::Config("timeouts must be > 0".to_string()));
        }
        if self.resume.startup_concurrency == 0 {
            return Err(HydraError::Config(
                "resume.startup_concurrency must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            alert_threshold: self.resume.alert_threshold,
            resume_timeout: Duration::from_secs(self.resume.timeout_secs),
            spawn_timeout: Duration::from_secs(self.runner.spawn_timeout_secs),
            conflict_retries: self.orchestrator.conflict_retries,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HYDRA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 HYDRA__*（双下划线表示嵌套键）
/// 4. 最后应用 RESUME_ALERT_THRESHOLD
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HYDRA")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let threshold = std::env::var("RESUME_ALERT_THRESHOLD")
        .ok()
        .map(|raw| {
            raw.trim().parse::<i64>().map_err(|e| {
                config::ConfigError::Message(format!("RESUME_ALERT_THRESHOLD: {e}"))
            })
        })
        .transpose()?;
    builder = builder.set_override_option("resume.alert_threshold", threshold)?;

    let c = builder.build()?;
    c.try_deserialize()
}
