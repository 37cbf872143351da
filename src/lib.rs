//! Hydra - 事件溯源的 agent 任务编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 事件模型、状态投影与回放、resume 协调、告警、编排门面
//! - **observability**: tracing 日志初始化
//! - **profiles**: agent profile 注册表
//! - **runner**: agent 会话后端（Codex CLI / 脚本化测试替身）
//! - **storage**: 只追加事件日志（内存 / SQLite）

pub mod config;
pub mod core;
pub mod observability;
pub mod profiles;
pub mod runner;
pub mod storage;

pub use crate::core::{HydraError, Orchestrator};
