//! 持久化层：只追加的事件日志（内存 / SQLite）

pub mod event_log;
pub mod sqlite;

use std::sync::Arc;

pub use event_log::{append_domain, EventFilter, EventLog, InMemoryEventLog};
pub use sqlite::SqliteEventLog;

use crate::config::StoreSection;
use crate::core::error::{HydraError, Result};

/// 按 [store] 配置打开事件日志
pub fn open_event_log(store: &StoreSection) -> Result<Arc<dyn EventLog>> {
    match store.backend.to_lowercase().as_str() {
        "sqlite" => {
            tracing::info!("Using SQLite event log: {:?}", store.path);
            Ok(Arc::new(SqliteEventLog::open(&store.path)?))
        }
        "memory" => {
            tracing::warn!("Using in-memory event log; events will not survive restart");
            Ok(Arc::new(InMemoryEventLog::new()))
        }
        other => Err(HydraError::Config(format!("unknown store backend: {other}"))),
    }
}
