//! Agent profile 注册表
//!
//! 目录结构：
//! ```text
//! config/profiles/
//! ├── generalist.toml
//! └── reviewer.toml
//! ```

mod loader;

pub use loader::{AgentProfile, ChecklistItem, ProfileError, ProfileLoader, ProfileRegistry, StaticProfiles};
