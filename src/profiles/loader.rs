//! Profile 加载器
//!
//! 从配置的目录加载 `*.toml` profile；多个目录中同名 id 以后加载的为准。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Profile '{0}' not found")]
    NotFound(String),

    #[error("Failed to load profiles: {0}")]
    Load(String),
}

/// checklist 条目
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// 如何引导一个 agent 的 profile
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub persona: String,
    pub system_prompt: String,
    #[serde(default)]
    pub goalset: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub checklist_template: Vec<ChecklistItem>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AgentProfile {
    fn normalize(mut self) -> Result<Self, String> {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            return Err("profile id must not be empty".to_string());
        }
        if self.checklist_template.iter().any(|c| c.id.trim().is_empty()) {
            return Err(format!("profile '{}': checklist item id must not be empty", self.id));
        }
        Ok(self)
    }
}

/// Profile 注册表（外部协作者）
pub trait ProfileRegistry: Send + Sync {
    fn get(&self, profile_id: &str) -> Result<AgentProfile, ProfileError>;

    fn ids(&self) -> Vec<String>;
}

/// 从磁盘加载的 profile 注册表
pub struct ProfileLoader {
    search_paths: Vec<PathBuf>,
    cache: RwLock<HashMap<String, AgentProfile>>,
}

impl ProfileLoader {
    /// 不存在的目录会被忽略
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths: search_paths.into_iter().filter(|p| p.exists()).collect(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// 重新扫描所有目录并替换缓存；任一文件解析失败时整体报错，缓存保持不变
    pub fn load_all(&self) -> Result<usize, ProfileError> {
        let mut profiles = HashMap::new();
        let mut errors = Vec::new();

        for base in &self.search_paths {
            for path in toml_files(base, &mut errors) {
                match load_profile(&path) {
                    Ok(profile) => {
                        profiles.insert(profile.id.clone(), profile);
                    }
                    Err(e) => errors.push(format!("{}: {e}", path.display())),
                }
            }
        }

        if !errors.is_empty() {
            return Err(ProfileError::Load(errors.join("; ")));
        }

        let count = profiles.len();
        *self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = profiles;
        tracing::info!("Loaded {} agent profiles", count);
        Ok(count)
    }
}

fn toml_files(base: &Path, errors: &mut Vec<String>) -> Vec<PathBuf> {
    let pattern = base.join("*.toml");
    let Some(pattern) = pattern.to_str() else {
        errors.push(format!("non UTF-8 profile path: {}", base.display()));
        return Vec::new();
    };
    match glob::glob(pattern) {
        Ok(paths) => {
            let mut files: Vec<PathBuf> = paths.flatten().collect();
            files.sort();
            files
        }
        Err(e) => {
            errors.push(format!("bad profile pattern {pattern}: {e}"));
            Vec::new()
        }
    }
}

fn load_profile(path: &Path) -> Result<AgentProfile, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let profile: AgentProfile = toml::from_str(&content).map_err(|e| e.to_string())?;
    profile.normalize()
}

impl ProfileRegistry for ProfileLoader {
    fn get(&self, profile_id: &str) -> Result<AgentProfile, ProfileError> {
        self.cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(profile_id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(profile_id.to_string()))
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// 内存 profile 注册表
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, AgentProfile>,
}

impl StaticProfiles {
    pub fn new(profiles: impl IntoIterator<Item = AgentProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// 只有 id 与 system_prompt 的最小 profile
    pub fn minimal(id: &str) -> AgentProfile {
        AgentProfile {
            id: id.to_string(),
            title: id.to_string(),
            persona: String::new(),
            system_prompt: format!("You are the {id} agent."),
            goalset: Vec::new(),
            constraints: Vec::new(),
            checklist_template: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl ProfileRegistry for StaticProfiles {
    fn get(&self, profile_id: &str) -> Result<AgentProfile, ProfileError> {
        self.profiles
            .get(profile_id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(profile_id.to_string()))
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }
}
