use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::task::WorkspaceMode;
use crate::{Error, Result};

/// Environment variable naming the code-generation tool executable.
pub const TOOL_PATH_ENV: &str = "KILN_TOOL_PATH";

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_ZOMBIE_THRESHOLD_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ROLE: &str = "backend";

pub fn default_role_caps() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("backend".to_string(), 2),
        ("frontend".to_string(), 2),
        ("infra".to_string(), 1),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_dir: Option<String>,
    pub workspace_root: Option<String>,
    pub repo_path: Option<String>,
    pub mode: WorkspaceMode,
    pub max_retries: u32,
    pub zombie_threshold_secs: u64,
    pub poll_interval_ms: u64,
    pub phase_timeout_secs: u64,
    pub default_role: String,
    pub role_caps: BTreeMap<String, usize>,
    pub tool_command: Option<String>,
    pub tool_args: Vec<String>,
    pub worker_command: Option<String>,
    /// Directory holding `kiln.toml`; relative paths resolve against it.
    #[serde(skip)]
    pub state_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: None,
            workspace_root: None,
            repo_path: None,
            mode: WorkspaceMode::Repo,
            max_retries: DEFAULT_MAX_RETRIES,
            zombie_threshold_secs: DEFAULT_ZOMBIE_THRESHOLD_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            phase_timeout_secs: DEFAULT_PHASE_TIMEOUT_SECS,
            default_role: DEFAULT_ROLE.to_string(),
            role_caps: default_role_caps(),
            tool_command: None,
            tool_args: Vec::new(),
            worker_command: None,
            state_dir: PathBuf::from(".kiln"),
        }
    }
}

impl Config {
    pub fn config_path(state_dir: &Path) -> PathBuf {
        state_dir.join("kiln.toml")
    }

    /// Load `kiln.toml` from the state directory, or defaults if absent.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::config_path(state_dir);
        debug!(path = %path.display(), "Config::load");
        let mut config = if path.exists() {
            let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
            debug!(
                mode = %config.mode,
                max_retries = config.max_retries,
                roles = ?config.role_caps,
                "config loaded"
            );
            config
        } else {
            debug!("config file not found, using defaults");
            Self::default()
        };
        config.state_dir = state_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.role_caps.is_empty() {
            return Err(Error::Validation("role_caps must name at least one role".into()));
        }
        if !self.role_caps.contains_key(&self.default_role) {
            return Err(Error::Validation(format!(
                "default_role '{}' has no entry in role_caps",
                self.default_role
            )));
        }
        Ok(())
    }

    fn resolve(&self, value: Option<&str>, fallback: &str) -> PathBuf {
        match value {
            Some(dir) => {
                let path = expand_tilde(dir);
                if path.is_absolute() {
                    path
                } else {
                    self.state_dir.join(path)
                }
            }
            None => self.state_dir.join(fallback),
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.resolve(self.store_dir.as_deref(), "store")
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.resolve(self.workspace_root.as_deref(), "workspaces")
    }

    pub fn repo_path(&self) -> PathBuf {
        match self.repo_path.as_deref() {
            Some(p) => expand_tilde(p),
            None => PathBuf::from("."),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join("kiln.log")
    }

    pub fn zombie_threshold(&self) -> Duration {
        Duration::from_secs(self.zombie_threshold_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    /// Role for a task: first tag naming a configured role, else the default.
    pub fn role_for_tags(&self, tags: &[String]) -> String {
        tags.iter()
            .map(|t| t.trim().to_lowercase())
            .find(|t| self.role_caps.contains_key(t))
            .unwrap_or_else(|| self.default_role.clone())
    }

    /// Locate the code-generation tool.
    ///
    /// Order: `tool_command`, `PATH`, well-known install locations, then
    /// `KILN_TOOL_PATH`.
    pub fn tool_binary(&self) -> Result<PathBuf> {
        if let Some(cmd) = &self.tool_command {
            return Ok(expand_tilde(cmd));
        }
        if let Ok(path) = which::which("claude") {
            return Ok(path);
        }
        let mut candidates = Vec::new();
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".claude/local/claude"));
            candidates.push(home.join(".local/bin/claude"));
        }
        candidates.push(PathBuf::from("/usr/local/bin/claude"));
        if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
            return Ok(found);
        }
        match std::env::var(TOOL_PATH_ENV) {
            Ok(path) if !path.is_empty() => Ok(expand_tilde(&path)),
            _ => Err(Error::ToolNotFound),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
