//! Configuration for a berth root.
//!
//! ## berth.toml
//!
//! Optional file at the workspace root:
//!
//! ```toml
//! branch_template = "{workspace_id}/{repo}"   # {workspace_id} {repo} {owner} {alias}
//! workspace_template = "default"              # scaffold under templates/<name>/
//! pool_root = "/var/cache/berth/pool"         # relative paths are taken from the root
//! git_timeout_secs = 120
//! output_format = "human"                     # or "json"
//! ```
//!
//! ## Precedence
//!
//! For the pool root: CLI flag / `BERTH_POOL` > `berth.toml` > data dir default.
//! For output format: `-H` flag > `berth.toml` > JSON.

use crate::storage::Layout;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BRANCH_TEMPLATE: &str = "{workspace_id}/{repo}";
pub const DEFAULT_WORKSPACE_TEMPLATE: &str = "default";

const PLACEHOLDERS: [&str; 4] = ["workspace_id", "repo", "owner", "alias"];

/// Output format preference for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON output (default, machine-readable)
    #[default]
    Json,
    /// Human-readable output
    Human,
}

/// Settings read from `berth.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub branch_template: String,
    pub workspace_template: String,
    pub pool_root: Option<PathBuf>,
    pub git_timeout_secs: Option<u64>,
    pub output_format: Option<OutputFormat>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            branch_template: DEFAULT_BRANCH_TEMPLATE.to_string(),
            workspace_template: DEFAULT_WORKSPACE_TEMPLATE.to_string(),
            pool_root: None,
            git_timeout_secs: None,
            output_format: None,
        }
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// CLI flag or its environment variable
    CliFlag,
    /// `berth.toml`
    ConfigFile,
    /// Built-in default
    Default,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::ConfigFile => write!(f, "config"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ValueSource,
}

impl Config {
    /// Load `<root>/berth.toml`, or defaults if it does not exist.
    pub fn load(layout: &Layout) -> Result<Self> {
        let path = layout.config_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Config = toml::from_str(&raw).map_err(|e| {
            Error::InvalidArgument(format!("{}: {}", path.display(), e.message()))
        })?;
        config
            .validate()
            .map_err(|msg| Error::InvalidArgument(format!("{}: {}", path.display(), msg)))?;
        Ok(config)
    }

    /// Validate the config values.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.branch_template.trim().is_empty() {
            return Err("branch_template must not be empty".to_string());
        }
        let mut rest = self.branch_template.as_str();
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .ok_or_else(|| "branch_template has an unclosed '{'".to_string())?;
            let name = &after[..end];
            if !PLACEHOLDERS.contains(&name) {
                return Err(format!(
                    "branch_template uses unknown placeholder {{{}}}; expected one of {}",
                    name,
                    PLACEHOLDERS.map(|p| format!("{{{}}}", p)).join(", ")
                ));
            }
            rest = &after[end + 1..];
        }
        if self.git_timeout_secs == Some(0) {
            return Err("git_timeout_secs must be positive".to_string());
        }
        Ok(())
    }

    pub fn git_timeout(&self) -> Option<Duration> {
        self.git_timeout_secs.map(Duration::from_secs)
    }

    /// Default branch name for a new binding.
    pub fn render_branch(
        &self,
        workspace_id: &str,
        owner: &str,
        repo: &str,
        alias: &str,
    ) -> String {
        self.branch_template
            .replace("{workspace_id}", workspace_id)
            .replace("{owner}", owner)
            .replace("{repo}", repo)
            .replace("{alias}", alias)
    }

    /// Resolve the repo pool location.
    pub fn resolve_pool_root(&self, root: &Path, flag: Option<PathBuf>) -> Resolved<PathBuf> {
        if let Some(path) = flag {
            return Resolved {
                value: path,
                source: ValueSource::CliFlag,
            };
        }
        if let Some(path) = &self.pool_root {
            return Resolved {
                value: root.join(path),
                source: ValueSource::ConfigFile,
            };
        }
        let base = dirs::data_dir().unwrap_or_else(|| root.join(crate::storage::STATE_DIR));
        Resolved {
            value: base.join("berth").join("pool"),
            source: ValueSource::Default,
        }
    }
}
