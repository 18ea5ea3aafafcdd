//! Worktree risk classification used to gate destructive transitions.

use crate::git::Worktrees;
use crate::models::RepoBinding;
use crate::storage::worktree_path;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Risk of one binding, or of a whole workspace.
///
/// Ordered so that the worst level compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Clean,
    Unknown,
    Dirty,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Clean => "clean",
            RiskLevel::Unknown => "unknown",
            RiskLevel::Dirty => "dirty",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoRisk {
    pub alias: String,
    pub level: RiskLevel,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskReport {
    pub aggregate: RiskLevel,
    pub repos: Vec<RepoRisk>,
}

impl RiskReport {
    pub fn dirty_aliases(&self) -> Vec<String> {
        self.aliases_at(RiskLevel::Dirty)
    }

    /// Aliases whose on-disk content would be lost without a clean status:
    /// dirty worktrees and directories git cannot read.
    pub fn at_risk_aliases(&self) -> Vec<String> {
        self.repos
            .iter()
            .filter(|r| {
                r.level == RiskLevel::Dirty || (r.level == RiskLevel::Unknown && r.path.exists())
            })
            .map(|r| r.alias.clone())
            .collect()
    }

    pub fn aliases_at(&self, level: RiskLevel) -> Vec<String> {
        self.repos
            .iter()
            .filter(|r| r.level == level)
            .map(|r| r.alias.clone())
            .collect()
    }
}

/// Dirty if any input is dirty, else unknown if any is unknown, else clean.
pub fn aggregate(levels: impl IntoIterator<Item = RiskLevel>) -> RiskLevel {
    levels.into_iter().max().unwrap_or(RiskLevel::Clean)
}

fn classify(worktrees: &Worktrees<'_>, alias: &str, path: &Path) -> RiskLevel {
    match worktrees.is_worktree_root(path) {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(alias, path = %path.display(), "not a worktree top level");
            return RiskLevel::Unknown;
        }
        Err(err) => {
            tracing::debug!(alias, error = %err, "cannot locate worktree");
            return RiskLevel::Unknown;
        }
    }
    match worktrees.is_dirty(path) {
        Ok(true) => RiskLevel::Dirty,
        Ok(false) => RiskLevel::Clean,
        Err(err) => {
            tracing::debug!(alias, error = %err, "cannot read worktree status");
            RiskLevel::Unknown
        }
    }
}

/// Classify every binding of the workspace at `workspace_path`.
///
/// A missing worktree, or one git cannot read as its own checkout, is
/// `unknown`.
pub fn assess(
    worktrees: &Worktrees<'_>,
    workspace_path: &Path,
    bindings: &[RepoBinding],
) -> RiskReport {
    let repos: Vec<RepoRisk> = bindings
        .iter()
        .map(|binding| {
            let path = worktree_path(workspace_path, &binding.alias);
            let level = if !path.exists() {
                RiskLevel::Unknown
            } else {
                classify(worktrees, &binding.alias, &path)
            };
            RepoRisk {
                alias: binding.alias.clone(),
                level,
                path,
            }
        })
        .collect();

    RiskReport {
        aggregate: aggregate(repos.iter().map(|r| r.level)),
        repos,
    }
}
