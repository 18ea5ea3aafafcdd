//! Data models for berth entities.
//!
//! This module defines the core data structures:
//! - `Workspace` - A ticket-scoped unit of work and its life-cycle state
//! - `RepoBinding` - One repository attached to a workspace through a worktree
//! - `WorkspaceEvent` - Audit trail entries kept in the secondary index

use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a workspace identifier or repository alias.
pub const MAX_NAME_LEN: usize = 64;

/// Workspace life-cycle status. `deleted` is terminal and never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    #[default]
    Active,
    Archived,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Archived => "archived",
        }
    }

    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" | "open" => Some(WorkspaceStatus::Active),
            "archived" | "closed" => Some(WorkspaceStatus::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The workspace record stored in `workspace.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Ticket-like identifier, unique across active and archived storage
    pub id: String,

    /// Free-text title
    pub title: String,

    #[serde(default)]
    pub status: WorkspaceStatus,

    /// Unix seconds
    pub created_at: i64,

    /// Unix seconds
    pub updated_at: i64,

    /// Set on archival, cleared by `unlock`; purge refuses while set
    #[serde(default)]
    pub purge_locked: bool,
}

impl Workspace {
    /// Create a new active workspace with the given ID and title.
    pub fn new(id: String, title: String) -> Self {
        let now = now_ts();
        Self {
            id,
            title,
            status: WorkspaceStatus::Active,
            created_at: now,
            updated_at: now,
            purge_locked: false,
        }
    }

    pub fn touch(&mut self) {
        // Two mutations in the same second still move the clock forward so
        // index reconciliation can tell the newer copy apart.
        self.updated_at = now_ts().max(self.updated_at + 1);
    }
}

/// One repository bound to a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoBinding {
    /// `host/owner/repo`
    pub repo_uid: String,

    /// `owner/repo`
    pub repo_key: String,

    pub remote_url: String,

    /// Worktree directory name under `repos/`, unique within the workspace
    pub alias: String,

    pub branch: String,

    /// Upstream ref the branch was created from (e.g. `origin/main`)
    pub base_ref: String,
}

impl RepoBinding {
    /// Whether `key` names this binding by alias, `owner/repo` or `host/owner/repo`.
    pub fn matches(&self, key: &str) -> bool {
        self.alias == key || self.repo_key == key || self.repo_uid == key
    }
}

/// Audit event types recorded in the secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Archived,
    Reopened,
    Purged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Archived => "archived",
            EventType::Reopened => "reopened",
            EventType::Purged => "purged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventType::Created),
            "archived" => Some(EventType::Archived),
            "reopened" => Some(EventType::Reopened),
            "purged" => Some(EventType::Purged),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    /// Insertion order within the index
    pub seq: i64,
    pub workspace_id: String,
    pub event_type: EventType,
    /// Unix seconds
    pub at: i64,
}

/// Current time as unix seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Validate a workspace identifier.
///
/// Identifiers are ticket-like tokens: 1-64 characters of ASCII letters,
/// digits, `-`, `_` and `.`, starting with a letter or digit.
pub fn validate_workspace_id(id: &str) -> Result<()> {
    validate_name(id, "workspace id")
}

/// Validate a repository alias (the worktree directory name).
pub fn validate_alias(alias: &str) -> Result<()> {
    validate_name(alias, "alias")
}

fn validate_name(value: &str, kind: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{} must not be empty", kind)));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "{} must be at most {} characters, got {}",
            kind,
            MAX_NAME_LEN,
            value.len()
        )));
    }
    let first = value.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() {
        return Err(Error::InvalidArgument(format!(
            "{} must start with a letter or digit, got: {}",
            kind, value
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::InvalidArgument(format!(
            "{} contains invalid character {:?}: {}",
            kind, bad, value
        )));
    }
    if value.ends_with(".lock") || value.contains("..") {
        return Err(Error::InvalidArgument(format!(
            "{} is not a valid path component: {}",
            kind, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_workspace_id_accepts_ticket_tokens() {
        for id in ["WS1", "PROJ-1234", "fix_login.v2", "a"] {
            assert!(validate_workspace_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_validate_workspace_id_rejects_bad_tokens() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        for id in ["", "-lead", ".hidden", "a/b", "a b", "a..b", "ws.lock", long.as_str()] {
            let err = validate_workspace_id(id).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{id:?} -> {err}");
        }
    }

    #[test]
    fn test_status_parse_and_display() {
        assert_eq!(WorkspaceStatus::parse("ACTIVE"), Some(WorkspaceStatus::Active));
        assert_eq!(WorkspaceStatus::parse("closed"), Some(WorkspaceStatus::Archived));
        assert_eq!(WorkspaceStatus::parse("gone"), None);
        assert_eq!(WorkspaceStatus::Archived.to_string(), "archived");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&WorkspaceStatus::Archived).unwrap();
        assert_eq!(json, "\"archived\"");
    }

    #[test]
    fn test_touch_moves_forward_within_same_second() {
        let mut ws = Workspace::new("WS1".to_string(), "t".to_string());
        let before = ws.updated_at;
        ws.touch();
        ws.touch();
        assert!(ws.updated_at >= before + 2);
    }

    #[test]
    fn test_binding_matches_alias_key_and_uid() {
        let binding = RepoBinding {
            repo_uid: "github.com/o/r".to_string(),
            repo_key: "o/r".to_string(),
            remote_url: "https://github.com/o/r.git".to_string(),
            alias: "r2".to_string(),
            branch: "WS1/r".to_string(),
            base_ref: "origin/main".to_string(),
        };
        assert!(binding.matches("r2"));
        assert!(binding.matches("o/r"));
        assert!(binding.matches("github.com/o/r"));
        assert!(!binding.matches("r"));
    }
}
