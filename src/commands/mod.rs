//! Command plumbing for the berth CLI.
//!
//! Builds an [`Engine`] for the resolved root and renders every engine report
//! as JSON (default) or human-readable text through the [`Output`] trait.

use crate::config::{Config, OutputFormat};
use crate::engine::{
    AddRepoReport, BindingRestore, CloseReport, CreateReport, CurrentWorkspace, Engine,
    EventsReport, InitReport, ListReport, ListSource, PurgeReport, RebuildReport,
    RemoveRepoReport, ReopenReport, RestoreStatus, UnlockReport, WorkspaceDetail,
};
use crate::git::Git;
use crate::models::WorkspaceStatus;
use crate::pool::GitPool;
use crate::prompt::{Interaction, StdinPrompt};
use crate::storage::{Layout, Location};
use crate::Result;
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;

pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BERTH_GIT_COMMIT"),
    " ",
    env!("BERTH_BUILD_TIMESTAMP"),
    ")"
);

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

/// Everything a command needs: the engine and how to print its result.
pub struct Session {
    pub engine: Engine,
    pub human: bool,
}

impl Session {
    /// Load `berth.toml` under `root` and assemble the engine.
    ///
    /// Prompts are only offered when stdin is a terminal and `no_input` is unset.
    pub fn open(
        root: PathBuf,
        pool: Option<PathBuf>,
        human_flag: bool,
        no_input: bool,
    ) -> Result<Self> {
        let config = Config::load(&Layout::new(&root))?;
        let pool_root = config.resolve_pool_root(&root, pool);
        tracing::debug!(pool = %pool_root.value.display(), source = %pool_root.source, "repo pool");

        let human = human_flag || config.output_format == Some(OutputFormat::Human);
        let interaction = if !no_input && std::io::stdin().is_terminal() {
            Interaction::Interactive(Box::new(StdinPrompt))
        } else {
            Interaction::NonInteractive
        };
        let pool = GitPool::new(pool_root.value, Git::with_timeout(config.git_timeout()));
        Ok(Self {
            engine: Engine::new(root, config, Box::new(pool), interaction),
            human,
        })
    }

    /// Print output in JSON or human-readable format.
    pub fn print<T: Output>(&self, result: &T) {
        if self.human {
            println!("{}", result.to_human());
        } else {
            println!("{}", result.to_json());
        }
    }
}

/// Result of `berth find`.
#[derive(Debug, Serialize)]
pub struct FindResult {
    pub id: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkspaceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl FindResult {
    pub fn new(id: &str, location: Option<Location>) -> Self {
        match location {
            Some(loc) => Self {
                id: loc.id,
                found: true,
                status: Some(loc.status),
                path: Some(loc.path),
            },
            None => Self {
                id: id.to_string(),
                found: false,
                status: None,
                path: None,
            },
        }
    }
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

fn timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn with_warnings(mut text: String, warnings: &[String]) -> String {
    for warning in warnings {
        text.push_str(&format!("\nwarning: {}", warning));
    }
    text
}

fn commit_line(commit: &Option<String>) -> String {
    match commit {
        Some(sha) => format!(" (commit {})", &sha[..sha.len().min(12)]),
        None => String::new(),
    }
}

impl Output for InitReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let verb = if self.created_repository {
            "Initialized"
        } else {
            "Checked"
        };
        with_warnings(
            format!("{} berth root at {}", verb, self.root.display()),
            &self.warnings,
        )
    }
}

impl Output for CreateReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut text = format!("Created workspace {} at {}", self.id, self.path.display());
        if self.scaffolded_files > 0 {
            text.push_str(&format!(" ({} files from template)", self.scaffolded_files));
        }
        with_warnings(text, &self.warnings)
    }
}

impl Output for AddRepoReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let text = if self.already_bound {
            format!(
                "{} already checked out at {} on {}",
                self.binding.repo_key,
                self.path.display(),
                self.binding.branch
            )
        } else {
            let branch = if self.created_branch {
                format!("new branch {} from {}", self.binding.branch, self.binding.base_ref)
            } else {
                format!("existing branch {}", self.binding.branch)
            };
            format!(
                "Bound {} as '{}' in {}: {} at {}",
                self.binding.repo_key,
                self.binding.alias,
                self.id,
                branch,
                self.path.display()
            )
        };
        with_warnings(text, &self.warnings)
    }
}

impl Output for RemoveRepoReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut text = format!("Removed '{}' from {}", self.alias, self.id);
        if !self.removed_worktree {
            text.push_str(" (worktree was already gone)");
        }
        with_warnings(text, &self.warnings)
    }
}

impl Output for CloseReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut text = format!(
            "Archived {} to {}{}",
            self.id,
            self.path.display(),
            commit_line(&self.commit)
        );
        if !self.discarded.is_empty() {
            text.push_str(&format!(
                "\nDiscarded uncommitted changes in: {}",
                self.discarded.join(", ")
            ));
        }
        text.push_str(&format!("\nPurge lock set; `berth unlock {}` clears it", self.id));
        with_warnings(text, &self.warnings)
    }
}

fn restore_line(restore: &BindingRestore) -> String {
    match restore.status {
        RestoreStatus::Restored => format!("  {}: restored on {}", restore.alias, restore.branch),
        RestoreStatus::AlreadyPresent => {
            format!("  {}: already present on {}", restore.alias, restore.branch)
        }
        RestoreStatus::Failed => format!(
            "  {}: FAILED ({})",
            restore.alias,
            restore.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

impl Output for ReopenReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "Reopened {} at {}{}",
            self.id,
            self.path.display(),
            commit_line(&self.commit)
        )];
        lines.extend(self.repos.iter().map(restore_line));
        if self.partial {
            lines.push(format!(
                "Some worktrees were not restored; re-bind them with `berth add-repo {} ...`",
                self.id
            ));
        }
        with_warnings(lines.join("\n"), &self.warnings)
    }
}

impl Output for PurgeReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        with_warnings(
            format!("Purged {}{}", self.id, commit_line(&self.commit)),
            &self.warnings,
        )
    }
}

impl Output for UnlockReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let text = if self.was_locked {
            format!("Unlocked {}", self.id)
        } else {
            format!("{} was not locked", self.id)
        };
        with_warnings(text, &self.warnings)
    }
}

impl Output for WorkspaceDetail {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let ws = &self.workspace;
        let mut lines = vec![format!("{} [{}] {}", ws.id, ws.status, ws.title)];
        lines.push(format!("  path:    {}", self.path.display()));
        lines.push(format!("  created: {}", timestamp(ws.created_at)));
        lines.push(format!("  updated: {}", timestamp(ws.updated_at)));
        if ws.purge_locked {
            lines.push("  purge lock: set".to_string());
        }
        if let Some(commit) = &self.archived_commit {
            lines.push(format!("  archived in: {}", commit));
        }
        if let Some(risk) = self.risk {
            lines.push(format!("  risk:    {}", risk));
        }
        if self.repos.is_empty() {
            lines.push("  no repositories".to_string());
        }
        for repo in &self.repos {
            let risk = repo
                .risk
                .map(|r| format!(" [{}]", r))
                .unwrap_or_default();
            lines.push(format!(
                "  {} ({}) {} from {}{}",
                repo.binding.alias,
                repo.binding.repo_key,
                repo.binding.branch,
                repo.binding.base_ref,
                risk
            ));
        }
        with_warnings(lines.join("\n"), &self.warnings)
    }
}

impl Output for FindResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match (&self.status, &self.path) {
            (Some(status), Some(path)) => format!("{} [{}] {}", self.id, status, path.display()),
            _ => format!("{} not found", self.id),
        }
    }
}

impl Output for ListReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        if self.workspaces.is_empty() {
            lines.push("No workspaces".to_string());
        }
        for ws in &self.workspaces {
            let mut line = format!("{:<20} {:<8} {}", ws.id, ws.status.to_string(), ws.title);
            if !ws.repos.is_empty() {
                line.push_str(&format!("  [{}]", ws.repos.join(", ")));
            }
            if let Some(risk) = ws.risk {
                line.push_str(&format!("  risk: {}", risk));
            }
            if !ws.missing.is_empty() {
                line.push_str(&format!("  missing: {}", ws.missing.join(", ")));
            }
            lines.push(line);
        }
        if self.source == ListSource::Filesystem {
            lines.push("(listed from disk)".to_string());
        }
        with_warnings(lines.join("\n"), &self.warnings)
    }
}

impl Output for EventsReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.events.is_empty() {
            return "No events".to_string();
        }
        self.events
            .iter()
            .map(|e| {
                format!(
                    "{}  {:<9} {}",
                    timestamp(e.at),
                    e.event_type.to_string(),
                    e.workspace_id
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Output for RebuildReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Rebuilt {}: {} workspaces indexed, {} archive commits recovered",
            self.path.display(),
            self.stats.inserted,
            self.archived_commits_recovered
        )
    }
}

impl Output for CurrentWorkspace {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} [{}] repo {}", self.id, self.status, alias),
            None => format!("{} [{}]", self.id, self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkspaceSummary;
    use crate::storage::ReconcileStats;

    fn summary(id: &str, status: WorkspaceStatus) -> WorkspaceSummary {
        WorkspaceSummary {
            id: id.to_string(),
            title: "Login fix".to_string(),
            status,
            created_at: 0,
            updated_at: 0,
            purge_locked: status == WorkspaceStatus::Archived,
            repos: vec!["api".to_string()],
            missing: Vec::new(),
            risk: None,
        }
    }

    #[test]
    fn test_list_json_shape() {
        let report = ListReport {
            workspaces: vec![summary("WS1", WorkspaceStatus::Active)],
            source: ListSource::Index,
            warnings: Vec::new(),
        };
        let value: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(value["source"], "index");
        assert_eq!(value["workspaces"][0]["id"], "WS1");
        assert_eq!(value["workspaces"][0]["status"], "active");
        assert!(value["workspaces"][0].get("risk").is_none());
    }

    #[test]
    fn test_list_human_marks_filesystem_fallback() {
        let report = ListReport {
            workspaces: vec![summary("WS1", WorkspaceStatus::Archived)],
            source: ListSource::Filesystem,
            warnings: vec!["listed from disk: index malformed".to_string()],
        };
        let text = report.to_human();
        assert!(text.contains("WS1"));
        assert!(text.contains("archived"));
        assert!(text.contains("(listed from disk)"));
        assert!(text.contains("warning: listed from disk"));
    }

    #[test]
    fn test_reopen_human_lists_failures() {
        let report = ReopenReport {
            id: "WS1".to_string(),
            path: PathBuf::from("/r/workspaces/WS1"),
            commit: Some("0123456789abcdef0123".to_string()),
            repos: vec![
                BindingRestore {
                    alias: "api".to_string(),
                    branch: "WS1/api".to_string(),
                    status: RestoreStatus::Restored,
                    error: None,
                },
                BindingRestore {
                    alias: "web".to_string(),
                    branch: "WS1/web".to_string(),
                    status: RestoreStatus::Failed,
                    error: Some("fetch failed".to_string()),
                },
            ],
            partial: true,
            warnings: Vec::new(),
        };
        let text = report.to_human();
        assert!(text.contains("(commit 0123456789ab)"));
        assert!(text.contains("api: restored on WS1/api"));
        assert!(text.contains("web: FAILED (fetch failed)"));

        let value: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(value["partial"], true);
        assert_eq!(value["repos"][1]["status"], "failed");
    }

    #[test]
    fn test_find_result() {
        let missing = FindResult::new("WS9", None);
        assert_eq!(missing.to_human(), "WS9 not found");
        assert_eq!(missing.to_json(), r#"{"id":"WS9","found":false}"#);
    }

    #[test]
    fn test_rebuild_json_flattens_stats() {
        let report = RebuildReport {
            path: PathBuf::from("/r/.state/index.db"),
            stats: ReconcileStats {
                inserted: 2,
                refreshed: 0,
                removed: 0,
            },
            archived_commits_recovered: 1,
        };
        let value: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(value["inserted"], 2);
        assert_eq!(value["archived_commits_recovered"], 1);
    }
}
