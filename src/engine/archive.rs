//! Archival protocol: close, reopen and purge.
//!
//! Each transition moves a workspace directory between `workspaces/` and
//! `archive/` (or deletes it) and records the move as a root commit scoped
//! to the two paths involved. Until the commit lands every step is undone on
//! failure, so the workspace is never left half-moved.

use super::{Engine, require_status};
use crate::git::BindOutcome;
use crate::models::{EventType, RepoBinding, WorkspaceStatus, now_ts};
use crate::pool::RepoSpec;
use crate::risk::{self, RiskLevel, RiskReport};
use crate::storage::{Metadata, metadata, repos_dir, worktree_path};
use crate::{Conflict, Error, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOptions {
    /// Discard uncommitted changes in dirty worktrees
    pub force: bool,
    /// Skip the plain "are you sure" prompt
    pub yes: bool,
}

#[derive(Debug, Serialize)]
pub struct CloseReport {
    pub id: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub removed_worktrees: Vec<String>,
    /// Aliases whose uncommitted changes were discarded
    pub discarded: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Restored,
    AlreadyPresent,
    Failed,
}

/// Outcome of recreating one worktree on reopen.
#[derive(Debug, Serialize)]
pub struct BindingRestore {
    pub alias: String,
    pub branch: String,
    pub status: RestoreStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReopenReport {
    pub id: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub repos: Vec<BindingRestore>,
    /// Some worktrees could not be recreated; the workspace is active anyway
    pub partial: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeOptions {
    /// Purge even while the purge lock is set
    pub force: bool,
    /// Answer the confirmation prompts up front
    pub yes: bool,
}

#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub warnings: Vec<String>,
}

impl Engine {
    /// Archive an active workspace.
    pub fn close(&mut self, id: &str, options: CloseOptions) -> Result<CloseReport> {
        let (location, meta) = self.load(id)?;
        require_status(&location, "close", WorkspaceStatus::Active)?;
        self.root_repo().ensure_repository("close")?;

        let stray = stray_entries(&repos_dir(&location.path), &meta)?;
        if !stray.is_empty() {
            return Err(Conflict::StrayRepoContent {
                repos_dir: repos_dir(&location.path),
                entries: stray,
            }
            .into());
        }

        let report = risk::assess(&self.worktrees(), &location.path, &meta.repos);
        self.confirm("close", &format!("Close workspace '{}'?", id), options.yes)?;
        let dirty = report.at_risk_aliases();
        if !dirty.is_empty() {
            let listed = dirty.join(", ");
            self.require_confirmation(
                "close",
                &format!("Discard uncommitted changes in {}?", listed),
                &format!("uncommitted changes in {}", listed),
                options.force,
                "--force",
            )?;
        }

        // Worktrees go first: archived storage never holds repos/.
        let mut removed: Vec<&RepoBinding> = Vec::new();
        for binding in &meta.repos {
            let path = worktree_path(&location.path, &binding.alias);
            let bare = self.pool.bare_path(&binding.repo_uid);
            let force = dirty.contains(&binding.alias);
            if let Err(err) = self.worktrees().remove_bound(Some(&bare), &path, force) {
                self.restore_worktrees(&location.path, &removed);
                return Err(Error::state_write(
                    format!("remove worktree {}", path.display()),
                    err,
                ));
            }
            removed.push(binding);
        }
        let repos = repos_dir(&location.path);
        if repos.exists()
            && let Err(err) = fs::remove_dir_all(&repos)
        {
            self.restore_worktrees(&location.path, &removed);
            return Err(Error::state_write(
                format!("remove {}", repos.display()),
                err.into(),
            ));
        }

        let archived_path = self.layout.workspace_path(id, WorkspaceStatus::Archived);
        let moved = fs::create_dir_all(self.layout.storage_dir(WorkspaceStatus::Archived))
            .and_then(|_| fs::rename(&location.path, &archived_path));
        if let Err(err) = moved {
            self.restore_worktrees(&location.path, &removed);
            return Err(Error::state_write(
                format!("move {} to archive", location.path.display()),
                err.into(),
            ));
        }

        let mut archived = meta.clone();
        archived.workspace.status = WorkspaceStatus::Archived;
        archived.workspace.purge_locked = true;
        archived.workspace.touch();

        let committed = metadata::save(&archived_path, &archived).and_then(|_| {
            self.root_repo().commit_paths(
                &format!("archive: {}", id),
                &[
                    self.layout.relative(&location.path),
                    self.layout.relative(&archived_path),
                ],
            )
        });
        let commit = match committed {
            Ok(commit) => commit,
            Err(err) => {
                self.undo_move(&archived_path, &location.path, &meta);
                self.restore_worktrees(&location.path, &removed);
                return Err(Error::state_write(format!("archive '{}'", id), err));
            }
        };

        let mut warnings = Vec::new();
        self.index_write(&mut warnings, "close", |idx| {
            idx.upsert_workspace(&archived)?;
            idx.set_archived_commit(id, commit.as_deref())?;
            idx.append_event(id, EventType::Archived, archived.workspace.updated_at)
        });
        tracing::info!(workspace = id, commit = ?commit, "workspace archived");

        Ok(CloseReport {
            id: id.to_string(),
            path: archived_path,
            commit,
            removed_worktrees: removed.iter().map(|b| b.alias.clone()).collect(),
            discarded: dirty,
            warnings,
        })
    }

    /// Bring an archived workspace back and recreate its worktrees.
    ///
    /// Branch conflicts and a dirty root index are refused before anything
    /// moves. Once the directory has moved and the move is committed, a
    /// worktree that cannot be recreated is reported in the result (and
    /// marked missing in the index) instead of undoing the reopen.
    pub fn reopen(&self, id: &str) -> Result<ReopenReport> {
        let (location, meta) = self.load(id)?;
        require_status(&location, "reopen", WorkspaceStatus::Archived)?;
        let root = self.root_repo();
        root.ensure_repository("reopen")?;

        let active_path = self.layout.workspace_path(id, WorkspaceStatus::Active);
        let worktrees = self.worktrees();
        for binding in &meta.repos {
            let bare = self.pool.bare_path(&binding.repo_uid);
            if !bare.exists() {
                continue;
            }
            let target = worktree_path(&active_path, &binding.alias);
            if let Some(path) =
                worktrees.branch_checked_out_elsewhere(&bare, &binding.branch, &target)?
            {
                return Err(Conflict::BranchCheckedOutElsewhere {
                    branch: binding.branch.clone(),
                    path,
                }
                .into());
            }
        }
        if root.has_staged_changes()? {
            return Err(Conflict::RootIndexDirty {
                operation: "reopen".to_string(),
            }
            .into());
        }

        let moved = fs::create_dir_all(self.layout.storage_dir(WorkspaceStatus::Active))
            .and_then(|_| fs::rename(&location.path, &active_path));
        if let Err(err) = moved {
            return Err(Error::state_write(
                format!("move {} out of archive", location.path.display()),
                err.into(),
            ));
        }

        let mut reopened = meta.clone();
        reopened.workspace.status = WorkspaceStatus::Active;
        reopened.workspace.purge_locked = false;
        reopened.workspace.touch();

        // Commit before any worktree exists so none can be recorded as a gitlink.
        let committed = metadata::save(&active_path, &reopened).and_then(|_| {
            root.commit_paths(
                &format!("reopen: {}", id),
                &[
                    self.layout.relative(&location.path),
                    self.layout.relative(&active_path),
                ],
            )
        });
        let commit = match committed {
            Ok(commit) => commit,
            Err(err) => {
                self.undo_move(&active_path, &location.path, &meta);
                return Err(Error::state_write(format!("reopen '{}'", id), err));
            }
        };

        let mut repos = Vec::with_capacity(reopened.repos.len());
        for binding in &reopened.repos {
            let restore = match self.rebind(&active_path, binding) {
                Ok(BindOutcome::AlreadyBound) => BindingRestore {
                    alias: binding.alias.clone(),
                    branch: binding.branch.clone(),
                    status: RestoreStatus::AlreadyPresent,
                    error: None,
                },
                Ok(BindOutcome::Created { .. }) => BindingRestore {
                    alias: binding.alias.clone(),
                    branch: binding.branch.clone(),
                    status: RestoreStatus::Restored,
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(
                        workspace = id,
                        alias = %binding.alias,
                        error = %err,
                        "worktree not restored"
                    );
                    BindingRestore {
                        alias: binding.alias.clone(),
                        branch: binding.branch.clone(),
                        status: RestoreStatus::Failed,
                        error: Some(err.to_string()),
                    }
                }
            };
            repos.push(restore);
        }
        let failed: Vec<&str> = repos
            .iter()
            .filter(|r| r.status == RestoreStatus::Failed)
            .map(|r| r.alias.as_str())
            .collect();

        let mut warnings = Vec::new();
        let now = now_ts();
        self.index_write(&mut warnings, "reopen", |idx| {
            idx.upsert_workspace(&reopened)?;
            for restore in &repos {
                if restore.status == RestoreStatus::Failed {
                    idx.mark_missing(id, &restore.alias, now)?;
                } else {
                    idx.clear_missing(id, &restore.alias)?;
                }
            }
            idx.append_event(id, EventType::Reopened, reopened.workspace.updated_at)
        });
        tracing::info!(workspace = id, failed = failed.len(), "workspace reopened");

        let partial = !failed.is_empty();
        Ok(ReopenReport {
            id: id.to_string(),
            path: active_path,
            commit,
            repos,
            partial,
            warnings,
        })
    }

    /// Permanently delete an archived workspace.
    pub fn purge(&mut self, id: &str, options: PurgeOptions) -> Result<PurgeReport> {
        let (location, meta) = self.load(id)?;
        require_status(&location, "purge", WorkspaceStatus::Archived)?;
        if meta.workspace.purge_locked && !options.force {
            return Err(Conflict::PurgeLocked { id: id.to_string() }.into());
        }

        // Archived storage holds no worktrees; anything under repos/ is assessed.
        let report = if repos_dir(&location.path).exists() {
            risk::assess(&self.worktrees(), &location.path, &meta.repos)
        } else {
            RiskReport {
                aggregate: RiskLevel::Clean,
                repos: Vec::new(),
            }
        };
        self.require_confirmation(
            "purge",
            &format!("Permanently delete archived workspace '{}'?", id),
            "purge cannot be undone",
            options.yes,
            "--yes",
        )?;
        if report.aggregate != RiskLevel::Clean {
            let unverified = report.aliases_at(RiskLevel::Unknown);
            let dirty = report.dirty_aliases();
            let detail = if dirty.is_empty() {
                format!("the state of {} cannot be verified", unverified.join(", "))
            } else {
                format!("{} still hold uncommitted changes", dirty.join(", "))
            };
            self.require_confirmation(
                "purge",
                &format!("Workspace risk is {}: {}. Delete anyway?", report.aggregate, detail),
                &detail,
                options.yes,
                "--yes",
            )?;
        }

        let root = self.root_repo();
        root.ensure_repository("purge")?;
        fs::remove_dir_all(&location.path).map_err(|err| {
            Error::state_write(format!("delete {}", location.path.display()), err.into())
        })?;
        let committed = root.commit_paths(
            &format!("purge: {}", id),
            &[self.layout.relative(&location.path)],
        );

        // The event goes in before the rows it describes are deleted.
        let mut warnings = Vec::new();
        self.index_write(&mut warnings, "purge", |idx| {
            idx.append_event(id, EventType::Purged, now_ts())?;
            idx.delete_workspace(id)
        });

        let commit = committed.map_err(|err| {
            Error::state_write(
                format!(
                    "'{}' was deleted but the purge commit failed; commit the removal of {} by hand",
                    id,
                    self.layout.relative(&location.path).display()
                ),
                err,
            )
        })?;
        tracing::info!(workspace = id, commit = ?commit, "workspace purged");
        Ok(PurgeReport {
            id: id.to_string(),
            commit,
            warnings,
        })
    }

    fn rebind(&self, workspace_path: &Path, binding: &RepoBinding) -> Result<BindOutcome> {
        let mut bare = self.pool.bare_path(&binding.repo_uid);
        if !bare.exists() {
            bare = self
                .pool
                .ensure_fetched(&RepoSpec::from_binding(binding)?)?
                .path;
        }
        self.worktrees().ensure_bound(
            &bare,
            workspace_path,
            &binding.alias,
            &binding.branch,
            &binding.base_ref,
        )
    }

    /// Best-effort recreation of worktrees removed by an aborted close.
    fn restore_worktrees(&self, workspace_path: &Path, bindings: &[&RepoBinding]) {
        for binding in bindings {
            if let Err(err) = self.rebind(workspace_path, binding) {
                tracing::warn!(alias = %binding.alias, error = %err, "could not restore worktree");
            }
        }
    }

    /// Put a moved workspace back where it was, with its previous metadata.
    fn undo_move(&self, moved_to: &Path, original: &Path, meta: &Metadata) {
        if let Err(err) = metadata::save(moved_to, meta) {
            tracing::warn!(error = %err, "could not restore metadata");
        }
        if let Err(err) = fs::rename(moved_to, original) {
            tracing::warn!(
                from = %moved_to.display(),
                to = %original.display(),
                error = %err,
                "could not move workspace back"
            );
        }
    }
}

/// Entries under `repos/` that no binding accounts for.
fn stray_entries(repos: &Path, meta: &Metadata) -> Result<Vec<String>> {
    if !repos.is_dir() {
        return Ok(Vec::new());
    }
    let mut stray = Vec::new();
    for entry in fs::read_dir(repos)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if meta.binding(&name).is_none() {
            stray.push(name);
        }
    }
    stray.sort();
    Ok(stray)
}
