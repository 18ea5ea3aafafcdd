//! Worktree binding and removal against pooled bare repositories.

use super::Git;
use crate::storage::worktree_path;
use crate::{Conflict, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name; `None` for detached or bare entries
    pub branch: Option<String>,
    pub bare: bool,
    pub prunable: bool,
}

/// What [`Worktrees::ensure_bound`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Created { created_branch: bool },
    AlreadyBound,
}

/// Worktree operations on top of a [`Git`] runner.
pub struct Worktrees<'a> {
    git: &'a Git,
}

impl<'a> Worktrees<'a> {
    pub fn new(git: &'a Git) -> Self {
        Self { git }
    }

    /// Forget registrations whose directories were deleted by hand.
    pub fn prune(&self, repo: &Path) -> Result<()> {
        self.git.run(repo, &["worktree", "prune"])?;
        Ok(())
    }

    pub fn list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>> {
        let raw = self.git.run(repo, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&raw))
    }

    /// Path of a live worktree other than `except` that has `branch` checked out.
    pub fn branch_checked_out_elsewhere(
        &self,
        repo: &Path,
        branch: &str,
        except: &Path,
    ) -> Result<Option<PathBuf>> {
        self.prune(repo)?;
        for entry in self.list(repo)? {
            if entry.bare || entry.branch.as_deref() != Some(branch) {
                continue;
            }
            if !entry.path.exists() || same_path(&entry.path, except) {
                continue;
            }
            return Ok(Some(entry.path));
        }
        Ok(None)
    }

    pub fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let full = format!("refs/heads/{}", branch);
        self.git
            .succeeds(repo, &["show-ref", "--verify", "--quiet", &full])
    }

    /// Resolve `reference` to a commit id, or `None` if it does not name a commit.
    pub fn resolve_ref(&self, repo: &Path, reference: &str) -> Result<Option<String>> {
        let spec = format!("{}^{{commit}}", reference);
        let output = self
            .git
            .output(repo, &["rev-parse", "--verify", "--quiet", &spec])?;
        if output.success {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Make sure `<workspace>/repos/<alias>` is a worktree of `repo` on `branch`.
    ///
    /// A branch that does not exist yet is created from `base_ref` without
    /// upstream tracking. Calling this again for an existing, matching
    /// worktree is a no-op.
    pub fn ensure_bound(
        &self,
        repo: &Path,
        workspace_path: &Path,
        alias: &str,
        branch: &str,
        base_ref: &str,
    ) -> Result<BindOutcome> {
        let target = worktree_path(workspace_path, alias);
        self.prune(repo)?;

        if target.exists() {
            let entries = self.list(repo)?;
            let registered = entries.iter().find(|e| same_path(&e.path, &target));
            return match registered {
                Some(entry) if entry.branch.as_deref() == Some(branch) => {
                    Ok(BindOutcome::AlreadyBound)
                }
                _ => Err(Conflict::PathOccupied {
                    path: target,
                    branch: branch.to_string(),
                }
                .into()),
            };
        }

        if let Some(path) = self.branch_checked_out_elsewhere(repo, branch, &target)? {
            return Err(Conflict::BranchCheckedOutElsewhere {
                branch: branch.to_string(),
                path,
            }
            .into());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let target_arg = target.to_string_lossy().to_string();

        if self.branch_exists(repo, branch)? {
            self.git
                .run(repo, &["worktree", "add", &target_arg, branch])?;
            tracing::info!(alias, branch, "worktree attached to existing branch");
            return Ok(BindOutcome::Created {
                created_branch: false,
            });
        }

        if self.resolve_ref(repo, base_ref)?.is_none() {
            return Err(Conflict::BaseRefNotFound {
                base_ref: base_ref.to_string(),
                repo: repo.to_path_buf(),
            }
            .into());
        }
        self.git.run(
            repo,
            &[
                "worktree",
                "add",
                "--no-track",
                "-b",
                branch,
                &target_arg,
                base_ref,
            ],
        )?;
        tracing::info!(alias, branch, base_ref, "worktree created on new branch");
        Ok(BindOutcome::Created {
            created_branch: true,
        })
    }

    /// Remove a worktree directory and its registration.
    ///
    /// `repo` may be `None` when the pooled repository is unknown; the owning
    /// repository is then read from the worktree itself. Returns `false` if
    /// there was nothing to remove.
    pub fn remove_bound(&self, repo: Option<&Path>, worktree: &Path, force: bool) -> Result<bool> {
        if !worktree.exists() {
            if let Some(repo) = repo.filter(|r| r.exists()) {
                self.prune(repo)?;
            }
            return Ok(false);
        }

        let owner = match repo {
            Some(repo) if repo.exists() => Some(repo.to_path_buf()),
            _ => self.common_dir(worktree)?,
        };

        // git refuses `worktree remove` once the `.git` link is gone.
        let registered = match &owner {
            Some(_) if !worktree.join(".git").exists() => false,
            Some(owner) => self
                .list(owner)?
                .iter()
                .any(|e| !e.bare && same_path(&e.path, worktree)),
            None => false,
        };

        match owner {
            Some(owner) if registered => {
                let target = worktree.to_string_lossy().to_string();
                let mut args = vec!["worktree", "remove"];
                if force {
                    args.push("--force");
                }
                args.push(&target);
                self.git.run(&owner, &args)?;
                self.prune(&owner)?;
            }
            owner => {
                fs::remove_dir_all(worktree)?;
                if let Some(owner) = owner {
                    self.prune(&owner)?;
                }
            }
        }
        Ok(true)
    }

    /// Whether `path` is the top level of its own checkout.
    ///
    /// False for a directory whose `.git` link is gone, where git would
    /// otherwise answer for an enclosing repository.
    pub fn is_worktree_root(&self, path: &Path) -> Result<bool> {
        if !path.join(".git").exists() {
            return Ok(false);
        }
        let output = self.git.output(path, &["rev-parse", "--show-toplevel"])?;
        Ok(output.success && same_path(Path::new(output.stdout.trim()), path))
    }

    /// Whether the worktree has staged, unstaged or untracked changes.
    pub fn is_dirty(&self, worktree: &Path) -> Result<bool> {
        let status = self.git.run(
            worktree,
            &["status", "--porcelain", "--untracked-files=normal"],
        )?;
        Ok(!status.is_empty())
    }

    fn common_dir(&self, worktree: &Path) -> Result<Option<PathBuf>> {
        if !worktree.join(".git").exists() {
            return Ok(None);
        }
        let output = self.git.output(
            worktree,
            &["rev-parse", "--path-format=absolute", "--git-common-dir"],
        )?;
        if !output.success {
            return Ok(None);
        }
        let path = PathBuf::from(output.stdout.trim());
        Ok(path.exists().then_some(path))
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

pub(crate) fn parse_worktree_porcelain(raw: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in raw.lines() {
        if line.is_empty() {
            entries.extend(current.take());
            continue;
        }

        if let Some(value) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(value.trim()),
                branch: None,
                bare: false,
                prunable: false,
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(value) = line.strip_prefix("branch ") {
            entry.branch = value
                .trim()
                .strip_prefix("refs/heads/")
                .map(str::to_string);
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "prunable" || line.starts_with("prunable ") {
            entry.prunable = true;
        }
    }

    entries.extend(current.take());
    entries
}
