//! Berth - ticket-scoped developer workspaces built from git worktrees.
//!
//! A workspace is a directory under `<root>/workspaces/<id>/` holding one git
//! worktree per bound repository plus a `workspace.json` metadata file. Closing
//! a workspace moves it to `<root>/archive/<id>/` and records the move as a
//! commit in the root repository; purging deletes it for good.
//!
//! Three records are kept in agreement:
//! - the directory layout on disk,
//! - the per-workspace metadata file (authoritative),
//! - a SQLite index under `<root>/.state/` (derived, rebuildable, optional).

pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod git;
pub mod models;
pub mod pool;
pub mod prompt;
pub mod risk;
pub mod scaffold;
pub mod storage;

use models::WorkspaceStatus;
use std::path::PathBuf;

/// Test utilities for isolated test environments.
#[cfg(test)]
pub(crate) mod test_utils {
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use tempfile::TempDir;

    use crate::config::Config;
    use crate::engine::Engine;
    use crate::git::Git;
    use crate::pool::GitPool;
    use crate::prompt::Interaction;

    /// Run git in `dir`, panicking on failure.
    pub fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .expect("failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Configure a throwaway identity so commits work on CI machines.
    pub fn configure_identity(dir: &Path) {
        git(dir, &["config", "user.email", "test@test.com"]);
        git(dir, &["config", "user.name", "Test"]);
    }

    /// Test environment with an isolated root, repo pool and upstream store.
    ///
    /// - `root_dir`: the workspace root (a git repository after `engine()`)
    /// - `pool_dir`: the bare-repository pool
    /// - `upstream_dir`: plays the part of the remote hosting service
    pub struct TestEnv {
        pub root_dir: TempDir,
        pub pool_dir: TempDir,
        pub upstream_dir: TempDir,
    }

    impl TestEnv {
        pub fn new() -> Self {
            Self {
                root_dir: TempDir::new().unwrap(),
                pool_dir: TempDir::new().unwrap(),
                upstream_dir: TempDir::new().unwrap(),
            }
        }

        pub fn root(&self) -> &Path {
            self.root_dir.path()
        }

        /// Create an upstream bare repository at `<upstream>/<host>/<owner>/<repo>.git`
        /// with one commit on `main`, returning its `file://` URL.
        pub fn upstream(&self, host: &str, owner: &str, repo: &str) -> String {
            let seed = self.upstream_dir.path().join(format!("seed-{owner}-{repo}"));
            std::fs::create_dir_all(&seed).unwrap();
            git(&seed, &["init", "-q", "-b", "main"]);
            configure_identity(&seed);
            std::fs::write(seed.join("README.md"), format!("# {repo}\n")).unwrap();
            git(&seed, &["add", "README.md"]);
            git(&seed, &["commit", "-q", "-m", "initial"]);

            let bare = self
                .upstream_dir
                .path()
                .join(host)
                .join(owner)
                .join(format!("{repo}.git"));
            std::fs::create_dir_all(bare.parent().unwrap()).unwrap();
            git(
                self.upstream_dir.path(),
                &[
                    "clone",
                    "-q",
                    "--bare",
                    seed.to_str().unwrap(),
                    bare.to_str().unwrap(),
                ],
            );
            format!("file://{}", bare.display())
        }

        /// Build a non-interactive engine over an initialized root.
        pub fn engine(&self) -> Engine {
            let git = Git::new();
            let pool = GitPool::new(self.pool_dir.path().to_path_buf(), git.clone());
            let engine = Engine::new(
                self.root().to_path_buf(),
                Config::default(),
                Box::new(pool),
                Interaction::NonInteractive,
            );
            engine.init().unwrap();
            configure_identity(self.root());
            engine
        }

        pub fn worktree(&self, id: &str, alias: &str) -> PathBuf {
            self.root()
                .join("workspaces")
                .join(id)
                .join("repos")
                .join(alias)
        }
    }

    impl Default for TestEnv {
        fn default() -> Self {
            Self::new()
        }
    }
}

/// Library-level error type for berth operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Malformed identifier or bad flag combination. Reported before any side effect.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{what} already exists: {hint}")]
    AlreadyExists { what: String, hint: String },

    #[error("{what} not found: {hint}")]
    NotFound { what: String, hint: String },

    /// A precondition failed; nothing was changed.
    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// An authoritative filesystem or metadata mutation failed.
    #[error("Failed to write workspace state ({context}): {source}")]
    StateWriteFailed {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// The secondary index cannot serve a query-only command.
    #[error(transparent)]
    IndexUnavailable(#[from] IndexProblem),

    #[error("Metadata at {} is corrupted: {reason}", .path.display())]
    MetadataCorrupted { path: PathBuf, reason: String },

    #[error("Metadata at {} uses schema version {version}, which this build does not understand", .path.display())]
    UnsupportedSchema { path: PathBuf, version: u64 },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("git {command} timed out after {seconds}s")]
    GitTimeout { command: String, seconds: u64 },
}

impl Error {
    /// Process exit code for this error: usage errors exit 2, everything else 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 2,
            _ => 1,
        }
    }

    pub(crate) fn state_write(context: impl Into<String>, source: Error) -> Self {
        Error::StateWriteFailed {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn workspace_not_found(id: &str) -> Self {
        Error::NotFound {
            what: format!("workspace '{}'", id),
            hint: format!("create it with `berth create {}`", id),
        }
    }
}

/// Blocking preconditions that refuse an operation before it touches anything.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    #[error("worktree '{alias}' has uncommitted or untracked changes (pass --force to discard them)")]
    DirtyWorktree { alias: String },

    #[error("{} is not readable as a git worktree (pass --force to delete it)", .path.display())]
    UnreadableWorktree { alias: String, path: PathBuf },

    #[error("branch '{branch}' is already checked out in another worktree at {}", .path.display())]
    BranchCheckedOutElsewhere { branch: String, path: PathBuf },

    #[error("base ref '{base_ref}' cannot be resolved in {}", .repo.display())]
    BaseRefNotFound { base_ref: String, repo: PathBuf },

    #[error("workspace '{id}' is purge-locked; run `berth unlock {id}` first or pass --force")]
    PurgeLocked { id: String },

    #[error("root repository has staged changes; commit or unstage them before {operation}")]
    RootIndexDirty { operation: String },

    #[error("{action} needs confirmation: {reason} (pass {flag} to proceed non-interactively)")]
    ConfirmationRequired {
        action: String,
        reason: String,
        flag: String,
    },

    #[error("{action} cancelled at the confirmation prompt")]
    Declined { action: String },

    #[error("workspace '{id}' is {actual}; {operation} requires an {expected} workspace{}", hint_suffix(.hint))]
    WrongState {
        id: String,
        operation: String,
        expected: WorkspaceStatus,
        actual: WorkspaceStatus,
        hint: Option<String>,
    },

    #[error("'{key}' matches several repositories ({}); name one by alias", .aliases.join(", "))]
    AmbiguousRepo { key: String, aliases: Vec<String> },

    #[error("{} already exists and is not a worktree on branch '{branch}'", .path.display())]
    PathOccupied { path: PathBuf, branch: String },

    #[error("{} holds entries no binding accounts for: {}", .repos_dir.display(), .entries.join(", "))]
    StrayRepoContent {
        repos_dir: PathBuf,
        entries: Vec<String>,
    },

    #[error("workspace '{id}' exists in both active and archived storage; remove one copy by hand")]
    DuplicateLocation { id: String },
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!(" ({})", h),
        None => String::new(),
    }
}

/// Why the secondary index could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexProblem {
    #[error("index {} does not exist yet; it will be recreated by the next mutating command", .path.display())]
    Absent { path: PathBuf },

    #[error("index {} is malformed ({reason}); fix or remove it, then run `berth index rebuild`", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

impl IndexProblem {
    pub fn is_absent(&self) -> bool {
        matches!(self, IndexProblem::Absent { .. })
    }
}

/// Result type alias for berth operations.
pub type Result<T> = std::result::Result<T, Error>;
