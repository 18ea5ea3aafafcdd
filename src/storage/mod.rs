//! Storage layer for berth data.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   berth.toml                 optional configuration
//!   templates/<name>/          optional workspace scaffolds
//!   workspaces/<id>/           active workspaces
//!     workspace.json           authoritative metadata
//!     repos/<alias>/           one git worktree per binding
//!   archive/<id>/              archived workspaces (never contain repos/)
//!   .state/index.db            secondary index (derived, safe to delete)
//! ```
//!
//! The metadata file is the source of truth. The SQLite index is a cache that
//! is reconciled from the filesystem and never consulted for correctness.

pub mod index;
pub mod metadata;

pub use index::{BindingRow, Index, IndexFilter, ReconcileStats, WorkspaceRow};
pub use metadata::Metadata;

use crate::models::WorkspaceStatus;
use crate::{Conflict, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const WORKSPACES_DIR: &str = "workspaces";
pub const ARCHIVE_DIR: &str = "archive";
pub const STATE_DIR: &str = ".state";
pub const REPOS_DIR: &str = "repos";
pub const TEMPLATES_DIR: &str = "templates";
pub const METADATA_FILE: &str = "workspace.json";
pub const INDEX_FILE: &str = "index.db";
pub const CONFIG_FILE: &str = "berth.toml";

/// Resolved paths for one workspace root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

/// Where a workspace currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: String,
    pub status: WorkspaceStatus,
    pub path: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn storage_dir(&self, status: WorkspaceStatus) -> PathBuf {
        match status {
            WorkspaceStatus::Active => self.root.join(WORKSPACES_DIR),
            WorkspaceStatus::Archived => self.root.join(ARCHIVE_DIR),
        }
    }

    pub fn workspace_path(&self, id: &str, status: WorkspaceStatus) -> PathBuf {
        self.storage_dir(status).join(id)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn index_path(&self) -> PathBuf {
        self.state_dir().join(INDEX_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn template_dir(&self, name: &str) -> PathBuf {
        self.root.join(TEMPLATES_DIR).join(name)
    }

    /// Path of `path` relative to the root, for git pathspecs.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root).unwrap_or(path).to_path_buf()
    }

    /// Find which storage holds `id`.
    ///
    /// Fails with [`Conflict::DuplicateLocation`] if both copies exist, which
    /// only happens after an out-of-band copy.
    pub fn locate(&self, id: &str) -> Result<Option<Location>> {
        let active = self.workspace_path(id, WorkspaceStatus::Active);
        let archived = self.workspace_path(id, WorkspaceStatus::Archived);
        match (active.is_dir(), archived.is_dir()) {
            (true, true) => Err(Conflict::DuplicateLocation { id: id.to_string() }.into()),
            (true, false) => Ok(Some(Location {
                id: id.to_string(),
                status: WorkspaceStatus::Active,
                path: active,
            })),
            (false, true) => Ok(Some(Location {
                id: id.to_string(),
                status: WorkspaceStatus::Archived,
                path: archived,
            })),
            (false, false) => Ok(None),
        }
    }

    /// List workspace ids in one storage area, sorted.
    ///
    /// Hidden entries and plain files are skipped. A missing storage directory
    /// yields an empty list.
    pub fn scan(&self, status: WorkspaceStatus) -> Result<Vec<String>> {
        let dir = self.storage_dir(status);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }
}

/// Paths inside one workspace directory.
pub fn metadata_path(workspace_path: &Path) -> PathBuf {
    workspace_path.join(METADATA_FILE)
}

pub fn repos_dir(workspace_path: &Path) -> PathBuf {
    workspace_path.join(REPOS_DIR)
}

pub fn worktree_path(workspace_path: &Path, alias: &str) -> PathBuf {
    repos_dir(workspace_path).join(alias)
}

/// Find the workspace root by walking up from `start`.
///
/// A directory qualifies if it holds `berth.toml` or a `workspaces/` directory.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(CONFIG_FILE).is_file() || dir.join(WORKSPACES_DIR).is_dir() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_locate_reports_storage_area() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        fs::create_dir_all(layout.workspace_path("A", WorkspaceStatus::Active)).unwrap();
        fs::create_dir_all(layout.workspace_path("B", WorkspaceStatus::Archived)).unwrap();

        let a = layout.locate("A").unwrap().unwrap();
        assert_eq!(a.status, WorkspaceStatus::Active);
        let b = layout.locate("B").unwrap().unwrap();
        assert_eq!(b.status, WorkspaceStatus::Archived);
        assert!(layout.locate("C").unwrap().is_none());
    }

    #[test]
    fn test_locate_rejects_duplicate_copies() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        fs::create_dir_all(layout.workspace_path("A", WorkspaceStatus::Active)).unwrap();
        fs::create_dir_all(layout.workspace_path("A", WorkspaceStatus::Archived)).unwrap();

        let err = layout.locate("A").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Conflict(Conflict::DuplicateLocation { .. })
        ));
    }

    #[test]
    fn test_scan_skips_hidden_and_files() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let active = layout.storage_dir(WorkspaceStatus::Active);
        fs::create_dir_all(active.join("B")).unwrap();
        fs::create_dir_all(active.join("A")).unwrap();
        fs::create_dir_all(active.join(".tmp")).unwrap();
        fs::write(active.join("notes.txt"), "x").unwrap();

        assert_eq!(layout.scan(WorkspaceStatus::Active).unwrap(), vec!["A", "B"]);
        assert!(layout.scan(WorkspaceStatus::Archived).unwrap().is_empty());
    }

    #[test]
    fn test_find_root_walks_up() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(WORKSPACES_DIR).join("WS1").join("repos")).unwrap();
        let nested = temp.path().join(WORKSPACES_DIR).join("WS1").join("repos");

        let found = find_root(&nested).unwrap();
        assert_eq!(found, temp.path());
    }
}
