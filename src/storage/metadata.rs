//! Workspace metadata store.
//!
//! Each workspace directory carries a single `workspace.json` file holding the
//! workspace record and its ordered repository bindings. This file is the
//! source of truth: it is read and written without touching the index.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the old file, so a crash mid-write leaves the previous version intact.

use super::metadata_path;
use crate::models::{RepoBinding, Workspace};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Current metadata schema version. Other versions fail closed.
pub const SCHEMA_VERSION: u64 = 1;

/// Contents of `workspace.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub schema_version: u64,
    pub workspace: Workspace,
    #[serde(default)]
    pub repos: Vec<RepoBinding>,
}

impl Metadata {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            workspace,
            repos: Vec::new(),
        }
    }

    pub fn binding(&self, alias: &str) -> Option<&RepoBinding> {
        self.repos.iter().find(|b| b.alias == alias)
    }

    /// Bindings that `key` could refer to (alias, `owner/repo`, or uid).
    ///
    /// An exact alias match wins over key matches.
    pub fn bindings_matching(&self, key: &str) -> Vec<&RepoBinding> {
        if let Some(binding) = self.binding(key) {
            return vec![binding];
        }
        self.repos.iter().filter(|b| b.matches(key)).collect()
    }

    /// Remove the binding with `alias`, returning it.
    pub fn remove_binding(&mut self, alias: &str) -> Option<RepoBinding> {
        let pos = self.repos.iter().position(|b| b.alias == alias)?;
        Some(self.repos.remove(pos))
    }
}

/// Load the metadata of the workspace at `workspace_path`.
///
/// Returns [`Error::NotFound`] if the file is missing, [`Error::MetadataCorrupted`]
/// if it cannot be parsed, and [`Error::UnsupportedSchema`] for any schema
/// version other than [`SCHEMA_VERSION`].
pub fn load(workspace_path: &Path) -> Result<Metadata> {
    let path = metadata_path(workspace_path);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::NotFound {
                what: format!("metadata file {}", path.display()),
                hint: "the workspace directory exists but was not created by berth".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| Error::MetadataCorrupted {
            path: path.clone(),
            reason: e.to_string(),
        })?;

    let version = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::MetadataCorrupted {
            path: path.clone(),
            reason: "missing schema_version".to_string(),
        })?;
    if version != SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema { path, version });
    }

    serde_json::from_value(value).map_err(|e| Error::MetadataCorrupted {
        path,
        reason: e.to_string(),
    })
}

/// Atomically write `metadata` into the workspace at `workspace_path`.
pub fn save(workspace_path: &Path, metadata: &Metadata) -> Result<()> {
    let path = metadata_path(workspace_path);
    let json = serde_json::to_string_pretty(metadata)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".workspace.json.")
        .tempfile_in(workspace_path)?;
    tmp.write_all(json.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
