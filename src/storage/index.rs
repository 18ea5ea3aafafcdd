//! Secondary index over workspaces, bindings and events.
//!
//! The index lives at `<root>/.state/index.db` and is a projection of the
//! filesystem: every row except the event log can be rebuilt from a directory
//! scan plus metadata reads. Callers treat every write as best-effort and fall
//! back to the filesystem whenever [`Index::open_or_create`] reports a problem.
//!
//! The event log has no foreign key to `workspaces` so that purge can delete a
//! workspace's rows while its history stays queryable.

use super::{Layout, Metadata, metadata};
use crate::models::{EventType, RepoBinding, WorkspaceEvent, WorkspaceStatus};
use crate::{IndexProblem, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Schema version stored in the `meta` table. Any other value is "malformed".
pub const INDEX_SCHEMA_VERSION: &str = "1";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL DEFAULT 0,
        purge_locked INTEGER NOT NULL DEFAULT 0,
        archived_commit TEXT
    );

    CREATE TABLE IF NOT EXISTS workspace_repos (
        workspace_id TEXT NOT NULL,
        alias TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        repo_uid TEXT NOT NULL,
        repo_key TEXT NOT NULL,
        remote_url TEXT NOT NULL,
        branch TEXT NOT NULL,
        base_ref TEXT NOT NULL,
        missing_since INTEGER,
        PRIMARY KEY (workspace_id, alias),
        FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS workspace_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        workspace_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workspaces_status ON workspaces(status);
    CREATE INDEX IF NOT EXISTS idx_workspace_repos_uid ON workspace_repos(repo_uid);
    CREATE INDEX IF NOT EXISTS idx_workspace_events_workspace ON workspace_events(workspace_id);
"#;

/// Handle to an open, schema-checked index.
pub struct Index {
    conn: Connection,
    path: PathBuf,
}

/// A workspace row with its bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceRow {
    pub id: String,
    pub title: String,
    pub status: WorkspaceStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub purge_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_commit: Option<String>,
    pub repos: Vec<BindingRow>,
}

/// A binding row. `missing_since` is set once a worktree is seen gone from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingRow {
    pub alias: String,
    pub repo_uid: String,
    pub repo_key: String,
    pub remote_url: String,
    pub branch: String,
    pub base_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_since: Option<i64>,
}

impl BindingRow {
    pub fn to_binding(&self) -> RepoBinding {
        RepoBinding {
            repo_uid: self.repo_uid.clone(),
            repo_key: self.repo_key.clone(),
            remote_url: self.remote_url.clone(),
            alias: self.alias.clone(),
            branch: self.branch.clone(),
            base_ref: self.base_ref.clone(),
        }
    }
}

/// Filters for [`Index::list_workspaces`].
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub status: Option<WorkspaceStatus>,
    /// Only workspaces binding this repository (`owner/repo` or `host/owner/repo`)
    pub repo: Option<String>,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub refreshed: usize,
    pub removed: usize,
}

impl ReconcileStats {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.refreshed == 0 && self.removed == 0
    }
}

type Opened = std::result::Result<Index, IndexProblem>;

impl Index {
    /// Open an existing index for querying. Never creates the file.
    pub fn open(layout: &Layout) -> Opened {
        let path = layout.index_path();
        if !path.exists() {
            return Err(IndexProblem::Absent { path });
        }
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(|e| malformed(&path, e.to_string()))?;
        Self::check(conn, path, false)
    }

    /// Open the index, creating it if it does not exist yet.
    ///
    /// An existing file that is not a database, or carries a different schema
    /// version, is reported as [`IndexProblem::Malformed`] and left untouched.
    pub fn open_or_create(layout: &Layout) -> Opened {
        let path = layout.index_path();
        fs::create_dir_all(layout.state_dir())
            .map_err(|e| malformed(&path, format!("cannot create state directory: {}", e)))?;
        let conn = Connection::open(&path).map_err(|e| malformed(&path, e.to_string()))?;
        Self::check(conn, path, true)
    }

    fn check(conn: Connection, path: PathBuf, create: bool) -> Opened {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| malformed(&path, e.to_string()))?;

        // Garbage bytes surface here as "file is not a database".
        let tables: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))
            .map_err(|e| malformed(&path, e.to_string()))?;

        if tables == 0 {
            if !create {
                return Err(IndexProblem::Absent { path });
            }
            conn.execute_batch(SCHEMA)
                .and_then(|_| {
                    conn.execute(
                        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                        params![INDEX_SCHEMA_VERSION],
                    )
                })
                .map_err(|e| malformed(&path, e.to_string()))?;
        } else {
            let version: Option<String> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'schema_version'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| malformed(&path, e.to_string()))?;
            match version.as_deref() {
                Some(INDEX_SCHEMA_VERSION) => {}
                Some(other) => {
                    return Err(malformed(
                        &path,
                        format!(
                            "schema version {}, expected {}",
                            other, INDEX_SCHEMA_VERSION
                        ),
                    ));
                }
                None => return Err(malformed(&path, "missing schema version".to_string())),
            }
        }

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| malformed(&path, e.to_string()))?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the index files so the next open starts from scratch.
    pub fn remove_files(layout: &Layout) -> Result<()> {
        let path = layout.index_path();
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let candidate = PathBuf::from(format!("{}{}", path.display(), suffix));
            if candidate.exists() {
                fs::remove_file(&candidate)?;
            }
        }
        Ok(())
    }

    /// Insert or refresh a workspace row and replace its bindings.
    ///
    /// `missing_since` markers survive for aliases that are still bound.
    pub fn upsert_workspace(&mut self, meta: &Metadata) -> Result<()> {
        let tx = self.conn.transaction()?;
        upsert_workspace(&tx, meta)?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_archived_commit(&mut self, id: &str, commit: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE workspaces SET archived_commit = ?2 WHERE id = ?1",
            params![id, commit],
        )?;
        Ok(())
    }

    /// Delete a workspace row and its bindings. Events are kept.
    pub fn delete_workspace(&mut self, id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        delete_workspace(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    /// Record that a bound worktree was observed missing at `at`.
    ///
    /// The first observation wins; returns whether the marker was newly set.
    pub fn mark_missing(&mut self, id: &str, alias: &str, at: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE workspace_repos SET missing_since = ?3
             WHERE workspace_id = ?1 AND alias = ?2 AND missing_since IS NULL",
            params![id, alias, at],
        )?;
        Ok(changed > 0)
    }

    /// Clear a missing marker after the worktree reappeared.
    pub fn clear_missing(&mut self, id: &str, alias: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE workspace_repos SET missing_since = NULL
             WHERE workspace_id = ?1 AND alias = ?2 AND missing_since IS NOT NULL",
            params![id, alias],
        )?;
        Ok(changed > 0)
    }

    pub fn append_event(&mut self, id: &str, event_type: EventType, at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO workspace_events (workspace_id, event_type, at) VALUES (?1, ?2, ?3)",
            params![id, event_type.as_str(), at],
        )?;
        Ok(())
    }

    /// Events in insertion order, optionally for one workspace.
    pub fn events(&self, id: Option<&str>) -> Result<Vec<WorkspaceEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, workspace_id, event_type, at FROM workspace_events
             WHERE ?1 IS NULL OR workspace_id = ?1
             ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            let kind: String = row.get(2)?;
            Ok((row.get(0)?, row.get(1)?, kind, row.get(3)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, workspace_id, kind, at): (i64, String, String, i64) = row?;
            // Unknown event types come from a newer build; skip rather than fail.
            if let Some(event_type) = EventType::parse(&kind) {
                events.push(WorkspaceEvent {
                    seq,
                    workspace_id,
                    event_type,
                    at,
                });
            }
        }
        Ok(events)
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, status, created_at, updated_at, purge_locked, archived_commit
                 FROM workspaces WHERE id = ?1",
                params![id],
                read_workspace_row,
            )
            .optional()?;
        match row {
            Some(mut row) => {
                row.repos = self.bindings(&row.id)?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// List workspaces ordered by id.
    pub fn list_workspaces(&self, filter: &IndexFilter) -> Result<Vec<WorkspaceRow>> {
        let status = filter.status.map(|s| s.as_str());
        let mut stmt = self.conn.prepare(
            "SELECT id, title, status, created_at, updated_at, purge_locked, archived_commit
             FROM workspaces w
             WHERE (?1 IS NULL OR w.status = ?1)
               AND (?2 IS NULL OR EXISTS (
                    SELECT 1 FROM workspace_repos r
                    WHERE r.workspace_id = w.id AND (r.repo_key = ?2 OR r.repo_uid = ?2)))
             ORDER BY w.id",
        )?;
        let rows = stmt.query_map(params![status, filter.repo], read_workspace_row)?;

        let mut out = Vec::new();
        for row in rows {
            let mut row = row?;
            row.repos = self.bindings(&row.id)?;
            out.push(row);
        }
        Ok(out)
    }

    fn bindings(&self, id: &str) -> Result<Vec<BindingRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT alias, repo_uid, repo_key, remote_url, branch, base_ref, missing_since
             FROM workspace_repos WHERE workspace_id = ?1
             ORDER BY position, alias",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(BindingRow {
                alias: row.get(0)?,
                repo_uid: row.get(1)?,
                repo_key: row.get(2)?,
                remote_url: row.get(3)?,
                branch: row.get(4)?,
                base_ref: row.get(5)?,
                missing_since: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Bring the index in line with the filesystem.
    ///
    /// - ids on disk but not indexed get a row (a minimal one if their
    ///   metadata is unreadable)
    /// - rows whose metadata is newer, or whose status disagrees with the
    ///   directory they live in, are refreshed
    /// - rows whose directory is gone are dropped (their events stay)
    ///
    /// Running it twice on an unchanged filesystem changes nothing the second time.
    pub fn reconcile(&mut self, layout: &Layout) -> Result<ReconcileStats> {
        let mut on_disk: BTreeMap<String, WorkspaceStatus> = BTreeMap::new();
        let mut duplicates = BTreeSet::new();
        for status in [WorkspaceStatus::Active, WorkspaceStatus::Archived] {
            for id in layout.scan(status)? {
                if on_disk.insert(id.clone(), status).is_some() {
                    duplicates.insert(id);
                }
            }
        }

        let indexed = self.indexed_state()?;
        let mut stats = ReconcileStats::default();
        let tx = self.conn.transaction()?;

        for (id, status) in &on_disk {
            if duplicates.contains(id) {
                tracing::warn!(
                    workspace = %id,
                    "present in both active and archived storage; not reconciled"
                );
                continue;
            }
            let meta = metadata::load(&layout.workspace_path(id, *status))
                .ok()
                .map(|mut m| {
                    m.workspace.id = id.clone();
                    m.workspace.status = *status;
                    m
                });

            match (indexed.get(id), meta) {
                (None, Some(meta)) => {
                    upsert_workspace(&tx, &meta)?;
                    stats.inserted += 1;
                }
                (None, None) => {
                    tx.execute(
                        "INSERT INTO workspaces (id, title, status) VALUES (?1, '', ?2)",
                        params![id, status.as_str()],
                    )?;
                    stats.inserted += 1;
                }
                (Some((_, updated_at)), Some(meta)) if meta.workspace.updated_at > *updated_at => {
                    upsert_workspace(&tx, &meta)?;
                    stats.refreshed += 1;
                }
                (Some((row_status, _)), _) if row_status != status => {
                    tx.execute(
                        "UPDATE workspaces SET status = ?2,
                            archived_commit = CASE WHEN ?2 = 'active' THEN NULL ELSE archived_commit END
                         WHERE id = ?1",
                        params![id, status.as_str()],
                    )?;
                    stats.refreshed += 1;
                }
                _ => {}
            }
        }

        for id in indexed.keys() {
            if !on_disk.contains_key(id) {
                delete_workspace(&tx, id)?;
                stats.removed += 1;
            }
        }

        tx.commit()?;
        if !stats.is_noop() {
            tracing::debug!(?stats, "index reconciled");
        }
        Ok(stats)
    }

    fn indexed_state(&self) -> Result<HashMap<String, (WorkspaceStatus, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, status, updated_at FROM workspaces")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(1)?;
            Ok((row.get::<_, String>(0)?, status, row.get::<_, i64>(2)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, status, updated_at) = row?;
            out.insert(
                id,
                (WorkspaceStatus::parse(&status).unwrap_or_default(), updated_at),
            );
        }
        Ok(out)
    }
}

fn malformed(path: &Path, reason: String) -> IndexProblem {
    IndexProblem::Malformed {
        path: path.to_path_buf(),
        reason,
    }
}

fn read_workspace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceRow> {
    let status: String = row.get(2)?;
    Ok(WorkspaceRow {
        id: row.get(0)?,
        title: row.get(1)?,
        status: WorkspaceStatus::parse(&status).unwrap_or_default(),
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        purge_locked: row.get(5)?,
        archived_commit: row.get(6)?,
        repos: Vec::new(),
    })
}

fn upsert_workspace(conn: &Connection, meta: &Metadata) -> Result<()> {
    let ws = &meta.workspace;
    conn.execute(
        "INSERT INTO workspaces (id, title, status, created_at, updated_at, purge_locked)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            status = excluded.status,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            purge_locked = excluded.purge_locked,
            archived_commit = CASE WHEN excluded.status = 'active' THEN NULL
                                   ELSE workspaces.archived_commit END",
        params![
            ws.id,
            ws.title,
            ws.status.as_str(),
            ws.created_at,
            ws.updated_at,
            ws.purge_locked
        ],
    )?;

    let mut missing: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT alias, missing_since FROM workspace_repos
             WHERE workspace_id = ?1 AND missing_since IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![ws.id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in rows {
            let (alias, since): (String, i64) = row?;
            missing.insert(alias, since);
        }
    }

    conn.execute(
        "DELETE FROM workspace_repos WHERE workspace_id = ?1",
        params![ws.id],
    )?;
    for (position, binding) in meta.repos.iter().enumerate() {
        conn.execute(
            "INSERT INTO workspace_repos
                (workspace_id, alias, position, repo_uid, repo_key, remote_url, branch, base_ref, missing_since)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ws.id,
                binding.alias,
                position as i64,
                binding.repo_uid,
                binding.repo_key,
                binding.remote_url,
                binding.branch,
                binding.base_ref,
                missing.get(&binding.alias)
            ],
        )?;
    }
    Ok(())
}

fn delete_workspace(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM workspace_repos WHERE workspace_id = ?1",
        params![id],
    )?;
    conn.execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
    Ok(())
}
