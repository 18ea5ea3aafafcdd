//! Workspace life-cycle engine.
//!
//! Every operation follows the same order of side effects:
//!
//! 1. validate and re-read authoritative state (directory layout, metadata,
//!    live worktrees); refuse on any blocking condition
//! 2. mutate the filesystem and metadata
//! 3. commit to the root repository where the operation moves a workspace
//! 4. update the secondary index, downgrading failures to warnings
//!
//! The engine is context-free: the root, configuration, repo pool and prompt
//! are all handed in by the caller.

mod archive;

pub use archive::{
    BindingRestore, CloseOptions, CloseReport, PurgeOptions, PurgeReport, ReopenReport,
    RestoreStatus,
};

use crate::config::Config;
use crate::git::{BindOutcome, Git, RootRepo, Worktrees};
use crate::models::{
    EventType, RepoBinding, Workspace, WorkspaceEvent, WorkspaceStatus, now_ts, validate_alias,
    validate_workspace_id,
};
use crate::pool::RepoPool;
use crate::prompt::Interaction;
use crate::risk::{self, RiskLevel};
use crate::scaffold;
use crate::storage::{
    ARCHIVE_DIR, Index, IndexFilter, Layout, Location, Metadata, REPOS_DIR, ReconcileStats,
    WORKSPACES_DIR, metadata, worktree_path,
};
use crate::{Conflict, Error, IndexProblem, Result};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

const GITIGNORE_ENTRIES: [&str; 2] = ["/.state/", "/workspaces/*/repos/"];

/// The life-cycle engine for one root.
pub struct Engine {
    layout: Layout,
    config: Config,
    git: Git,
    pool: Box<dyn RepoPool>,
    interaction: Interaction,
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub root: PathBuf,
    pub created_repository: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateReport {
    pub id: String,
    pub path: PathBuf,
    pub scaffolded_files: usize,
    pub warnings: Vec<String>,
}

/// Optional overrides for [`Engine::add_repo`].
#[derive(Debug, Clone, Default)]
pub struct AddRepoOptions {
    pub alias: Option<String>,
    pub branch: Option<String>,
    pub base_ref: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddRepoReport {
    pub id: String,
    pub binding: RepoBinding,
    pub path: PathBuf,
    pub created_branch: bool,
    pub already_bound: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveRepoReport {
    pub id: String,
    pub alias: String,
    pub removed_worktree: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct UnlockReport {
    pub id: String,
    pub was_locked: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RepoStatus {
    #[serde(flatten)]
    pub binding: RepoBinding,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceDetail {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_commit: Option<String>,
    pub repos: Vec<RepoStatus>,
    pub warnings: Vec<String>,
}

/// Filters for [`Engine::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub status: Option<WorkspaceStatus>,
    /// Only workspaces binding this repository (`owner/repo` or `host/owner/repo`)
    pub repo: Option<String>,
    /// Compute per-workspace risk for active workspaces
    pub risk: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceSummary {
    pub id: String,
    pub title: String,
    pub status: WorkspaceStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub purge_locked: bool,
    pub repos: Vec<String>,
    /// Aliases whose worktree is gone from disk
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListSource {
    Index,
    Filesystem,
}

#[derive(Debug, Serialize)]
pub struct ListReport {
    pub workspaces: Vec<WorkspaceSummary>,
    pub source: ListSource,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EventsReport {
    pub events: Vec<WorkspaceEvent>,
}

#[derive(Debug, Serialize)]
pub struct RebuildReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub stats: ReconcileStats,
    pub archived_commits_recovered: usize,
}

/// The workspace (and repository, if any) a path lies in.
#[derive(Debug, Serialize)]
pub struct CurrentWorkspace {
    pub id: String,
    pub status: WorkspaceStatus,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Engine {
    pub fn new(
        root: PathBuf,
        config: Config,
        pool: Box<dyn RepoPool>,
        interaction: Interaction,
    ) -> Self {
        let git = Git::with_timeout(config.git_timeout());
        Self {
            layout: Layout::new(root),
            config,
            git,
            pool,
            interaction,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn worktrees(&self) -> Worktrees<'_> {
        Worktrees::new(&self.git)
    }

    fn root_repo(&self) -> RootRepo<'_> {
        RootRepo::new(&self.git, self.layout.root())
    }

    /// Prepare a root: storage directories, root repository, ignore rules, index.
    pub fn init(&self) -> Result<InitReport> {
        for dir in [
            self.layout.storage_dir(WorkspaceStatus::Active),
            self.layout.storage_dir(WorkspaceStatus::Archived),
            self.layout.state_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        let created_repository = self.root_repo().init()?;
        ensure_gitignore(self.layout.root())?;

        let mut warnings = Vec::new();
        self.index_write(&mut warnings, "init", |idx| {
            idx.reconcile(&self.layout).map(|_| ())
        });
        tracing::info!(
            root = %self.layout.root().display(),
            created_repository,
            "root initialized"
        );
        Ok(InitReport {
            root: self.layout.root().to_path_buf(),
            created_repository,
            warnings,
        })
    }

    pub fn create(&self, id: &str, title: &str) -> Result<CreateReport> {
        validate_workspace_id(id)?;
        if let Some(existing) = self.layout.locate(id)? {
            let hint = match existing.status {
                WorkspaceStatus::Active => "it is already active".to_string(),
                WorkspaceStatus::Archived => {
                    format!("it is archived; use `berth reopen {}` instead", id)
                }
            };
            return Err(Error::AlreadyExists {
                what: format!("workspace '{}'", id),
                hint,
            });
        }

        let path = self.layout.workspace_path(id, WorkspaceStatus::Active);
        fs::create_dir_all(self.layout.storage_dir(WorkspaceStatus::Active))
            .and_then(|_| fs::create_dir(&path))
            .map_err(|e| Error::state_write(format!("create {}", path.display()), e.into()))?;

        let meta = Metadata::new(Workspace::new(id.to_string(), title.to_string()));
        let populated = scaffold::apply(
            &self.layout,
            &self.config.workspace_template,
            &path,
            id,
            title,
        )
        .and_then(|files| metadata::save(&path, &meta).map(|_| files));
        let scaffolded_files = match populated {
            Ok(files) => files,
            Err(err) => {
                let _ = fs::remove_dir_all(&path);
                return Err(Error::state_write(format!("populate {}", path.display()), err));
            }
        };

        let mut warnings = Vec::new();
        self.index_write(&mut warnings, "create", |idx| {
            idx.upsert_workspace(&meta)?;
            idx.append_event(id, EventType::Created, meta.workspace.created_at)
        });
        tracing::info!(workspace = id, "workspace created");
        Ok(CreateReport {
            id: id.to_string(),
            path,
            scaffolded_files,
            warnings,
        })
    }

    /// Bind a repository to an active workspace through a new worktree.
    ///
    /// The worktree is created before the binding is recorded. If recording
    /// fails the worktree stays behind and the error says where it is.
    pub fn add_repo(&self, id: &str, spec: &str, options: AddRepoOptions) -> Result<AddRepoReport> {
        let (location, mut meta) = self.load(id)?;
        require_status(&location, "add-repo", WorkspaceStatus::Active)?;

        let spec = self.pool.normalize(spec)?;
        let alias = options.alias.unwrap_or_else(|| spec.repo.clone());
        validate_alias(&alias)?;
        if meta.binding(&alias).is_some() {
            return Err(Error::AlreadyExists {
                what: format!("alias '{}' in workspace '{}'", alias, id),
                hint: "pass --alias to bind the repository under another name".to_string(),
            });
        }
        let branch = options.branch.unwrap_or_else(|| {
            self.config
                .render_branch(id, &spec.owner, &spec.repo, &alias)
        });
        self.validate_branch(&branch)?;

        let fetched = self.pool.ensure_fetched(&spec)?;
        let base_ref = options
            .base_ref
            .unwrap_or_else(|| fetched.default_base_ref());
        let outcome = self.worktrees().ensure_bound(
            &fetched.path,
            &location.path,
            &alias,
            &branch,
            &base_ref,
        )?;

        let binding = RepoBinding {
            repo_uid: spec.uid(),
            repo_key: spec.key(),
            remote_url: spec.remote_url.clone(),
            alias: alias.clone(),
            branch,
            base_ref,
        };
        let path = worktree_path(&location.path, &alias);
        meta.repos.push(binding.clone());
        meta.workspace.touch();
        metadata::save(&location.path, &meta).map_err(|err| {
            Error::state_write(
                format!(
                    "worktree {} exists but the binding was not recorded; re-run add-repo to record it or delete the worktree",
                    path.display()
                ),
                err,
            )
        })?;

        let mut warnings = Vec::new();
        self.index_write(&mut warnings, "add-repo", |idx| {
            idx.upsert_workspace(&meta)?;
            idx.clear_missing(id, &alias)?;
            Ok(())
        });
        tracing::info!(workspace = id, alias = %alias, "repository bound");
        Ok(AddRepoReport {
            id: id.to_string(),
            binding,
            path,
            created_branch: matches!(outcome, BindOutcome::Created { created_branch: true }),
            already_bound: outcome == BindOutcome::AlreadyBound,
            warnings,
        })
    }

    /// Unbind a repository. A dirty worktree is refused unless `force`.
    pub fn remove_repo(&self, id: &str, repo: &str, force: bool) -> Result<RemoveRepoReport> {
        let (location, mut meta) = self.load(id)?;
        require_status(&location, "remove-repo", WorkspaceStatus::Active)?;

        let binding = {
            let matches = meta.bindings_matching(repo);
            match matches.as_slice() {
                [] => {
                    return Err(Error::NotFound {
                        what: format!("repository '{}' in workspace '{}'", repo, id),
                        hint: format!("`berth show {}` lists the bound repositories", id),
                    });
                }
                [one] => (*one).clone(),
                several => {
                    return Err(Conflict::AmbiguousRepo {
                        key: repo.to_string(),
                        aliases: several.iter().map(|b| b.alias.clone()).collect(),
                    }
                    .into());
                }
            }
        };

        let worktrees = self.worktrees();
        let path = worktree_path(&location.path, &binding.alias);
        if path.exists() && !force {
            let report = risk::assess(&worktrees, &location.path, std::slice::from_ref(&binding));
            match report.aggregate {
                RiskLevel::Clean => {}
                RiskLevel::Dirty => {
                    return Err(Conflict::DirtyWorktree {
                        alias: binding.alias.clone(),
                    }
                    .into());
                }
                RiskLevel::Unknown => {
                    return Err(Conflict::UnreadableWorktree {
                        alias: binding.alias.clone(),
                        path,
                    }
                    .into());
                }
            }
        }

        let bare = self.pool.bare_path(&binding.repo_uid);
        let removed_worktree = worktrees
            .remove_bound(Some(&bare), &path, force)
            .map_err(|err| Error::state_write(format!("remove worktree {}", path.display()), err))?;
        remove_if_empty(&crate::storage::repos_dir(&location.path));

        meta.remove_binding(&binding.alias);
        meta.workspace.touch();
        metadata::save(&location.path, &meta)
            .map_err(|err| Error::state_write(format!("update metadata of '{}'", id), err))?;

        let mut warnings = Vec::new();
        self.index_write(&mut warnings, "remove-repo", |idx| idx.upsert_workspace(&meta));
        tracing::info!(workspace = id, alias = %binding.alias, "repository unbound");
        Ok(RemoveRepoReport {
            id: id.to_string(),
            alias: binding.alias,
            removed_worktree,
            warnings,
        })
    }

    /// Clear the purge lock. Idempotent.
    pub fn unlock(&self, id: &str) -> Result<UnlockReport> {
        let (location, mut meta) = self.load(id)?;
        let was_locked = meta.workspace.purge_locked;
        if was_locked {
            meta.workspace.purge_locked = false;
            meta.workspace.touch();
            metadata::save(&location.path, &meta)
                .map_err(|err| Error::state_write(format!("update metadata of '{}'", id), err))?;
        }

        let mut warnings = Vec::new();
        self.index_write(&mut warnings, "unlock", |idx| idx.upsert_workspace(&meta));
        Ok(UnlockReport {
            id: id.to_string(),
            was_locked,
            warnings,
        })
    }

    /// Locate a workspace without reading its metadata.
    pub fn find(&self, id: &str) -> Result<Option<Location>> {
        validate_workspace_id(id)?;
        self.layout.locate(id)
    }

    pub fn show(&self, id: &str) -> Result<WorkspaceDetail> {
        let (location, meta) = self.load(id)?;
        let mut warnings = Vec::new();

        let (repos, risk, archived_commit) = match location.status {
            WorkspaceStatus::Active => {
                let report = risk::assess(&self.worktrees(), &location.path, &meta.repos);
                let repos = meta
                    .repos
                    .iter()
                    .zip(report.repos.iter())
                    .map(|(binding, r)| RepoStatus {
                        binding: binding.clone(),
                        path: r.path.clone(),
                        risk: Some(r.level),
                    })
                    .collect();
                (repos, Some(report.aggregate), None)
            }
            WorkspaceStatus::Archived => {
                let repos = meta
                    .repos
                    .iter()
                    .map(|binding| RepoStatus {
                        binding: binding.clone(),
                        path: worktree_path(
                            &self.layout.workspace_path(id, WorkspaceStatus::Active),
                            &binding.alias,
                        ),
                        risk: None,
                    })
                    .collect();
                (repos, None, self.archived_commit(id, &mut warnings))
            }
        };

        Ok(WorkspaceDetail {
            workspace: meta.workspace,
            path: location.path,
            risk,
            archived_commit,
            repos,
            warnings,
        })
    }

    /// List workspaces, from the index when it is usable, else from disk.
    pub fn list(&self, options: &ListOptions) -> Result<ListReport> {
        let filter = IndexFilter {
            status: options.status,
            repo: options.repo.clone(),
        };
        let mut warnings = Vec::new();

        let opened = if self.layout.state_dir().is_dir() {
            Index::open_or_create(&self.layout)
        } else {
            Err(IndexProblem::Absent {
                path: self.layout.index_path(),
            })
        };
        match opened {
            Ok(mut idx) => match self.list_indexed(&mut idx, &filter, options.risk) {
                Ok(workspaces) => {
                    return Ok(ListReport {
                        workspaces,
                        source: ListSource::Index,
                        warnings,
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "index query failed; scanning the filesystem");
                    warnings.push(format!("index unusable, listed from disk: {}", err));
                }
            },
            Err(problem) => {
                if !problem.is_absent() {
                    tracing::warn!(%problem, "index unusable; scanning the filesystem");
                }
                warnings.push(format!("listed from disk: {}", problem));
            }
        }

        let workspaces = self.list_scanned(&filter, options.risk, &mut warnings)?;
        Ok(ListReport {
            workspaces,
            source: ListSource::Filesystem,
            warnings,
        })
    }

    fn list_indexed(
        &self,
        idx: &mut Index,
        filter: &IndexFilter,
        with_risk: bool,
    ) -> Result<Vec<WorkspaceSummary>> {
        idx.reconcile(&self.layout)?;
        let rows = idx.list_workspaces(filter)?;
        let now = now_ts();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let path = self.layout.workspace_path(&row.id, row.status);
            let mut missing = Vec::new();
            if row.status == WorkspaceStatus::Active {
                for binding in &row.repos {
                    if worktree_path(&path, &binding.alias).exists() {
                        if binding.missing_since.is_some() {
                            idx.clear_missing(&row.id, &binding.alias)?;
                        }
                    } else {
                        if binding.missing_since.is_none() {
                            idx.mark_missing(&row.id, &binding.alias, now)?;
                            tracing::info!(
                                workspace = %row.id,
                                alias = %binding.alias,
                                "worktree missing"
                            );
                        }
                        missing.push(binding.alias.clone());
                    }
                }
            }
            let bindings: Vec<RepoBinding> = row.repos.iter().map(|b| b.to_binding()).collect();
            out.push(WorkspaceSummary {
                risk: self.summary_risk(row.status, &path, &bindings, with_risk),
                repos: bindings.into_iter().map(|b| b.alias).collect(),
                missing,
                id: row.id,
                title: row.title,
                status: row.status,
                created_at: row.created_at,
                updated_at: row.updated_at,
                purge_locked: row.purge_locked,
            });
        }
        Ok(out)
    }

    fn list_scanned(
        &self,
        filter: &IndexFilter,
        with_risk: bool,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<WorkspaceSummary>> {
        let statuses = match filter.status {
            Some(status) => vec![status],
            None => vec![WorkspaceStatus::Active, WorkspaceStatus::Archived],
        };

        let mut out = Vec::new();
        for status in statuses {
            for id in self.layout.scan(status)? {
                let path = self.layout.workspace_path(&id, status);
                let meta = match metadata::load(&path) {
                    Ok(meta) => meta,
                    Err(err) => {
                        warnings.push(format!("{}: {}", id, err));
                        if filter.repo.is_none() {
                            let mut ws = Workspace::new(id.clone(), String::new());
                            ws.status = status;
                            ws.created_at = 0;
                            ws.updated_at = 0;
                            out.push(summary_from(ws, Vec::new(), Vec::new(), None));
                        }
                        continue;
                    }
                };
                if let Some(repo) = &filter.repo
                    && !meta.repos.iter().any(|b| &b.repo_key == repo || &b.repo_uid == repo)
                {
                    continue;
                }
                let missing = if status == WorkspaceStatus::Active {
                    meta.repos
                        .iter()
                        .filter(|b| !worktree_path(&path, &b.alias).exists())
                        .map(|b| b.alias.clone())
                        .collect()
                } else {
                    Vec::new()
                };
                let risk = self.summary_risk(status, &path, &meta.repos, with_risk);
                let aliases = meta.repos.iter().map(|b| b.alias.clone()).collect();
                let mut ws = meta.workspace;
                ws.id = id;
                ws.status = status;
                out.push(summary_from(ws, aliases, missing, risk));
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn summary_risk(
        &self,
        status: WorkspaceStatus,
        path: &Path,
        bindings: &[RepoBinding],
        with_risk: bool,
    ) -> Option<RiskLevel> {
        (with_risk && status == WorkspaceStatus::Active)
            .then(|| risk::assess(&self.worktrees(), path, bindings).aggregate)
    }

    /// Event history. Needs a usable index; never creates one.
    pub fn events(&self, id: Option<&str>) -> Result<EventsReport> {
        if let Some(id) = id {
            validate_workspace_id(id)?;
        }
        let idx = Index::open(&self.layout)?;
        Ok(EventsReport {
            events: idx.events(id)?,
        })
    }

    /// Throw the index away and rebuild it from disk.
    ///
    /// Events cannot be recovered from disk and start over empty.
    pub fn rebuild_index(&self) -> Result<RebuildReport> {
        Index::remove_files(&self.layout)?;
        let mut idx = Index::open_or_create(&self.layout)?;
        let stats = idx.reconcile(&self.layout)?;

        let mut archived_commits_recovered = 0;
        let archived = idx.list_workspaces(&IndexFilter {
            status: Some(WorkspaceStatus::Archived),
            repo: None,
        })?;
        if self.root_repo().is_repository()? {
            for row in archived {
                let message = format!("archive: {}", row.id);
                if let Some(commit) = self.root_repo().find_commit(&message)? {
                    idx.set_archived_commit(&row.id, Some(&commit))?;
                    archived_commits_recovered += 1;
                }
            }
        }
        tracing::info!(?stats, archived_commits_recovered, "index rebuilt");
        Ok(RebuildReport {
            path: idx.path().to_path_buf(),
            stats,
            archived_commits_recovered,
        })
    }

    /// Resolve the workspace containing `path`.
    pub fn resolve_current(&self, path: &Path) -> Result<CurrentWorkspace> {
        let root = self
            .layout
            .root()
            .canonicalize()
            .unwrap_or_else(|_| self.layout.root().to_path_buf());
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let not_found = || Error::NotFound {
            what: format!("workspace containing {}", path.display()),
            hint: format!(
                "run inside {}/<id>/ or name the workspace explicitly",
                root.join(WORKSPACES_DIR).display()
            ),
        };

        let relative = path.strip_prefix(&root).map_err(|_| not_found())?;
        let mut parts = relative.components().filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        });
        let status = match parts.next().as_deref() {
            Some(WORKSPACES_DIR) => WorkspaceStatus::Active,
            Some(ARCHIVE_DIR) => WorkspaceStatus::Archived,
            _ => return Err(not_found()),
        };
        let id = parts.next().ok_or_else(not_found)?;
        let alias = match parts.next().as_deref() {
            Some(REPOS_DIR) => parts.next(),
            _ => None,
        };

        let workspace_path = self.layout.workspace_path(&id, status);
        if !crate::storage::metadata_path(&workspace_path).exists() {
            return Err(not_found());
        }
        Ok(CurrentWorkspace {
            id,
            status,
            path: workspace_path,
            alias,
        })
    }

    fn load(&self, id: &str) -> Result<(Location, Metadata)> {
        validate_workspace_id(id)?;
        let location = self
            .layout
            .locate(id)?
            .ok_or_else(|| Error::workspace_not_found(id))?;
        let meta = metadata::load(&location.path)?;
        Ok((location, meta))
    }

    fn validate_branch(&self, branch: &str) -> Result<()> {
        let ok = self
            .git
            .succeeds(self.layout.root(), &["check-ref-format", "--branch", branch])?;
        if !ok {
            return Err(Error::InvalidArgument(format!(
                "'{}' is not a valid branch name",
                branch
            )));
        }
        Ok(())
    }

    /// Commit that archived `id`: the index copy, else the newest matching commit.
    fn archived_commit(&self, id: &str, warnings: &mut Vec<String>) -> Option<String> {
        if let Ok(idx) = Index::open(&self.layout) {
            match idx.get_workspace(id) {
                Ok(Some(row)) if row.archived_commit.is_some() => return row.archived_commit,
                Ok(_) => {}
                Err(err) => warnings.push(format!("index lookup failed: {}", err)),
            }
        }
        match self.root_repo().find_commit(&format!("archive: {}", id)) {
            Ok(commit) => commit,
            Err(err) => {
                warnings.push(format!("cannot search root history: {}", err));
                None
            }
        }
    }

    /// Run a best-effort index update. Failures become warnings.
    fn index_write<F>(&self, warnings: &mut Vec<String>, operation: &str, update: F)
    where
        F: FnOnce(&mut Index) -> Result<()>,
    {
        let result = Index::open_or_create(&self.layout)
            .map_err(Error::from)
            .and_then(|mut idx| update(&mut idx));
        if let Err(err) = result {
            tracing::warn!(operation, error = %err, "index not updated");
            warnings.push(format!("index not updated after {}: {}", operation, err));
        }
    }

    /// Ask for confirmation when interactive; non-interactive runs proceed.
    fn confirm(&mut self, action: &str, question: &str, preset: bool) -> Result<()> {
        if preset {
            return Ok(());
        }
        match &mut self.interaction {
            Interaction::Interactive(prompt) => {
                if prompt.confirm(question)? {
                    Ok(())
                } else {
                    Err(Conflict::Declined {
                        action: action.to_string(),
                    }
                    .into())
                }
            }
            Interaction::NonInteractive => Ok(()),
        }
    }

    /// Like [`Engine::confirm`], but non-interactive runs need `flag` up front.
    fn require_confirmation(
        &mut self,
        action: &str,
        question: &str,
        reason: &str,
        preset: bool,
        flag: &str,
    ) -> Result<()> {
        if preset {
            return Ok(());
        }
        if !self.interaction.is_interactive() {
            return Err(Conflict::ConfirmationRequired {
                action: action.to_string(),
                reason: reason.to_string(),
                flag: flag.to_string(),
            }
            .into());
        }
        self.confirm(action, question, false)
    }
}

fn require_status(location: &Location, operation: &str, expected: WorkspaceStatus) -> Result<()> {
    if location.status == expected {
        return Ok(());
    }
    let hint = match (expected, location.status) {
        (WorkspaceStatus::Active, WorkspaceStatus::Archived) => {
            Some(format!("reopen it first with `berth reopen {}`", location.id))
        }
        (WorkspaceStatus::Archived, WorkspaceStatus::Active) if operation == "purge" => {
            Some(format!("close it first with `berth close {}`", location.id))
        }
        _ => None,
    };
    Err(Conflict::WrongState {
        id: location.id.clone(),
        operation: operation.to_string(),
        expected,
        actual: location.status,
        hint,
    }
    .into())
}

fn summary_from(
    ws: Workspace,
    repos: Vec<String>,
    missing: Vec<String>,
    risk: Option<RiskLevel>,
) -> WorkspaceSummary {
    WorkspaceSummary {
        id: ws.id,
        title: ws.title,
        status: ws.status,
        created_at: ws.created_at,
        updated_at: ws.updated_at,
        purge_locked: ws.purge_locked,
        repos,
        missing,
        risk,
    }
}

fn remove_if_empty(dir: &Path) {
    if fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
        let _ = fs::remove_dir(dir);
    }
}

/// Append berth's ignore rules to `<root>/.gitignore` if they are missing.
fn ensure_gitignore(root: &Path) -> Result<()> {
    let path = root.join(".gitignore");
    let existing = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let missing: Vec<&str> = GITIGNORE_ENTRIES
        .iter()
        .copied()
        .filter(|entry| !existing.lines().any(|l| l.trim() == *entry))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for entry in missing {
        content.push_str(entry);
        content.push('\n');
    }
    fs::write(&path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestEnv, git};

    fn engine_with_repo(env: &TestEnv) -> (Engine, String) {
        let engine = env.engine();
        let url = env.upstream("github.com", "o", "r");
        (engine, url)
    }

    #[test]
    fn test_init_is_idempotent_and_ignores_worktrees() {
        let env = TestEnv::new();
        let engine = env.engine();
        let again = engine.init().unwrap();
        assert!(!again.created_repository);

        let ignore = fs::read_to_string(env.root().join(".gitignore")).unwrap();
        assert_eq!(ignore.matches("/workspaces/*/repos/").count(), 1);
        assert!(ignore.contains("/.state/"));
    }

    #[test]
    fn test_create_then_collisions() {
        let env = TestEnv::new();
        let engine = env.engine();
        let report = engine.create("WS1", "Login fix").unwrap();
        assert!(report.warnings.is_empty());
        assert!(report.path.join("workspace.json").exists());

        let err = engine.create("WS1", "again").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        fs::rename(
            env.root().join("workspaces/WS1"),
            env.root().join("archive/WS1"),
        )
        .unwrap();
        match engine.create("WS1", "again").unwrap_err() {
            Error::AlreadyExists { hint, .. } => assert!(hint.contains("berth reopen WS1")),
            other => panic!("expected AlreadyExists, got {other}"),
        }
    }

    #[test]
    fn test_create_rejects_bad_id_before_side_effects() {
        let env = TestEnv::new();
        let engine = env.engine();
        let err = engine.create("../escape", "t").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(engine.layout().scan(WorkspaceStatus::Active).unwrap().is_empty());
    }

    #[test]
    fn test_add_repo_scenario() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();

        let report = engine
            .add_repo(
                "WS1",
                &url,
                AddRepoOptions {
                    branch: Some("WS1/test".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let wt = env.worktree("WS1", "r");
        assert!(wt.join(".git").exists());
        assert_eq!(report.path, wt);
        assert!(report.created_branch);

        let meta = metadata::load(&env.root().join("workspaces/WS1")).unwrap();
        let binding = &meta.repos[0];
        assert_eq!(binding.repo_uid, "github.com/o/r");
        assert_eq!(binding.alias, "r");
        assert_eq!(binding.branch, "WS1/test");
        assert_eq!(binding.base_ref, "origin/main");
        assert_eq!(git(&wt, &["rev-parse", "--abbrev-ref", "HEAD"]), "WS1/test");
    }

    #[test]
    fn test_add_repo_default_branch_and_duplicate_alias() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();

        let report = engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        assert_eq!(report.binding.branch, "WS1/r");

        let err = engine
            .add_repo("WS1", &url, AddRepoOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        // Same repository under a second alias needs its own branch.
        let err = engine
            .add_repo(
                "WS1",
                &url,
                AddRepoOptions {
                    alias: Some("r2".to_string()),
                    branch: Some("WS1/r".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(Conflict::BranchCheckedOutElsewhere { .. })
        ));
        let meta = metadata::load(&env.root().join("workspaces/WS1")).unwrap();
        assert_eq!(meta.repos.len(), 1);
    }

    #[test]
    fn test_add_repo_unknown_base_ref_leaves_metadata_alone() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();

        let err = engine
            .add_repo(
                "WS1",
                &url,
                AddRepoOptions {
                    base_ref: Some("origin/does-not-exist".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::BaseRefNotFound { .. })));
        let meta = metadata::load(&env.root().join("workspaces/WS1")).unwrap();
        assert!(meta.repos.is_empty());
        assert!(!env.worktree("WS1", "r").exists());
    }

    #[test]
    fn test_remove_repo_dirty_requires_force() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();
        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        let wt = env.worktree("WS1", "r");
        fs::write(wt.join("wip.txt"), "unsaved").unwrap();

        let err = engine.remove_repo("WS1", "r", false).unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::DirtyWorktree { .. })));
        assert!(wt.join("wip.txt").exists());
        let meta = metadata::load(&env.root().join("workspaces/WS1")).unwrap();
        assert_eq!(meta.repos.len(), 1);

        let report = engine.remove_repo("WS1", "o/r", true).unwrap();
        assert!(report.removed_worktree);
        assert!(!wt.exists());
        let meta = metadata::load(&env.root().join("workspaces/WS1")).unwrap();
        assert!(meta.repos.is_empty());
    }

    #[test]
    fn test_remove_repo_with_hand_deleted_worktree() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();
        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        fs::remove_dir_all(env.worktree("WS1", "r")).unwrap();

        let report = engine.remove_repo("WS1", "r", false).unwrap();
        assert!(!report.removed_worktree);
    }

    #[test]
    fn test_remove_repo_broken_worktree_requires_force() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();
        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        // Keep the root clean so nothing leaks through from it.
        git(env.root(), &["add", ".gitignore"]);
        git(env.root(), &["commit", "-q", "-m", "ignore worktrees"]);
        let wt = env.worktree("WS1", "r");
        fs::remove_file(wt.join(".git")).unwrap();

        let err = engine.remove_repo("WS1", "r", false).unwrap_err();
        assert!(matches!(err, Error::Conflict(Conflict::UnreadableWorktree { .. })));
        assert!(wt.join("README.md").exists());

        let report = engine.remove_repo("WS1", "r", true).unwrap();
        assert!(report.removed_worktree);
        assert!(!wt.exists());
        let remaining = Worktrees::new(&Git::new())
            .list(&env.pool_dir.path().join("github.com/o/r.git"))
            .unwrap();
        assert!(remaining.iter().all(|e| e.bare));
    }

    #[test]
    fn test_add_repo_again_clears_missing_marker() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();
        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        let wt = env.worktree("WS1", "r");
        fs::remove_dir_all(&wt).unwrap();
        engine.list(&ListOptions::default()).unwrap();

        // Drop the binding from metadata only; the index row keeps its marker.
        let ws_path = env.root().join("workspaces/WS1");
        let mut meta = metadata::load(&ws_path).unwrap();
        meta.remove_binding("r");
        metadata::save(&ws_path, &meta).unwrap();

        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        assert!(wt.join(".git").exists());

        let idx = Index::open(engine.layout()).unwrap();
        let row = idx.get_workspace("WS1").unwrap().unwrap();
        assert_eq!(row.repos[0].missing_since, None);
    }

    #[test]
    fn test_mutations_survive_garbage_index() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        fs::write(engine.layout().index_path(), b"garbage garbage garbage garbage").unwrap();

        let created = engine.create("WS1", "t").unwrap();
        assert!(!created.warnings.is_empty());
        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        assert!(env.worktree("WS1", "r").exists());
        engine.remove_repo("WS1", "r", false).unwrap();

        let listed = engine.list(&ListOptions::default()).unwrap();
        assert_eq!(listed.source, ListSource::Filesystem);
        assert_eq!(listed.workspaces.len(), 1);
        assert_eq!(listed.workspaces[0].id, "WS1");
        assert!(listed.workspaces[0].repos.is_empty());

        // The garbage is never overwritten.
        assert!(fs::read(engine.layout().index_path()).unwrap().starts_with(b"garbage"));
        match engine.events(None).unwrap_err() {
            Error::IndexUnavailable(IndexProblem::Malformed { .. }) => {}
            other => panic!("expected malformed index, got {other}"),
        }
    }

    #[test]
    fn test_list_marks_and_clears_missing_worktrees() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();
        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();
        let wt = env.worktree("WS1", "r");
        fs::remove_dir_all(&wt).unwrap();

        let listed = engine.list(&ListOptions::default()).unwrap();
        assert_eq!(listed.source, ListSource::Index);
        assert_eq!(listed.workspaces[0].missing, vec!["r"]);

        let idx = Index::open(engine.layout()).unwrap();
        let row = idx.get_workspace("WS1").unwrap().unwrap();
        assert!(row.repos[0].missing_since.is_some());
        drop(idx);

        // Re-binding the same alias brings the worktree back.
        let git_runner = Git::new();
        Worktrees::new(&git_runner)
            .ensure_bound(
                &env.pool_dir.path().join("github.com/o/r.git"),
                &env.root().join("workspaces/WS1"),
                "r",
                "WS1/r",
                "origin/main",
            )
            .unwrap();
        let listed = engine.list(&ListOptions::default()).unwrap();
        assert!(listed.workspaces[0].missing.is_empty());
        let idx = Index::open(engine.layout()).unwrap();
        assert_eq!(idx.get_workspace("WS1").unwrap().unwrap().repos[0].missing_since, None);
    }

    #[test]
    fn test_list_filters_and_risk() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("A", "a").unwrap();
        engine.create("B", "b").unwrap();
        engine.add_repo("A", &url, AddRepoOptions::default()).unwrap();
        fs::write(env.worktree("A", "r").join("wip.txt"), "x").unwrap();

        let listed = engine
            .list(&ListOptions {
                repo: Some("o/r".to_string()),
                risk: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(listed.workspaces.len(), 1);
        assert_eq!(listed.workspaces[0].risk, Some(RiskLevel::Dirty));
    }

    #[test]
    fn test_events_absent_index_is_distinct() {
        let env = TestEnv::new();
        let engine = env.engine();
        Index::remove_files(engine.layout()).unwrap();
        match engine.events(None).unwrap_err() {
            Error::IndexUnavailable(problem) => assert!(problem.is_absent()),
            other => panic!("expected absent index, got {other}"),
        }
    }

    #[test]
    fn test_resolve_current() {
        let env = TestEnv::new();
        let (engine, url) = engine_with_repo(&env);
        engine.create("WS1", "t").unwrap();
        engine.add_repo("WS1", &url, AddRepoOptions::default()).unwrap();

        let inside = env.worktree("WS1", "r");
        let current = engine.resolve_current(&inside).unwrap();
        assert_eq!(current.id, "WS1");
        assert_eq!(current.status, WorkspaceStatus::Active);
        assert_eq!(current.alias.as_deref(), Some("r"));

        assert!(matches!(
            engine.resolve_current(env.root()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_rebuild_index_restores_rows() {
        let env = TestEnv::new();
        let engine = env.engine();
        engine.create("A", "a").unwrap();
        engine.create("B", "b").unwrap();
        fs::write(engine.layout().index_path(), b"not a database at all, sorry").unwrap();

        let report = engine.rebuild_index().unwrap();
        assert_eq!(report.stats.inserted, 2);
        let listed = engine.list(&ListOptions::default()).unwrap();
        assert_eq!(listed.source, ListSource::Index);
        assert_eq!(listed.workspaces.len(), 2);
    }

    #[test]
    fn test_unlock_is_idempotent() {
        let env = TestEnv::new();
        let engine = env.engine();
        engine.create("A", "a").unwrap();
        assert!(!engine.unlock("A").unwrap().was_locked);
        assert!(!engine.unlock("A").unwrap().was_locked);
    }
}
