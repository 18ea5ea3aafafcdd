//! Shared pool of bare repository mirrors.
//!
//! Every repository bound to any workspace is cloned once, as a bare mirror at
//! `<pool>/<host>/<owner>/<repo>.git`, and worktrees are checked out from it.

use crate::git::Git;
use crate::models::RepoBinding;
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "github.com";

/// A normalized repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub host: String,
    pub owner: String,
    pub repo: String,
    /// URL the mirror fetches from
    pub remote_url: String,
}

impl RepoSpec {
    /// `host/owner/repo`
    pub fn uid(&self) -> String {
        format!("{}/{}/{}", self.host, self.owner, self.repo)
    }

    /// `owner/repo`
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Rebuild the spec a binding was created from.
    pub fn from_binding(binding: &RepoBinding) -> Result<Self> {
        let mut parts = binding.repo_uid.splitn(2, '/');
        let host = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();
        let (owner, repo) = rest.rsplit_once('/').ok_or_else(|| {
            Error::InvalidArgument(format!("malformed repo uid: {}", binding.repo_uid))
        })?;
        Ok(Self {
            host: host.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            remote_url: binding.remote_url.clone(),
        })
    }
}

/// A mirror that is present and fetched.
#[derive(Debug, Clone)]
pub struct FetchedRepo {
    pub path: PathBuf,
    pub default_branch: String,
}

impl FetchedRepo {
    /// Ref new branches start from unless told otherwise.
    pub fn default_base_ref(&self) -> String {
        format!("origin/{}", self.default_branch)
    }
}

/// Capability the engine needs from the pool.
pub trait RepoPool {
    fn normalize(&self, spec: &str) -> Result<RepoSpec>;

    /// Location of the mirror for a `host/owner/repo` uid, whether or not it exists.
    fn bare_path(&self, repo_uid: &str) -> PathBuf;

    /// Clone the mirror if needed, fetch it, and report its default branch.
    fn ensure_fetched(&self, spec: &RepoSpec) -> Result<FetchedRepo>;
}

/// Mirror path for `spec` under `pool_root`.
pub fn path_for(pool_root: &Path, spec: &RepoSpec) -> PathBuf {
    path_for_uid(pool_root, &spec.uid())
}

fn path_for_uid(pool_root: &Path, uid: &str) -> PathBuf {
    match uid.rsplit_once('/') {
        Some((prefix, repo)) => pool_root.join(prefix).join(format!("{}.git", repo)),
        None => pool_root.join(format!("{}.git", uid)),
    }
}

/// Parse a repository spec.
///
/// Accepted forms:
/// - `https://host/owner/repo(.git)`, `ssh://[user@]host[:port]/owner/repo(.git)`
/// - `git@host:owner/repo(.git)`
/// - `file:///any/prefix/host/owner/repo(.git)` and bare absolute paths of the same shape
/// - `host/owner/repo`, `owner/repo` (host defaults to github.com)
pub fn normalize(spec: &str) -> Result<RepoSpec> {
    let raw = spec.trim();
    if raw.is_empty() {
        return Err(Error::InvalidArgument("repository spec is empty".to_string()));
    }
    let invalid = |why: &str| {
        Error::InvalidArgument(format!("invalid repository spec '{}': {}", raw, why))
    };

    if let Some(path) = raw.strip_prefix("file://") {
        return from_local_path(path, raw)
            .ok_or_else(|| invalid("expected .../<host>/<owner>/<repo>"));
    }
    if raw.starts_with('/') {
        return from_local_path(raw, raw)
            .ok_or_else(|| invalid("expected .../<host>/<owner>/<repo>"));
    }

    if let Some((scheme, rest)) = raw.split_once("://") {
        if !matches!(scheme, "https" | "http" | "ssh" | "git") {
            return Err(invalid("unsupported URL scheme"));
        }
        let (authority, path) = rest.split_once('/').ok_or_else(|| invalid("missing path"))?;
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host);
        let (owner, repo) = owner_repo(path).ok_or_else(|| invalid("expected <owner>/<repo>"))?;
        return build(host, &owner, &repo, raw.to_string()).ok_or_else(|| invalid("bad component"));
    }

    // scp-like `user@host:owner/repo`
    if let Some((authority, path)) = raw.split_once(':')
        && authority.contains('@')
    {
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let (owner, repo) = owner_repo(path).ok_or_else(|| invalid("expected <owner>/<repo>"))?;
        return build(host, &owner, &repo, raw.to_string()).ok_or_else(|| invalid("bad component"));
    }

    let trimmed = strip_git_suffix(raw);
    let segments: Vec<&str> = trimmed.split('/').collect();
    let (host, owner, repo) = match segments.as_slice() {
        [owner, repo] => (DEFAULT_HOST, *owner, *repo),
        [host, owner, repo] => (*host, *owner, *repo),
        _ => return Err(invalid("expected <owner>/<repo> or <host>/<owner>/<repo>")),
    };
    let url = format!("https://{}/{}/{}.git", host.to_lowercase(), owner, repo);
    build(host, owner, repo, url).ok_or_else(|| invalid("bad component"))
}

fn from_local_path(path: &str, raw: &str) -> Option<RepoSpec> {
    let trimmed = strip_git_suffix(path);
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return None;
    }
    let n = segments.len();
    build(segments[n - 3], segments[n - 2], segments[n - 1], raw.to_string())
}

fn owner_repo(path: &str) -> Option<(String, String)> {
    let trimmed = strip_git_suffix(path);
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [owner, repo] => Some((owner.to_string(), repo.to_string())),
        _ => None,
    }
}

fn strip_git_suffix(s: &str) -> &str {
    let s = s.trim_end_matches('/');
    s.strip_suffix(".git").unwrap_or(s)
}

fn build(host: &str, owner: &str, repo: &str, remote_url: String) -> Option<RepoSpec> {
    let valid = |s: &str| {
        !s.is_empty()
            && s != "."
            && s != ".."
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !(valid(host) && valid(owner) && valid(repo)) {
        return None;
    }
    Some(RepoSpec {
        host: host.to_lowercase(),
        owner: owner.to_string(),
        repo: repo.to_string(),
        remote_url,
    })
}

/// Pool backed by bare git mirrors on the local filesystem.
pub struct GitPool {
    root: PathBuf,
    git: Git,
}

impl GitPool {
    pub fn new(root: PathBuf, git: Git) -> Self {
        Self { root, git }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn create_mirror(&self, path: &Path, spec: &RepoSpec) -> Result<()> {
        fs::create_dir_all(path)?;
        self.git.run(path, &["init", "--bare", "-q"])?;
        self.git
            .run(path, &["remote", "add", "origin", &spec.remote_url])?;
        self.git.run(
            path,
            &[
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
        )?;
        Ok(())
    }

    fn default_branch(&self, path: &Path) -> Result<String> {
        let head = self
            .git
            .output(path, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])?;
        if head.success
            && let Some(branch) = head.stdout.trim().strip_prefix("origin/")
        {
            return Ok(branch.to_string());
        }
        for candidate in ["main", "master"] {
            let full = format!("refs/remotes/origin/{}", candidate);
            if self
                .git
                .succeeds(path, &["show-ref", "--verify", "--quiet", &full])?
            {
                return Ok(candidate.to_string());
            }
        }
        Ok("main".to_string())
    }
}

impl RepoPool for GitPool {
    fn normalize(&self, spec: &str) -> Result<RepoSpec> {
        normalize(spec)
    }

    fn bare_path(&self, repo_uid: &str) -> PathBuf {
        path_for_uid(&self.root, repo_uid)
    }

    fn ensure_fetched(&self, spec: &RepoSpec) -> Result<FetchedRepo> {
        let path = path_for(&self.root, spec);
        let fresh = !path.exists();
        if fresh {
            tracing::info!(repo = %spec.uid(), path = %path.display(), "creating mirror");
            if let Err(err) = self.create_mirror(&path, spec) {
                let _ = fs::remove_dir_all(&path);
                return Err(err);
            }
        }

        if let Err(err) = self.git.run(&path, &["fetch", "--prune", "--quiet", "origin"]) {
            if fresh {
                let _ = fs::remove_dir_all(&path);
                return Err(err);
            }
            // A stale mirror is still usable for existing branches.
            tracing::warn!(repo = %spec.uid(), error = %err, "fetch failed; using existing mirror");
        }
        if !self
            .git
            .succeeds(&path, &["remote", "set-head", "origin", "--auto"])?
        {
            tracing::debug!(repo = %spec.uid(), "could not determine remote HEAD");
        }

        let default_branch = self.default_branch(&path)?;
        Ok(FetchedRepo {
            path,
            default_branch,
        })
    }
}
