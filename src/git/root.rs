//! The root repository that records workspace moves as commits.
//!
//! Commits made here are scoped to the paths a single operation touched.
//! Anything else the user has staged stays staged and out of the commit.

use super::Git;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Handle to the git repository at the workspace root.
pub struct RootRepo<'a> {
    git: &'a Git,
    root: PathBuf,
}

impl<'a> RootRepo<'a> {
    pub fn new(git: &'a Git, root: &Path) -> Self {
        Self {
            git,
            root: root.to_path_buf(),
        }
    }

    pub fn is_repository(&self) -> Result<bool> {
        // `--show-prefix` is empty only at the top of a work tree, so a root
        // nested inside some unrelated repository does not count.
        let output = self
            .git
            .output(&self.root, &["rev-parse", "--show-prefix"])?;
        Ok(output.success && output.stdout.trim().is_empty())
    }

    /// Fail unless the root is the top of a git work tree.
    pub fn ensure_repository(&self, operation: &str) -> Result<()> {
        if self.is_repository()? {
            return Ok(());
        }
        Err(Error::NotFound {
            what: format!("git repository at {}", self.root.display()),
            hint: format!("run `berth init` before {}", operation),
        })
    }

    /// Initialize the root repository if needed. Returns whether it was created.
    pub fn init(&self) -> Result<bool> {
        if self.is_repository()? {
            return Ok(false);
        }
        self.git.run(&self.root, &["init", "-q"])?;
        Ok(true)
    }

    /// Whether anything is staged in the root index.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let output = self
            .git
            .output(&self.root, &["diff", "--cached", "--quiet"])?;
        match output.code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(Error::Git {
                command: "diff --cached --quiet".to_string(),
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Current HEAD commit, if any.
    pub fn head(&self) -> Result<Option<String>> {
        let output = self
            .git
            .output(&self.root, &["rev-parse", "--verify", "--quiet", "HEAD"])?;
        Ok(output
            .success
            .then(|| output.stdout.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    /// Whether `rel_path` is tracked in the index or at HEAD.
    pub fn is_tracked(&self, rel_path: &Path) -> Result<bool> {
        let spec = rel_path.to_string_lossy().to_string();
        let staged = self
            .git
            .run(&self.root, &["ls-files", "--", &spec])?;
        if !staged.is_empty() {
            return Ok(true);
        }
        if self.head()?.is_none() {
            return Ok(false);
        }
        let committed = self.git.run(
            &self.root,
            &["ls-tree", "-r", "--name-only", "HEAD", "--", &spec],
        )?;
        Ok(!committed.is_empty())
    }

    /// Stage and commit exactly `rel_paths`, returning the new commit id.
    ///
    /// Paths that neither exist nor are known to git are skipped. Returns
    /// `None` if there was nothing to commit. On failure the paths are
    /// unstaged again before the error is returned.
    pub fn commit_paths(&self, message: &str, rel_paths: &[PathBuf]) -> Result<Option<String>> {
        let mut specs = Vec::new();
        for path in rel_paths {
            if self.root.join(path).exists() || self.is_tracked(path)? {
                specs.push(path.to_string_lossy().to_string());
            }
        }
        if specs.is_empty() {
            return Ok(None);
        }

        let with_specs = |head: &[&str]| -> Vec<String> {
            head.iter()
                .map(|s| s.to_string())
                .chain(std::iter::once("--".to_string()))
                .chain(specs.iter().cloned())
                .collect()
        };

        self.run_owned(&with_specs(&["add", "-A"]))?;

        let staged = self
            .output_owned(&with_specs(&["diff", "--cached", "--quiet"]))?;
        if staged.success {
            tracing::debug!(message, "nothing to commit for scoped paths");
            return Ok(None);
        }

        let commit = with_specs(&["commit", "--no-verify", "-q", "-m", message]);
        if let Err(err) = self.run_owned(&commit) {
            self.unstage(&specs);
            return Err(err);
        }

        let head = self.head()?.ok_or_else(|| Error::Git {
            command: "rev-parse HEAD".to_string(),
            stderr: "no HEAD after commit".to_string(),
        })?;
        tracing::info!(commit = %head, message, "root commit");
        Ok(Some(head))
    }

    /// Find the newest commit whose message is exactly `message`.
    pub fn find_commit(&self, message: &str) -> Result<Option<String>> {
        if self.head()?.is_none() {
            return Ok(None);
        }
        let grep = format!("--grep=^{}$", regex_escape(message));
        let found = self
            .git
            .run(&self.root, &["log", "-1", "--format=%H", "--extended-regexp", &grep])?;
        Ok(Some(found).filter(|s| !s.is_empty()))
    }

    fn unstage(&self, specs: &[String]) {
        let mut args: Vec<String> = if self.head().ok().flatten().is_some() {
            vec!["reset".into(), "-q".into(), "HEAD".into()]
        } else {
            vec![
                "rm".into(),
                "-r".into(),
                "--cached".into(),
                "-q".into(),
                "--ignore-unmatch".into(),
            ]
        };
        args.push("--".into());
        args.extend(specs.iter().cloned());
        if let Err(err) = self.run_owned(&args) {
            tracing::warn!(error = %err, "failed to unstage paths after commit failure");
        }
    }

    fn run_owned(&self, args: &[String]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git.run(&self.root, &args)
    }

    fn output_owned(&self, args: &[String]) -> Result<super::GitOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git.output(&self.root, &args)
    }
}

fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{configure_identity, git};
    use std::fs;
    use tempfile::TempDir;

    fn repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        git(temp.path(), &["init", "-q"]);
        configure_identity(temp.path());
        temp
    }

    #[test]
    fn test_init_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let git = Git::new();
        let root = RootRepo::new(&git, temp.path());
        assert!(!root.is_repository().unwrap());
        assert!(root.init().unwrap());
        assert!(!root.init().unwrap());
        assert!(root.ensure_repository("close").is_ok());
    }

    #[test]
    fn test_subdirectory_of_repository_is_not_a_root() {
        let temp = repo();
        let nested = temp.path().join("nested");
        fs::create_dir_all(&nested).unwrap();
        let git = Git::new();
        assert!(!RootRepo::new(&git, &nested).is_repository().unwrap());
    }

    #[test]
    fn test_commit_paths_leaves_unrelated_staged_changes() {
        let temp = repo();
        let git_runner = Git::new();
        let root = RootRepo::new(&git_runner, temp.path());

        fs::create_dir_all(temp.path().join("archive/A")).unwrap();
        fs::write(temp.path().join("archive/A/workspace.json"), "{}").unwrap();
        fs::write(temp.path().join("unrelated.txt"), "staged").unwrap();
        git(temp.path(), &["add", "unrelated.txt"]);

        let commit = root
            .commit_paths(
                "archive: A",
                &[PathBuf::from("workspaces/A"), PathBuf::from("archive/A")],
            )
            .unwrap()
            .unwrap();

        let files = git(temp.path(), &["show", "--name-only", "--format=", &commit]);
        assert_eq!(files, "archive/A/workspace.json");
        let staged = git(temp.path(), &["diff", "--cached", "--name-only"]);
        assert_eq!(staged, "unrelated.txt");
        assert!(root.has_staged_changes().unwrap());
    }

    #[test]
    fn test_commit_paths_records_deletions_and_moves() {
        let temp = repo();
        let git_runner = Git::new();
        let root = RootRepo::new(&git_runner, temp.path());

        fs::create_dir_all(temp.path().join("archive/A")).unwrap();
        fs::write(temp.path().join("archive/A/workspace.json"), "{}").unwrap();
        root.commit_paths("archive: A", &[PathBuf::from("archive/A")])
            .unwrap();

        fs::remove_dir_all(temp.path().join("archive/A")).unwrap();
        let purge = root
            .commit_paths("purge: A", &[PathBuf::from("archive/A")])
            .unwrap();
        assert!(purge.is_some());
        let tracked = git(temp.path(), &["ls-files"]);
        assert!(tracked.is_empty());
    }

    #[test]
    fn test_commit_paths_with_nothing_to_commit() {
        let temp = repo();
        let git_runner = Git::new();
        let root = RootRepo::new(&git_runner, temp.path());
        assert_eq!(
            root.commit_paths("noop", &[PathBuf::from("archive/none")])
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_find_commit_by_exact_message() {
        let temp = repo();
        let git_runner = Git::new();
        let root = RootRepo::new(&git_runner, temp.path());
        assert_eq!(root.find_commit("archive: A").unwrap(), None);

        fs::create_dir_all(temp.path().join("archive/A.1")).unwrap();
        fs::write(temp.path().join("archive/A.1/workspace.json"), "{}").unwrap();
        let commit = root
            .commit_paths("archive: A.1", &[PathBuf::from("archive/A.1")])
            .unwrap();

        assert_eq!(root.find_commit("archive: A.1").unwrap(), commit);
        assert_eq!(root.find_commit("archive: A").unwrap(), None);
    }
}
