//! Common test utilities for berth integration tests.
//!
//! Provides `TestEnv` for isolated test environments that never touch the
//! user's data directory or a real remote.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// A test environment with an isolated root, repo pool and upstream store.
///
/// - `root_dir`: the workspace root (passed via `BERTH_ROOT`)
/// - `pool_dir`: the bare mirror pool (passed via `BERTH_POOL`)
/// - `upstream_dir`: plays the part of the hosting service
///
/// The `berth()` method sets both variables per-command, making tests
/// parallel-safe.
pub struct TestEnv {
    pub root_dir: TempDir,
    pub pool_dir: TempDir,
    pub upstream_dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment with isolated directories.
    pub fn new() -> Self {
        Self {
            root_dir: TempDir::new().unwrap(),
            pool_dir: TempDir::new().unwrap(),
            upstream_dir: TempDir::new().unwrap(),
        }
    }

    /// Create a new test environment and run `berth init`.
    pub fn init() -> Self {
        let env = Self::new();
        env.berth().arg("init").assert().success();
        env
    }

    /// Get a Command for the berth binary, non-interactive, with isolated paths.
    pub fn berth(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_berth"));
        cmd.current_dir(self.root());
        cmd.env("BERTH_ROOT", self.root());
        cmd.env("BERTH_POOL", self.pool_dir.path());
        cmd.env_remove("BERTH_LOG");
        cmd.env("GIT_AUTHOR_NAME", "Test");
        cmd.env("GIT_AUTHOR_EMAIL", "test@test.com");
        cmd.env("GIT_COMMITTER_NAME", "Test");
        cmd.env("GIT_COMMITTER_EMAIL", "test@test.com");
        cmd.arg("--no-input");
        cmd
    }

    pub fn root(&self) -> &Path {
        self.root_dir.path()
    }

    pub fn worktree(&self, id: &str, alias: &str) -> PathBuf {
        self.root().join("workspaces").join(id).join("repos").join(alias)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root().join(".state").join("index.db")
    }

    /// Create `<upstream>/<host>/<owner>/<repo>.git` with one commit on `main`
    /// and return its `file://` URL.
    pub fn upstream(&self, host: &str, owner: &str, repo: &str) -> String {
        let seed = self.upstream_dir.path().join(format!("seed-{owner}-{repo}"));
        std::fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "-q", "-b", "main"]);
        git(&seed, &["config", "user.email", "test@test.com"]);
        git(&seed, &["config", "user.name", "Test"]);
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

    /// `init`, `create <id>`, and bind one upstream repository as `r`.
    pub fn with_bound_workspace(id: &str) -> (Self, String) {
        let env = Self::init();
        let url = env.upstream("github.com", "o", "r");
        env.berth()
            .args(["create", id, "--title", "Login fix"])
            .assert()
            .success();
        env.berth()
            .args(["add-repo", id, &url, "--branch", &format!("{id}/test")])
            .assert()
            .success();
        (env, url)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
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

/// Parse a command's stdout as JSON.
pub fn json_stdout(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}
