//! Thin wrapper around the `git` executable.
//!
//! Every call runs `git -C <dir> ...` with terminal prompts disabled. When a
//! timeout is configured the child is killed once it runs past it and the
//! call fails with [`Error::GitTimeout`].

pub mod root;
pub mod worktree;

pub use root::RootRepo;
pub use worktree::{BindOutcome, WorktreeEntry, Worktrees};

use crate::{Error, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Git command runner.
#[derive(Debug, Clone, Default)]
pub struct Git {
    timeout: Option<Duration>,
}

impl Git {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Run git in `dir` and capture its output, whatever the exit status.
    pub fn output(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        tracing::debug!(dir = %dir.display(), ?args, "git");

        let mut child = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes on their own threads so a chatty child cannot
        // block on a full pipe while we wait on it.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = match self.timeout {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(?args, seconds = limit.as_secs(), "git timed out");
                    return Err(Error::GitTimeout {
                        command: args.join(" "),
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => child.wait()?,
        };

        Ok(GitOutput {
            success: status.success(),
            code: status.code(),
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
        })
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    pub fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.output(dir, args)?;
        if !output.success {
            return Err(Error::Git {
                command: args.join(" "),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Run git and report whether it exited zero.
    pub fn succeeds(&self, dir: &Path, args: &[&str]) -> Result<bool> {
        Ok(self.output(dir, args)?.success)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
