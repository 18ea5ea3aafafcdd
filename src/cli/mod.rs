//! CLI argument definitions for berth.

use crate::models::WorkspaceStatus;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Berth - ticket-scoped developer workspaces built from git worktrees.
///
/// Start with `berth init` in an empty directory, then `berth create <id>`.
#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(
    author,
    version = crate::commands::VERSION,
    about = "Ticket-scoped developer workspaces built from git worktrees",
    long_about = None
)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Log git invocations and engine decisions to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace root. Defaults to the nearest ancestor holding berth.toml or workspaces/.
    #[arg(long = "root", global = true, env = "BERTH_ROOT")]
    pub root: Option<PathBuf>,

    /// Directory holding the shared bare repository mirrors
    #[arg(long = "pool", global = true, env = "BERTH_POOL")]
    pub pool: Option<PathBuf>,

    /// Never prompt; destructive steps need --force/--yes up front
    #[arg(long = "no-input", global = true)]
    pub no_input: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare the root: storage directories, root git repository, index
    Init,

    /// Create an empty active workspace
    Create {
        /// Workspace identifier (e.g. a ticket key such as PROJ-123)
        id: String,

        /// Free-text title
        #[arg(short, long, default_value = "")]
        title: String,
    },

    /// Bind a repository to a workspace through a new worktree
    #[command(name = "add-repo")]
    AddRepo {
        /// Workspace identifier
        id: String,

        /// Repository: URL, host/owner/repo or owner/repo
        repo: String,

        /// Directory name under repos/ (default: the repository name)
        #[arg(short, long)]
        alias: Option<String>,

        /// Branch to check out (default: rendered from branch_template)
        #[arg(short, long)]
        branch: Option<String>,

        /// Ref a newly created branch starts from (default: origin/<default branch>)
        #[arg(long = "base-ref")]
        base_ref: Option<String>,
    },

    /// Remove a repository's worktree and binding
    #[command(name = "remove-repo")]
    RemoveRepo {
        /// Workspace identifier
        id: String,

        /// Alias, owner/repo or host/owner/repo
        repo: String,

        /// Discard uncommitted changes in the worktree
        #[arg(short, long)]
        force: bool,
    },

    /// Archive a workspace: remove its worktrees and commit the move
    Close {
        /// Workspace identifier
        id: String,

        /// Discard uncommitted changes in dirty worktrees
        #[arg(short, long)]
        force: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Restore an archived workspace and recreate its worktrees
    Reopen {
        /// Workspace identifier
        id: String,
    },

    /// Permanently delete an archived workspace
    Purge {
        /// Workspace identifier
        id: String,

        /// Purge even while the purge lock is set
        #[arg(short, long)]
        force: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Clear the purge lock set when a workspace was archived
    Unlock {
        /// Workspace identifier
        id: String,
    },

    /// Show a workspace with per-repository risk
    Show {
        /// Workspace identifier
        id: String,
    },

    /// Report where a workspace lives, if anywhere
    Find {
        /// Workspace identifier
        id: String,
    },

    /// List workspaces
    List {
        /// Only workspaces in this state
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Only workspaces binding this repository (owner/repo or host/owner/repo)
        #[arg(short, long)]
        repo: Option<String>,

        /// Inspect worktrees and include each active workspace's risk
        #[arg(long)]
        risk: bool,
    },

    /// Show the event history recorded in the index
    Events {
        /// Only events of this workspace
        id: Option<String>,
    },

    /// Show the workspace containing the current directory
    Current,

    /// Secondary index maintenance
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },
}

/// Index subcommands
#[derive(Subcommand, Debug)]
pub enum IndexCommands {
    /// Delete the index and rebuild it from the workspace directories
    Rebuild,
}

/// Workspace state filter
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusArg {
    Active,
    Archived,
}

impl From<StatusArg> for WorkspaceStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Active => WorkspaceStatus::Active,
            StatusArg::Archived => WorkspaceStatus::Archived,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_repo() {
        let cli = Cli::try_parse_from([
            "berth",
            "-H",
            "add-repo",
            "WS1",
            "o/r",
            "--branch",
            "WS1/test",
            "--base-ref",
            "origin/dev",
        ])
        .unwrap();
        assert!(cli.human_readable);
        match cli.command {
            Commands::AddRepo {
                id,
                repo,
                branch,
                base_ref,
                alias,
            } => {
                assert_eq!(id, "WS1");
                assert_eq!(repo, "o/r");
                assert_eq!(branch.as_deref(), Some("WS1/test"));
                assert_eq!(base_ref.as_deref(), Some("origin/dev"));
                assert_eq!(alias, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["berth", "list", "--status", "archived", "--no-input"]).unwrap();
        assert!(cli.no_input);
        assert!(matches!(
            cli.command,
            Commands::List {
                status: Some(StatusArg::Archived),
                ..
            }
        ));
    }

    #[test]
    fn test_missing_id_is_usage_error() {
        let err = Cli::try_parse_from(["berth", "close"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
