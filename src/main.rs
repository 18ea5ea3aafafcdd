//! Berth CLI - ticket-scoped developer workspaces built from git worktrees.

use berth::cli::{Cli, Commands, IndexCommands};
use berth::commands::{FindResult, Session};
use berth::engine::{AddRepoOptions, CloseOptions, ListOptions, PurgeOptions};
use berth::storage::find_root;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Exit code of a reopen that left some worktrees unrestored.
const EXIT_PARTIAL: i32 = 3;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine root: --root flag > BERTH_ROOT env > nearest marked ancestor > cwd
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let root = match cli.root {
        Some(path) => path,
        None => find_root(&cwd).unwrap_or_else(|| cwd.clone()),
    };
    tracing::debug!(root = %root.display(), "resolved root");

    let human = cli.human_readable;
    let result = Session::open(root, cli.pool, human, cli.no_input)
        .and_then(|mut session| run_command(cli.command, &mut session, &cwd));

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            if human {
                eprintln!("Error: {}", e);
            } else {
                eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
            }
            process::exit(e.exit_code());
        }
    }
}

/// Logs go to stderr; stdout carries command output only.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("BERTH_LOG")
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(
    command: Commands,
    session: &mut Session,
    cwd: &std::path::Path,
) -> Result<i32, berth::Error> {
    match command {
        Commands::Init => {
            let result = session.engine.init()?;
            session.print(&result);
        }

        Commands::Create { id, title } => {
            let result = session.engine.create(&id, &title)?;
            session.print(&result);
        }

        Commands::AddRepo {
            id,
            repo,
            alias,
            branch,
            base_ref,
        } => {
            let result = session.engine.add_repo(
                &id,
                &repo,
                AddRepoOptions {
                    alias,
                    branch,
                    base_ref,
                },
            )?;
            session.print(&result);
        }

        Commands::RemoveRepo { id, repo, force } => {
            let result = session.engine.remove_repo(&id, &repo, force)?;
            session.print(&result);
        }

        Commands::Close { id, force, yes } => {
            let result = session.engine.close(&id, CloseOptions { force, yes })?;
            session.print(&result);
        }

        Commands::Reopen { id } => {
            let result = session.engine.reopen(&id)?;
            session.print(&result);
            if result.partial {
                return Ok(EXIT_PARTIAL);
            }
        }

        Commands::Purge { id, force, yes } => {
            let result = session.engine.purge(&id, PurgeOptions { force, yes })?;
            session.print(&result);
        }

        Commands::Unlock { id } => {
            let result = session.engine.unlock(&id)?;
            session.print(&result);
        }

        Commands::Show { id } => {
            let result = session.engine.show(&id)?;
            session.print(&result);
        }

        Commands::Find { id } => {
            let location = session.engine.find(&id)?;
            session.print(&FindResult::new(&id, location));
        }

        Commands::List { status, repo, risk } => {
            let result = session.engine.list(&ListOptions {
                status: status.map(Into::into),
                repo,
                risk,
            })?;
            session.print(&result);
        }

        Commands::Events { id } => {
            let result = session.engine.events(id.as_deref())?;
            session.print(&result);
        }

        Commands::Current => {
            let result = session.engine.resolve_current(cwd)?;
            session.print(&result);
        }

        Commands::Index { command } => match command {
            IndexCommands::Rebuild => {
                let result = session.engine.rebuild_index()?;
                session.print(&result);
            }
        },
    }
    Ok(0)
}
