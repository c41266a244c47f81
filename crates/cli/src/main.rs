//! `agent` — local CLI for the Foreman runtime.
//!
//! - `agent run`      — execute a task locally (orchestrator or single worker)
//! - `agent history`  — list file-history snapshots
//! - `agent diff`     — show one snapshot's before/after
//! - `agent rollback` — restore files from snapshots
//!
//! Exit code 0 on success, 1 on failure.

mod run;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use fm_domain::config::Config;
use fm_history::rollback::{self, RollbackTarget};
use fm_history::HistoryStore;

#[derive(Debug, Parser)]
#[command(name = "agent", about = "Foreman agent runtime CLI")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "foreman.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a task to completion and print the answer.
    Run {
        #[arg(long)]
        task: String,
        /// `orchestrator` (plan + delegate) or `single` (one worker).
        #[arg(long, default_value = "orchestrator")]
        mode: String,
        #[arg(long)]
        session_id: Option<String>,
        /// Starting tier: small, medium, or large.
        #[arg(long)]
        tier: Option<String>,
        /// Use a scripted offline client instead of real endpoints.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        verbose: bool,
        /// Print the tool trace after the run.
        #[arg(long)]
        trace: bool,
    },
    /// List file-history snapshots.
    History {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show a single change's before/after states.
    Diff {
        #[arg(long)]
        change_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Restore files from snapshots.
    Rollback {
        #[arg(long)]
        change_id: Option<String>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        /// RFC 3339 timestamp; roll back changes at or after this instant.
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        Ok(Config::from_toml(&raw)?)
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit = match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(exit);
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Run { task, mode, session_id, tier, dry_run, verbose, trace } => {
            run::run(&config, run::RunArgs {
                task,
                mode,
                session_id,
                tier,
                dry_run,
                verbose,
                print_trace: trace,
            })
            .await
        }
        Command::History { session_id, file, agent_id, json } => {
            history(&config, session_id, file, agent_id, json)
        }
        Command::Diff { change_id, json } => diff(&config, &change_id, json),
        Command::Rollback { change_id, file, agent_id, session_id, after, dry_run, json } => {
            run_rollback(&config, change_id, file, agent_id, session_id, after, dry_run, json)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn history(
    config: &Config,
    session_id: Option<String>,
    file: Option<String>,
    agent_id: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let store = HistoryStore::new(&config.paths.state_dir);
    let mut changes = match (&session_id, &file, &agent_id) {
        (Some(session), _, _) => store.session_changes(session)?,
        (None, Some(path), _) => store.by_file(path)?,
        (None, None, Some(agent)) => store.by_agent(agent)?,
        (None, None, None) => store.all_changes()?,
    };
    if let Some(path) = &file {
        changes.retain(|c| &c.file_path == path);
    }
    if let Some(agent) = &agent_id {
        changes.retain(|c| &c.agent_id == agent);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }
    if changes.is_empty() {
        println!("no snapshots found");
        return Ok(());
    }
    for change in &changes {
        println!(
            "{}  {}  {:<6}  {}  ({})",
            change.timestamp.format("%Y-%m-%d %H:%M:%S"),
            change.change_id,
            format!("{:?}", change.operation).to_lowercase(),
            change.file_path,
            change.agent_id,
        );
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// diff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn diff(config: &Config, change_id: &str, json: bool) -> anyhow::Result<()> {
    let store = HistoryStore::new(&config.paths.state_dir);
    let change = store.find(change_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&change)?);
        return Ok(());
    }

    println!("change {} on {} ({:?})", change.change_id, change.file_path, change.operation);
    match &change.before {
        Some(before) => {
            println!("--- before ({} bytes, {})", before.size, &before.hash[..12]);
            for line in before.content.lines() {
                println!("- {line}");
            }
        }
        None => println!("--- before: (file did not exist)"),
    }
    match &change.after {
        Some(after) => {
            println!("+++ after ({} bytes, {})", after.size, &after.hash[..12]);
            for line in after.content.lines() {
                println!("+ {line}");
            }
        }
        None => println!("+++ after: (file deleted)"),
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// rollback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
fn run_rollback(
    config: &Config,
    change_id: Option<String>,
    file: Option<String>,
    agent_id: Option<String>,
    session_id: Option<String>,
    after: Option<String>,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    let target = match (change_id, file, agent_id, session_id, after) {
        (Some(id), None, None, None, None) => RollbackTarget::Change(id),
        (None, Some(path), None, None, None) => RollbackTarget::File(path),
        (None, None, Some(agent), None, None) => RollbackTarget::Agent(agent),
        (None, None, None, Some(session), None) => RollbackTarget::Session(session),
        (None, None, None, None, Some(ts)) => {
            let cutoff: DateTime<Utc> = ts
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid --after timestamp: {e}"))?;
            RollbackTarget::After(cutoff)
        }
        _ => anyhow::bail!(
            "specify exactly one of --change-id, --file, --agent-id, --session-id, --after"
        ),
    };

    let store = HistoryStore::new(&config.paths.state_dir);
    let plan = rollback::plan(&store, &target)?;

    if dry_run {
        if json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            println!("dry run — {} action(s):", plan.actions.len());
            for action in &plan.actions {
                match action {
                    fm_history::RestoreAction::Restore { file_path, hash, .. } => {
                        println!("  restore {file_path} -> {}", &hash[..12]);
                    }
                    fm_history::RestoreAction::Delete { file_path, .. } => {
                        println!("  delete  {file_path}");
                    }
                }
            }
        }
        return Ok(());
    }

    let outcome = rollback::apply(&plan, &config.paths.workspace_root);
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for path in &outcome.restored {
            println!("restored {path}");
        }
        for path in &outcome.deleted {
            println!("deleted {path}");
        }
        for path in &outcome.unchanged {
            println!("unchanged {path}");
        }
        for path in &outcome.failed {
            println!("FAILED {path}");
        }
    }
    if outcome.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} file(s) failed to roll back", outcome.failed.len())
    }
}
