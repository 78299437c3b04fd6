// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! foreman command-line entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use foreman::agents::{AgentRecord, AgentRole, AgentServices};
use foreman::bus::{BusMessage, HistoryFilter, MessageBus, MessageType};
use foreman::coding::{HumanResponder, SessionEvent};
use foreman::config::{self, CliOptions, ResolvedConfig};
use foreman::git::{DiffStats, FileDiff, Git};
use foreman::store::{default_db_path, Store};
use foreman::telemetry::{init_telemetry, TelemetryConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sender id used for directives issued from the command line.
const CLI_AGENT_ID: &str = "cli";

/// Multi-agent task orchestration over isolated git worktrees.
#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Workspace root (defaults to the nearest directory with a foreman config)
    #[arg(long, global = true, env = "FOREMAN_ROOT")]
    root: Option<PathBuf>,

    /// Database file for messages and agents
    #[arg(long, global = true, env = "FOREMAN_DB")]
    db: Option<PathBuf>,

    /// Logging preset: default, development, production or testing
    #[arg(long, global = true, default_value = "production")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task through a worker and print its report
    Run {
        /// Task text
        #[arg(short, long)]
        task: String,

        /// Coding agent type (opencode, claude-code, codex, gemini)
        #[arg(short, long, env = "FOREMAN_CODING_AGENT")]
        agent: Option<String>,

        /// Repository the worker edits
        #[arg(short, long)]
        repo: Option<PathBuf>,

        /// Model passed to the coding agent
        #[arg(short, long)]
        model: Option<String>,

        /// Answer clarifying questions from stdin
        #[arg(short, long)]
        interactive: bool,

        /// Print session events as JSON lines on stderr
        #[arg(long)]
        events: bool,
    },

    /// Show the diff of a repository against its merge base
    Diff {
        #[arg(short, long)]
        repo: Option<PathBuf>,

        /// Print patches as well as counts
        #[arg(long)]
        json: bool,
    },

    /// Page through persisted bus messages
    History {
        #[arg(short, long)]
        conversation: Option<String>,

        #[arg(short, long)]
        agent: Option<String>,

        /// directive, report, chat or status
        #[arg(short = 't', long = "type")]
        message_type: Option<String>,

        #[arg(short, long, default_value_t = HistoryFilter::DEFAULT_LIMIT)]
        limit: usize,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig::preset(&cli.log)
        .ok_or_else(|| anyhow::anyhow!("unknown log preset: {}", cli.log))?;
    let _guard = init_telemetry(&telemetry)?;

    let cwd = std::env::current_dir()?;
    let root = cli
        .root
        .clone()
        .or_else(|| config::find_workspace_root(&cwd))
        .unwrap_or(cwd);

    match cli.command {
        Commands::Run {
            task,
            agent,
            repo,
            model,
            interactive,
            events,
        } => {
            let options = CliOptions {
                coding_agent: agent,
                model,
                database_path: cli.db,
                ..Default::default()
            };
            let config = config::load_config(&root, options)?;
            let repo = repo.unwrap_or_else(|| root.clone());
            run_task(&config, &root, &repo, &task, interactive, events).await
        }
        Commands::Diff { repo, json } => {
            let config = config::load_config(&root, CliOptions::default())?;
            let repo = repo.unwrap_or(root);
            show_diff(&config, &repo, json).await
        }
        Commands::History {
            conversation,
            agent,
            message_type,
            limit,
            offset,
            json,
        } => {
            let options = CliOptions {
                database_path: cli.db,
                ..Default::default()
            };
            let config = config::load_config(&root, options)?;
            let message_type = match message_type.as_deref() {
                Some(t) => Some(
                    MessageType::parse(t)
                        .ok_or_else(|| anyhow::anyhow!("unknown message type: {}", t))?,
                ),
                None => None,
            };
            let filter = HistoryFilter {
                agent_id: agent,
                conversation_id: conversation,
                message_type,
                limit: Some(limit),
                offset,
            };
            show_history(&config, &root, &filter, json)
        }
        Commands::Config { action } => {
            let config = config::load_config(&root, CliOptions::default())?;
            match action {
                Some(ConfigAction::Show) | None => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
            }
            Ok(())
        }
        Commands::Version => {
            println!("foreman {}", VERSION);
            Ok(())
        }
    }
}

fn open_store(config: &ResolvedConfig, root: &Path) -> anyhow::Result<Arc<Store>> {
    let path = config
        .database_path
        .clone()
        .unwrap_or_else(|| default_db_path(root));
    Ok(Arc::new(Store::open(&path)?))
}

/// Reads answers to clarifying questions from stdin; an empty line ends the
/// conversation.
struct StdinResponder;

#[async_trait]
impl HumanResponder for StdinResponder {
    async fn respond(&self, _session_id: &str, question: &str) -> Option<String> {
        let mut stderr = tokio::io::stderr();
        let prompt = format!("\n{} {}\n> ", "?".yellow().bold(), question);
        stderr.write_all(prompt.as_bytes()).await.ok()?;
        stderr.flush().await.ok()?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .ok()?;
        let answer = line.trim();
        (!answer.is_empty()).then(|| answer.to_string())
    }
}

async fn run_task(
    config: &ResolvedConfig,
    root: &Path,
    repo: &Path,
    task: &str,
    interactive: bool,
    events: bool,
) -> anyhow::Result<()> {
    let bus = MessageBus::new(open_store(config, root)?);
    let mut services = AgentServices::from_config(bus, config)?;
    if interactive {
        services = services.with_human(Arc::new(StdinResponder));
    }
    if events {
        services = services.with_event_sink(Arc::new(|event: SessionEvent| {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{}", line);
            }
        }));
    }
    let services = Arc::new(services);

    let git = Git::new(config.git_timeout());
    if !git.is_git_repo(repo).await {
        git.init_git_repo(repo).await?;
    }
    if !git.has_commits(repo).await {
        git.create_initial_commit(repo).await?;
    }

    let record = services.registry.create(
        AgentRecord::new(AgentRole::Worker, None)
            .with_name("cli-worker")
            .with_workspace(repo)
            .with_project(repo.display().to_string())
            .with_model(config.model.clone())
            .with_coding_agent(config.coding_agent.clone()),
    )?;
    let _worker = foreman::agents::Worker::spawn(services.clone(), &record);

    eprintln!(
        "{} {} ({})",
        "Dispatching".cyan().bold(),
        record.label(),
        config.coding_agent.as_deref().unwrap_or("direct LLM")
    );
    let timeout = Duration::from_millis(config.hard_cap_ms) + Duration::from_secs(60);
    let report = services
        .bus
        .request(
            &record.id,
            BusMessage::directive(Some(CLI_AGENT_ID), &record.id, task),
            timeout,
        )
        .await?;

    let success = report.metadata_bool("success").unwrap_or(false);
    if success {
        println!("{}", report.content);
    } else {
        println!("{}", report.content.red());
    }
    if let Some(binding) = services.worktrees.get(&record.id).await {
        eprintln!(
            "{} {} at {}",
            "Branch".dimmed(),
            binding.branch,
            binding.worktree_path.display()
        );
    }
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn show_diff(config: &ResolvedConfig, repo: &Path, json: bool) -> anyhow::Result<()> {
    let git = Git::new(config.git_timeout());
    if !git.is_git_repo(repo).await {
        anyhow::bail!("not a git repository: {}", repo.display());
    }
    let diff = git.compute_git_diff(repo).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&diff)?);
        return Ok(());
    }
    match diff {
        Some(diff) => print_diff(&diff),
        None => println!("No changes"),
    }
    Ok(())
}

fn print_diff(diff: &[FileDiff]) {
    for file in diff {
        println!(
            "{:>6} {:>6}  {}",
            format!("+{}", file.additions).green(),
            format!("-{}", file.deletions).red(),
            file.path
        );
    }
    println!("{}", DiffStats::from_diff(diff).to_string().bold());
}

fn show_history(
    config: &ResolvedConfig,
    root: &Path,
    filter: &HistoryFilter,
    json: bool,
) -> anyhow::Result<()> {
    let bus = MessageBus::new(open_store(config, root)?);
    let page = bus.get_history(filter)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&page.messages)?);
    } else {
        for message in &page.messages {
            println!(
                "{} {:<9} {} -> {}  {}",
                message.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                message.message_type.to_string().cyan(),
                message.from_agent_id.as_deref().unwrap_or("external"),
                message.to_agent_id.as_deref().unwrap_or("*"),
                message.content.lines().next().unwrap_or_default()
            );
        }
    }
    if page.has_more {
        eprintln!(
            "{}",
            format!("more: --offset {}", filter.offset + page.messages.len()).dimmed()
        );
    }
    Ok(())
}
