//! Command implementations.

use crate::cli::{Cli, Commands, McpAction, RunArgs, WorkflowAction};
use crate::daemon::Daemon;
use apc_core::agents::{AgentBackend, AgentFactory, BackendKind, McpServer, RunOptions, StopReason};
use apc_core::config::load_config;
use apc_core::state::{WorkflowCoordinator, WorkflowStatus};
use apc_core::supervisor::ProcessSupervisor;
use apc_protocol::ipc::Event;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use colored::Colorize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn dispatch(cli: Cli) -> Result<()> {
    let backend = cli.backend.as_deref();
    match cli.command {
        Commands::Doctor => cmd_doctor(&cli.root, backend).await,
        Commands::Run(args) => cmd_run(&cli.root, backend, args).await,
        Commands::Workflow { action } => cmd_workflow(&cli.root, backend, action).await,
        Commands::Sweep => cmd_sweep(&cli.root, backend).await,
        Commands::InstallCli => cmd_install_cli(&cli.root, backend).await,
        Commands::Mcp { action } => cmd_mcp(&cli.root, backend, action).await,
    }
}

async fn cmd_doctor(root: &Path, backend: Option<&str>) -> Result<()> {
    let config = load_config(root).await?;
    let active = backend.unwrap_or(config.global.backend.as_str()).to_string();
    let supervisor = ProcessSupervisor::default();

    println!("{}", "Agent CLIs".bold());
    let mut missing = 0;
    for kind in [BackendKind::Cursor, BackendKind::Claude] {
        let status = AgentFactory::create(kind, &config.global, &supervisor)
            .dependency_status()
            .await;
        let marker = if kind.name() == active { " (active)" } else { "" };
        if status.installed {
            let path = status
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let version = status.version.unwrap_or_else(|| "unknown version".to_string());
            println!("  {} {kind}{marker}: {path} ({version})", "✓".green());
        } else {
            missing += 1;
            println!("  {} {kind}{marker}: {} not found", "✗".red(), status.name);
            println!("      {}", status.install_hint.dimmed());
        }
    }
    if missing > 0 {
        println!("\n{}", "Run `apc install-cli --backend <name>` to install a missing CLI.".yellow());
    }
    Ok(())
}

async fn cmd_run(root: &Path, backend: Option<&str>, args: RunArgs) -> Result<()> {
    let (daemon, _events) = Daemon::open(root, backend).await?;
    let prompt = tokio::fs::read_to_string(&args.prompt_file)
        .await
        .wrap_err_with(|| format!("reading {}", args.prompt_file.display()))?;

    let run_id = format!("cli-run-{}", std::process::id());
    let mut options = RunOptions::new(&run_id, prompt, &daemon.root)
        .with_tier(args.tier.into())
        .on_output(|text| {
            print!("{text}");
            let _ = std::io::stdout().flush();
        })
        .on_progress(|note| eprintln!("{}", note.dimmed()));
    if let Some(secs) = args.timeout {
        options = options.with_timeout(Duration::from_secs(secs));
    }
    if let Some(path) = args.plan_file {
        options = options.with_plan_file(path);
    }
    if let Some(path) = args.log_file {
        options = options.with_log_file(path);
    }

    let runner = Arc::clone(&daemon.runner);
    let run = runner.run(options);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n{}", "Interrupted, stopping the agent...".yellow());
            daemon.runner.stop(&run_id, StopReason::Cancelled).await;
            run.await
        }
    };
    println!();

    match result.error {
        None => {
            eprintln!(
                "{} finished in {:.1}s",
                "✓".green(),
                result.duration.as_secs_f64()
            );
            Ok(())
        }
        Some(error) => Err(eyre!(error)),
    }
}

async fn cmd_workflow(root: &Path, backend: Option<&str>, action: WorkflowAction) -> Result<()> {
    let (daemon, events) = Daemon::open(root, backend).await?;
    match action {
        WorkflowAction::Start {
            workflow_type,
            task,
            session,
        } => {
            let id = daemon.coordinator.start(&workflow_type, &session, task).await?;
            println!("{} {id}", "Started".green().bold());
            follow(&daemon.coordinator, events, &id, &session).await
        }
        WorkflowAction::Resume {
            workflow_id,
            session,
        } => {
            daemon.coordinator.resume(&session, &workflow_id).await?;
            println!("{} {workflow_id}", "Resumed".green().bold());
            follow(&daemon.coordinator, events, &workflow_id, &session).await
        }
        WorkflowAction::Paused { session } => {
            let paused = daemon
                .coordinator
                .engine()
                .pause_manager()
                .list_paused(&session)
                .await?;
            if paused.is_empty() {
                println!("No paused workflows in session '{session}'.");
                return Ok(());
            }
            for state in paused {
                println!(
                    "{}  {}  phase {} ({})  {}  {}",
                    state.workflow_id.bold(),
                    state.workflow_type,
                    state.phase.index,
                    state.phase.name,
                    state.pause_reason.to_string().yellow(),
                    state.paused_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(other) = &state.conflicting_workflow_id {
                    println!("    blocked by {other}");
                }
            }
            Ok(())
        }
    }
}

/// Print events until the workflow leaves the engine. Ctrl-C pauses it.
async fn follow(
    coordinator: &WorkflowCoordinator,
    mut events: mpsc::Receiver<Event>,
    workflow_id: &str,
    session_id: &str,
) -> Result<()> {
    let status = loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            status = coordinator.wait(workflow_id) => break status,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Interrupted, pausing...".yellow());
                coordinator.shutdown().await;
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    match status {
        Some(WorkflowStatus::Completed) => Ok(()),
        Some(WorkflowStatus::Paused) => {
            println!("Resume with: apc workflow resume {workflow_id} --session {session_id}");
            Ok(())
        }
        Some(WorkflowStatus::Failed(error)) => Err(eyre!("workflow {workflow_id} failed: {error}")),
        Some(WorkflowStatus::Cancelled) => Err(eyre!("workflow {workflow_id} was cancelled")),
        Some(other) => Err(eyre!("workflow {workflow_id} stopped while {other:?}")),
        None => Err(eyre!("unknown workflow {workflow_id}")),
    }
}

fn print_event(event: &Event) {
    match event {
        Event::WorkflowStarted { workflow_type, .. } => {
            println!("{} {workflow_type}", "▶".cyan());
        }
        Event::PhaseStarted {
            phase_index,
            phase_name,
            ..
        } => println!("{} phase {phase_index}: {}", "→".cyan(), phase_name.bold()),
        Event::PhaseCompleted { phase_name, .. } => println!("{} {phase_name}", "✓".green()),
        Event::WorkflowProgress { message, .. } => println!("  {}", message.dimmed()),
        Event::WorkflowPaused {
            phase_index,
            reason,
            conflicting_workflow_id,
            ..
        } => {
            let by = conflicting_workflow_id
                .as_ref()
                .map(|id| format!(" by {id}"))
                .unwrap_or_default();
            println!("{} paused at phase {phase_index} ({reason}{by})", "⏸".yellow());
        }
        Event::WorkflowResumed { phase_index, .. } => {
            println!("{} resumed at phase {phase_index}", "▶".cyan());
        }
        Event::WorkflowCompleted { workflow_id } => {
            println!("{} {workflow_id} completed", "✓".green().bold());
        }
        Event::WorkflowError { workflow_id, error } => {
            println!("{} {workflow_id}: {}", "✗".red().bold(), error.red());
        }
        Event::ConflictDeclared { workflow_id, scope } => {
            println!("{} {workflow_id} declared a conflict on {scope:?}", "!".yellow());
        }
        Event::ConflictsCleared { workflow_id } => {
            println!("{} {workflow_id} cleared its conflicts", "·".dimmed());
        }
    }
}

async fn cmd_sweep(root: &Path, backend: Option<&str>) -> Result<()> {
    let (daemon, _events) = Daemon::open(root, backend).await?;
    let killed = daemon.runner.kill_orphan_agents().await;
    if killed.is_empty() {
        println!("No orphaned agent processes.");
    } else {
        let pids: Vec<String> = killed.iter().map(ToString::to_string).collect();
        println!("Killed {} orphaned agent process(es): {}", killed.len(), pids.join(", "));
    }
    Ok(())
}

async fn active_backend(root: &Path, backend: Option<&str>) -> Result<Arc<dyn AgentBackend>> {
    let (daemon, _events) = Daemon::open(root, backend).await?;
    daemon
        .runner
        .active()
        .ok_or_else(|| eyre!("no backend configured"))
}

async fn cmd_install_cli(root: &Path, backend: Option<&str>) -> Result<()> {
    let agent = active_backend(root, backend).await?;
    if agent.is_available().await {
        println!("{} {} is already installed.", "✓".green(), agent.kind());
        return Ok(());
    }
    println!("Installing {}...", agent.kind());
    agent.install_cli().await?;
    println!("{} installed {}", "✓".green(), agent.kind());
    Ok(())
}

async fn cmd_mcp(root: &Path, backend: Option<&str>, action: McpAction) -> Result<()> {
    let agent = active_backend(root, backend).await?;
    match action {
        McpAction::Add {
            name,
            env,
            command,
            args,
        } => {
            let mut server = McpServer::new(&name, command).with_args(args);
            server.env = env.into_iter().collect();
            agent.install_mcp(&server).await?;
            println!("{} added MCP server '{name}' to {}", "✓".green(), agent.kind());
        }
        McpAction::Remove { name } => {
            if agent.remove_mcp(&name).await? {
                println!("{} removed MCP server '{name}'", "✓".green());
            } else {
                println!("MCP server '{name}' was not configured.");
            }
        }
        McpAction::Status { name } => {
            let path = agent
                .mcp_config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "no MCP configuration".to_string());
            if agent.is_mcp_configured(&name).await {
                println!("{} '{name}' is configured in {path}", "✓".green());
            } else {
                println!("{} '{name}' is not configured in {path}", "✗".red());
            }
        }
    }
    Ok(())
}
