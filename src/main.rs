//! Foreman - autonomous coding-agent orchestration CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use foreman::dispatch::{GitCliProbe, GitCliReset, SupervisorDispatcher};
use foreman::supervisor::runner::TokioProcessRunner;
use foreman::{
    AgentSupervisor, Autopilot, CiFailureKind, FileProjectStore, ForemanConfig, ForemanError,
    PhaseStatus, ProjectState, ProjectStore, TaskEngine,
};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version = "0.1.0")]
#[command(about = "Autonomous coding-agent orchestration for Git/CI projects", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a project for orchestration
    Init {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Run the unattended execution loop until work is exhausted
    Run {
        /// Default assignee for tasks without one
        #[arg(long)]
        assignee: Option<String>,
    },

    /// Show project and loop status
    Status,

    /// Manage phases
    Phase {
        #[command(subcommand)]
        action: PhaseAction,
    },

    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Inspect and control supervised agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },

    /// Show effective configuration
    Config,
}

#[derive(Subcommand)]
enum PhaseAction {
    /// Create a new phase
    Create {
        name: String,
        /// Git branch for this phase
        #[arg(long)]
        branch: String,
    },
    /// List phases with task rollups
    List,
    /// Select the active phase by id or 1-based number
    Activate { selector: String },
    /// Set a phase's lifecycle status
    SetStatus {
        phase_id: String,
        /// One of PLANNING, BRANCHING, CODING, CREATING_PR, AWAITING_CI,
        /// CI_FAILED, READY_FOR_REVIEW, DONE
        status: String,
        /// Required with CI_FAILED: LOCAL_TESTER, REMOTE_CI, or AGENT_FAILURE
        #[arg(long)]
        failure_kind: Option<String>,
        /// CI signal context recorded alongside CI_FAILED
        #[arg(long)]
        ci_context: Option<String>,
    },
    /// Record a phase's pull-request URL
    SetPrUrl { phase_id: String, url: String },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a task in a phase
    Create {
        phase_id: String,
        title: String,
        /// Full task description handed to the worker
        #[arg(long)]
        description: String,
        /// Dependency task ids (may live in other phases)
        #[arg(long = "dep")]
        dependencies: Vec<String>,
    },
    /// Dispatch one task and wait for it to settle
    Start {
        phase_id: String,
        task_id: String,
        #[arg(long)]
        assignee: String,
    },
    /// Reset a task to TODO (also hard-resets the repository)
    Reset { phase_id: String, task_id: String },
    /// List tasks in the active (or given) phase
    List {
        #[arg(long)]
        phase_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List known agents (merged live + persisted view)
    List,
    /// Kill a running agent
    Kill { id: Uuid },
    /// Restart an agent with identical command/args
    Restart { id: Uuid },
    /// Flip RUNNING registry records with dead owners to STOPPED
    Reconcile,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e:#}", "Error:".red().bold());
        let code = e
            .downcast_ref::<ForemanError>()
            .map_or(1, ForemanError::exit_code);
        std::process::exit(code);
    }
}

struct App {
    config: ForemanConfig,
    store: Arc<FileProjectStore>,
    supervisor: AgentSupervisor,
    engine: Arc<TaskEngine>,
}

fn build_app(project_dir: &PathBuf) -> Result<App> {
    let config = ForemanConfig::load(project_dir)?;
    let state_dir = ForemanConfig::state_dir(project_dir);

    let store = Arc::new(FileProjectStore::new(&state_dir));
    let supervisor = AgentSupervisor::new(
        &state_dir,
        Arc::new(TokioProcessRunner),
        config.supervisor.clone(),
    );
    let dispatcher = Arc::new(SupervisorDispatcher::new(
        supervisor.clone(),
        config.workers.clone(),
        project_dir.clone(),
    ));
    let engine = Arc::new(TaskEngine::new(
        store.clone(),
        dispatcher,
        Arc::new(GitCliProbe::new(project_dir.clone())),
        Arc::new(GitCliReset),
    ));

    Ok(App {
        config,
        store,
        supervisor,
        engine,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = cli
        .project
        .canonicalize()
        .with_context(|| format!("project directory {} not found", cli.project.display()))?;

    if let Commands::Init { name } = &cli.command {
        return init_project(&project_dir, name.clone());
    }

    let app = build_app(&project_dir)?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::Run { assignee } => {
            // Startup safety nets: a prior crash may have left RUNNING
            // registry records and IN_PROGRESS tasks behind.
            let stale_agents = app.supervisor.reconcile_stale_running_agents()?;
            let stale_tasks = app.engine.reconcile_in_progress_tasks()?;
            if stale_agents + stale_tasks > 0 {
                println!(
                    "   {} reconciled {stale_agents} stale agent(s), {stale_tasks} stuck task(s)",
                    "Info:".blue()
                );
            }

            let mut autopilot_config = app.config.autopilot.clone();
            if let Some(assignee) = assignee {
                autopilot_config.default_assignee = assignee;
            }
            let autopilot = Autopilot::new(
                app.engine.clone(),
                app.supervisor.clone(),
                app.store.clone(),
                autopilot_config,
            );

            let state = app.store.read()?;
            println!(
                "{} auto mode for '{}' ({} phase(s))",
                "Starting".green().bold(),
                state.project_name,
                state.phases.len()
            );
            autopilot.start_auto()?;

            tokio::select! {
                outcome = autopilot.wait() => {
                    println!(
                        "{} {}",
                        "Done:".green().bold(),
                        outcome.unwrap_or_else(|| "no outcome recorded".into())
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("\n{} stopping at the current task boundary...", "Interrupt:".yellow().bold());
                    autopilot.stop().await?;
                    let outcome = autopilot.wait().await;
                    println!(
                        "{} {}",
                        "Stopped:".yellow().bold(),
                        outcome.unwrap_or_else(|| "stop requested".into())
                    );
                }
            }
        }

        Commands::Status => {
            let state = app.store.read()?;
            println!("Project: {}", state.project_name.bold());
            println!("Root: {}", state.root_dir.display());
            for (i, phase) in state.phases.iter().enumerate() {
                let active = state
                    .active_phase_id
                    .as_deref()
                    .map_or(i == 0, |id| id == phase.id);
                let marker = if active { "*" } else { " " };
                let done = phase
                    .tasks
                    .iter()
                    .filter(|t| t.status == foreman::TaskStatus::Done)
                    .count();
                println!(
                    "{marker} [{}] {} ({}) - {} - {done}/{} tasks done",
                    i + 1,
                    phase.name,
                    phase.id,
                    phase.status,
                    phase.tasks.len()
                );
            }
        }

        Commands::Phase { action } => match action {
            PhaseAction::Create { name, branch } => {
                let phase = app.engine.create_phase(&name, &branch)?;
                println!("Created phase {} ({})", phase.name.bold(), phase.id);
            }
            PhaseAction::List => {
                let state = app.store.read()?;
                for phase in &state.phases {
                    println!("{} ({}) - {} - branch {}", phase.name, phase.id, phase.status, phase.branch_name);
                }
            }
            PhaseAction::Activate { selector } => {
                let phase = app.engine.set_active_phase(&selector)?;
                println!("Active phase: {} ({})", phase.name.bold(), phase.id);
            }
            PhaseAction::SetStatus {
                phase_id,
                status,
                failure_kind,
                ci_context,
            } => {
                let status = parse_phase_status(&status)?;
                let failure_kind = failure_kind.as_deref().map(parse_failure_kind).transpose()?;
                let phase = app
                    .engine
                    .set_phase_status(&phase_id, status, failure_kind, ci_context)?;
                println!("Phase {} is now {}", phase.id, phase.status);
            }
            PhaseAction::SetPrUrl { phase_id, url } => {
                let phase = app.engine.set_phase_pr_url(&phase_id, &url)?;
                println!("Phase {} PR: {}", phase.id, url);
            }
        },

        Commands::Task { action } => match action {
            TaskAction::Create {
                phase_id,
                title,
                description,
                dependencies,
            } => {
                let task = app
                    .engine
                    .create_task(&phase_id, &title, &description, dependencies)?;
                println!("Created task {} ({})", task.title.bold(), task.id);
            }
            TaskAction::Start {
                phase_id,
                task_id,
                assignee,
            } => {
                let task = app.engine.start_task(&phase_id, &task_id, &assignee).await?;
                match task.status {
                    foreman::TaskStatus::Done => {
                        println!("{} task {} completed", "OK".green().bold(), task.id);
                    }
                    status => {
                        println!("{} task {} ended {}", "Failed:".red().bold(), task.id, status);
                        if let Some(logs) = &task.error_logs {
                            eprintln!("{logs}");
                        }
                        bail!("task did not complete");
                    }
                }
            }
            TaskAction::Reset { phase_id, task_id } => {
                let task = app.engine.reset_task_to_todo(&phase_id, &task_id).await?;
                println!("Task {} reset to {}", task.id, task.status);
            }
            TaskAction::List { phase_id } => {
                let state = app.store.read()?;
                let phase = match &phase_id {
                    Some(id) => state.phase(id).ok_or(ForemanError::UnknownPhase {
                        id: id.clone(),
                    })?,
                    None => state
                        .active_phase()
                        .ok_or(ForemanError::StalePhaseReference {
                            reference: state.active_phase_id.clone().unwrap_or_default(),
                        })?,
                };
                for task in &phase.tasks {
                    println!(
                        "[{}] {} ({}) - {}",
                        task.status, task.title, task.id, task.assignee
                    );
                }
            }
        },

        Commands::Agents { action } => match action {
            AgentsAction::List => {
                for view in app.supervisor.list()? {
                    println!(
                        "{} {} [{}] pid={} task={}",
                        view.id,
                        view.name,
                        view.status,
                        view.pid.map_or("-".into(), |p| p.to_string()),
                        view.task_id.as_deref().unwrap_or("-")
                    );
                }
            }
            AgentsAction::Kill { id } => {
                let view = app.supervisor.kill(id)?;
                println!("Agent {} is now {}", view.id, view.status);
            }
            AgentsAction::Restart { id } => {
                let view = app.supervisor.restart(id).await?;
                println!("Agent {} restarted (pid {:?})", view.id, view.pid);
            }
            AgentsAction::Reconcile => {
                let flipped = app.supervisor.reconcile_stale_running_agents()?;
                println!("Reconciled {flipped} stale agent record(s)");
            }
        },

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&app.config)?);
        }
    }

    Ok(())
}

fn init_project(project_dir: &PathBuf, name: Option<String>) -> Result<()> {
    let name = name.unwrap_or_else(|| {
        project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let store = FileProjectStore::new(ForemanConfig::state_dir(project_dir));
    if store.exists() {
        bail!("project already initialized at {}", project_dir.display());
    }
    store.write(ProjectState::new(&name, project_dir.clone()))?;
    println!(
        "{} project '{}' at {}",
        "Initialized".green().bold(),
        name,
        project_dir.display()
    );
    Ok(())
}

fn parse_phase_status(value: &str) -> Result<PhaseStatus> {
    Ok(match value.to_uppercase().as_str() {
        "PLANNING" => PhaseStatus::Planning,
        "BRANCHING" => PhaseStatus::Branching,
        "CODING" => PhaseStatus::Coding,
        "CREATING_PR" => PhaseStatus::CreatingPr,
        "AWAITING_CI" => PhaseStatus::AwaitingCi,
        "CI_FAILED" => PhaseStatus::CiFailed,
        "READY_FOR_REVIEW" => PhaseStatus::ReadyForReview,
        "DONE" => PhaseStatus::Done,
        other => bail!("unknown phase status '{other}'"),
    })
}

fn parse_failure_kind(value: &str) -> Result<CiFailureKind> {
    Ok(match value.to_uppercase().as_str() {
        "LOCAL_TESTER" => CiFailureKind::LocalTester,
        "REMOTE_CI" => CiFailureKind::RemoteCi,
        "AGENT_FAILURE" => CiFailureKind::AgentFailure,
        other => bail!("unknown failure kind '{other}'"),
    })
}
