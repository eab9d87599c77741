use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vigil_agents::env::{load_dotenv, EnvLayers};
use vigil_agents::invocation::{AgentRequest, BackendInvocation};
use vigil_core::config::{load_config_or_default, VigilConfig};
use vigil_core::events::SupervisorEventKind;
use vigil_core::types::{ProcessKind, SpecId, TaskKey};
use vigil_core::validation::{Validate, ValidationLevel};
use vigil_git::GitCli;
use vigild::plan::spec_plan_path;
use vigild::{
    CreateTerminal, EventBus, JsonlEventLog, LaunchRequest, MergeCoordinator, MergeRequest,
    MergeSettings, ProcessRegistry, SqliteStore, Supervisor, SupervisorSettings, TerminalManager,
    TerminalSize,
};

const DEFAULT_CONFIG_PATH: &str = ".vigil/config.toml";
const PROJECT_DOTENV: &str = ".vigil/.env";
const LOG_LEVEL_VAR: &str = "VIGIL_LOG_LEVEL";
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Supervise agent backend processes")]
struct Cli {
    /// Path to the TOML config; defaults apply when the file is absent.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start one agent process and stream its events as JSON lines.
    Run(RunArgs),
    /// Merge a spec's changes into the project.
    Merge(MergeArgs),
    /// Report what a merge would change without merging.
    Preview(PreviewArgs),
    /// Persisted interactive terminal sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Task,
    Qa,
    Spec,
    Ideation,
    Roadmap,
}

impl From<KindArg> for ProcessKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Task => ProcessKind::TaskExecution,
            KindArg::Qa => ProcessKind::QaProcess,
            KindArg::Spec => ProcessKind::SpecCreation,
            KindArg::Ideation => ProcessKind::Ideation,
            KindArg::Roadmap => ProcessKind::Roadmap,
        }
    }
}

#[derive(Debug, Args)]
struct ProjectArgs {
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Credential override passed to the agent, `KEY=VALUE`. Repeatable.
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value_t = KindArg::Task)]
    kind: KindArg,
    /// Registry key; defaults to the spec id or `project`.
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    spec: Option<String>,
    /// Task description for spec creation.
    #[arg(long)]
    task: Option<String>,
    #[command(flatten)]
    project: ProjectArgs,
    /// Extra arguments forwarded to the agent script.
    #[arg(last = true)]
    extra: Vec<String>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    spec: String,
    /// Stage the changes for review instead of committing them.
    #[arg(long)]
    no_commit: bool,
    #[arg(long)]
    key: Option<String>,
    #[command(flatten)]
    project: ProjectArgs,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    spec: String,
    #[command(flatten)]
    project: ProjectArgs,
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    List,
    Show { id: String },
    /// Kill the terminal if live and delete its record.
    Delete { id: String },
    /// Open a new terminal and attach to it.
    New {
        id: String,
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        #[arg(long)]
        title: Option<String>,
        /// Start the agent CLI and capture its session id.
        #[arg(long)]
        agent: bool,
    },
    /// Reopen a persisted terminal and attach to it.
    Restore { id: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Validate the config and print any issues.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "vigil failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_LEVEL_VAR))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config_or_default(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    if let Command::Config {
        command: ConfigCommand::Check,
    } = &cli.command
    {
        return Ok(check_config(&config));
    }
    if has_errors(&config) {
        bail!(
            "config {} is invalid; run `vigil config check`",
            cli.config.display()
        );
    }

    match cli.command {
        Command::Run(args) => run_agent(&config, args).await,
        Command::Merge(args) => run_merge(&config, args).await,
        Command::Preview(args) => run_preview(&config, args).await,
        Command::Sessions { command } => run_sessions(&config, command).await,
        Command::Config { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn check_config(config: &VigilConfig) -> ExitCode {
    let issues = config.validate();
    if issues.is_empty() {
        println!("config ok");
        return ExitCode::SUCCESS;
    }
    for issue in &issues {
        let level = match issue.level {
            ValidationLevel::Error => "error",
            ValidationLevel::Warning => "warning",
        };
        println!("{level}\t{}\t{}", issue.code, issue.message);
    }
    if has_errors(config) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn has_errors(config: &VigilConfig) -> bool {
    config
        .validate()
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

fn env_layers(config: &VigilConfig, project: &ProjectArgs) -> Result<EnvLayers> {
    let dotenv = load_dotenv(&project.project.join(PROJECT_DOTENV))?;
    Ok(EnvLayers::from_system()
        .with_project(config.env.clone())
        .with_project(dotenv)
        .with_credentials(project.env.iter().cloned()))
}

async fn run_agent(config: &VigilConfig, args: RunArgs) -> Result<ExitCode> {
    let kind = ProcessKind::from(args.kind);
    let env = env_layers(config, &args.project)?;
    let project_dir = &args.project.project;

    let mut request = AgentRequest::new(kind, project_dir.clone());
    if let Some(spec) = &args.spec {
        request = request.with_spec(SpecId::new(spec.clone()));
    }
    if let Some(task) = &args.task {
        request = request.with_task_description(task.clone());
    }
    request.extra_args = args.extra;
    let command = BackendInvocation::new(config.agent.clone()).command_for(&request, &env)?;

    let key = TaskKey::new(
        args.key
            .or_else(|| args.spec.clone())
            .unwrap_or_else(|| "project".to_string()),
    );
    let plan_path = args
        .spec
        .as_ref()
        .map(|spec| spec_plan_path(project_dir, &SpecId::new(spec.clone())));

    let events = EventBus::default();
    let sink = spawn_event_log(config, &events)?;
    let mut rx = events.subscribe();
    let supervisor = Supervisor::new(
        Arc::new(ProcessRegistry::new()),
        events.clone(),
        SupervisorSettings::from_config(config),
    );
    supervisor
        .start(LaunchRequest {
            key: key.clone(),
            kind,
            command,
            plan_path,
        })
        .await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut code = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    print_json_line(&event)?;
                    if let SupervisorEventKind::Exit { code: exit, .. } = event.kind {
                        code = exit_code_for(exit);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!(key = %key, "interrupted; stopping");
                supervisor.stop_all();
                let deadline = Instant::now()
                    + Duration::from_millis(config.supervisor.stop_grace_ms)
                    + SHUTDOWN_SLACK;
                while !supervisor.registry().is_empty() && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                code = ExitCode::from(130);
                break;
            }
        }
    }

    drop(supervisor);
    drop(events);
    if tokio::time::timeout(SHUTDOWN_SLACK, sink).await.is_err() {
        warn!("event log did not drain before shutdown");
    }
    Ok(code)
}

async fn run_merge(config: &VigilConfig, args: MergeArgs) -> Result<ExitCode> {
    let env = env_layers(config, &args.project)?;
    let project_dir = args.project.project.clone();
    let spec_id = SpecId::new(args.spec);
    let request = MergeRequest {
        key: TaskKey::new(args.key.unwrap_or_else(|| spec_id.0.clone())),
        plan_path: Some(spec_plan_path(&project_dir, &spec_id)),
        spec_id,
        project_dir,
        no_commit: args.no_commit,
    };

    let result = merge_coordinator(config, env).merge(&request).await?;
    print_json_pretty(&result)?;
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_preview(config: &VigilConfig, args: PreviewArgs) -> Result<ExitCode> {
    let env = env_layers(config, &args.project)?;
    let preview = merge_coordinator(config, env)
        .preview(&args.project.project, &SpecId::new(args.spec))
        .await?;
    print_json_pretty(&preview)?;
    Ok(ExitCode::SUCCESS)
}

fn merge_coordinator(config: &VigilConfig, env: EnvLayers) -> MergeCoordinator {
    MergeCoordinator::new(
        BackendInvocation::new(config.agent.clone()),
        env,
        GitCli::default(),
        MergeSettings::from_config(&config.merge),
    )
}

async fn run_sessions(config: &VigilConfig, command: SessionsCommand) -> Result<ExitCode> {
    let store = open_store(&config.storage.sqlite_path)?;
    let events = EventBus::default();
    let manager = TerminalManager::new(Arc::new(Mutex::new(store)), events.clone(), config);

    match command {
        SessionsCommand::List => {
            for session in manager.sessions()? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    session.id,
                    session.title,
                    session.working_path.display(),
                    if session.agent_mode { "agent" } else { "shell" },
                    session.last_active_at.to_rfc3339(),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        SessionsCommand::Show { id } => match manager.session(&id)? {
            Some(session) => {
                print_json_pretty(&session)?;
                Ok(ExitCode::SUCCESS)
            }
            None => bail!("no session named {id}"),
        },
        SessionsCommand::Delete { id } => {
            if !manager.destroy(&id)? {
                bail!("no session named {id}");
            }
            println!("deleted {id}");
            Ok(ExitCode::SUCCESS)
        }
        SessionsCommand::New {
            id,
            cwd,
            title,
            agent,
        } => {
            let mut request = CreateTerminal::new(id.clone(), cwd);
            request.title = title;
            let mut rx = events.subscribe();
            manager.create(request)?;
            if agent {
                manager.invoke_agent(&id)?;
            }
            attach(&manager, &mut rx, &id).await?;
            Ok(ExitCode::SUCCESS)
        }
        SessionsCommand::Restore { id } => {
            let mut rx = events.subscribe();
            manager.restore(&id, TerminalSize::default())?;
            attach(&manager, &mut rx, &id).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Forward stdin lines to the terminal and its output to stdout until the
/// shell exits or the user interrupts. Scrollback is persisted either way.
async fn attach(
    manager: &TerminalManager,
    rx: &mut tokio::sync::broadcast::Receiver<vigil_core::events::SupervisorEvent>,
    id: &str,
) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) if event.key.0 == id => match event.kind {
                    SupervisorEventKind::TerminalOutput { data } => {
                        let mut stdout = std::io::stdout();
                        stdout.write_all(data.as_bytes())?;
                        stdout.flush()?;
                    }
                    SupervisorEventKind::SessionCaptured { agent_session_id } => {
                        info!(terminal = %id, agent_session_id, "agent session captured");
                    }
                    SupervisorEventKind::TerminalExit { .. } => return Ok(()),
                    _ => {}
                },
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "terminal output dropped"),
                Err(RecvError::Closed) => return Ok(()),
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => manager.write(id, &format!("{line}\r"))?,
                None => stdin_open = false,
            },
            _ = &mut ctrl_c => {
                manager.flush_all();
                info!(terminal = %id, "detached");
                return Ok(());
            }
        }
    }
}

fn spawn_event_log(
    config: &VigilConfig,
    events: &EventBus,
) -> Result<tokio::task::JoinHandle<()>> {
    let log = JsonlEventLog::new(&config.storage.event_log_root);
    log.ensure_layout()?;
    Ok(log.spawn_sink(events.subscribe()))
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("opening session store {}", path.display()))?;
    store.migrate()?;
    Ok(store)
}

fn exit_code_for(code: Option<i32>) -> ExitCode {
    match code {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

fn print_json_line(value: &impl Serialize) -> Result<()> {
    let line = serde_json::to_string(value)?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn print_json_pretty(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
