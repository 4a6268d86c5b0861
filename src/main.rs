use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use livescribe::cli::{Cli, Commands, ConfigAction, ModelsAction};
use livescribe::config::Config;
use livescribe::ipc::server::IpcServer;
use livescribe::ipc::{Command, Response, send_command};
use livescribe::logging;
use livescribe::models::Catalog;
use livescribe::models::catalog::is_available;
use livescribe::server::{AppState, ServeOptions, run_server};
use livescribe::worker::{LoopExit, WorkerLauncher, WorkerSettings, run_worker};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    // The worker is synchronous and owns stdout; keep it off the runtime.
    if let Some(Commands::Worker(args)) = &cli.command {
        let exit = run_worker(&args.model, &args.settings())?;
        if exit == LoopExit::Orphaned {
            std::process::exit(1);
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            serve(config, None, None, cli.socket, cli.verbose).await?;
        }
        Some(Commands::Serve { listen, preload }) => {
            let config = load_config(cli.config.as_deref())?;
            serve(config, listen, preload, cli.socket, cli.verbose).await?;
        }
        Some(Commands::Status) => {
            handle_ipc_command(cli.socket, cli.config.as_deref(), Command::Status).await?;
        }
        Some(Commands::Switch {
            model,
            keep_sessions,
        }) => {
            let command = Command::SwitchModel {
                model,
                keep_sessions,
            };
            handle_ipc_command(cli.socket, cli.config.as_deref(), command).await?;
        }
        Some(Commands::StopModel) => {
            handle_ipc_command(cli.socket, cli.config.as_deref(), Command::StopModel).await?;
        }
        Some(Commands::Sessions) => {
            handle_ipc_command(cli.socket, cli.config.as_deref(), Command::Sessions).await?;
        }
        Some(Commands::Sweep) => {
            handle_ipc_command(cli.socket, cli.config.as_deref(), Command::Sweep).await?;
        }
        Some(Commands::Shutdown) => {
            handle_ipc_command(cli.socket, cli.config.as_deref(), Command::Shutdown).await?;
        }
        Some(Commands::Models { action }) => {
            let config = load_config(cli.config.as_deref())?;
            handle_models_command(action, &config);
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "livescribe", &mut std::io::stdout());
        }
        Some(Commands::Worker(_)) => unreachable!("worker runs before the async runtime starts"),
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// An explicit `--config` must exist; the default path may be absent.
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn serve(
    mut config: Config,
    listen: Option<String>,
    preload: Option<String>,
    socket: Option<PathBuf>,
    verbosity: u8,
) -> Result<()> {
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    if let Some(preload) = preload {
        config.models.preload = Some(preload);
    }
    if let Some(socket) = socket {
        config.server.socket = Some(socket);
    }
    let options = ServeOptions::from_config(&config)?;

    let launcher = WorkerLauncher::current_exe(WorkerSettings::from_config(&config))?
        .with_verbosity(verbosity);
    let state = Arc::new(AppState::from_config(config, launcher));
    run_server(state, options).await?;
    Ok(())
}

fn handle_models_command(action: ModelsAction, config: &Config) {
    let models_dir = config.models.resolved_dir();
    match action {
        ModelsAction::List => {
            println!("Models ({}):", models_dir.display().dimmed());
            for model in Catalog::builtin().list() {
                let status = if !model.backend.is_compiled() {
                    "not built".red().to_string()
                } else if is_available(&models_dir, model) {
                    "installed".green().to_string()
                } else {
                    "missing".yellow().to_string()
                };
                println!(
                    "  {:<20} {:<9} {:>4}-{:<5}ms  {:<10} {}",
                    model.id,
                    format!("{:?}", model.workflow).to_lowercase(),
                    model.latency.min_ms,
                    model.latency.max_ms,
                    status,
                    model.description.dimmed()
                );
            }
        }
    }
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}

/// Send a control command to a running server and print the reply.
async fn handle_ipc_command(
    socket: Option<PathBuf>,
    config_path: Option<&Path>,
    command: Command,
) -> Result<()> {
    let socket_path = match socket {
        Some(path) => path,
        None => load_config(config_path)?
            .server
            .socket
            .unwrap_or_else(IpcServer::default_socket_path),
    };

    let response = send_command(&socket_path, &command)
        .await
        .with_context(|| format!("Is the server running? (socket: {})", socket_path.display()))?;

    match response {
        Response::Ok => println!("{}", "ok".green()),
        Response::Status {
            worker,
            sessions,
            active_sessions,
        } => {
            println!("Status:");
            println!(
                "  {}     {}",
                "Model:".dimmed(),
                worker.model.as_deref().unwrap_or("none")
            );
            println!("  {}    {:?}", "Worker:".dimmed(), worker.state);
            if let Some(pid) = worker.pid {
                println!("  {}       {}", "PID:".dimmed(), pid);
            }
            if let Some(workflow) = worker.workflow {
                println!("  {}  {:?}", "Workflow:".dimmed(), workflow);
            }
            if worker.model.is_some() && !worker.loaded {
                println!("  {}", "model artifacts missing, running degraded".yellow());
            }
            println!(
                "  {}  {} ({} active)",
                "Sessions:".dimmed(),
                sessions,
                active_sessions
            );
        }
        Response::Switched {
            previous,
            current,
            changed,
        } => {
            if changed {
                println!(
                    "Switched {} -> {}",
                    previous.as_deref().unwrap_or("none"),
                    current.green()
                );
            } else {
                println!("{} already active", current.green());
            }
        }
        Response::Stopped { outcome } => match outcome {
            Some(outcome) => println!("Worker stopped ({outcome:?})"),
            None => println!("No worker running"),
        },
        Response::Sessions { sessions } => {
            if sessions.is_empty() {
                println!("No sessions");
            }
            for session in sessions {
                let marker = if session.is_active {
                    "●".green().to_string()
                } else {
                    "○".dimmed().to_string()
                };
                println!(
                    "  {} {}  {:<20} {:>4} results  expires {}",
                    marker,
                    session.id,
                    session.model_id,
                    session.transcription_count,
                    session.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        Response::Swept { removed } => println!("Removed {removed} expired session(s)"),
        Response::Error { message, code } => {
            eprintln!("{} {} ({})", "Error:".red(), message, code.dimmed());
            std::process::exit(1);
        }
    }
    Ok(())
}
