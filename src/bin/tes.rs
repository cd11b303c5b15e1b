//! tes CLI: server, worker and task client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tes_rs::client::{HttpEventWriter, TesClient};
use tes_rs::config::Config;
use tes_rs::events::{EventWriter, LogWriter, MultiWriter};
use tes_rs::model::{ListTasksRequest, State, Task, View};
use tes_rs::retry::Retrier;
use tes_rs::shutdown::cancel_on_signal;
use tes_rs::telemetry::{TelemetryConfig, init_telemetry};
use tes_rs::worker::{Runner, RunnerConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tes", about = "GA4GH Task Execution Service", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server, dispatcher and reconcilers
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Execute a task on this host
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Task operations against a running server
    Task {
        /// Server address
        #[arg(short = 'S', long, global = true)]
        server: Option<String>,

        #[command(subcommand)]
        action: TaskAction,
    },
    /// Print the version
    Version,
}

#[derive(Subcommand)]
enum ServerAction {
    Run,
}

#[derive(Subcommand)]
enum WorkerAction {
    Run {
        /// Task to execute
        #[arg(long)]
        task_id: String,
        /// Server to read the task from and report events to
        #[arg(long)]
        server_address: Option<String>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a task from a JSON file
    Create { file: PathBuf },
    /// Show a task
    Get {
        id: String,
        #[arg(long, default_value = "FULL")]
        view: View,
    },
    /// List tasks
    List {
        #[arg(long, default_value = "MINIMAL")]
        view: View,
        #[arg(long)]
        state: Option<State>,
        #[arg(long, default_value = "")]
        name_prefix: String,
        /// Tag filter, KEY=VALUE; repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long)]
        page_token: Option<String>,
    },
    /// Cancel tasks
    Cancel { ids: Vec<String> },
    /// Wait for tasks to finish; fails unless all complete
    Wait {
        ids: Vec<String>,
        /// Poll interval
        #[arg(long, default_value = "1s", value_parser = humantime_duration)]
        every: Duration,
    },
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Server {
            action: ServerAction::Run,
        } => cmd_server(config, cli.config.as_deref()).await,
        Command::Worker {
            action:
                WorkerAction::Run {
                    task_id,
                    server_address,
                },
        } => cmd_worker(config, task_id, server_address).await,
        Command::Task { server, action } => {
            let address = server.unwrap_or_else(|| config.worker.server_address.clone());
            let client = client(&config, &address)?;
            match action {
                TaskAction::Create { file } => cmd_task_create(&client, &file).await,
                TaskAction::Get { id, view } => {
                    print_json(&client.get_task(&id, view).await?)
                }
                TaskAction::List {
                    view,
                    state,
                    name_prefix,
                    tags,
                    page_size,
                    page_token,
                } => {
                    let tags = tags
                        .iter()
                        .map(|t| match t.split_once('=') {
                            Some((k, v)) => (k.to_string(), v.to_string()),
                            None => (t.clone(), String::new()),
                        })
                        .collect();
                    let req = ListTasksRequest {
                        name_prefix,
                        state,
                        tags,
                        page_size,
                        page_token,
                        view,
                        owner: None,
                    };
                    print_json(&client.list_tasks(&req).await?)
                }
                TaskAction::Cancel { ids } => {
                    for id in ids {
                        client.cancel_task(&id).await?;
                        println!("{id}");
                    }
                    Ok(())
                }
                TaskAction::Wait { ids, every } => cmd_task_wait(&client, &ids, every).await,
            }
        }
        Command::Version => {
            println!("tes {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Ok(match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    })
}

/// A client using the first configured basic-auth user, if any.
fn client(config: &Config, address: &str) -> anyhow::Result<TesClient> {
    let mut client = TesClient::new(address, config.worker.update_timeout)?;
    if let Some(cred) = config.server.basic_auth.first() {
        client = client.with_basic_auth(&cred.user, cred.password.expose_secret());
    }
    Ok(client)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_server(config: Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::server(
        &config.logging,
        config.server.service_name.clone(),
    ))?;

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone())?;

    tes_rs::server::run(config, config_path, shutdown).await?;
    Ok(())
}

async fn cmd_worker(
    config: Config,
    task_id: String,
    server_address: Option<String>,
) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig::worker(
        &config.logging,
        &config.server.service_name,
        &task_id,
    ))?;
    let address = server_address.unwrap_or_else(|| config.worker.server_address.clone());
    let client = client(&config, &address)?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let writers: Vec<Arc<dyn EventWriter>> = vec![
        Arc::new(HttpEventWriter::new(
            client.clone(),
            Retrier::from(&config.retry),
            cancel.clone(),
        )),
        Arc::new(LogWriter::new("worker")),
    ];
    let runner = Runner::new(
        RunnerConfig::from(&config),
        Arc::new(client),
        Arc::new(MultiWriter::new(writers)),
    );
    let state = runner.run(&task_id, cancel).await?;
    guard.force_flush();

    if state != State::Complete {
        anyhow::bail!("task {task_id} finished in state {state}");
    }
    Ok(())
}

async fn cmd_task_create(client: &TesClient, file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let task: Task = serde_json::from_str(&raw)?;
    let resp = client.create_task(&task).await?;
    println!("{}", resp.id);
    Ok(())
}

async fn cmd_task_wait(client: &TesClient, ids: &[String], every: Duration) -> anyhow::Result<()> {
    let tasks = client.wait(ids, every).await?;
    let mut failed = 0;
    for task in &tasks {
        println!("{}  {}", task.id, task.state);
        if task.state != State::Complete {
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} task(s) did not complete");
    }
    Ok(())
}
