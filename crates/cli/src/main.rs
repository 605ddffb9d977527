use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tether::bus::{
    BusEvent, EventBus, CONNECTION_STATUS_CHANGED, HEALTH_STATUS_CHANGED, SERVER_DISCONNECTED,
    SERVER_READY,
};
use tether::config::Config;
use tether::connection::{ConnectionRegistry, RpcClient};
use tether::health::{HealthMonitor, HttpProbe};
use tether::stream::{
    CallOutcome, ChatRequest, ChatStreamer, ChatUpdate, StreamClient, TaskStreamer, TaskUpdate,
};
use tether::supervisor::{ExternalBackend, ProcessSupervisor};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether CLI", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG still wins)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Probe the backend once and print its health status.
    Health {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Start (or attach to) the backend and monitor it until Ctrl-C.
    Watch {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Send one chat message and stream the answer.
    Chat {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        chat_id: String,

        message: String,
    },

    /// Stream progress of a backend task.
    Task {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        task_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Health { config }) => {
            if let Err(e) = run_health(config).await {
                log::error!("health failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch { config }) => {
            if let Err(e) = run_watch(config).await {
                log::error!("watch failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            chat_id,
            message,
        }) => {
            if let Err(e) = run_chat(config, chat_id, message).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Task { config, task_id }) => {
            if let Err(e) = run_task(config, task_id).await {
                log::error!("task failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// A connected registry plus whatever owns the backend process.
struct Session {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    process: Option<Arc<ProcessSupervisor>>,
}

impl Session {
    async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (config, path) = tether::config::load_config(config_path)?;
        log::debug!("using config {}", path.display());
        let bus = Arc::new(EventBus::new());

        if let Some(address) = tether::config::resolve_backend_address(&config) {
            let external = Arc::new(ExternalBackend::new(address));
            let endpoint = external.endpoint();
            let registry = Arc::new(ConnectionRegistry::new(bus, external));
            registry.handle_ready(endpoint);
            return Ok(Self {
                config,
                registry,
                process: None,
            });
        }

        if config.backend.command.is_none() {
            anyhow::bail!(
                "no backend configured: set backend.command or backend.address in {} \
                 (or TETHER_BACKEND_URL)",
                path.display()
            );
        }
        let (supervisor, notices) =
            ProcessSupervisor::new(config.backend.clone(), config.health.path.clone());
        let supervisor = Arc::new(supervisor);
        let registry = Arc::new(ConnectionRegistry::new(bus, supervisor.clone()));
        registry.listen(notices);
        let endpoint = supervisor.start().await?;
        registry.handle_ready(endpoint);
        Ok(Self {
            config,
            registry,
            process: Some(supervisor),
        })
    }

    fn rpc(&self) -> Arc<RpcClient> {
        Arc::new(
            RpcClient::new(Arc::clone(&self.registry))
                .with_default_timeout(self.config.streams.request_timeout()),
        )
    }

    fn monitor(&self) -> HealthMonitor {
        let probe = Arc::new(HttpProbe::new(self.rpc(), self.config.health.path.clone()));
        HealthMonitor::new(Arc::clone(&self.registry), probe, self.config.health.to_health_config())
    }

    fn streams(&self) -> Arc<StreamClient> {
        Arc::new(StreamClient::new(Arc::clone(&self.registry)))
    }

    async fn shutdown(self) {
        if let Some(process) = self.process {
            process.stop().await;
        }
    }
}

async fn run_health(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let session = Session::connect(config_path).await?;
    let monitor = session.monitor();
    let status = monitor.check_now().await;
    drop(monitor);
    session.shutdown().await;
    let status = status.ok_or_else(|| anyhow::anyhow!("health check was cancelled"))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.is_healthy {
        anyhow::bail!("backend unhealthy");
    }
    Ok(())
}

async fn run_watch(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let session = Session::connect(config_path).await?;
    let bus = Arc::clone(session.registry.bus());
    let mut subscriptions = Vec::new();
    let channels = [
        SERVER_READY,
        SERVER_DISCONNECTED,
        CONNECTION_STATUS_CHANGED,
        HEALTH_STATUS_CHANGED,
    ];
    for name in channels {
        let id = bus.subscribe(name, |event| match event {
            BusEvent::ServerReady(endpoint) => {
                println!("ready: {} (pid {})", endpoint.address, endpoint.process_id)
            }
            BusEvent::ServerDisconnected { exit_code } => {
                println!("disconnected (exit code {:?})", exit_code)
            }
            BusEvent::ConnectionStatusChanged(connected) => println!("connected: {}", connected),
            BusEvent::HealthStatusChanged(status) => match &status.error {
                None => println!("healthy ({} ms)", status.latency_ms.unwrap_or(0)),
                Some(error) => println!("unhealthy: {}", error),
            },
        });
        subscriptions.push((name, id));
    }

    let monitor = session.monitor();
    monitor.start();
    tokio::signal::ctrl_c().await?;
    monitor.stop();
    for (name, id) in subscriptions {
        bus.unsubscribe(name, id);
    }
    session.shutdown().await;
    Ok(())
}

async fn run_chat(
    config_path: Option<PathBuf>,
    chat_id: String,
    message: String,
) -> anyhow::Result<()> {
    let session = Session::connect(config_path).await?;
    let streamer = ChatStreamer::new(session.streams(), session.config.streams.chat_path.clone());
    let request = ChatRequest::new(chat_id, message);
    let mut stdout = std::io::stdout();

    let outcome = tokio::select! {
        outcome = streamer.run(&request, |update| match update {
            ChatUpdate::UserMessage(msg) => log::debug!("sent {:?}", msg.message_id),
            ChatUpdate::Status(status) => eprintln!("[{}]", status),
            ChatUpdate::Sources(sources) => log::info!("{} sources", sources.len()),
            ChatUpdate::Content { delta, .. } => {
                print!("{}", delta);
                let _ = stdout.flush();
            }
            ChatUpdate::Done(answer) => {
                println!();
                if let Some(id) = &answer.message_id {
                    log::info!("answer {} complete", id);
                }
            }
        }) => outcome,
        _ = tokio::signal::ctrl_c() => Ok(CallOutcome::Cancelled),
    };
    drop(streamer);
    session.shutdown().await;
    if outcome?.is_cancelled() {
        eprintln!("cancelled");
    }
    Ok(())
}

async fn run_task(config_path: Option<PathBuf>, task_id: String) -> anyhow::Result<()> {
    let session = Session::connect(config_path).await?;
    let streamer = TaskStreamer::new(session.streams(), session.config.streams.task_path.clone());

    let outcome = tokio::select! {
        outcome = streamer.run(&task_id, |update| match update {
            TaskUpdate::Metadata(meta) => log::info!("task metadata: {}", meta),
            TaskUpdate::Progress { percent, status } => println!("{:>3}% {}", percent, status),
            TaskUpdate::Log(line) => println!("{}", line),
            TaskUpdate::Completed(report) => println!("done: {}", report.status),
        }) => outcome,
        _ = tokio::signal::ctrl_c() => Ok(CallOutcome::Cancelled),
    };
    drop(streamer);
    session.shutdown().await;
    if let Some(report) = outcome?.completed() {
        println!("{}", serde_json::to_string_pretty(&report.result)?);
    } else {
        eprintln!("cancelled");
    }
    Ok(())
}
