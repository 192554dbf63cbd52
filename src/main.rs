use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use warden_channel::{
    ChannelKind, ChannelManager, ChannelReporter, HostpipeChannel, HttpChannel, OnReceive,
    SupportProbe,
};
use warden_core::AgentConfig;
use warden_engine::{Reporter, TaskEngine};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Guest-side instance agent executing control-plane commands", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: select a kick channel, fetch on startup, serve kicks
    Run {
        /// Control-plane base URL
        #[arg(long)]
        server_url: Option<String>,

        /// Directory task scripts are written to
        #[arg(long)]
        script_dir: Option<PathBuf>,
    },
}

/// Hostpipe support probe backed by the control-plane gshell check.
struct EngineProbe {
    reporter: Arc<Reporter>,
}

#[async_trait]
impl SupportProbe for EngineProbe {
    async fn gshell_supported(&self) -> bool {
        self.reporter.gshell_check().await
    }
}

/// Channel lifecycle reports land in the agent log; metrics sinks are wired
/// by the packaging layer.
struct LogChannelReporter;

#[async_trait]
impl ChannelReporter for LogChannelReporter {
    async fn report(&self, report_type: &str, report_info: &str) {
        info!(report_type, info = report_info, "channel report");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            server_url,
            script_dir,
        } => run_agent(server_url, script_dir).await,
    }
}

async fn run_agent(server_url: Option<String>, script_dir: Option<PathBuf>) -> Result<()> {
    let mut config = AgentConfig::default();
    if let Some(url) = server_url {
        config.server_url = url;
    }
    if let Some(dir) = script_dir {
        config.script_dir = dir;
    }
    let config = Arc::new(config);

    let reporter = Arc::new(Reporter::from_config(&config));
    let engine = Arc::new(TaskEngine::new(config.clone(), reporter.clone()));

    let kick_engine = engine.clone();
    let on_receive: OnReceive = Arc::new(move |payload, kind| {
        info!(channel = kind.as_str(), payload = %payload.trim(), "kick received");
        let engine = kick_engine.clone();
        tokio::spawn(async move {
            engine.fetch(true, None, false).await;
        });
        Some("ok".to_string())
    });

    let (failure_tx, failure_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = Arc::new(ChannelManager::new(Arc::new(LogChannelReporter)));
    manager.register(Arc::new(HostpipeChannel::new(
        on_receive.clone(),
        Arc::new(EngineProbe {
            reporter: reporter.clone(),
        }),
        failure_tx.clone(),
        config.hybrid,
    )));
    manager.register(Arc::new(HttpChannel::new(
        format!("{}/agent/kick", reporter.base_url()),
        on_receive,
        failure_tx,
    )));
    let failure_listener = manager.spawn_failure_listener(failure_rx);

    if let Err(err) = manager.select_available_channel(ChannelKind::None).await {
        warn!(error = %err, "no kick channel available, relying on startup fetch");
    }

    engine.enable_fetching();
    let fetched = engine.fetch(false, None, true).await;
    info!(fetched, "startup fetch complete");

    info!("agent running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    engine.shutdown();
    manager.stop_all().await;
    failure_listener.abort();
    info!("agent stopped");
    Ok(())
}
