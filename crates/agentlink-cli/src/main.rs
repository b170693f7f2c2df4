//! agentlink - run a coding agent behind the canonical session protocol
//!
//! UI messages are read from stdin and canonical messages are written to
//! stdout, one JSON object per line. Logs go to stderr or `--log-file`.

mod recorder;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use agentlink_core::{
    Bridge, BridgeConfig, CanonicalMessage, EventReceiver, FrameObserver, RpcPeer, Transport,
    UiMessage,
};
use recorder::FrameRecorder;

/// Respawns allowed with `--reconnect`
const MAX_RECONNECTS: u32 = 3;

#[derive(Parser)]
#[command(name = "agentlink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bridge a coding agent to the canonical session protocol over stdio", long_about = None)]
struct Cli {
    /// Agent executable
    #[arg(long, default_value = "codex")]
    command: String,

    /// Argument for the agent executable (repeatable)
    #[arg(long = "arg", default_value = "app-server", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Connect to an agent already listening on this TCP address instead
    /// of spawning one
    #[arg(long)]
    connect: Option<String>,

    /// Working directory for the agent
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Model to use (agent default when unset)
    #[arg(short, long)]
    model: Option<String>,

    /// Resume an existing thread
    #[arg(long)]
    resume: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Record raw agent frames to a JSONL file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Respawn the agent when it exits
    #[arg(long)]
    reconnect: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    let config = build_config(&cli)?;
    let recorder: Option<Arc<dyn FrameObserver>> = match &cli.record {
        Some(path) => Some(Arc::new(
            FrameRecorder::create(path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => None,
    };

    let cwd = config.cwd.clone();
    let peer = open_agent(&cli, &cwd, recorder.clone()).await?;
    let (bridge, mut events) = Bridge::new(config, peer);
    let mut out = tokio::io::stdout();

    let mut input = tokio::spawn(forward_stdin(bridge.clone()));

    if let Err(e) = bridge.initialize().await {
        drain_events(&mut events, &mut out).await?;
        input.abort();
        bridge.disconnect();
        return Err(anyhow::Error::new(e).context("Session failed to start"));
    }

    let mut reconnects = 0;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let disconnected = matches!(event, CanonicalMessage::Disconnected { .. });
                write_event(&mut out, &event).await?;
                if !disconnected {
                    continue;
                }

                if !cli.reconnect || reconnects >= MAX_RECONNECTS {
                    info!("Agent disconnected; exiting");
                    break;
                }
                reconnects += 1;
                warn!("Agent disconnected; reconnecting ({}/{})", reconnects, MAX_RECONNECTS);
                tokio::time::sleep(Duration::from_millis(500 * u64::from(reconnects))).await;

                let peer = open_agent(&cli, &cwd, recorder.clone()).await?;
                if let Err(e) = bridge.reset_for_reconnect(peer).await {
                    error!("Reconnect failed: {}", e);
                    drain_events(&mut events, &mut out).await?;
                    break;
                }
            }
            _ = &mut input => {
                debug!("stdin closed; shutting down");
                bridge.disconnect();
                drain_events(&mut events, &mut out).await?;
                break;
            }
        }
    }

    input.abort();
    bridge.disconnect();
    Ok(())
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("info,agentlink_core=debug,agentlink_rpc=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            // stdout carries the protocol
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Config file first, then command-line overrides
fn build_config(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::load_default().context("Failed to load config")?,
    };

    if let Some(cwd) = &cli.cwd {
        config.cwd = cwd.clone();
    }
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    if let Some(thread_id) = &cli.resume {
        config.resume_thread_id = Some(thread_id.clone());
    }
    Ok(config)
}

async fn open_agent(
    cli: &Cli,
    cwd: &Path,
    recorder: Option<Arc<dyn FrameObserver>>,
) -> anyhow::Result<Arc<RpcPeer>> {
    let transport = match &cli.connect {
        Some(addr) => Transport::connect_tcp(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?,
        None => Transport::spawn(&cli.command, &cli.args, Some(cwd))
            .with_context(|| format!("Failed to start {}", cli.command))?,
    };
    info!("Opened {}", transport.label());
    Ok(RpcPeer::start(transport, recorder))
}

/// Parse UI messages from stdin until it closes
async fn forward_stdin(bridge: Bridge) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<UiMessage>(line) {
            Ok(msg) => {
                let kind = msg.kind();
                if !bridge.send_message(msg) {
                    warn!("{} was not accepted", kind);
                }
            }
            Err(e) => warn!("Ignoring malformed UI message: {}", e),
        }
    }
}

async fn write_event(out: &mut Stdout, event: &CanonicalMessage) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

async fn drain_events(events: &mut EventReceiver, out: &mut Stdout) -> anyhow::Result<()> {
    while let Ok(event) = events.try_recv() {
        write_event(out, &event).await?;
    }
    Ok(())
}
