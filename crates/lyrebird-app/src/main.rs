//! Lyrebird - HTTP/HTTPS recording and replay proxy.
//!
//! `lyrebird recording <url>` sits between a browser and the live origin
//! and captures every transaction into an inventory on shutdown.
//! `lyrebird playback` answers those requests from the inventory with the
//! recorded status, headers, body and timing; unmatched requests are
//! forwarded upstream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use lyrebird_proxy::{
    watch_inventory, CaManager, PlaybackHandler, ProxyServer, Recorder, RecordingHandler,
    Replayer, UpstreamClient, DEFAULT_PORT,
};

#[derive(Parser)]
#[command(
    name = "lyrebird",
    version,
    about = "HTTP/HTTPS recording and replay proxy for performance engineering"
)]
struct Cli {
    /// Proxy listen port.
    #[arg(short, long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Inventory directory.
    #[arg(short, long, global = true, default_value = "./inventory")]
    inventory_dir: PathBuf,

    /// Log level (debug, info, warn, error).
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record traffic for the given entry URL into the inventory.
    Recording {
        /// Entry URL the session is recorded for.
        url: String,

        /// Store bodies as captured instead of beautifying HTML/CSS/JS.
        #[arg(long)]
        no_beautify: bool,
    },
    /// Replay recorded traffic from the inventory.
    Playback {
        /// Reload the inventory when it changes on disk.
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and exit 0; everything else is
            // a configuration error.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_logging(&cli.log_level)?;

    match cli.command {
        Command::Recording { url, no_beautify } => {
            run_recording(cli.port, cli.inventory_dir, url, no_beautify).await
        }
        Command::Playback { watch } => run_playback(cli.port, cli.inventory_dir, watch).await,
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    if !matches!(level, "debug" | "info" | "warn" | "error") {
        anyhow::bail!("invalid log level: {level} (expected debug, info, warn or error)");
    }
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in [
        "lyrebird_app",
        "lyrebird_core",
        "lyrebird_inventory",
        "lyrebird_proxy",
    ] {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn run_recording(
    port: u16,
    inventory_dir: PathBuf,
    url: String,
    no_beautify: bool,
) -> anyhow::Result<()> {
    let recorder = Recorder::new(url.clone(), &inventory_dir, no_beautify)
        .map_err(|e| anyhow::anyhow!("failed to create recorder: {e}"))?;
    let handler = RecordingHandler::new(recorder.clone());

    let ca_manager = CaManager::with_default_dir()?;
    let server = ProxyServer::on_port(port, ca_manager, handler)?;

    tracing::info!(mode = "recording", %url, port, inventory = %inventory_dir.display(), "starting");
    tracing::info!("proxy settings: http://localhost:{port}");

    let handle = server.start()?;
    wait_for_shutdown_signal().await;

    tracing::info!("shutting down, saving inventory...");
    if let Err(e) = recorder.save_inventory() {
        tracing::error!(error = %e, "failed to save inventory on shutdown");
    } else {
        tracing::info!(
            transactions = recorder.transaction_count(),
            "inventory saved"
        );
    }
    // Grace for straggling file writes before the process exits.
    tokio::time::sleep(Duration::from_secs(1)).await;

    handle.stop().await;
    Ok(())
}

async fn run_playback(port: u16, inventory_dir: PathBuf, watch: bool) -> anyhow::Result<()> {
    let replayer = Replayer::new(&inventory_dir)
        .map_err(|e| anyhow::anyhow!("failed to load inventory: {e}"))?;
    let upstream = Arc::new(UpstreamClient::new()?);
    let handler = PlaybackHandler::new(replayer.clone(), upstream);

    let ca_manager = CaManager::with_default_dir()?;
    let server = ProxyServer::on_port(port, ca_manager, handler)?;

    tracing::info!(
        mode = "playback",
        port,
        inventory = %inventory_dir.display(),
        resources = replayer.transaction_count(),
        watch,
        "starting"
    );
    tracing::info!("proxy settings: http://localhost:{port}");

    let handle = server.start()?;

    let watcher = if watch {
        Some(watch_inventory(
            &inventory_dir,
            replayer,
            handle.shutdown_sender().subscribe(),
        )?)
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down...");

    handle.stop().await;
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
