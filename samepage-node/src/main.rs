// SamePage node: relay connection, direct peer links, file-backed pages and a
// JSON-lines control surface on stdin/stdout.

mod actor;
mod backend;
mod config;
mod control;
mod host;
mod relay;
mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

use crate::actor::Input;
use crate::control::Command;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("samepage-node {}", VERSION);
            return Ok(());
        }
    }

    // stdout carries results and events, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("samepage_node=info,samepage_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let uuid = match cfg.notebook_uuid {
        Some(uuid) => uuid,
        None => {
            let uuid = uuid::Uuid::new_v4();
            tracing::warn!(%uuid, "no notebook_uuid configured, using a fresh one");
            uuid
        }
    };
    let notebook = actor::notebook(&cfg, uuid);
    let notebook_id = notebook.uuid;

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let peers: transport::PeerSenders = Arc::new(Mutex::new(HashMap::new()));
    let core = actor::spawn(cfg.clone(), notebook, input_rx, relay_tx, peers.clone())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        tokio::spawn(relay::run_relay(
            cfg.relay_url.clone(),
            relay_rx,
            input_tx.clone(),
        ));
        let transport_inputs = input_tx.clone();
        let dial = cfg.peers.clone();
        let port = cfg.p2p_port;
        tokio::spawn(async move {
            if let Err(e) =
                transport::run_transport(notebook_id, port, dial, peers, transport_inputs).await
            {
                tracing::error!(%port, error = %e, "direct links unavailable");
            }
        });
        tokio::spawn(control::run_stdin(input_tx.clone()));
        let tick_inputs = input_tx.clone();
        let tick = Duration::from_millis(cfg.tick_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if tick_inputs.send(Input::Tick).is_err() {
                    break;
                }
            }
        });
        if cfg.auto_connect {
            let _ = input_tx.send(Input::Command(Command::Connect));
        }
        shutdown_signal().await?;
        tracing::info!("shutting down");
        let _ = input_tx.send(Input::Shutdown);
        // Give the relay task a moment to close the socket.
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<(), anyhow::Error>(())
    })?;

    match core.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("core thread panicked"),
    }
    rt.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
