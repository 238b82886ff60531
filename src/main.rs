//! Peering coordinator client entry point.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

mod config;
mod links;
mod policy;
mod reconciler;
mod session;
mod transport;
mod types;
mod updates;

use config::{Config, DEFAULT_CONFIG_PATH};
use reconciler::{Reconciler, ScriptAction};
use session::{Session, SessionState};
use transport::TcpConnector;

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("COORD_CLIENT_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load(&config_path())?;
    info!(
        "Starting peering client for AS {} with {} connection(s)",
        cfg.asn,
        cfg.connections.len()
    );

    // Connect every session; any failure here is fatal.
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let mut sessions: Vec<Session> = Vec::new();
    for session_cfg in cfg.sessions()? {
        let mut session = Session::new(session_cfg);
        if let Err(e) = session.connect(&TcpConnector, ended_tx.clone()).await {
            error!("[{}] {}", session.name(), e);
            for session in &mut sessions {
                session.disconnect().await;
            }
            return Err(e.into());
        }
        info!("[{}] Session {:?}", session.name(), session.state());
        sessions.push(session);
    }
    drop(ended_tx);

    let stores = sessions
        .iter()
        .map(|s| (s.name().to_string(), Arc::clone(s.links())))
        .collect();
    let reconciler = Reconciler::new(
        stores,
        ScriptAction::new(cfg.as_config_script.clone()),
        cfg.reconcile_interval(),
    );

    let run = reconciler.run();
    tokio::pin!(run);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut run => break,
            res = &mut shutdown => {
                match res {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
            // Ended sessions stay down until the process is restarted.
            Some(ended) = ended_rx.recv() => {
                warn!(
                    "[{}] Session ended: {}; not reconnecting",
                    ended.session, ended.reason
                );
                if let Some(session) = sessions
                    .iter_mut()
                    .find(|s| s.name() == ended.session && s.state() == SessionState::Streaming)
                {
                    session.close_ended().await;
                }
            }
        }
    }

    for session in &mut sessions {
        if session.state() == SessionState::Closed {
            continue;
        }
        info!(
            "[{}] Disconnecting (arbitration: {:?})",
            session.name(),
            session.arbitration()
        );
        session.disconnect().await;
    }

    info!("Shutdown complete.");
    Ok(())
}
