//! Periodic link installation.
//!
//! Every tick reconciles the link store of each session.  If any of them
//! changed the installed set, the AS reconfiguration action runs once for
//! the whole tick.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::process::Command;
use tokio::time::{self, MissedTickBehavior};

use crate::links::LinkStore;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("could not launch {}: {source}", path.display())]
    Launch {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} exited with {status}", path.display())]
    Exit { path: PathBuf, status: ExitStatus },
}

/// Applies the installed link set to the managed AS.
#[async_trait]
pub trait ReconfigureAction: Send + Sync {
    async fn run(&self) -> Result<(), ActionError>;
}

/// Runs an executable with no arguments and waits for it to exit.
#[derive(Debug, Clone)]
pub struct ScriptAction {
    path: PathBuf,
}

impl ScriptAction {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReconfigureAction for ScriptAction {
    async fn run(&self) -> Result<(), ActionError> {
        let status = Command::new(&self.path)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| ActionError::Launch {
                path: self.path.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ActionError::Exit {
                path: self.path.clone(),
                status,
            })
        }
    }
}

pub struct Reconciler<A> {
    stores: Vec<(String, Arc<LinkStore>)>,
    action: A,
    interval: Duration,
}

impl<A: ReconfigureAction> Reconciler<A> {
    /// `stores` pairs each session name with its link store.
    pub fn new(stores: Vec<(String, Arc<LinkStore>)>, action: A, interval: Duration) -> Self {
        Self {
            stores,
            action,
            interval,
        }
    }

    /// Reconciles every store and restarts the AS if any of them changed.
    /// Returns whether a restart was attempted.
    pub async fn tick(&self) -> bool {
        let mut restart = false;
        for (session, store) in &self.stores {
            let pass = store.reconcile();
            if pass.restart_needed() {
                info!(
                    "[{}] {} link(s) created, {} destroyed, {} installed",
                    session,
                    pass.created.len(),
                    pass.destroyed.len(),
                    store.installed().len()
                );
                restart = true;
            } else {
                debug!("[{}] {} link(s) tracked, no changes", session, store.len());
            }
        }
        if restart {
            info!("Restarting AS");
            if let Err(e) = self.action.run().await {
                error!("Restarting AS failed: {}", e);
            }
        }
        restart
    }

    /// Ticks forever.  A slow action delays the following ticks.
    pub async fn run(&self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::Link;
    use crate::types::LinkType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAction {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReconfigureAction for Arc<CountingAction> {
        async fn run(&self) -> Result<(), ActionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ActionError::Launch {
                    path: "restart-as".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(())
        }
    }

    fn link(port: u16) -> Link {
        Link {
            link_type: LinkType::Core,
            peer_asn: "1-ff00:0:111".into(),
            local_ip: "10.0.0.1".into(),
            local_port: port,
            remote_ip: "10.0.0.2".into(),
            remote_port: 50001,
        }
    }

    fn reconciler(
        stores: &[Arc<LinkStore>],
        action: &Arc<CountingAction>,
    ) -> Reconciler<Arc<CountingAction>> {
        let stores = stores
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("session-{}", i), Arc::clone(s)))
            .collect();
        Reconciler::new(stores, Arc::clone(action), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn one_restart_per_tick() {
        let changed = Arc::new(LinkStore::new());
        let idle = Arc::new(LinkStore::new());
        changed.add(link(50000));
        changed.add(link(50002));
        let action = Arc::new(CountingAction::default());
        let reconciler = reconciler(&[changed, idle], &action);

        assert!(reconciler.tick().await);
        assert_eq!(action.runs.load(Ordering::SeqCst), 1);

        assert!(!reconciler.tick().await);
        assert_eq!(action.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_triggers_restart() {
        let store = Arc::new(LinkStore::new());
        store.add(link(50000));
        let action = Arc::new(CountingAction::default());
        let reconciler = reconciler(&[Arc::clone(&store)], &action);

        reconciler.tick().await;
        store.remove(&link(50000));
        assert!(reconciler.tick().await);
        assert_eq!(action.runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn failed_action_is_not_fatal() {
        let store = Arc::new(LinkStore::new());
        store.add(link(50000));
        let action = Arc::new(CountingAction {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let reconciler = reconciler(&[Arc::clone(&store)], &action);

        assert!(reconciler.tick().await);
        store.add(link(50004));
        assert!(reconciler.tick().await);
        assert_eq!(action.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reconciles_on_interval() {
        let store = Arc::new(LinkStore::new());
        store.add(link(50000));
        let action = Arc::new(CountingAction::default());
        let reconciler = Arc::new(reconciler(&[Arc::clone(&store)], &action));
        let task = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.run().await }
        });

        // The first tick fires immediately.
        time::sleep(Duration::from_millis(5)).await;
        assert_eq!(action.runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.installed(), vec![link(50000)]);

        store.add(link(50002));
        time::sleep(Duration::from_millis(4)).await;
        assert_eq!(action.runs.load(Ordering::SeqCst), 1);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(action.runs.load(Ordering::SeqCst), 2);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(action.runs.load(Ordering::SeqCst), 2);
        task.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_exit_status_is_observed() {
        assert!(ScriptAction::new("true").run().await.is_ok());
        assert!(matches!(
            ScriptAction::new("false").run().await,
            Err(ActionError::Exit { .. })
        ));
        assert!(matches!(
            ScriptAction::new("/nonexistent/restart-as").run().await,
            Err(ActionError::Launch { .. })
        ));
    }
}
