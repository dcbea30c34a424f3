//! Binary reachability reporting.
//!
//! The watcher forwards transitions only. It does no debouncing of its own;
//! whatever feeds it (a platform primitive calling [`ConnectivityWatcher::report`]
//! or the TCP probe) owns any damping.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Satisfied,
    Unsatisfied,
}

/// Shared reachability cell. `None` until the first report.
#[derive(Debug, Clone)]
pub struct ConnectivityWatcher {
    tx: Arc<watch::Sender<Option<Reachability>>>,
}

impl ConnectivityWatcher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Report the current reachability. Returns whether it changed.
    pub fn report(&self, reachability: Reachability) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == Some(reachability) {
                false
            } else {
                *current = Some(reachability);
                true
            }
        });
        if changed {
            tracing::info!(?reachability, "Connectivity changed");
        }
        changed
    }

    pub fn current(&self) -> Option<Reachability> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Reachability>> {
        self.tx.subscribe()
    }

    /// Poll a TCP connect to `target` every `interval` and report the result.
    pub fn spawn_probe(&self, target: String, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachability = probe(&target, timeout).await;
                watcher.report(reachability);
            }
        })
    }
}

impl Default for ConnectivityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe(target: &str, timeout: Duration) -> Reachability {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => Reachability::Satisfied,
        Ok(Err(e)) => {
            tracing::debug!("Connectivity probe to {} failed: {}", target, e);
            Reachability::Unsatisfied
        }
        Err(_) => {
            tracing::debug!("Connectivity probe to {} timed out", target);
            Reachability::Unsatisfied
        }
    }
}
