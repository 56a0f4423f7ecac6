//! Cooperative cancellation
//!
//! Every leaf execution gets an [`AbortController`]. Controllers are
//! registered per run so a `workflow.cancel` handled by this process can
//! signal the steps it is executing for that run.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Trigger side of an abort signal
#[derive(Clone, Debug)]
pub struct AbortController {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of an abort signal
#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the controller aborts
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            // controller dropped without aborting
            std::future::pending::<()>().await;
        }
    }
}

/// Controllers of in-flight steps, grouped by run id
#[derive(Default)]
pub struct AbortRegistry {
    runs: DashMap<String, Vec<(u64, AbortController)>>,
    next: AtomicU64,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh controller for a run, returning it with its token
    pub fn register(&self, run_id: &str) -> (u64, AbortController) {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        let controller = AbortController::new();
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .push((token, controller.clone()));
        (token, controller)
    }

    pub fn unregister(&self, run_id: &str, token: u64) {
        let empty = match self.runs.get_mut(run_id) {
            Some(mut controllers) => {
                controllers.retain(|(t, _)| *t != token);
                controllers.is_empty()
            }
            None => false,
        };
        if empty {
            self.runs.remove_if(run_id, |_, controllers| controllers.is_empty());
        }
    }

    /// Abort every step of a run executing in this process
    pub fn abort_run(&self, run_id: &str) -> usize {
        match self.runs.get(run_id) {
            Some(controllers) => {
                for (_, controller) in controllers.iter() {
                    controller.abort();
                }
                controllers.len()
            }
            None => 0,
        }
    }

    /// Number of in-flight steps registered for a run
    pub fn in_flight(&self, run_id: &str) -> usize {
        self.runs.get(run_id).map_or(0, |c| c.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_resolves_on_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());

        let waiter = tokio::spawn(async move { signal.aborted().await });
        controller.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(controller.is_aborted());
    }

    #[test]
    fn test_registry_aborts_only_its_run() {
        let registry = AbortRegistry::new();
        let (token, a) = registry.register("run-a");
        let (_, b) = registry.register("run-b");

        assert_eq!(registry.abort_run("run-a"), 1);
        assert!(a.is_aborted());
        assert!(!b.is_aborted());

        registry.unregister("run-a", token);
        assert_eq!(registry.in_flight("run-a"), 0);
        assert_eq!(registry.abort_run("run-a"), 0);
    }
}
