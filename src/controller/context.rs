//! Shared state threaded through every reconciliation

use std::sync::Arc;
use std::time::Duration;

use super::finalizers::{CleanupHandler, FinalizerManager};
use super::queue::BackoffPolicy;
use super::status::{EventRecorder, StatusReporter};
use crate::store::ResourceStore;

/// Tunables for the controller, usually filled from the command line
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Only watch this namespace; all namespaces when unset
    pub namespace: Option<String>,
    pub workers: usize,
    /// Deadline for a single reconciliation attempt
    pub reconcile_timeout: Duration,
    /// Requeue interval for converged Databases
    pub resync_interval: Duration,
    /// Requeue interval while children are still rolling out
    pub progress_interval: Duration,
    /// Consecutive apply failures tolerated before the phase becomes Degraded
    pub quick_retries: u32,
    pub backoff: BackoffPolicy,
    /// Backoff for authorization failures
    pub forbidden_backoff: BackoffPolicy,
    /// Pause before restarting a failed watch
    pub watch_restart_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            reconcile_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(300),
            progress_interval: Duration::from_secs(10),
            quick_retries: 3,
            backoff: BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
            forbidden_backoff: BackoffPolicy::new(
                Duration::from_secs(60),
                Duration::from_secs(900),
            ),
            watch_restart_delay: Duration::from_secs(5),
        }
    }
}

/// Everything a reconciliation needs, built once at startup
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub reporter: StatusReporter,
    pub finalizers: FinalizerManager,
    pub cleanup: Arc<dyn CleanupHandler>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        recorder: Arc<dyn EventRecorder>,
        cleanup: Arc<dyn CleanupHandler>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reporter: StatusReporter::new(store.clone(), recorder),
            finalizers: FinalizerManager::new(store.clone()),
            store,
            cleanup,
            config,
        }
    }
}
