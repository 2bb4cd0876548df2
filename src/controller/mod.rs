//! Controller module for Database reconciliation
//! This module contains the work queue, the reconciliation logic, status
//! reporting, finalizer handling and the worker pool that ties them together.

pub mod conditions;
mod context;
mod finalizers;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod queue;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod resources;
#[cfg(test)]
mod resources_test;
mod runner;
mod status;

pub use context::{Context, ControllerConfig};
pub use finalizers::{
    cleanup_blocked, has_finalizer, CleanupHandler, CleanupOutcome, FinalizerManager,
    StorageCleanup, DATABASE_FINALIZER,
};
pub use queue::{BackoffPolicy, RetryKind, WorkItem, WorkQueue};
pub use reconciler::{reconcile, ReconcileAction};
pub use runner::Controller;
pub use status::{
    EventRecorder, EventType, KubeEventRecorder, MemoryRecorder, ResourceEvent, StatusReporter,
};
