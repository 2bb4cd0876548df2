//! Core reconciliation logic for Database resources
//!
//! One pass loads the Database and its children, computes the structural diff
//! against the engine template, applies it and writes the outcome to status.
//! Passes are level-triggered: nothing is carried over between them except
//! what is stored on the cluster, so a hand-edited or deleted child is simply
//! corrected on the next pass.

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::conditions::{
    remove_condition, set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_STATUS_UNKNOWN, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_PROGRESSING,
    CONDITION_TYPE_READY, REASON_APPLY_FAILED, REASON_APPLY_REJECTED, REASON_AVAILABLE,
    REASON_CHILD_FAILED, REASON_CLEANUP_FAILED, REASON_CLEANUP_IN_PROGRESS, REASON_FORBIDDEN,
    REASON_PENDING, REASON_PROVISIONING, REASON_STORAGE_CLASS, REASON_STORAGE_SHRINK,
};
use super::context::Context;
use super::finalizers::{cleanup_blocked, has_finalizer, CleanupOutcome};
use super::resources::{desired_children, endpoint, plan_changes, ChildChange};
use super::status::EventType;
use crate::crd::{Database, DatabasePhase, DatabaseStatus, Engine};
use crate::error::{Error, Result};
use crate::store::{ChildHealth, ChildKind, ChildResource, ObjectKey, StoreError};

/// What the queue should do with the key after a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Everything is in place; check again after the resync interval
    Converged,
    /// Children are still rolling out; check again after the progress interval
    Progressing,
    /// The Database is gone or fully cleaned up
    Forget,
    /// Blocked on something only a spec change or a human can fix
    Stalled,
}

/// The state a pass wants to publish
struct Outcome {
    phase: DatabasePhase,
    reason: String,
    message: String,
    available_replicas: i32,
    endpoint: Option<String>,
}

impl Outcome {
    fn new(phase: DatabasePhase, reason: &str, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.to_string(),
            message: message.into(),
            available_replicas: 0,
            endpoint: None,
        }
    }
}

/// Reconcile one Database
///
/// `attempt` is the number of consecutive failed attempts before this one.
#[instrument(skip(ctx, key), fields(key = %key))]
pub async fn reconcile(ctx: &Context, key: &ObjectKey, attempt: u32) -> Result<ReconcileAction> {
    match reconcile_database(ctx, key, attempt).await {
        Err(Error::Store(StoreError::NotFound(msg))) => {
            debug!("Database {} disappeared mid-flight: {}", key, msg);
            Ok(ReconcileAction::Forget)
        }
        other => other,
    }
}

async fn reconcile_database(
    ctx: &Context,
    key: &ObjectKey,
    attempt: u32,
) -> Result<ReconcileAction> {
    let Some(db) = ctx.store.get(key).await? else {
        debug!("Database {} not found, nothing to do", key);
        #[cfg(feature = "metrics")]
        super::metrics::clear_phase(&key.namespace, &key.name);
        return Ok(ReconcileAction::Forget);
    };

    if db.is_being_deleted() {
        return finalize(ctx, db).await;
    }

    let db = ctx.finalizers.ensure(db).await?;

    if db.is_generation_observed()
        && db.status.as_ref().map(|s| s.phase) == Some(DatabasePhase::Failed)
    {
        debug!("Spec of {} was rejected at this generation, waiting for an edit", key);
        return Ok(ReconcileAction::Stalled);
    }

    let engine = match db.spec.validate() {
        Ok(engine) => engine,
        Err(errors) => {
            let reason = errors
                .first()
                .map(|e| e.reason.clone())
                .unwrap_or_else(|| "InvalidSpec".to_string());
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!("Database {} has an invalid spec: {}", key, message);
            publish(ctx, &db, Outcome::new(DatabasePhase::Failed, &reason, message)).await?;
            return Ok(ReconcileAction::Stalled);
        }
    };

    let db = if db.status.is_none() {
        let pending = Outcome::new(
            DatabasePhase::Pending,
            REASON_PENDING,
            "Waiting for provisioning",
        );
        match publish(ctx, &db, pending).await? {
            Some(updated) => updated,
            None => return Ok(ReconcileAction::Forget),
        }
    } else {
        db
    };

    let desired = desired_children(&db, engine);
    let actual = ctx.store.list_children(&db).await?;

    let changes = match plan_changes(&desired, &actual) {
        Ok(changes) => changes,
        Err(e @ (Error::StorageShrink { .. } | Error::StorageClassChange { .. })) => {
            warn!("Database {}: {}", key, e);
            let reason = match e {
                Error::StorageShrink { .. } => REASON_STORAGE_SHRINK,
                _ => REASON_STORAGE_CLASS,
            };
            let outcome = Outcome::new(DatabasePhase::Degraded, reason, e.to_string());
            publish(ctx, &db, outcome).await?;
            return Ok(ReconcileAction::Stalled);
        }
        Err(e) => return Err(e),
    };

    if !changes.is_empty() {
        info!("Applying {} change(s) to the children of {}", changes.len(), key);
    }
    for change in &changes {
        let result = match change {
            ChildChange::Create(child) | ChildChange::Update(child) => {
                ctx.store.apply_child(&db, child).await
            }
            ChildChange::Delete(child) => ctx.store.delete_child(&db, child).await,
        };
        match result {
            Ok(()) => {}
            Err(StoreError::Invalid(msg)) => {
                warn!("API server rejected {} of {}: {}", change.key(), key, msg);
                let outcome = Outcome::new(
                    DatabasePhase::Degraded,
                    REASON_APPLY_REJECTED,
                    format!("{}: {}", change.key(), msg),
                );
                publish(ctx, &db, outcome).await?;
                return Ok(ReconcileAction::Stalled);
            }
            Err(e) => return Err(apply_failed(ctx, &db, change, e, attempt).await),
        }
    }

    let outcome = observe(&db, engine, &actual, !changes.is_empty());
    let action = match outcome.phase {
        DatabasePhase::Running => ReconcileAction::Converged,
        _ => ReconcileAction::Progressing,
    };
    publish(ctx, &db, outcome).await?;
    Ok(action)
}

/// Derive the phase from the observed children
fn observe(db: &Database, engine: Engine, actual: &[ChildResource], mutated: bool) -> Outcome {
    let available_replicas = actual
        .iter()
        .find(|c| c.key.kind == ChildKind::StatefulSet)
        .map(|c| c.ready_replicas)
        .unwrap_or(0);
    let service_exists = actual.iter().any(|c| c.key.kind == ChildKind::Service);

    let failed = actual.iter().find_map(|c| match &c.health {
        ChildHealth::Failed(msg) => Some(format!("{}: {}", c.key, msg)),
        _ => None,
    });
    let progressing = actual.iter().find_map(|c| match &c.health {
        ChildHealth::Progressing(msg) => Some(format!("{}: {}", c.key, msg)),
        _ => None,
    });

    let mut outcome = match (mutated, failed, progressing) {
        (true, _, _) => Outcome::new(
            DatabasePhase::Provisioning,
            REASON_PROVISIONING,
            "Applying child resources",
        ),
        (false, Some(msg), _) => Outcome::new(DatabasePhase::Degraded, REASON_CHILD_FAILED, msg),
        (false, None, Some(msg)) => {
            Outcome::new(DatabasePhase::Provisioning, REASON_PROVISIONING, msg)
        }
        (false, None, None) => Outcome::new(
            DatabasePhase::Running,
            REASON_AVAILABLE,
            format!("{} {} is available", engine, db.spec.version),
        ),
    };
    outcome.available_replicas = available_replicas;
    if service_exists {
        outcome.endpoint = Some(endpoint(db, engine));
    }
    outcome
}

/// Classify a failed child mutation, surfacing it in status where warranted
async fn apply_failed(
    ctx: &Context,
    db: &Database,
    change: &ChildChange,
    error: StoreError,
    attempt: u32,
) -> Error {
    warn!(
        "Failed to converge {} of {}: {}",
        change.key(),
        db.name_any(),
        error
    );
    let outcome = match &error {
        StoreError::Conflict(_) => None,
        StoreError::Forbidden(msg) => Some(Outcome::new(
            DatabasePhase::Degraded,
            REASON_FORBIDDEN,
            format!("{}: {}", change.key(), msg),
        )),
        _ if attempt + 1 >= ctx.config.quick_retries => Some(Outcome::new(
            DatabasePhase::Degraded,
            REASON_APPLY_FAILED,
            format!("{}: {}", change.key(), error),
        )),
        _ => None,
    };
    if let Some(outcome) = outcome {
        if let Err(e) = publish(ctx, db, outcome).await {
            warn!("Could not record the failure on {}: {}", db.name_any(), e);
        }
    }
    Error::Store(error)
}

/// Run cleanup for a Database whose deletion was requested
async fn finalize(ctx: &Context, db: Database) -> Result<ReconcileAction> {
    if !has_finalizer(&db) {
        debug!("{} is being deleted without our finalizer", db.name_any());
        return Ok(ReconcileAction::Forget);
    }
    if cleanup_blocked(&db) {
        debug!(
            "Cleanup of {} failed earlier, waiting for manual intervention",
            db.name_any()
        );
        return Ok(ReconcileAction::Stalled);
    }

    match ctx.cleanup.cleanup(&db).await {
        CleanupOutcome::Done => {
            ctx.finalizers.remove(&db).await?;
            info!("Cleanup of {} complete", db.name_any());
            #[cfg(feature = "metrics")]
            {
                let key = ObjectKey::from(&db);
                super::metrics::clear_phase(&key.namespace, &key.name);
            }
            Ok(ReconcileAction::Forget)
        }
        CleanupOutcome::Retry(reason) => {
            info!("Cleanup of {} not finished: {}", db.name_any(), reason);
            let outcome = Outcome::new(
                DatabasePhase::Deleting,
                REASON_CLEANUP_IN_PROGRESS,
                reason.clone(),
            );
            publish(ctx, &db, outcome).await?;
            Err(Error::CleanupPending(reason))
        }
        CleanupOutcome::Fatal(reason) => {
            warn!("Cleanup of {} failed: {}", db.name_any(), reason);
            let outcome = Outcome::new(DatabasePhase::Failed, REASON_CLEANUP_FAILED, reason);
            publish(ctx, &db, outcome).await?;
            Ok(ReconcileAction::Stalled)
        }
    }
}

/// Compute the next status from the previous one
fn next_status(db: &Database, outcome: &Outcome) -> DatabaseStatus {
    let generation = db.generation();
    let previous = db.status.clone().unwrap_or_default();
    let mut conditions = previous.conditions;

    let (ready, progressing, degraded) = match outcome.phase {
        DatabasePhase::Pending => (CONDITION_STATUS_UNKNOWN, CONDITION_STATUS_TRUE, false),
        DatabasePhase::Provisioning | DatabasePhase::Deleting => {
            (CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, false)
        }
        DatabasePhase::Running => (CONDITION_STATUS_TRUE, CONDITION_STATUS_FALSE, false),
        DatabasePhase::Degraded | DatabasePhase::Failed => {
            (CONDITION_STATUS_FALSE, CONDITION_STATUS_FALSE, true)
        }
    };
    let reason = outcome.reason.as_str();
    let message = outcome.message.as_str();
    set_condition(&mut conditions, generation, CONDITION_TYPE_READY, ready, reason, message);
    set_condition(
        &mut conditions,
        generation,
        CONDITION_TYPE_PROGRESSING,
        progressing,
        reason,
        message,
    );
    if degraded {
        set_condition(
            &mut conditions,
            generation,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_TRUE,
            reason,
            message,
        );
    } else {
        remove_condition(&mut conditions, CONDITION_TYPE_DEGRADED);
    }

    let observed_generation = match outcome.phase {
        DatabasePhase::Pending => previous.observed_generation,
        _ => Some(generation),
    };

    DatabaseStatus {
        phase: outcome.phase,
        available_replicas: outcome.available_replicas,
        endpoint: outcome.endpoint.clone(),
        conditions,
        observed_generation,
        message: Some(outcome.message.clone()),
    }
}

/// Write the outcome to status and announce phase transitions
async fn publish(ctx: &Context, db: &Database, outcome: Outcome) -> Result<Option<Database>> {
    let previous_phase = db.status.as_ref().map(|s| s.phase);
    let status = next_status(db, &outcome);
    let updated = ctx.reporter.update_status(db, status).await?;

    if updated.is_some() {
        #[cfg(feature = "metrics")]
        {
            let key = ObjectKey::from(db);
            super::metrics::set_phase(&key.namespace, &key.name, outcome.phase);
        }
        if previous_phase != Some(outcome.phase) {
            info!(
                "Database {} is now {}: {}",
                db.name_any(),
                outcome.phase,
                outcome.message
            );
            let event_type = match outcome.phase {
                DatabasePhase::Degraded | DatabasePhase::Failed => EventType::Warning,
                _ => EventType::Normal,
            };
            ctx.reporter
                .record_event(db, event_type, &outcome.reason, &outcome.message);
        }
    }
    Ok(updated)
}
