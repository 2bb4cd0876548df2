//! Finalizer handling for Database cleanup
//!
//! The finalizer keeps a deleted Database around until its external state
//! has been dealt with:
//! 1. `reclaimPolicy: Delete` deletes the data volume
//! 2. `reclaimPolicy: Retain` detaches the data volume so garbage collection skips it
//!
//! Everything else the Database owns is removed by owner-reference garbage
//! collection once the finalizer is gone.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use super::conditions::{has_true_reason, CONDITION_TYPE_DEGRADED, REASON_CLEANUP_FAILED};
use super::resources::data_claim_name;
use crate::crd::Database;
use crate::error::Result;
use crate::store::{ChildKey, ChildKind, ResourceStore, StoreError};

/// Finalizer name used to protect Database resources
pub const DATABASE_FINALIZER: &str = "databases.example.com/finalizer";

/// Result of one cleanup attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// External state is gone; the finalizer may be released
    Done,
    /// Not finished yet, try again after a backoff
    Retry(String),
    /// Cannot finish without human intervention
    Fatal(String),
}

/// Releases external state held by a Database before it is deleted
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    async fn cleanup(&self, db: &Database) -> CleanupOutcome;
}

/// Honours `reclaimPolicy` for the data volume
pub struct StorageCleanup {
    store: Arc<dyn ResourceStore>,
}

impl StorageCleanup {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CleanupHandler for StorageCleanup {
    async fn cleanup(&self, db: &Database) -> CleanupOutcome {
        let claim = ChildKey::new(ChildKind::PersistentVolumeClaim, data_claim_name(db));
        let result = if db.spec.should_delete_storage() {
            self.store.delete_child(db, &claim).await
        } else {
            self.store.release_child(db, &claim).await
        };
        match result {
            Ok(()) => {
                info!(
                    "Data volume of {} handled with reclaim policy {:?}",
                    db.name_any(),
                    db.spec.reclaim_policy
                );
                CleanupOutcome::Done
            }
            Err(StoreError::NotFound(_)) => CleanupOutcome::Done,
            Err(StoreError::Forbidden(msg)) => CleanupOutcome::Fatal(msg),
            Err(e) => CleanupOutcome::Retry(e.to_string()),
        }
    }
}

/// Check if the Database carries our finalizer
pub fn has_finalizer(db: &Database) -> bool {
    db.finalizers().iter().any(|f| f == DATABASE_FINALIZER)
}

/// Whether an earlier cleanup failed permanently
///
/// The Database then stays blocked until someone removes the finalizer by hand.
pub fn cleanup_blocked(db: &Database) -> bool {
    db.status.as_ref().is_some_and(|s| {
        has_true_reason(&s.conditions, CONDITION_TYPE_DEGRADED, REASON_CLEANUP_FAILED)
    })
}

/// Adds and removes the finalizer with conditional writes
#[derive(Clone)]
pub struct FinalizerManager {
    store: Arc<dyn ResourceStore>,
}

impl FinalizerManager {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Add the finalizer if missing; returns the object as stored afterwards
    pub async fn ensure(&self, db: Database) -> Result<Database> {
        if has_finalizer(&db) {
            return Ok(db);
        }
        let mut finalizers = db.finalizers().to_vec();
        finalizers.push(DATABASE_FINALIZER.to_string());
        let updated = self.store.set_finalizers(&db, finalizers).await?;
        info!("Added finalizer to Database: {}", db.name_any());
        Ok(updated)
    }

    /// Remove the finalizer so deletion can complete
    pub async fn remove(&self, db: &Database) -> Result<()> {
        if !has_finalizer(db) {
            return Ok(());
        }
        let finalizers: Vec<String> = db
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != DATABASE_FINALIZER)
            .cloned()
            .collect();
        match self.store.set_finalizers(db, finalizers).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {
                info!("Removed finalizer from Database: {}", db.name_any());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
