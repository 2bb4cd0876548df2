//! In-memory [`ResourceStore`]
//!
//! Behaves like the API server for the parts the operator relies on:
//! resource versions with optimistic concurrency, generation bumps on spec
//! changes only, deletion blocked by finalizers, owner-reference garbage
//! collection and a watch stream. Workloads do not become ready on their own;
//! call [`InMemoryStore::mark_children_ready`] to simulate a finished rollout.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::broadcast;
use tracing::trace;

use super::{
    merge_patch, status_patch, ChildHealth, ChildKey, ChildKind, ChildResource, ChildSpec,
    DesiredChild, ObjectKey, ResourceStore, StoreError, StoreResult, WatchEvent, WatchEventKind,
};
use crate::crd::{Database, DatabasePhase, DatabaseSpec, DatabaseStatus};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// A mutating call observed by the store, recorded for assertions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    ApplyChild(ObjectKey, ChildKey),
    DeleteChild(ObjectKey, ChildKey),
    ReleaseChild(ObjectKey, ChildKey),
    UpdateStatus(ObjectKey),
    SetFinalizers(ObjectKey),
}

/// Operations that can be made to fail with [`InMemoryStore::inject_fault`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    Get,
    ListChildren,
    ApplyChild,
    UpdateStatus,
    SetFinalizers,
}

#[derive(Clone, Debug)]
struct StoredChild {
    labels: BTreeMap<String, String>,
    spec: ChildSpec,
    health: ChildHealth,
    ready_replicas: i32,
}

#[derive(Default)]
struct Inner {
    databases: BTreeMap<ObjectKey, Database>,
    children: BTreeMap<ObjectKey, BTreeMap<ChildKey, StoredChild>>,
    released: Vec<(ObjectKey, ChildKey)>,
    next_version: u64,
    faults: VecDeque<(FaultOp, StoreError)>,
    calls: Vec<StoreCall>,
    phases: BTreeMap<ObjectKey, Vec<DatabasePhase>>,
}

impl Inner {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_fault(&mut self, op: FaultOp) -> StoreResult<()> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(pos) => match self.faults.remove(pos) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn check_version(&self, key: &ObjectKey, db: &Database) -> StoreResult<()> {
        let stored = self
            .databases
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if stored.metadata.resource_version != db.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "{key}: resourceVersion {:?} is stale, current is {:?}",
                db.metadata.resource_version, stored.metadata.resource_version
            )));
        }
        Ok(())
    }

    fn owner_exists(&self, key: &ObjectKey) -> StoreResult<()> {
        if self.databases.contains_key(key) {
            Ok(())
        } else {
            Err(StoreError::NotFound(key.to_string()))
        }
    }
}

/// Deterministic store for tests and local runs
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, kind: WatchEventKind, key: &ObjectKey) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(WatchEvent {
            kind,
            key: key.clone(),
        });
    }

    /// Create a Database the way `kubectl apply` would
    pub fn create(&self, mut db: Database) -> Database {
        let key = ObjectKey::from(&db);
        let mut inner = self.lock();
        let version = inner.bump_version();
        db.metadata.namespace = Some(key.namespace.clone());
        db.metadata.uid = Some(format!("uid-{}-{version}", key.name));
        db.metadata.generation = Some(1);
        db.metadata.resource_version = Some(version);
        db.metadata.creation_timestamp = Some(Time(Utc::now()));
        db.status = None;
        inner.databases.insert(key.clone(), db.clone());
        drop(inner);
        self.notify(WatchEventKind::Applied, &key);
        db
    }

    /// Edit the spec; the generation only moves when the spec actually changes
    pub fn update_spec(
        &self,
        key: &ObjectKey,
        edit: impl FnOnce(&mut DatabaseSpec),
    ) -> Option<Database> {
        let mut inner = self.lock();
        let mut db = inner.databases.get(key)?.clone();
        let before = db.spec.clone();
        edit(&mut db.spec);
        if db.spec == before {
            return Some(db);
        }
        db.metadata.generation = Some(db.generation() + 1);
        db.metadata.resource_version = Some(inner.bump_version());
        inner.databases.insert(key.clone(), db.clone());
        drop(inner);
        self.notify(WatchEventKind::Applied, key);
        Some(db)
    }

    /// Request deletion: blocked by finalizers, immediate otherwise
    pub fn request_delete(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        let Some(mut db) = inner.databases.get(key).cloned() else {
            return;
        };
        if db.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if db.metadata.deletion_timestamp.is_none() {
                db.metadata.deletion_timestamp = Some(Time(Utc::now()));
                db.metadata.generation = Some(db.generation() + 1);
                db.metadata.resource_version = Some(inner.bump_version());
                inner.databases.insert(key.clone(), db);
            }
            drop(inner);
            self.notify(WatchEventKind::Applied, key);
        } else {
            inner.databases.remove(key);
            inner.children.remove(key);
            drop(inner);
            self.notify(WatchEventKind::Deleted, key);
        }
    }

    /// Current copy of a Database
    pub fn database(&self, key: &ObjectKey) -> Option<Database> {
        self.lock().databases.get(key).cloned()
    }

    /// Children owned by the Database
    pub fn children(&self, key: &ObjectKey) -> Vec<ChildResource> {
        let inner = self.lock();
        observed_children(&inner, key)
    }

    /// Children that were released from their owner before it was deleted
    pub fn released_children(&self) -> Vec<(ObjectKey, ChildKey)> {
        self.lock().released.clone()
    }

    /// Simulate finished rollouts for every workload the Database owns
    pub fn mark_children_ready(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        if let Some(children) = inner.children.get_mut(key) {
            for child in children.values_mut() {
                if let ChildSpec::StatefulSet { replicas, .. } = child.spec {
                    child.ready_replicas = replicas;
                }
                child.health = ChildHealth::Ready;
            }
        }
        drop(inner);
        self.notify(WatchEventKind::Applied, key);
    }

    /// Mark a child as failed, e.g. a crash-looping pod
    pub fn fail_child(&self, key: &ObjectKey, child: &ChildKey, message: &str) {
        let mut inner = self.lock();
        if let Some(stored) = inner.children.get_mut(key).and_then(|c| c.get_mut(child)) {
            stored.health = ChildHealth::Failed(message.to_string());
            stored.ready_replicas = 0;
        }
        drop(inner);
        self.notify(WatchEventKind::Applied, key);
    }

    /// Delete a child behind the operator's back
    pub fn remove_child_externally(&self, key: &ObjectKey, child: &ChildKey) {
        let mut inner = self.lock();
        if let Some(children) = inner.children.get_mut(key) {
            children.remove(child);
        }
        drop(inner);
        self.notify(WatchEventKind::Applied, key);
    }

    /// Hand-edit a child's owned fields behind the operator's back
    pub fn edit_child_externally(
        &self,
        key: &ObjectKey,
        child: &ChildKey,
        edit: impl FnOnce(&mut ChildSpec),
    ) {
        let mut inner = self.lock();
        if let Some(stored) = inner.children.get_mut(key).and_then(|c| c.get_mut(child)) {
            edit(&mut stored.spec);
        }
        drop(inner);
        self.notify(WatchEventKind::Applied, key);
    }

    /// Make the next call of `op` fail with `error`
    pub fn inject_fault(&self, op: FaultOp, error: StoreError) {
        self.lock().faults.push_back((op, error));
    }

    /// Mutating calls seen so far
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of child mutations (apply, delete, release) seen so far
    pub fn child_mutations(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    StoreCall::ApplyChild(..)
                        | StoreCall::DeleteChild(..)
                        | StoreCall::ReleaseChild(..)
                )
            })
            .count()
    }

    /// Every phase written to the Database's status, in order, without repeats
    pub fn phase_history(&self, key: &ObjectKey) -> Vec<DatabasePhase> {
        self.lock().phases.get(key).cloned().unwrap_or_default()
    }
}

fn observed_children(inner: &Inner, key: &ObjectKey) -> Vec<ChildResource> {
    inner
        .children
        .get(key)
        .map(|children| {
            children
                .iter()
                .map(|(child_key, stored)| ChildResource {
                    key: child_key.clone(),
                    spec: stored.spec.clone(),
                    health: stored.health.clone(),
                    ready_replicas: stored.ready_replicas,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Database>> {
        let mut inner = self.lock();
        inner.take_fault(FaultOp::Get)?;
        Ok(inner.databases.get(key).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<ObjectKey>> {
        Ok(self.lock().databases.keys().cloned().collect())
    }

    async fn list_children(&self, owner: &Database) -> StoreResult<Vec<ChildResource>> {
        let key = ObjectKey::from(owner);
        let mut inner = self.lock();
        inner.take_fault(FaultOp::ListChildren)?;
        Ok(observed_children(&inner, &key))
    }

    async fn apply_child(&self, owner: &Database, child: &DesiredChild) -> StoreResult<()> {
        let key = ObjectKey::from(owner);
        let mut inner = self.lock();
        inner
            .calls
            .push(StoreCall::ApplyChild(key.clone(), child.key.clone()));
        inner.take_fault(FaultOp::ApplyChild)?;
        inner.owner_exists(&key)?;

        let children = inner.children.entry(key.clone()).or_default();
        match children.get_mut(&child.key) {
            Some(stored) if stored.spec == child.spec && stored.labels == child.labels => {
                trace!("{} on {} unchanged", child.key, key);
                return Ok(());
            }
            Some(stored) => {
                stored.labels = child.labels.clone();
                stored.spec = child.spec.clone();
                if child.key.kind == ChildKind::StatefulSet {
                    stored.health = ChildHealth::Progressing("rolling out".to_string());
                    stored.ready_replicas = 0;
                }
            }
            None => {
                let health = if child.key.kind == ChildKind::StatefulSet {
                    ChildHealth::Progressing("waiting for pods".to_string())
                } else {
                    ChildHealth::Ready
                };
                children.insert(
                    child.key.clone(),
                    StoredChild {
                        labels: child.labels.clone(),
                        spec: child.spec.clone(),
                        health,
                        ready_replicas: 0,
                    },
                );
            }
        }
        drop(inner);
        self.notify(WatchEventKind::Applied, &key);
        Ok(())
    }

    async fn delete_child(&self, owner: &Database, child: &ChildKey) -> StoreResult<()> {
        let key = ObjectKey::from(owner);
        let mut inner = self.lock();
        inner
            .calls
            .push(StoreCall::DeleteChild(key.clone(), child.clone()));
        let removed = inner
            .children
            .get_mut(&key)
            .and_then(|children| children.remove(child))
            .is_some();
        drop(inner);
        if removed {
            self.notify(WatchEventKind::Applied, &key);
        }
        Ok(())
    }

    async fn release_child(&self, owner: &Database, child: &ChildKey) -> StoreResult<()> {
        let key = ObjectKey::from(owner);
        let mut inner = self.lock();
        inner
            .calls
            .push(StoreCall::ReleaseChild(key.clone(), child.clone()));
        let removed = inner
            .children
            .get_mut(&key)
            .and_then(|children| children.remove(child))
            .is_some();
        if removed {
            inner.released.push((key, child.clone()));
        }
        Ok(())
    }

    async fn update_status(&self, db: &Database, status: &DatabaseStatus) -> StoreResult<Database> {
        let key = ObjectKey::from(db);
        let patch = status_patch(status)?;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::UpdateStatus(key.clone()));
        inner.take_fault(FaultOp::UpdateStatus)?;
        inner.check_version(&key, db)?;

        let version = inner.bump_version();
        let updated = match inner.databases.get_mut(&key) {
            Some(stored) => {
                // Same merge semantics as the API server applies to a status patch
                let mut merged = serde_json::to_value(&stored.status)
                    .map_err(|e| StoreError::Invalid(e.to_string()))?;
                merge_patch(&mut merged, &patch);
                let merged: DatabaseStatus = serde_json::from_value(merged)
                    .map_err(|e| StoreError::Invalid(e.to_string()))?;
                stored.status = Some(merged);
                stored.metadata.resource_version = Some(version);
                stored.clone()
            }
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        let phases = inner.phases.entry(key.clone()).or_default();
        if phases.last() != Some(&status.phase) {
            phases.push(status.phase);
        }
        drop(inner);
        self.notify(WatchEventKind::Applied, &key);
        Ok(updated)
    }

    async fn set_finalizers(
        &self,
        db: &Database,
        finalizers: Vec<String>,
    ) -> StoreResult<Database> {
        let key = ObjectKey::from(db);
        let mut inner = self.lock();
        inner.calls.push(StoreCall::SetFinalizers(key.clone()));
        inner.take_fault(FaultOp::SetFinalizers)?;
        inner.check_version(&key, db)?;

        let version = inner.bump_version();
        let Some(stored) = inner.databases.get_mut(&key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        let release = updated.is_being_deleted()
            && updated.metadata.finalizers.as_ref().is_some_and(|f| f.is_empty());
        if release {
            // Last finalizer gone: the deletion completes and owned children are collected.
            inner.databases.remove(&key);
            inner.children.remove(&key);
        }
        drop(inner);
        let kind = if release {
            WatchEventKind::Deleted
        } else {
            WatchEventKind::Applied
        };
        self.notify(kind, &key);
        Ok(updated)
    }

    fn watch(&self) -> BoxStream<'static, StoreResult<WatchEvent>> {
        let receiver = self.events.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(event) => Some((Ok(event), receiver)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(StoreError::Transient(format!("watch lagged by {missed} events"))),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}
