//! Resource store abstraction
//!
//! The reconciler never talks to the API server directly. Everything it reads
//! or writes goes through [`ResourceStore`], which has a kube-rs backed
//! implementation ([`KubeStore`]) and an in-memory one ([`InMemoryStore`]) used
//! by tests and local runs.
//!
//! Owned children are exchanged as descriptors keyed by `(kind, name)` and
//! carrying only the fields the operator manages, so that diffing is
//! structural rather than a byte comparison of full manifests.

mod kubernetes;
mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::ResourceExt;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::crd::{Database, DatabaseStatus};

pub use kubernetes::KubeStore;
pub use memory::{FaultOp, InMemoryStore, StoreCall};

/// Namespace + name identity of a Database
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Database> for ObjectKey {
    fn from(db: &Database) -> Self {
        ObjectKey::new(
            db.namespace().unwrap_or_else(|| "default".to_string()),
            db.name_any(),
        )
    }
}

/// Kinds of child resources owned by a Database, in apply order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChildKind {
    ConfigMap,
    PersistentVolumeClaim,
    StatefulSet,
    Service,
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChildKind::ConfigMap => "ConfigMap",
            ChildKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ChildKind::StatefulSet => "StatefulSet",
            ChildKind::Service => "Service",
        };
        f.write_str(s)
    }
}

/// Identity of a child resource within its owner's namespace
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildKey {
    pub kind: ChildKind,
    pub name: String,
}

impl ChildKey {
    pub fn new(kind: ChildKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Source of a container environment variable
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvSource {
    Value(String),
    Secret { name: String, key: String },
}

/// The fields of a child the operator owns; everything else is left to the platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildSpec {
    ConfigMap {
        data: BTreeMap<String, String>,
    },
    PersistentVolumeClaim {
        storage: String,
        storage_class: Option<String>,
    },
    StatefulSet {
        image: String,
        replicas: i32,
        port: i32,
        env: BTreeMap<String, EnvSource>,
        data_dir: String,
        claim_name: String,
        config_map: String,
    },
    Service {
        port: i32,
        selector: BTreeMap<String, String>,
    },
}

impl ChildSpec {
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildSpec::ConfigMap { .. } => ChildKind::ConfigMap,
            ChildSpec::PersistentVolumeClaim { .. } => ChildKind::PersistentVolumeClaim,
            ChildSpec::StatefulSet { .. } => ChildKind::StatefulSet,
            ChildSpec::Service { .. } => ChildKind::Service,
        }
    }
}

/// A child resource the Database should own
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredChild {
    pub key: ChildKey,
    pub labels: BTreeMap<String, String>,
    pub spec: ChildSpec,
}

/// Observed readiness of a child
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildHealth {
    Ready,
    Progressing(String),
    Failed(String),
}

/// A child resource as observed in the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildResource {
    pub key: ChildKey,
    pub spec: ChildSpec,
    pub health: ChildHealth,
    /// Ready pods for workloads, zero for everything else
    pub ready_replicas: i32,
}

/// What happened to a watched object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Applied,
    Deleted,
}

/// A change notification for a Database, or for one of its children mapped to the owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: ObjectKey,
}

/// Errors returned by the store, classified for retry decisions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure: the object changed since it was read
    #[error("conflict: {0}")]
    Conflict(String),

    /// RBAC denial
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The API server rejected the object
    #[error("invalid: {0}")]
    Invalid(String),

    /// Network failure, timeout or temporary unavailability
    #[error("transient: {0}")]
    Transient(String),
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => match response.code {
                404 => StoreError::NotFound(response.message),
                409 => StoreError::Conflict(response.message),
                401 | 403 => StoreError::Forbidden(response.message),
                400 | 422 => StoreError::Invalid(response.message),
                _ => StoreError::Transient(response.message),
            },
            other => StoreError::Transient(other.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Read/write/watch access to Databases and their children
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a Database; `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Database>>;

    /// Keys of every Database in scope
    async fn list(&self) -> StoreResult<Vec<ObjectKey>>;

    /// Children currently owned by the Database
    async fn list_children(&self, owner: &Database) -> StoreResult<Vec<ChildResource>>;

    /// Create or update a child so that its owned fields match `child`
    async fn apply_child(&self, owner: &Database, child: &DesiredChild) -> StoreResult<()>;

    /// Delete a child; deleting a missing child succeeds
    async fn delete_child(&self, owner: &Database, key: &ChildKey) -> StoreResult<()>;

    /// Drop the owner reference so the child survives the owner's deletion
    async fn release_child(&self, owner: &Database, key: &ChildKey) -> StoreResult<()>;

    /// Replace the status, conditional on the resourceVersion carried by `db`
    async fn update_status(&self, db: &Database, status: &DatabaseStatus) -> StoreResult<Database>;

    /// Replace the finalizer list, conditional on the resourceVersion carried by `db`
    async fn set_finalizers(&self, db: &Database, finalizers: Vec<String>) -> StoreResult<Database>;

    /// Infinite stream of change notifications; callers restart it after an error
    fn watch(&self) -> BoxStream<'static, StoreResult<WatchEvent>>;
}

/// Status fields that serialization omits when unset
const OPTIONAL_STATUS_FIELDS: [&str; 3] = ["endpoint", "observedGeneration", "message"];

/// JSON merge patch body that replaces the whole status
///
/// Unset optional fields are sent as explicit `null` so the patch clears them.
pub fn status_patch(status: &DatabaseStatus) -> StoreResult<Value> {
    let mut value = serde_json::to_value(status).map_err(|e| StoreError::Invalid(e.to_string()))?;
    if let Value::Object(fields) = &mut value {
        for field in OPTIONAL_STATUS_FIELDS {
            fields.entry(field).or_insert(Value::Null);
        }
    }
    Ok(value)
}

/// Apply an RFC 7386 merge patch to `target`
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (name, value) in patch {
            if value.is_null() {
                fields.remove(name);
            } else {
                merge_patch(fields.entry(name.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DatabasePhase;
    use serde_json::json;

    #[test]
    fn test_status_patch_nulls_unset_fields() {
        let status = DatabaseStatus {
            phase: DatabasePhase::Failed,
            message: Some("unsupported engine".to_string()),
            ..Default::default()
        };
        let patch = status_patch(&status).unwrap();
        assert_eq!(patch["endpoint"], Value::Null);
        assert_eq!(patch["observedGeneration"], Value::Null);
        assert_eq!(patch["message"], json!("unsupported engine"));
        assert_eq!(patch["phase"], json!("Failed"));
    }

    #[test]
    fn test_merge_patch_removes_nulls_and_replaces_arrays() {
        let mut target = json!({
            "phase": "Running",
            "endpoint": "orders.default.svc:5432",
            "conditions": [{"type": "Ready"}, {"type": "Progressing"}],
        });
        merge_patch(
            &mut target,
            &json!({"phase": "Failed", "endpoint": null, "conditions": [{"type": "Ready"}]}),
        );
        assert_eq!(
            target,
            json!({"phase": "Failed", "conditions": [{"type": "Ready"}]})
        );
    }
}
