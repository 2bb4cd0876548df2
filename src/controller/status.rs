//! Status and Event reporting
//!
//! Status writes are conditional on the resourceVersion that was read and are
//! skipped when nothing changed. Events are best effort: they are emitted from
//! a spawned task and a failure is only logged.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::crd::{Database, DatabaseStatus};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, ResourceStore, StoreError};

const REPORTING_COMPONENT: &str = "database-operator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// An Event about a Database
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceEvent {
    pub key: ObjectKey,
    pub involved: ObjectReference,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: &ResourceEvent) -> Result<()>;
}

/// Creates `core/v1` Events through the API server
pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, event: &ResourceEvent) -> Result<()> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &event.key.namespace);

        let time = chrono::Utc::now();
        let object = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-event-", event.key.name)),
                ..Default::default()
            },
            type_: Some(event.type_.to_string()),
            reason: Some(event.reason.clone()),
            message: Some(event.message.clone()),
            involved_object: event.involved.clone(),
            source: Some(EventSource {
                component: Some(REPORTING_COMPONENT.to_string()),
                host: None,
            }),
            reporting_component: Some(REPORTING_COMPONENT.to_string()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events
            .create(&PostParams::default(), &object)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

/// Keeps Events in memory
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<ResourceEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResourceEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Reasons recorded for one Database, in order
    pub fn reasons(&self, key: &ObjectKey) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| &e.key == key)
            .map(|e| e.reason)
            .collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, event: &ResourceEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// Persists reconciliation outcomes on the Database
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn ResourceStore>,
    recorder: Arc<dyn EventRecorder>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn ResourceStore>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { store, recorder }
    }

    /// Write `status` unless it equals the stored one
    ///
    /// Returns the updated object, or `None` when nothing was written because
    /// the status was unchanged or the Database is gone.
    pub async fn update_status(
        &self,
        db: &Database,
        status: DatabaseStatus,
    ) -> Result<Option<Database>> {
        if db.status.as_ref() == Some(&status) {
            debug!("Status of {} unchanged, skipping write", db.name_any());
            return Ok(None);
        }

        match self.store.update_status(db, &status).await {
            Ok(updated) => Ok(Some(updated)),
            Err(StoreError::Conflict(_)) => {
                Err(Error::StatusConflict(ObjectKey::from(db).to_string()))
            }
            Err(StoreError::NotFound(_)) => {
                debug!("{} disappeared before its status was written", db.name_any());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Emit an Event without waiting for it
    pub fn record_event(&self, db: &Database, type_: EventType, reason: &str, message: &str) {
        let event = ResourceEvent {
            key: ObjectKey::from(db),
            involved: db.object_ref(&()),
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            if let Err(e) = recorder.record(&event).await {
                warn!(key = %event.key, reason = %event.reason, "Failed to emit event: {}", e);
            }
        });
    }
}
