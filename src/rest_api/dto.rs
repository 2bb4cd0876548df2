//! Response bodies for the REST API

use serde::Serialize;

use crate::crd::{Database, DatabasePhase};
use crate::store::ObjectKey;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue_depth: usize,
    pub in_flight: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSummary {
    pub namespace: String,
    pub name: String,
    pub engine: String,
    pub version: String,
    pub phase: DatabasePhase,
    pub endpoint: Option<String>,
    pub available_replicas: i32,
    pub generation: i64,
    pub observed_generation: Option<i64>,
    pub message: Option<String>,
}

impl From<&Database> for DatabaseSummary {
    fn from(db: &Database) -> Self {
        let key = ObjectKey::from(db);
        let status = db.status.clone().unwrap_or_default();
        Self {
            namespace: key.namespace,
            name: key.name,
            engine: db.spec.engine.clone(),
            version: db.spec.version.clone(),
            phase: status.phase,
            endpoint: status.endpoint,
            available_replicas: status.available_replicas,
            generation: db.generation(),
            observed_generation: status.observed_generation,
            message: status.message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DatabaseListResponse {
    pub items: Vec<DatabaseSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
