//! Database Custom Resource Definition
//!
//! A Database describes a single-instance database server (PostgreSQL, MySQL,
//! MongoDB or Redis) that the operator runs as a StatefulSet with a dedicated
//! volume and Service.

use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{parse_quantity, BackupConfig, Condition, DatabasePhase, Engine, ReclaimPolicy};

/// Structured validation error for `DatabaseSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    /// Machine-readable reason surfaced in status conditions
    pub reason: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "databases.example.com",
    version = "v1alpha1",
    kind = "Database",
    namespaced,
    status = "DatabaseStatus",
    shortname = "db",
    printcolumn = r#"{"name":"Engine","type":"string","jsonPath":".spec.engine"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.endpoint"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Database engine: postgres, mysql, mongodb or redis
    #[schemars(with = "Engine")]
    pub engine: String,

    /// Engine version, used as the container image tag
    pub version: String,

    /// Size of the data volume (e.g. "20Gi")
    pub storage_size: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfig>,

    /// StorageClass for the data volume; the cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Secret holding a `password` key for the engine's administrative user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,

    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

/// Observed state of a Database, written only by the operator
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    #[serde(default)]
    pub phase: DatabasePhase,

    #[serde(default)]
    pub available_replicas: i32,

    /// In-cluster address as host:port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DatabaseSpec {
    /// Parse the engine name into the closed [`Engine`] set
    pub fn engine(&self) -> Result<Engine, SpecValidationError> {
        Engine::from_str(&self.engine).map_err(|message| {
            SpecValidationError::new(
                "spec.engine",
                "UnsupportedEngine",
                message,
                "Set spec.engine to one of postgres, mysql, mongodb or redis.",
            )
        })
    }

    /// Requested volume size in bytes
    pub fn storage_bytes(&self) -> Option<u128> {
        parse_quantity(&self.storage_size).filter(|bytes| *bytes > 0)
    }

    /// Validate the spec, returning the parsed engine on success
    ///
    /// All problems are collected so that the status condition can report
    /// them at once; the first error's reason becomes the condition reason.
    pub fn validate(&self) -> Result<Engine, Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        let engine = match self.engine() {
            Ok(engine) => Some(engine),
            Err(e) => {
                errors.push(e);
                None
            }
        };

        if !is_valid_version(&self.version) {
            errors.push(SpecValidationError::new(
                "spec.version",
                "InvalidVersion",
                format!("version {:?} is not a valid image tag", self.version),
                "Use a version such as \"15.3\" or \"8.0-debian\".",
            ));
        }

        if self.storage_bytes().is_none() {
            errors.push(SpecValidationError::new(
                "spec.storageSize",
                "InvalidStorageSize",
                format!("storageSize {:?} is not a positive quantity", self.storage_size),
                "Use a Kubernetes quantity such as \"20Gi\".",
            ));
        }

        if let Some(backup) = &self.backup {
            if let Err(e) = parse_schedule(&backup.schedule) {
                errors.push(SpecValidationError::new(
                    "spec.backup.schedule",
                    "InvalidBackupSchedule",
                    format!("schedule {:?} is invalid: {e}", backup.schedule),
                    "Use a cron expression such as \"0 2 * * *\".",
                ));
            }
            if backup.retention_days == 0 {
                errors.push(SpecValidationError::new(
                    "spec.backup.retentionDays",
                    "InvalidBackupRetention",
                    "retentionDays must be at least 1",
                    "Set spec.backup.retentionDays to 1 or greater.",
                ));
            }
        }

        match engine {
            Some(engine) if errors.is_empty() => Ok(engine),
            _ => Err(errors),
        }
    }

    pub fn should_delete_storage(&self) -> bool {
        self.reclaim_policy == ReclaimPolicy::Delete
    }
}

fn is_valid_version(version: &str) -> bool {
    version.len() <= 128
        && version.starts_with(|c: char| c.is_ascii_digit())
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Parse a five- or six-field cron expression
pub fn parse_schedule(schedule: &str) -> Result<cron::Schedule, cron::error::Error> {
    let expr = if schedule.split_whitespace().count() == 5 {
        format!("0 {schedule}")
    } else {
        schedule.to_string()
    };
    cron::Schedule::from_str(&expr)
}

impl Database {
    /// Whether deletion has been requested and finalizers are pending
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// True when the last status write covered the current spec
    pub fn is_generation_observed(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .is_some_and(|g| g == self.generation())
    }
}
