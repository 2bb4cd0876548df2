//! Shared types for the Database Custom Resource
//!
//! - [`Engine`] - the closed set of supported database engines and their templates
//! - [`BackupConfig`] - descriptive backup settings rendered into the engine ConfigMap
//! - [`ReclaimPolicy`] - what happens to the data volume when a Database is deleted
//! - [`DatabasePhase`] / [`Condition`] - status vocabulary

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Supported database engines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    Mysql,
    Mongodb,
    Redis,
}

impl Engine {
    pub const ALL: [Engine; 4] = [
        Engine::Postgres,
        Engine::Mysql,
        Engine::Mongodb,
        Engine::Redis,
    ];

    /// Container image repository for the engine
    pub fn image_repository(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
            Engine::Mongodb => "mongo",
            Engine::Redis => "redis",
        }
    }

    /// Port the engine listens on
    pub fn port(&self) -> i32 {
        match self {
            Engine::Postgres => 5432,
            Engine::Mysql => 3306,
            Engine::Mongodb => 27017,
            Engine::Redis => 6379,
        }
    }

    /// Mount path of the data volume inside the container
    pub fn data_dir(&self) -> &'static str {
        match self {
            Engine::Postgres => "/var/lib/postgresql/data",
            Engine::Mysql => "/var/lib/mysql",
            Engine::Mongodb => "/data/db",
            Engine::Redis => "/data",
        }
    }

    /// Environment variable that receives the credentials secret, if the image reads one
    pub fn password_env(&self) -> Option<&'static str> {
        match self {
            Engine::Postgres => Some("POSTGRES_PASSWORD"),
            Engine::Mysql => Some("MYSQL_ROOT_PASSWORD"),
            Engine::Mongodb => Some("MONGO_INITDB_ROOT_PASSWORD"),
            Engine::Redis => None,
        }
    }

    /// Name and contents of the engine configuration file
    pub fn config_file(&self) -> (&'static str, String) {
        let port = self.port();
        match self {
            Engine::Postgres => (
                "postgresql.conf",
                format!("listen_addresses = '*'\nport = {port}\n"),
            ),
            Engine::Mysql => (
                "my.cnf",
                format!("[mysqld]\nbind-address = 0.0.0.0\nport = {port}\n"),
            ),
            Engine::Mongodb => (
                "mongod.conf",
                format!(
                    "net:\n  bindIp: 0.0.0.0\n  port: {port}\nstorage:\n  dbPath: {}\n",
                    self.data_dir()
                ),
            ),
            Engine::Redis => (
                "redis.conf",
                format!(
                    "bind 0.0.0.0\nport {port}\nappendonly yes\ndir {}\n",
                    self.data_dir()
                ),
            ),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Postgres => write!(f, "postgres"),
            Engine::Mysql => write!(f, "mysql"),
            Engine::Mongodb => write!(f, "mongodb"),
            Engine::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Engine::ALL
            .into_iter()
            .find(|engine| engine.to_string() == s)
            .ok_or_else(|| format!("unsupported engine {s:?}"))
    }
}

/// Backup settings
///
/// Purely descriptive: the operator validates them and publishes them in the
/// engine ConfigMap for external backup tooling, it never runs backups itself.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Cron schedule, five fields (`0 2 * * *`) or six with seconds
    pub schedule: String,
    /// Days to keep each backup
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    7
}

/// What happens to the data volume when the Database is deleted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReclaimPolicy {
    /// Delete the PersistentVolumeClaim together with the Database
    #[default]
    Delete,
    /// Keep the PersistentVolumeClaim; it is detached from the Database first
    Retain,
}

/// Lifecycle phase reported in `status.phase`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DatabasePhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Degraded,
    Deleting,
    Failed,
}

impl fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatabasePhase::Pending => "Pending",
            DatabasePhase::Provisioning => "Provisioning",
            DatabasePhase::Running => "Running",
            DatabasePhase::Degraded => "Degraded",
            DatabasePhase::Deleting => "Deleting",
            DatabasePhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Kubernetes-style status condition
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Parse a Kubernetes quantity (`20Gi`, `500M`, `1.5Ti`, `1e9`, `1073741824`) into bytes
pub fn parse_quantity(quantity: &str) -> Option<u128> {
    const SUFFIXES: [(&str, f64); 12] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let quantity = quantity.trim();
    let (number, multiplier) = match decimal_exponent(quantity) {
        Some((mantissa, exponent)) => (mantissa, 10f64.powi(exponent)),
        None => SUFFIXES
            .iter()
            .find_map(|(suffix, mult)| quantity.strip_suffix(suffix).map(|n| (n, *mult)))
            .unwrap_or((quantity, 1.0)),
    };

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    let bytes = (value * multiplier).round();
    if !bytes.is_finite() || bytes < 0.0 {
        return None;
    }
    Some(bytes as u128)
}

/// Split `1e9` or `2.5E-3` into mantissa and exponent; a bare `E` is the exa suffix
fn decimal_exponent(quantity: &str) -> Option<(&str, i32)> {
    let at = quantity.rfind(['e', 'E'])?;
    let exponent = &quantity[at + 1..];
    let digits = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((&quantity[..at], exponent.parse().ok()?))
}
