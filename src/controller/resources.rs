//! Desired child resources for a Database and the diff against observed state
//!
//! Everything here is pure: the desired set is a function of the spec and the
//! engine template, and [`plan_changes`] compares descriptors structurally.

use std::collections::{BTreeMap, HashSet};

use kube::ResourceExt;

use crate::crd::{parse_quantity, Database, Engine};
use crate::error::{Error, Result};
use crate::store::{ChildKey, ChildKind, ChildResource, ChildSpec, DesiredChild, EnvSource};

/// Key in the credentials Secret holding the administrative password
pub const PASSWORD_KEY: &str = "password";

/// Get the standard labels for a Database's resources
pub fn standard_labels(db: &Database) -> BTreeMap<String, String> {
    let mut labels = selector_labels(db);
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "database-server".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "database-operator".to_string(),
    );
    labels
}

/// Labels that select the Database's pods
pub fn selector_labels(db: &Database) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "database".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), db.name_any());
    labels
}

fn resource_name(db: &Database, suffix: &str) -> String {
    format!("{}-{}", db.name_any(), suffix)
}

pub fn config_map_name(db: &Database) -> String {
    resource_name(db, "config")
}

pub fn data_claim_name(db: &Database) -> String {
    resource_name(db, "data")
}

/// In-cluster address of the Database's Service
pub fn endpoint(db: &Database, engine: Engine) -> String {
    let namespace = db.namespace().unwrap_or_else(|| "default".to_string());
    format!(
        "{}.{}.svc.cluster.local:{}",
        db.name_any(),
        namespace,
        engine.port()
    )
}

/// The complete set of children the Database should own, in apply order
pub fn desired_children(db: &Database, engine: Engine) -> Vec<DesiredChild> {
    let labels = standard_labels(db);
    let child = |kind: ChildKind, name: String, spec: ChildSpec| DesiredChild {
        key: ChildKey::new(kind, name),
        labels: labels.clone(),
        spec,
    };

    vec![
        child(ChildKind::ConfigMap, config_map_name(db), build_config_map(db, engine)),
        child(
            ChildKind::PersistentVolumeClaim,
            data_claim_name(db),
            build_pvc(db),
        ),
        child(ChildKind::StatefulSet, db.name_any(), build_statefulset(db, engine)),
        child(ChildKind::Service, db.name_any(), build_service(db, engine)),
    ]
}

fn build_config_map(db: &Database, engine: Engine) -> ChildSpec {
    let (file, contents) = engine.config_file();
    let mut data = BTreeMap::new();
    data.insert(file.to_string(), contents);
    data.insert("engine".to_string(), engine.to_string());
    data.insert("version".to_string(), db.spec.version.clone());
    if let Some(backup) = &db.spec.backup {
        data.insert("backup.schedule".to_string(), backup.schedule.clone());
        data.insert(
            "backup.retentionDays".to_string(),
            backup.retention_days.to_string(),
        );
    }
    ChildSpec::ConfigMap { data }
}

fn build_pvc(db: &Database) -> ChildSpec {
    ChildSpec::PersistentVolumeClaim {
        storage: db.spec.storage_size.clone(),
        storage_class: db.spec.storage_class_name.clone(),
    }
}

fn build_env(db: &Database, engine: Engine) -> BTreeMap<String, EnvSource> {
    let mut env = BTreeMap::new();
    match (&db.spec.credentials_secret, engine.password_env()) {
        (Some(secret), Some(var)) => {
            env.insert(
                var.to_string(),
                EnvSource::Secret {
                    name: secret.clone(),
                    key: PASSWORD_KEY.to_string(),
                },
            );
        }
        (None, Some(_)) => {
            // Without credentials the images refuse to start unless told otherwise.
            match engine {
                Engine::Postgres => {
                    env.insert(
                        "POSTGRES_HOST_AUTH_METHOD".to_string(),
                        EnvSource::Value("trust".to_string()),
                    );
                }
                Engine::Mysql => {
                    env.insert(
                        "MYSQL_ALLOW_EMPTY_PASSWORD".to_string(),
                        EnvSource::Value("yes".to_string()),
                    );
                }
                Engine::Mongodb | Engine::Redis => {}
            }
        }
        (_, None) => {}
    }
    if engine == Engine::Postgres {
        // initdb refuses a mount point that contains lost+found
        env.insert(
            "PGDATA".to_string(),
            EnvSource::Value(format!("{}/pgdata", engine.data_dir())),
        );
    }
    env
}

fn build_statefulset(db: &Database, engine: Engine) -> ChildSpec {
    ChildSpec::StatefulSet {
        image: format!("{}:{}", engine.image_repository(), db.spec.version),
        replicas: 1,
        port: engine.port(),
        env: build_env(db, engine),
        data_dir: engine.data_dir().to_string(),
        claim_name: data_claim_name(db),
        config_map: config_map_name(db),
    }
}

fn build_service(db: &Database, engine: Engine) -> ChildSpec {
    ChildSpec::Service {
        port: engine.port(),
        selector: selector_labels(db),
    }
}

/// A mutation needed to converge one child
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildChange {
    Create(DesiredChild),
    Update(DesiredChild),
    Delete(ChildKey),
}

impl ChildChange {
    pub fn key(&self) -> &ChildKey {
        match self {
            ChildChange::Create(child) | ChildChange::Update(child) => &child.key,
            ChildChange::Delete(key) => key,
        }
    }
}

/// Whether the observed child already carries every field the operator owns
///
/// Volume sizes compare by value so that `1024Mi` matches `1Gi`, and an unset
/// storage class accepts whatever default the cluster filled in.
pub fn satisfies(desired: &ChildSpec, actual: &ChildSpec) -> bool {
    match (desired, actual) {
        (
            ChildSpec::PersistentVolumeClaim {
                storage,
                storage_class,
            },
            ChildSpec::PersistentVolumeClaim {
                storage: actual_storage,
                storage_class: actual_class,
            },
        ) => {
            let same_size = match (parse_quantity(storage), parse_quantity(actual_storage)) {
                (Some(a), Some(b)) => a == b,
                _ => storage == actual_storage,
            };
            same_size && (storage_class.is_none() || storage_class == actual_class)
        }
        _ => desired == actual,
    }
}

/// Reject volume edits the API server would refuse: shrinking and reclassing
fn check_volume_change(desired: &ChildSpec, actual: &ChildSpec) -> Result<()> {
    let (
        ChildSpec::PersistentVolumeClaim {
            storage,
            storage_class,
        },
        ChildSpec::PersistentVolumeClaim {
            storage: current,
            storage_class: current_class,
        },
    ) = (desired, actual)
    else {
        return Ok(());
    };

    if let (Some(requested), Some(bound)) = (parse_quantity(storage), parse_quantity(current)) {
        if requested < bound {
            return Err(Error::StorageShrink {
                current: current.clone(),
                requested: storage.clone(),
            });
        }
    }
    if let Some(requested) = storage_class {
        if current_class.as_ref() != Some(requested) {
            return Err(Error::StorageClassChange {
                current: current_class
                    .clone()
                    .unwrap_or_else(|| "the cluster default".to_string()),
                requested: requested.clone(),
            });
        }
    }
    Ok(())
}

/// Structural diff of desired against observed children
///
/// Creates and updates come first in dependency order, then deletes of
/// children the Database no longer wants. Orphaned volumes are never deleted
/// here; they go through the cleanup handler on Database deletion. A request
/// to shrink a volume or change its storage class rejects the whole plan.
pub fn plan_changes(
    desired: &[DesiredChild],
    actual: &[ChildResource],
) -> Result<Vec<ChildChange>> {
    let observed: BTreeMap<&ChildKey, &ChildResource> =
        actual.iter().map(|child| (&child.key, child)).collect();

    let mut applies = Vec::new();
    for child in desired {
        match observed.get(&child.key) {
            None => applies.push(ChildChange::Create(child.clone())),
            Some(current) => {
                check_volume_change(&child.spec, &current.spec)?;
                if !satisfies(&child.spec, &current.spec) {
                    applies.push(ChildChange::Update(child.clone()));
                }
            }
        }
    }
    applies.sort_by_key(|change| change.key().kind);

    let wanted: HashSet<&ChildKey> = desired.iter().map(|child| &child.key).collect();
    let mut deletes: Vec<ChildChange> = actual
        .iter()
        .filter(|child| !wanted.contains(&child.key))
        .filter(|child| child.key.kind != ChildKind::PersistentVolumeClaim)
        .map(|child| ChildChange::Delete(child.key.clone()))
        .collect();
    // Consumers go before what they consume.
    deletes.sort_by(|a, b| b.key().kind.cmp(&a.key().kind));

    applies.extend(deletes);
    Ok(applies)
}
