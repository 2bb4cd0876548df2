//! kube-rs backed [`ResourceStore`]

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{
    status_patch, ChildHealth, ChildKey, ChildKind, ChildResource, ChildSpec, DesiredChild,
    EnvSource, ObjectKey, ResourceStore, StoreError, StoreResult, WatchEvent, WatchEventKind,
};
use crate::crd::{Database, DatabaseStatus};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "database-operator";

/// Label selecting every child the operator manages
const MANAGED_SELECTOR: &str = "app.kubernetes.io/managed-by=database-operator";

const CONTAINER_NAME: &str = "database";
const DATA_VOLUME: &str = "data";
const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT_PATH: &str = "/etc/database";

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Restrict list/watch to one namespace; all namespaces when unset
    namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn in_namespace<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn apply<K>(&self, namespace: &str, name: &str, object: &K) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.in_namespace(namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await?;
        Ok(())
    }

    async fn delete<K>(&self, namespace: &str, key: &ChildKey) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.in_namespace(namespace);
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted {}", key),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!("{} not found, already deleted", key);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn release<K>(&self, namespace: &str, key: &ChildKey) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.in_namespace(namespace);
        let patch = json!({ "metadata": { "ownerReferences": null } });
        match api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Released {} from its owner", key),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!("{} not found, nothing to release", key);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn owned<K>(&self, owner: &Database) -> StoreResult<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let key = ObjectKey::from(owner);
        let api: Api<K> = self.in_namespace(&key.namespace);
        let selector = format!("app.kubernetes.io/instance={},{MANAGED_SELECTOR}", key.name);
        let uid = owner.metadata.uid.clone().unwrap_or_default();
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|child| child.owner_references().iter().any(|r| r.uid == uid))
            .collect())
    }

    /// Events for one child kind, mapped to the owning Database
    fn child_events<K>(&self) -> BoxStream<'static, StoreResult<WatchEvent>>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + 'static,
        K::DynamicType: Default,
    {
        let config = watcher::Config::default().labels(MANAGED_SELECTOR);
        watcher(self.scoped::<K>(), config)
            .default_backoff()
            .flat_map(|event| {
                let events: Vec<StoreResult<WatchEvent>> = match event {
                    Ok(watcher::Event::Apply(child))
                    | Ok(watcher::Event::InitApply(child))
                    | Ok(watcher::Event::Delete(child)) => owner_key(&child)
                        .map(|key| {
                            Ok(WatchEvent {
                                kind: WatchEventKind::Applied,
                                key,
                            })
                        })
                        .into_iter()
                        .collect(),
                    Ok(_) => Vec::new(),
                    Err(e) => vec![Err(StoreError::Transient(e.to_string()))],
                };
                stream::iter(events)
            })
            .boxed()
    }

    fn database_events(&self) -> BoxStream<'static, StoreResult<WatchEvent>> {
        watcher(self.scoped::<Database>(), watcher::Config::default())
            .default_backoff()
            .flat_map(|event| {
                let event = match event {
                    Ok(watcher::Event::Apply(db)) | Ok(watcher::Event::InitApply(db)) => {
                        Some(Ok(WatchEvent {
                            kind: WatchEventKind::Applied,
                            key: ObjectKey::from(&db),
                        }))
                    }
                    Ok(watcher::Event::Delete(db)) => Some(Ok(WatchEvent {
                        kind: WatchEventKind::Deleted,
                        key: ObjectKey::from(&db),
                    })),
                    Ok(_) => None,
                    Err(e) => Some(Err(StoreError::Transient(e.to_string()))),
                };
                stream::iter(event)
            })
            .boxed()
    }
}

fn owner_key<K: Resource>(child: &K) -> Option<ObjectKey> {
    let namespace = child.meta().namespace.clone()?;
    child
        .owner_references()
        .iter()
        .find(|r| r.kind == Database::kind(&()) && r.api_version == Database::api_version(&()))
        .map(|r| ObjectKey::new(namespace, r.name.clone()))
}

/// Create an OwnerReference for garbage collection
fn owner_reference(owner: &Database) -> OwnerReference {
    OwnerReference {
        api_version: Database::api_version(&()).to_string(),
        kind: Database::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn child_meta(owner: &Database, child: &DesiredChild) -> ObjectMeta {
    ObjectMeta {
        name: Some(child.key.name.clone()),
        namespace: owner.namespace(),
        labels: Some(child.labels.clone()),
        owner_references: Some(vec![owner_reference(owner)]),
        ..Default::default()
    }
}

// ============================================================================
// Descriptor -> Kubernetes object
// ============================================================================

fn build_config_map(
    owner: &Database,
    child: &DesiredChild,
    data: &BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: child_meta(owner, child),
        data: Some(data.clone()),
        ..Default::default()
    }
}

fn build_pvc(
    owner: &Database,
    child: &DesiredChild,
    storage: &str,
    storage_class: &Option<String>,
) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(storage.to_string()));

    PersistentVolumeClaim {
        metadata: child_meta(owner, child),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_env(env: &BTreeMap<String, EnvSource>) -> Vec<EnvVar> {
    env.iter()
        .map(|(name, source)| match source {
            EnvSource::Value(value) => EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            },
            EnvSource::Secret { name: secret, key } => EnvVar {
                name: name.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(secret.clone()),
                        key: key.clone(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
            },
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn build_statefulset(
    owner: &Database,
    child: &DesiredChild,
    image: &str,
    replicas: i32,
    port: i32,
    env: &BTreeMap<String, EnvSource>,
    data_dir: &str,
    claim_name: &str,
    config_map: &str,
) -> StatefulSet {
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("db".to_string()),
            container_port: port,
            ..Default::default()
        }]),
        env: Some(build_env(env)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: data_dir.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    StatefulSet {
        metadata: child_meta(owner, child),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(child.labels.clone()),
                ..Default::default()
            },
            service_name: owner.name_any(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(child.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![
                        Volume {
                            name: DATA_VOLUME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: claim_name.to_string(),
                                read_only: Some(false),
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: CONFIG_VOLUME.to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(config_map.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_service(
    owner: &Database,
    child: &DesiredChild,
    port: i32,
    selector: &BTreeMap<String, String>,
) -> Service {
    Service {
        metadata: child_meta(owner, child),
        spec: Some(ServiceSpec {
            selector: Some(selector.clone()),
            ports: Some(vec![ServicePort {
                name: Some("db".to_string()),
                port,
                target_port: Some(IntOrString::String("db".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Kubernetes object -> descriptor
// ============================================================================

fn observe_config_map(cm: ConfigMap) -> ChildResource {
    ChildResource {
        key: ChildKey::new(ChildKind::ConfigMap, cm.name_any()),
        spec: ChildSpec::ConfigMap {
            data: cm.data.unwrap_or_default(),
        },
        health: ChildHealth::Ready,
        ready_replicas: 0,
    }
}

fn observe_pvc(pvc: PersistentVolumeClaim) -> ChildResource {
    let name = pvc.name_any();
    let spec = pvc.spec.unwrap_or_default();
    let storage = spec
        .resources
        .and_then(|r| r.requests)
        .and_then(|mut requests| requests.remove("storage"))
        .map(|q| q.0)
        .unwrap_or_default();
    let health = match pvc.status.and_then(|s| s.phase).as_deref() {
        Some("Bound") => ChildHealth::Ready,
        Some("Lost") => ChildHealth::Failed("volume lost".to_string()),
        Some(phase) => ChildHealth::Progressing(format!("volume is {phase}")),
        None => ChildHealth::Progressing("volume is pending".to_string()),
    };

    ChildResource {
        key: ChildKey::new(ChildKind::PersistentVolumeClaim, name),
        spec: ChildSpec::PersistentVolumeClaim {
            storage,
            storage_class: spec.storage_class_name,
        },
        health,
        ready_replicas: 0,
    }
}

fn observe_env(env: Vec<EnvVar>) -> BTreeMap<String, EnvSource> {
    env.into_iter()
        .filter_map(|var| {
            let source = match (var.value, var.value_from.and_then(|v| v.secret_key_ref)) {
                (_, Some(secret)) => EnvSource::Secret {
                    name: secret.name.unwrap_or_default(),
                    key: secret.key,
                },
                (Some(value), None) => EnvSource::Value(value),
                (None, None) => return None,
            };
            Some((var.name, source))
        })
        .collect()
}

fn observe_statefulset(sts: StatefulSet) -> ChildResource {
    let name = sts.name_any();
    let generation = sts.metadata.generation.unwrap_or(0);
    let spec = sts.spec.unwrap_or_default();
    let replicas = spec.replicas.unwrap_or(1);
    let pod = spec.template.spec.unwrap_or_default();

    let container = pod
        .containers
        .into_iter()
        .find(|c| c.name == CONTAINER_NAME)
        .unwrap_or_default();
    let port = container
        .ports
        .unwrap_or_default()
        .first()
        .map(|p| p.container_port)
        .unwrap_or_default();
    let data_dir = container
        .volume_mounts
        .unwrap_or_default()
        .into_iter()
        .find(|m| m.name == DATA_VOLUME)
        .map(|m| m.mount_path)
        .unwrap_or_default();

    let volumes = pod.volumes.unwrap_or_default();
    let claim_name = volumes
        .iter()
        .find_map(|v| v.persistent_volume_claim.as_ref())
        .map(|c| c.claim_name.clone())
        .unwrap_or_default();
    let config_map = volumes
        .iter()
        .find_map(|v| v.config_map.as_ref())
        .and_then(|c| c.name.clone())
        .unwrap_or_default();

    let status = sts.status.unwrap_or_default();
    let ready = status.ready_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let observed = status.observed_generation.unwrap_or(0) >= generation;
    let health = if observed && ready >= replicas && updated >= replicas {
        ChildHealth::Ready
    } else {
        ChildHealth::Progressing(format!("{ready}/{replicas} replicas ready"))
    };

    ChildResource {
        key: ChildKey::new(ChildKind::StatefulSet, name),
        spec: ChildSpec::StatefulSet {
            image: container.image.unwrap_or_default(),
            replicas,
            port,
            env: observe_env(container.env.unwrap_or_default()),
            data_dir,
            claim_name,
            config_map,
        },
        health,
        ready_replicas: ready,
    }
}

fn observe_service(svc: Service) -> ChildResource {
    let name = svc.name_any();
    let spec = svc.spec.unwrap_or_default();
    let port = spec
        .ports
        .unwrap_or_default()
        .first()
        .map(|p| p.port)
        .unwrap_or_default();

    ChildResource {
        key: ChildKey::new(ChildKind::Service, name),
        spec: ChildSpec::Service {
            port,
            selector: spec.selector.unwrap_or_default(),
        },
        health: ChildHealth::Ready,
        ready_replicas: 0,
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Database>> {
        let api: Api<Database> = self.in_namespace(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(&self) -> StoreResult<Vec<ObjectKey>> {
        let api: Api<Database> = self.scoped();
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(ObjectKey::from).collect())
    }

    #[instrument(
        skip(self, owner),
        fields(name = %owner.name_any(), namespace = owner.namespace())
    )]
    async fn list_children(&self, owner: &Database) -> StoreResult<Vec<ChildResource>> {
        let mut children = Vec::new();
        children.extend(
            self.owned::<ConfigMap>(owner)
                .await?
                .into_iter()
                .map(observe_config_map),
        );
        children.extend(
            self.owned::<PersistentVolumeClaim>(owner)
                .await?
                .into_iter()
                .map(observe_pvc),
        );
        children.extend(
            self.owned::<StatefulSet>(owner)
                .await?
                .into_iter()
                .map(observe_statefulset),
        );
        children.extend(
            self.owned::<Service>(owner)
                .await?
                .into_iter()
                .map(observe_service),
        );
        debug!("Observed {} children", children.len());
        Ok(children)
    }

    #[instrument(skip(self, owner, child), fields(name = %owner.name_any(), child = %child.key))]
    async fn apply_child(&self, owner: &Database, child: &DesiredChild) -> StoreResult<()> {
        let namespace = ObjectKey::from(owner).namespace;
        let name = &child.key.name;
        match &child.spec {
            ChildSpec::ConfigMap { data } => {
                self.apply(&namespace, name, &build_config_map(owner, child, data))
                    .await
            }
            ChildSpec::PersistentVolumeClaim {
                storage,
                storage_class,
            } => {
                self.apply(&namespace, name, &build_pvc(owner, child, storage, storage_class))
                    .await
            }
            ChildSpec::StatefulSet {
                image,
                replicas,
                port,
                env,
                data_dir,
                claim_name,
                config_map,
            } => {
                let sts = build_statefulset(
                    owner, child, image, *replicas, *port, env, data_dir, claim_name, config_map,
                );
                self.apply(&namespace, name, &sts).await
            }
            ChildSpec::Service { port, selector } => {
                self.apply(&namespace, name, &build_service(owner, child, *port, selector))
                    .await
            }
        }
    }

    #[instrument(skip(self, owner), fields(name = %owner.name_any(), child = %key))]
    async fn delete_child(&self, owner: &Database, key: &ChildKey) -> StoreResult<()> {
        let namespace = ObjectKey::from(owner).namespace;
        match key.kind {
            ChildKind::ConfigMap => self.delete::<ConfigMap>(&namespace, key).await,
            ChildKind::PersistentVolumeClaim => {
                self.delete::<PersistentVolumeClaim>(&namespace, key).await
            }
            ChildKind::StatefulSet => self.delete::<StatefulSet>(&namespace, key).await,
            ChildKind::Service => self.delete::<Service>(&namespace, key).await,
        }
    }

    #[instrument(skip(self, owner), fields(name = %owner.name_any(), child = %key))]
    async fn release_child(&self, owner: &Database, key: &ChildKey) -> StoreResult<()> {
        let namespace = ObjectKey::from(owner).namespace;
        match key.kind {
            ChildKind::ConfigMap => self.release::<ConfigMap>(&namespace, key).await,
            ChildKind::PersistentVolumeClaim => {
                self.release::<PersistentVolumeClaim>(&namespace, key).await
            }
            ChildKind::StatefulSet => self.release::<StatefulSet>(&namespace, key).await,
            ChildKind::Service => self.release::<Service>(&namespace, key).await,
        }
    }

    #[instrument(
        skip(self, db, status),
        fields(name = %db.name_any(), namespace = db.namespace(), phase = %status.phase)
    )]
    async fn update_status(&self, db: &Database, status: &DatabaseStatus) -> StoreResult<Database> {
        let key = ObjectKey::from(db);
        let api: Api<Database> = self.in_namespace(&key.namespace);
        // A resourceVersion in the patch body turns it into a conditional write.
        let patch = json!({
            "metadata": { "resourceVersion": db.resource_version() },
            "status": status_patch(status)?,
        });
        Ok(api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    #[instrument(skip(self, db), fields(name = %db.name_any(), namespace = db.namespace()))]
    async fn set_finalizers(
        &self,
        db: &Database,
        finalizers: Vec<String>,
    ) -> StoreResult<Database> {
        let key = ObjectKey::from(db);
        let api: Api<Database> = self.in_namespace(&key.namespace);
        let patch = json!({
            "metadata": {
                "resourceVersion": db.resource_version(),
                "finalizers": finalizers,
            }
        });
        Ok(api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    fn watch(&self) -> BoxStream<'static, StoreResult<WatchEvent>> {
        stream::select_all(vec![
            self.database_events(),
            self.child_events::<ConfigMap>(),
            self.child_events::<PersistentVolumeClaim>(),
            self.child_events::<StatefulSet>(),
            self.child_events::<Service>(),
        ])
        .boxed()
    }
}
