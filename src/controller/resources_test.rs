//! Unit tests for child templates and the structural diff.
//!
//! Run with: `cargo test -p database-operator resources_test`

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use crate::controller::resources::{
        desired_children, endpoint, plan_changes, satisfies, ChildChange,
    };
    use crate::crd::{BackupConfig, Database, DatabaseSpec, Engine, ReclaimPolicy};
    use crate::error::Error;
    use crate::store::{
        ChildHealth, ChildKey, ChildKind, ChildResource, ChildSpec, DesiredChild, EnvSource,
    };

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn create_test_database(engine: &str) -> Database {
        Database {
            metadata: ObjectMeta {
                name: Some("orders".to_string()),
                namespace: Some("shop".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: DatabaseSpec {
                engine: engine.to_string(),
                version: "15.3".to_string(),
                storage_size: "20Gi".to_string(),
                backup: None,
                storage_class_name: None,
                credentials_secret: None,
                reclaim_policy: ReclaimPolicy::Delete,
            },
            status: None,
        }
    }

    fn observed(children: &[DesiredChild]) -> Vec<ChildResource> {
        children
            .iter()
            .map(|child| ChildResource {
                key: child.key.clone(),
                spec: child.spec.clone(),
                health: ChildHealth::Ready,
                ready_replicas: 1,
            })
            .collect()
    }

    fn find(children: &[DesiredChild], kind: ChildKind) -> &ChildSpec {
        &children
            .iter()
            .find(|c| c.key.kind == kind)
            .expect("child kind should be present")
            .spec
    }

    // -----------------------------------------------------------------------
    // desired_children
    // -----------------------------------------------------------------------

    #[test]
    fn test_postgres_children_follow_the_template() {
        let db = create_test_database("postgres");
        let children = desired_children(&db, Engine::Postgres);

        let keys: Vec<_> = children.iter().map(|c| c.key.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "ConfigMap/orders-config",
                "PersistentVolumeClaim/orders-data",
                "StatefulSet/orders",
                "Service/orders",
            ]
        );

        match find(&children, ChildKind::StatefulSet) {
            ChildSpec::StatefulSet {
                image,
                port,
                claim_name,
                config_map,
                ..
            } => {
                assert_eq!(image, "postgres:15.3");
                assert_eq!(*port, 5432);
                assert_eq!(claim_name, "orders-data");
                assert_eq!(config_map, "orders-config");
            }
            other => panic!("unexpected spec {other:?}"),
        }
        assert_eq!(
            endpoint(&db, Engine::Postgres),
            "orders.shop.svc.cluster.local:5432"
        );
    }

    #[test]
    fn test_every_child_is_labelled_as_managed() {
        let db = create_test_database("redis");
        for child in desired_children(&db, Engine::Redis) {
            assert_eq!(
                child.labels.get("app.kubernetes.io/managed-by").map(String::as_str),
                Some("database-operator")
            );
            assert_eq!(
                child.labels.get("app.kubernetes.io/instance").map(String::as_str),
                Some("orders")
            );
        }
    }

    #[test]
    fn test_credentials_secret_feeds_the_password_variable() {
        let mut db = create_test_database("mysql");
        db.spec.credentials_secret = Some("orders-creds".to_string());

        let children = desired_children(&db, Engine::Mysql);
        let ChildSpec::StatefulSet { env, .. } = find(&children, ChildKind::StatefulSet) else {
            panic!("missing statefulset");
        };
        assert_eq!(
            env.get("MYSQL_ROOT_PASSWORD"),
            Some(&EnvSource::Secret {
                name: "orders-creds".to_string(),
                key: "password".to_string(),
            })
        );
        assert!(!env.contains_key("MYSQL_ALLOW_EMPTY_PASSWORD"));
    }

    #[test]
    fn test_backup_settings_are_published_in_the_config_map() {
        let mut db = create_test_database("mongodb");
        db.spec.backup = Some(BackupConfig {
            schedule: "0 2 * * *".to_string(),
            retention_days: 14,
        });

        let children = desired_children(&db, Engine::Mongodb);
        let ChildSpec::ConfigMap { data } = find(&children, ChildKind::ConfigMap) else {
            panic!("missing config map");
        };
        assert_eq!(data.get("backup.schedule").map(String::as_str), Some("0 2 * * *"));
        assert_eq!(data.get("backup.retentionDays").map(String::as_str), Some("14"));
        assert!(data.contains_key("mongod.conf"));
    }

    // -----------------------------------------------------------------------
    // plan_changes
    // -----------------------------------------------------------------------

    #[test]
    fn test_nothing_observed_creates_everything_in_order() {
        let db = create_test_database("postgres");
        let desired = desired_children(&db, Engine::Postgres);

        let plan = plan_changes(&desired, &[]).unwrap();
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|c| matches!(c, ChildChange::Create(_))));
        let kinds: Vec<_> = plan.iter().map(|c| c.key().kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChildKind::ConfigMap,
                ChildKind::PersistentVolumeClaim,
                ChildKind::StatefulSet,
                ChildKind::Service,
            ]
        );
    }

    #[test]
    fn test_converged_children_need_no_changes() {
        let db = create_test_database("postgres");
        let desired = desired_children(&db, Engine::Postgres);

        assert!(plan_changes(&desired, &observed(&desired)).unwrap().is_empty());
    }

    #[test]
    fn test_version_change_updates_only_the_statefulset() {
        let db = create_test_database("postgres");
        let before = desired_children(&db, Engine::Postgres);
        let mut upgraded = db.clone();
        upgraded.spec.version = "16.0".to_string();
        let after = desired_children(&upgraded, Engine::Postgres);

        let plan = plan_changes(&after, &observed(&before)).unwrap();
        let updated: Vec<_> = plan.iter().map(|c| c.key().to_string()).collect();
        assert_eq!(updated, vec!["ConfigMap/orders-config", "StatefulSet/orders"]);
        assert!(plan.iter().all(|c| matches!(c, ChildChange::Update(_))));
    }

    #[test]
    fn test_equivalent_volume_sizes_match() {
        let desired = ChildSpec::PersistentVolumeClaim {
            storage: "1Gi".to_string(),
            storage_class: None,
        };
        let actual = ChildSpec::PersistentVolumeClaim {
            storage: "1024Mi".to_string(),
            storage_class: Some("standard".to_string()),
        };
        assert!(satisfies(&desired, &actual));

        let pinned = ChildSpec::PersistentVolumeClaim {
            storage: "1Gi".to_string(),
            storage_class: Some("fast".to_string()),
        };
        assert!(!satisfies(&pinned, &actual));
    }

    #[test]
    fn test_volume_shrink_is_rejected() {
        let db = create_test_database("postgres");
        let current = observed(&desired_children(&db, Engine::Postgres));
        let mut smaller = db.clone();
        smaller.spec.storage_size = "10Gi".to_string();

        let err = plan_changes(&desired_children(&smaller, Engine::Postgres), &current)
            .unwrap_err();
        match err {
            Error::StorageShrink { current, requested } => {
                assert_eq!(current, "20Gi");
                assert_eq!(requested, "10Gi");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_storage_class_change_is_rejected() {
        let mut db = create_test_database("postgres");
        db.spec.storage_class_name = Some("standard".to_string());
        let current = observed(&desired_children(&db, Engine::Postgres));
        assert!(plan_changes(&desired_children(&db, Engine::Postgres), &current)
            .unwrap()
            .is_empty());

        let mut reclassed = db.clone();
        reclassed.spec.storage_class_name = Some("fast".to_string());
        let err = plan_changes(&desired_children(&reclassed, Engine::Postgres), &current)
            .unwrap_err();
        match err {
            Error::StorageClassChange { current, requested } => {
                assert_eq!(current, "standard");
                assert_eq!(requested, "fast");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_volume_growth_is_an_update() {
        let db = create_test_database("postgres");
        let current = observed(&desired_children(&db, Engine::Postgres));
        let mut bigger = db.clone();
        bigger.spec.storage_size = "40Gi".to_string();

        let plan = plan_changes(&desired_children(&bigger, Engine::Postgres), &current).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].key().kind, ChildKind::PersistentVolumeClaim);
    }

    #[test]
    fn test_orphans_are_deleted_after_applies_but_volumes_are_kept() {
        let db = create_test_database("postgres");
        let desired = desired_children(&db, Engine::Postgres);
        let mut actual = observed(&desired[1..]);
        actual.push(ChildResource {
            key: ChildKey::new(ChildKind::Service, "orders-legacy"),
            spec: ChildSpec::Service {
                port: 5432,
                selector: Default::default(),
            },
            health: ChildHealth::Ready,
            ready_replicas: 0,
        });
        actual.push(ChildResource {
            key: ChildKey::new(ChildKind::PersistentVolumeClaim, "orders-old-data"),
            spec: ChildSpec::PersistentVolumeClaim {
                storage: "5Gi".to_string(),
                storage_class: None,
            },
            health: ChildHealth::Ready,
            ready_replicas: 0,
        });

        let plan = plan_changes(&desired, &actual).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(matches!(&plan[0], ChildChange::Create(c) if c.key.kind == ChildKind::ConfigMap));
        assert_eq!(
            plan[1],
            ChildChange::Delete(ChildKey::new(ChildKind::Service, "orders-legacy"))
        );
    }
}
