//! Tests for the reconciler module
//!
//! These drive single passes against the in-memory store:
//! - First provisioning and convergence
//! - Idempotence of converged passes
//! - Spec validation and volume change rejection
//! - Apply failures and their status reporting
//! - Drift correction
//! - Finalizer cleanup

#[cfg(test)]
mod tests {
    use super::super::conditions::{
        find_condition, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_READY, REASON_APPLY_FAILED,
        REASON_APPLY_REJECTED, REASON_CLEANUP_FAILED, REASON_FORBIDDEN, REASON_STORAGE_CLASS,
        REASON_STORAGE_SHRINK,
    };
    use super::super::context::{Context, ControllerConfig};
    use super::super::finalizers::{
        has_finalizer, CleanupHandler, CleanupOutcome, StorageCleanup,
    };
    use super::super::queue::RetryKind;
    use super::super::reconciler::*;
    use super::super::status::MemoryRecorder;
    use crate::crd::{Database, DatabasePhase, DatabaseSpec, ReclaimPolicy};
    use crate::error::Error;
    use crate::store::{
        ChildKey, ChildKind, ChildSpec, FaultOp, InMemoryStore, ObjectKey, StoreCall, StoreError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Helper to create a minimal test Database
    fn create_test_database(name: &str) -> Database {
        Database::new(
            name,
            DatabaseSpec {
                engine: "postgres".to_string(),
                version: "15.3".to_string(),
                storage_size: "20Gi".to_string(),
                backup: None,
                storage_class_name: None,
                credentials_secret: None,
                reclaim_policy: ReclaimPolicy::Delete,
            },
        )
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        recorder: Arc<MemoryRecorder>,
        ctx: Context,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let cleanup = Arc::new(StorageCleanup::new(store.clone()));
        harness_with(store, cleanup)
    }

    fn harness_with(store: Arc<InMemoryStore>, cleanup: Arc<dyn CleanupHandler>) -> Harness {
        let recorder = Arc::new(MemoryRecorder::new());
        let ctx = Context::new(
            store.clone(),
            recorder.clone(),
            cleanup,
            ControllerConfig::default(),
        );
        Harness {
            store,
            recorder,
            ctx,
        }
    }

    fn phase(store: &InMemoryStore, key: &ObjectKey) -> Option<DatabasePhase> {
        store
            .database(key)
            .and_then(|db| db.status)
            .map(|status| status.phase)
    }

    /// Run passes until the Database is Running
    async fn converge(h: &Harness, key: &ObjectKey) {
        reconcile(&h.ctx, key, 0).await.unwrap();
        h.store.mark_children_ready(key);
        let action = reconcile(&h.ctx, key, 0).await.unwrap();
        assert_eq!(action, ReconcileAction::Converged);
    }

    #[tokio::test]
    async fn test_first_pass_provisions_children_in_order() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));

        let action = reconcile(&h.ctx, &key, 0).await.unwrap();
        assert_eq!(action, ReconcileAction::Progressing);

        let applied: Vec<ChildKind> = h
            .store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::ApplyChild(_, child) => Some(child.kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            applied,
            vec![
                ChildKind::ConfigMap,
                ChildKind::PersistentVolumeClaim,
                ChildKind::StatefulSet,
                ChildKind::Service,
            ]
        );

        let db = h.store.database(&key).unwrap();
        assert!(has_finalizer(&db));
        assert_eq!(
            h.store.phase_history(&key),
            vec![DatabasePhase::Pending, DatabasePhase::Provisioning]
        );
        assert_eq!(db.status.unwrap().observed_generation, Some(1));
    }

    #[tokio::test]
    async fn test_ready_children_reach_running() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));

        converge(&h, &key).await;

        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Running);
        assert_eq!(status.available_replicas, 1);
        assert_eq!(
            status.endpoint.as_deref(),
            Some("orders.default.svc.cluster.local:5432")
        );
        let ready = find_condition(&status.conditions, CONDITION_TYPE_READY).unwrap();
        assert_eq!(ready.status, "True");
        assert!(find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).is_none());
    }

    #[tokio::test]
    async fn test_converged_pass_writes_nothing() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        h.store.clear_calls();
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Converged);
        assert!(h.store.calls().is_empty(), "calls: {:?}", h.store.calls());
    }

    #[tokio::test]
    async fn test_unsupported_engine_fails_without_children() {
        let h = harness();
        let mut db = create_test_database("legacy");
        db.spec.engine = "oracle".to_string();
        let key = ObjectKey::from(&h.store.create(db));

        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Stalled);
        assert!(h.store.children(&key).is_empty());
        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Failed);
        let ready = find_condition(&status.conditions, CONDITION_TYPE_READY).unwrap();
        assert_eq!(ready.reason, "UnsupportedEngine");
        assert!(ready.message.contains("oracle"));
    }

    #[tokio::test]
    async fn test_rejected_spec_is_not_revalidated() {
        let h = harness();
        let mut db = create_test_database("legacy");
        db.spec.engine = "oracle".to_string();
        let key = ObjectKey::from(&h.store.create(db));
        reconcile(&h.ctx, &key, 0).await.unwrap();

        h.store.clear_calls();
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Stalled);
        assert!(h.store.calls().is_empty(), "calls: {:?}", h.store.calls());

        // An edit moves the generation and the spec is checked again.
        h.store
            .update_spec(&key, |spec| spec.engine = "postgres".to_string());
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();
        assert_eq!(action, ReconcileAction::Progressing);
    }

    #[tokio::test]
    async fn test_failed_spec_clears_endpoint() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        h.store
            .update_spec(&key, |spec| spec.engine = "oracle".to_string());
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Stalled);
        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Failed);
        assert_eq!(status.available_replicas, 0);
        assert_eq!(status.endpoint, None);
        assert_eq!(status.observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_storage_shrink_is_rejected() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        h.store
            .update_spec(&key, |spec| spec.storage_size = "10Gi".to_string());
        h.store.clear_calls();
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Stalled);
        assert_eq!(h.store.child_mutations(), 0);
        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Degraded);
        let degraded = find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.reason, REASON_STORAGE_SHRINK);

        let pvc = h
            .store
            .children(&key)
            .into_iter()
            .find(|c| c.key.kind == ChildKind::PersistentVolumeClaim)
            .unwrap();
        assert!(matches!(
            pvc.spec,
            ChildSpec::PersistentVolumeClaim { ref storage, .. } if storage == "20Gi"
        ));
    }

    #[tokio::test]
    async fn test_storage_class_change_is_rejected() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        h.store.update_spec(&key, |spec| {
            spec.storage_class_name = Some("fast".to_string())
        });
        h.store.clear_calls();
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Stalled);
        assert_eq!(h.store.child_mutations(), 0);
        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Degraded);
        let degraded = find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.reason, REASON_STORAGE_CLASS);
        assert!(degraded.message.contains("fast"));
    }

    #[tokio::test]
    async fn test_rejected_apply_stalls_without_retry() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        h.store.inject_fault(
            FaultOp::ApplyChild,
            StoreError::Invalid("spec.data: Invalid value".to_string()),
        );

        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Stalled);
        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Degraded);
        let degraded = find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.reason, REASON_APPLY_REJECTED);
        assert!(degraded.message.contains("Invalid value"));
    }

    #[tokio::test]
    async fn test_forbidden_apply_degrades_immediately() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        h.store.inject_fault(
            FaultOp::ApplyChild,
            StoreError::Forbidden("configmaps is forbidden".to_string()),
        );

        let err = reconcile(&h.ctx, &key, 0).await.unwrap_err();

        assert_eq!(err.retry_kind(), RetryKind::Slow);
        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Degraded);
        let degraded = find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.reason, REASON_FORBIDDEN);
    }

    #[tokio::test]
    async fn test_transient_failures_degrade_after_quick_retries() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));

        h.store.inject_fault(
            FaultOp::ApplyChild,
            StoreError::Transient("connection reset".to_string()),
        );
        let err = reconcile(&h.ctx, &key, 0).await.unwrap_err();
        assert_eq!(err.retry_kind(), RetryKind::Normal);
        assert_eq!(phase(&h.store, &key), Some(DatabasePhase::Pending));

        let quick_retries = h.ctx.config.quick_retries;
        h.store.inject_fault(
            FaultOp::ApplyChild,
            StoreError::Transient("connection reset".to_string()),
        );
        reconcile(&h.ctx, &key, quick_retries - 1).await.unwrap_err();

        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Degraded);
        let degraded = find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.reason, REASON_APPLY_FAILED);

        // The next clean pass clears the degradation.
        reconcile(&h.ctx, &key, 0).await.unwrap();
        h.store.mark_children_ready(&key);
        reconcile(&h.ctx, &key, 0).await.unwrap();
        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Running);
        assert!(find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).is_none());
    }

    #[tokio::test]
    async fn test_status_conflict_retries_immediately() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        h.store.inject_fault(
            FaultOp::UpdateStatus,
            StoreError::Conflict("object has been modified".to_string()),
        );

        let err = reconcile(&h.ctx, &key, 0).await.unwrap_err();
        assert!(matches!(err, Error::StatusConflict(_)));
        assert_eq!(err.retry_kind(), RetryKind::Immediate);
    }

    #[tokio::test]
    async fn test_drift_is_corrected() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        let service = ChildKey::new(ChildKind::Service, "orders");
        let statefulset = ChildKey::new(ChildKind::StatefulSet, "orders");
        h.store.remove_child_externally(&key, &service);
        h.store.edit_child_externally(&key, &statefulset, |spec| {
            if let ChildSpec::StatefulSet { image, .. } = spec {
                *image = "postgres:9.6".to_string();
            }
        });

        reconcile(&h.ctx, &key, 0).await.unwrap();

        let children = h.store.children(&key);
        assert!(children.iter().any(|c| c.key == service));
        let restored = children.iter().find(|c| c.key == statefulset).unwrap();
        assert!(matches!(
            restored.spec,
            ChildSpec::StatefulSet { ref image, .. } if image == "postgres:15.3"
        ));
    }

    #[tokio::test]
    async fn test_missing_database_is_forgotten() {
        let h = harness();
        let key = ObjectKey::new("default", "ghost");

        let action = reconcile(&h.ctx, &key, 0).await.unwrap();
        assert_eq!(action, ReconcileAction::Forget);
        assert!(h.store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_policy_removes_volume_and_finalizer() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        h.store.request_delete(&key);
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();

        assert_eq!(action, ReconcileAction::Forget);
        assert!(h.store.database(&key).is_none());
        assert!(h.store.calls().contains(&StoreCall::DeleteChild(
            key.clone(),
            ChildKey::new(ChildKind::PersistentVolumeClaim, "orders-data"),
        )));
    }

    #[tokio::test]
    async fn test_retain_policy_releases_volume() {
        let h = harness();
        let mut db = create_test_database("orders");
        db.spec.reclaim_policy = ReclaimPolicy::Retain;
        let key = ObjectKey::from(&h.store.create(db));
        converge(&h, &key).await;

        h.store.request_delete(&key);
        reconcile(&h.ctx, &key, 0).await.unwrap();

        assert!(h.store.database(&key).is_none());
        assert_eq!(
            h.store.released_children(),
            vec![(
                key.clone(),
                ChildKey::new(ChildKind::PersistentVolumeClaim, "orders-data")
            )]
        );
    }

    struct CountingCleanup {
        outcome: CleanupOutcome,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CleanupHandler for CountingCleanup {
        async fn cleanup(&self, _db: &Database) -> CleanupOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[tokio::test]
    async fn test_pending_cleanup_keeps_the_finalizer() {
        let store = Arc::new(InMemoryStore::new());
        let cleanup = Arc::new(CountingCleanup {
            outcome: CleanupOutcome::Retry("snapshot in progress".to_string()),
            calls: AtomicU32::new(0),
        });
        let h = harness_with(store, cleanup.clone());
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        h.store.request_delete(&key);
        let err = reconcile(&h.ctx, &key, 0).await.unwrap_err();

        assert!(matches!(err, Error::CleanupPending(_)));
        assert!(err.is_retriable());
        let db = h.store.database(&key).expect("finalizer keeps the object");
        assert!(has_finalizer(&db));
        assert_eq!(db.status.unwrap().phase, DatabasePhase::Deleting);
    }

    #[tokio::test]
    async fn test_fatal_cleanup_blocks_until_intervention() {
        let store = Arc::new(InMemoryStore::new());
        let cleanup = Arc::new(CountingCleanup {
            outcome: CleanupOutcome::Fatal("volume is locked".to_string()),
            calls: AtomicU32::new(0),
        });
        let h = harness_with(store, cleanup.clone());
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        h.store.request_delete(&key);
        let action = reconcile(&h.ctx, &key, 0).await.unwrap();
        assert_eq!(action, ReconcileAction::Stalled);

        let status = h.store.database(&key).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Failed);
        let degraded = find_condition(&status.conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.reason, REASON_CLEANUP_FAILED);

        let action = reconcile(&h.ctx, &key, 0).await.unwrap();
        assert_eq!(action, ReconcileAction::Stalled);
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_phase_transitions_emit_events() {
        let h = harness();
        let key = ObjectKey::from(&h.store.create(create_test_database("orders")));
        converge(&h, &key).await;

        for _ in 0..10 {
            if h.recorder.reasons(&key).len() >= 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            h.recorder.reasons(&key),
            vec!["Pending", "Provisioning", "Available"]
        );
    }
}
