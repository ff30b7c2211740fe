//! End-to-end pipeline tests, fully in memory.
//!
//! Repository → publisher → queue → worker → index, with the worker driven
//! explicitly through `drain()` so every step is deterministic.
//!
//! # Running Tests
//! ```bash
//! cargo test --test pipeline
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use plan_sync::index::memory::InMemoryIndex;
use plan_sync::index::{join_name, join_parent};
use plan_sync::queue::memory::InMemoryQueue;
use plan_sync::storage::memory::InMemoryStore;
use plan_sync::{
    ChangeAction, ChangeEvent, ChangePublisher, DurableQueue, EntityKind, IndexQuery, IndexSyncWorker, PlanError,
    PlanRead, PlanRepository, RetryConfig, SearchIndex, StructuralValidator, WorkerConfig,
};

struct Pipeline {
    repo: PlanRepository,
    queue: Arc<InMemoryQueue>,
    index: Arc<InMemoryIndex>,
    worker: IndexSyncWorker,
}

fn pipeline() -> Pipeline {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let index = Arc::new(InMemoryIndex::new());
    let repo = PlanRepository::new(
        store,
        Arc::new(StructuralValidator::new().require("planType")),
        ChangePublisher::new(queue.clone()),
    );
    let worker = IndexSyncWorker::new(
        queue.clone(),
        index.clone(),
        WorkerConfig {
            receive_timeout: Duration::from_millis(10),
            redelivery_backoff: RetryConfig::fast(),
            ..WorkerConfig::default()
        },
    );
    Pipeline { repo, queue, index, worker }
}

fn plan(id: &str, services: &[&str]) -> Value {
    let services: Vec<Value> = services
        .iter()
        .map(|s| json!({"objectId": s, "objectType": "planservice", "name": format!("service {s}")}))
        .collect();
    json!({
        "objectId": id,
        "objectType": "plan",
        "planType": "inNetwork",
        "linkedPlanServices": services
    })
}

fn pending_events(queue: &InMemoryQueue) -> Vec<ChangeEvent> {
    queue
        .pending_payloads()
        .iter()
        .map(|p| ChangeEvent::from_slice(p).unwrap())
        .collect()
}

// =============================================================================
// Repository properties
// =============================================================================

#[tokio::test]
async fn duplicate_create_keeps_first_payload() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1"])).await.unwrap();

    let mut second = plan("P1", &["S2"]);
    second["planType"] = json!("outOfNetwork");
    assert!(matches!(p.repo.create(second).await, Err(PlanError::Conflict(_))));

    let PlanRead::Found { document, .. } = p.repo.get("P1", None).await.unwrap() else {
        panic!("plan missing");
    };
    assert_eq!(document.to_value(), plan("P1", &["S1"]));
}

#[tokio::test]
async fn stale_fingerprint_leaves_document_unchanged() {
    let p = pipeline();
    let v1 = p.repo.create(plan("P1", &["S1"])).await.unwrap();
    let v2 = p.repo.patch("P1", json!({"planStatus": "active"}), Some(&v1.fingerprint)).await.unwrap();

    let err = p.repo.replace("P1", plan("P1", &[]), Some(&v1.fingerprint)).await.unwrap_err();
    assert!(matches!(err, PlanError::PreconditionFailed { .. }));

    let PlanRead::Found { document, fingerprint } = p.repo.get("P1", None).await.unwrap() else {
        panic!("plan missing");
    };
    assert_eq!(fingerprint, v2.fingerprint);
    assert_eq!(document.get("planStatus"), Some(&json!("active")));
}

#[tokio::test]
async fn fingerprint_ignores_key_order() {
    let p = pipeline();
    let created = p
        .repo
        .create(json!({"planType": "inNetwork", "objectId": "P1", "a": {"y": 1, "x": 2}}))
        .await
        .unwrap();
    let replaced = p
        .repo
        .replace("P1", json!({"a": {"x": 2, "y": 1}, "objectId": "P1", "planType": "inNetwork"}), None)
        .await
        .unwrap();
    assert_eq!(created.fingerprint, replaced.fingerprint);
}

#[tokio::test]
async fn patch_appends_linked_services() {
    let p = pipeline();
    p.repo.create(plan("P1", &["A"])).await.unwrap();

    p.repo.patch("P1", json!({"linkedPlanServices": [{"objectId": "X"}]}), None).await.unwrap();
    let PlanRead::Found { document, .. } = p.repo.get("P1", None).await.unwrap() else {
        panic!("plan missing");
    };
    let ids: Vec<String> = document.linked_services().into_iter().map(|s| s.object_id).collect();
    assert_eq!(ids, vec!["A", "X"]);

    p.repo.patch("P1", json!({"linkedPlanServices": [{"objectId": "X"}]}), None).await.unwrap();
    let PlanRead::Found { document, .. } = p.repo.get("P1", None).await.unwrap() else {
        panic!("plan missing");
    };
    let ids: Vec<String> = document.linked_services().into_iter().map(|s| s.object_id).collect();
    assert_eq!(ids, vec!["A", "X", "X"]);
}

#[tokio::test]
async fn patch_validation_failure_reports_path() {
    let p = pipeline();
    p.repo.create(plan("P1", &["A"])).await.unwrap();

    let err = p.repo.patch("P1", json!({"planType": null}), None).await.unwrap_err();
    match err {
        PlanError::ValidationFailed { path, .. } => assert_eq!(path, "planType"),
        other => panic!("expected ValidationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn delete_emits_children_then_parent() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1", "S2"])).await.unwrap();
    p.worker.drain().await.unwrap();

    p.repo.delete("P1").await.unwrap();
    let events = pending_events(&p.queue);

    let plan_deletes = events
        .iter()
        .filter(|e| e.action == ChangeAction::Delete && e.entity_kind == EntityKind::Plan)
        .count();
    assert_eq!(plan_deletes, 1);

    let service_deletes: Vec<&str> = events
        .iter()
        .filter(|e| e.action == ChangeAction::Delete && e.entity_kind == EntityKind::Service)
        .map(|e| e.object_id().unwrap())
        .collect();
    assert_eq!(service_deletes, vec!["S1", "S2"]);
    assert_eq!(events.last().unwrap().entity_kind, EntityKind::Plan);
}

// =============================================================================
// End-to-end
// =============================================================================

#[tokio::test]
async fn create_then_delete_leaves_no_dangling_child() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1"])).await.unwrap();
    assert_eq!(p.worker.drain().await.unwrap(), 1);

    let children = p.index.search_by_parent("P1").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, "S1");
    assert_eq!(children[0].routing.as_deref(), Some("P1"));
    assert_eq!(join_parent(&children[0].source), Some("P1"));

    let parent = p.index.get_doc("P1", None).await.unwrap().unwrap();
    assert_eq!(join_name(&parent.source), Some("plan"));

    p.repo.delete("P1").await.unwrap();
    assert_eq!(p.worker.drain().await.unwrap(), 2);

    assert!(p.index.get_doc("P1", None).await.unwrap().is_none());
    assert!(p.index.search_by_parent("P1").await.unwrap().is_empty());
    assert!(p.index.is_empty());
}

#[tokio::test]
async fn patch_projects_new_service_under_parent() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1"])).await.unwrap();
    p.repo
        .patch("P1", json!({"linkedPlanServices": [{"objectId": "S2", "name": "Dental"}]}), None)
        .await
        .unwrap();
    p.worker.drain().await.unwrap();

    let hits = p.index.search(&IndexQuery::child_of("S2", "P1")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source["name"], "Dental");
    assert_eq!(p.index.search_by_parent("P1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn replace_dropping_a_service_removes_it_everywhere() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1", "S2"])).await.unwrap();
    p.worker.drain().await.unwrap();

    p.repo.replace("P1", plan("P1", &["S2"]), None).await.unwrap();
    p.worker.drain().await.unwrap();

    assert!(matches!(p.repo.get_service("S1").await, Err(PlanError::NotFound(_))));
    let children = p.index.search_by_parent("P1").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, "S2");

    p.repo.delete("P1").await.unwrap();
    p.worker.drain().await.unwrap();
    assert!(p.index.is_empty());
}

#[tokio::test]
async fn service_id_cannot_shadow_a_plan() {
    let p = pipeline();
    let first = p.repo.create(plan("P1", &["S1"])).await.unwrap();

    let err = p.repo.create(plan("P2", &["P1"])).await.unwrap_err();
    assert!(matches!(err, PlanError::Conflict(id) if id == "P1"));

    let PlanRead::Found { fingerprint, .. } = p.repo.get("P1", None).await.unwrap() else {
        panic!("plan missing");
    };
    assert_eq!(fingerprint, first.fingerprint);
    assert_eq!(pending_events(&p.queue).len(), 1);
}

#[tokio::test]
async fn update_service_reaches_index_before_its_plan() {
    let p = pipeline();
    let service = plan_sync::LinkedService::from_value(&json!({"objectId": "S1", "name": "early"})).unwrap();
    p.queue
        .enqueue(&ChangeEvent::update_service(&service, "P1").to_bytes().unwrap())
        .await
        .unwrap();
    assert_eq!(p.worker.drain().await.unwrap(), 1);

    let child = p.index.get_doc("S1", Some("P1")).await.unwrap().unwrap();
    assert_eq!(child.routing.as_deref(), Some("P1"));
    assert_eq!(join_parent(&child.source), Some("P1"));
    assert_eq!(join_name(&child.source), Some("service"));

    // The plan arriving later keeps the child attached
    p.repo.create(plan("P1", &["S1"])).await.unwrap();
    p.worker.drain().await.unwrap();
    assert_eq!(p.index.search_by_parent("P1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn replayed_events_converge() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1", "S2"])).await.unwrap();
    p.repo.patch("P1", json!({"planStatus": "active"}), None).await.unwrap();

    let events = pending_events(&p.queue);
    p.worker.drain().await.unwrap();
    let once = p.index.snapshot();

    // Redeliver every event a second time
    for event in &events {
        p.queue.enqueue(&event.to_bytes().unwrap()).await.unwrap();
    }
    p.worker.drain().await.unwrap();
    assert_eq!(p.index.snapshot(), once);
}

#[tokio::test]
async fn update_service_replay_is_idempotent() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1"])).await.unwrap();
    p.worker.drain().await.unwrap();

    let service = plan_sync::LinkedService::from_value(&json!({"objectId": "S1", "name": "renamed"})).unwrap();
    let event = ChangeEvent::update_service(&service, "P1");
    p.worker.apply(&event).await.unwrap();
    let once = p.index.snapshot();
    p.worker.apply(&event).await.unwrap();
    assert_eq!(p.index.snapshot(), once);
    assert_eq!(
        p.index.get_doc("S1", Some("P1")).await.unwrap().unwrap().source["name"],
        "renamed"
    );
}

#[tokio::test]
async fn primary_reads_are_immediate_index_is_eventual() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1"])).await.unwrap();

    assert!(matches!(p.repo.get("P1", None).await.unwrap(), PlanRead::Found { .. }));
    let entry = p.repo.get_service("S1").await.unwrap();
    assert_eq!(entry.service["objectId"], "S1");
    assert_eq!(entry.parent_id, "P1");
    assert!(p.index.is_empty());

    p.worker.drain().await.unwrap();
    assert_eq!(p.index.len(), 2);
}

#[tokio::test]
async fn crash_before_ack_is_redelivered_after_recover() {
    let p = pipeline();
    p.repo.create(plan("P1", &["S1"])).await.unwrap();

    // A consumer takes the delivery and dies without settling it
    let abandoned = p.queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(abandoned.attempt, 1);

    assert_eq!(p.queue.recover().await.unwrap(), 1);
    assert_eq!(p.worker.drain().await.unwrap(), 1);
    assert_eq!(p.index.search_by_parent("P1").await.unwrap().len(), 1);
}
