// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Plan repository: fingerprint-guarded mutations of the primary store.
//!
//! Every successful mutation commits to the [`PrimaryStore`] first and then
//! publishes the matching [`ChangeEvent`]s. The commit is never rolled back;
//! a publish failure is reported on the result (or as
//! [`PlanError::PublishFailed`] with [`RepositoryOptions::strict_publish`]).
//!
//! # Concurrency
//!
//! There is no locking. Two writers racing on the same plan are told apart
//! only when they pass the fingerprint they read:
//!
//! ```text
//! A: get("p")            -> fp1
//! B: get("p")            -> fp1
//! A: replace("p", .., fp1) -> ok, fp2
//! B: replace("p", .., fp1) -> PreconditionFailed { expected: fp1, actual: fp2 }
//! ```
//!
//! Writers that omit the fingerprint overwrite unconditionally.
//!
//! # Linked services
//!
//! Each entry of `linkedPlanServices` is also stored on its own as a
//! [`ServiceEntry`] that names the owning plan, so it can be read with
//! [`PlanRepository::get_service`] and removed by the cascading delete.
//! Plans and services live in separate key namespaces (`plan:` and
//! `service:`). A service id is owned by exactly one plan: writes that
//! would hand it to another plan fail with [`PlanError::Conflict`].
//! Services a replace drops are removed from the store and the index.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cdc::publisher::ChangePublisher;
use crate::cdc::ChangeEvent;
use crate::document::{PlanDocument, ServiceEntry, OBJECT_ID};
use crate::error::PlanError;
use crate::fingerprint;
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::{PrimaryStore, StorageError};
use crate::validation::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// Run the validator on the replacement body of a PUT.
    pub validate_on_replace: bool,
    /// Return [`PlanError::PublishFailed`] when events could not be queued.
    pub strict_publish: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            validate_on_replace: true,
            strict_publish: false,
        }
    }
}

/// Whether the change events of a committed mutation reached the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { events: usize },
    /// The first `published` events were queued; the rest were not.
    Failed { published: usize, error: String },
}

impl PublishOutcome {
    #[must_use]
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub object_id: String,
    pub fingerprint: String,
    pub publish: PublishOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub object_id: String,
    /// Linked service ids removed with the plan, in document order.
    pub removed_services: Vec<String>,
    pub publish: PublishOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanRead {
    /// The client's fingerprint is current.
    NotModified { fingerprint: String },
    Found { document: PlanDocument, fingerprint: String },
}

pub struct PlanRepository {
    store: Arc<dyn PrimaryStore>,
    validator: Arc<dyn Validator>,
    publisher: ChangePublisher,
    options: RepositoryOptions,
}

impl PlanRepository {
    pub fn new(store: Arc<dyn PrimaryStore>, validator: Arc<dyn Validator>, publisher: ChangePublisher) -> Self {
        Self {
            store,
            validator,
            publisher,
            options: RepositoryOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RepositoryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn options(&self) -> RepositoryOptions {
        self.options
    }

    /// Store a new plan. Fails with [`PlanError::Conflict`] if the id exists.
    pub async fn create(&self, body: Value) -> Result<Mutation, PlanError> {
        observe("create", async {
            self.validator.validate(&body)?;
            let document = PlanDocument::from_value(body)?;
            let id = document.object_id().to_string();

            if self.store.exists(&plan_key(&id)).await? || self.store.exists(&service_key(&id)).await? {
                return Err(PlanError::Conflict(id));
            }
            self.persist(&document, None).await?;

            let fingerprint = document.fingerprint();
            info!(object_id = %id, fingerprint = %fingerprint, "Created plan");
            let publish = self.publish(vec![ChangeEvent::create_plan(&document)]).await?;
            Ok(Mutation {
                object_id: id,
                fingerprint,
                publish,
            })
        })
        .await
    }

    /// Read a plan. A matching `client_fingerprint` yields
    /// [`PlanRead::NotModified`] instead of the body.
    pub async fn get(&self, object_id: &str, client_fingerprint: Option<&str>) -> Result<PlanRead, PlanError> {
        observe("get", async {
            let document = self.load(object_id).await?;
            let fingerprint = document.fingerprint();
            if client_fingerprint.is_some_and(|client| fingerprint::matches(client, &fingerprint)) {
                debug!(object_id, "Fingerprint current, not modified");
                return Ok(PlanRead::NotModified { fingerprint });
            }
            Ok(PlanRead::Found { document, fingerprint })
        })
        .await
    }

    /// Read a linked service stored on its own, with the id of its plan.
    pub async fn get_service(&self, object_id: &str) -> Result<ServiceEntry, PlanError> {
        observe("get_service", async {
            self.load_service(object_id)
                .await?
                .ok_or_else(|| PlanError::NotFound(object_id.to_string()))
        })
        .await
    }

    /// Overwrite a plan wholesale.
    pub async fn replace(&self, object_id: &str, body: Value, expected: Option<&str>) -> Result<Mutation, PlanError> {
        observe("replace", async {
            let current = self.load(object_id).await?;
            check_precondition(&current, expected)?;

            if self.options.validate_on_replace {
                self.validator.validate(&body)?;
            }
            let document = PlanDocument::from_value(body)?;
            ensure_same_id(object_id, document.object_id())?;

            let dropped = self.persist(&document, Some(&current)).await?;

            let fingerprint = document.fingerprint();
            info!(object_id, fingerprint = %fingerprint, dropped = dropped.len(), "Replaced plan");
            let mut events: Vec<ChangeEvent> = dropped
                .iter()
                .map(|service_id| ChangeEvent::delete_service(service_id, object_id))
                .collect();
            events.push(ChangeEvent::update_plan(&document));
            let publish = self.publish(events).await?;
            Ok(Mutation {
                object_id: object_id.to_string(),
                fingerprint,
                publish,
            })
        })
        .await
    }

    /// Merge `partial` into a plan: `linkedPlanServices` entries are appended,
    /// other top-level fields overwrite. The merged document is always validated.
    pub async fn patch(&self, object_id: &str, partial: Value, expected: Option<&str>) -> Result<Mutation, PlanError> {
        observe("patch", async {
            let Value::Object(partial) = partial else {
                return Err(PlanError::InvalidDocument("patch body must be a JSON object".to_string()));
            };
            let current = self.load(object_id).await?;
            check_precondition(&current, expected)?;

            if let Some(id) = partial.get(OBJECT_ID) {
                ensure_same_id(object_id, id.as_str().unwrap_or_default())?;
            }

            let merged = Value::Object(current.merge_patch(&partial));
            self.validator.validate(&merged)?;
            let document = PlanDocument::from_value(merged)?;

            self.persist(&document, Some(&current)).await?;

            let fingerprint = document.fingerprint();
            info!(object_id, fingerprint = %fingerprint, "Patched plan");
            let publish = self.publish(vec![ChangeEvent::update_plan(&document)]).await?;
            Ok(Mutation {
                object_id: object_id.to_string(),
                fingerprint,
                publish,
            })
        })
        .await
    }

    /// Remove a plan and its linked services, children first.
    ///
    /// Emits one `Delete(Service)` per linked service entry, duplicates
    /// included, then one `Delete(Plan)`.
    pub async fn delete(&self, object_id: &str) -> Result<Deletion, PlanError> {
        observe("delete", async {
            let current = self.load(object_id).await?;

            let mut removed_services: Vec<String> = Vec::new();
            for service in current.linked_services() {
                self.store.delete(&service_key(&service.object_id)).await?;
                removed_services.push(service.object_id);
            }
            self.store.delete(&plan_key(object_id)).await?;

            info!(object_id, services = removed_services.len(), "Deleted plan");

            let mut events: Vec<ChangeEvent> = removed_services
                .iter()
                .map(|service_id| ChangeEvent::delete_service(service_id, object_id))
                .collect();
            events.push(ChangeEvent::delete_plan(object_id));
            let publish = self.publish(events).await?;

            Ok(Deletion {
                object_id: object_id.to_string(),
                removed_services,
                publish,
            })
        })
        .await
    }

    async fn load(&self, object_id: &str) -> Result<PlanDocument, PlanError> {
        let bytes = self
            .store
            .get(&plan_key(object_id))
            .await?
            .ok_or_else(|| PlanError::NotFound(object_id.to_string()))?;
        PlanDocument::from_slice(&bytes).map_err(|e| corruption(object_id, e))
    }

    async fn load_service(&self, object_id: &str) -> Result<Option<ServiceEntry>, PlanError> {
        match self.store.get(&service_key(object_id)).await? {
            Some(bytes) => ServiceEntry::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corruption(object_id, e)),
            None => Ok(None),
        }
    }

    /// Every linked service must be free or already owned by this plan.
    async fn check_services(&self, document: &PlanDocument) -> Result<(), PlanError> {
        let plan_id = document.object_id();
        for service in document.linked_services() {
            let id = &service.object_id;
            if id == plan_id {
                return Err(PlanError::InvalidDocument(format!(
                    "linked service '{id}' reuses the plan's objectId"
                )));
            }
            if self.store.exists(&plan_key(id)).await? {
                return Err(PlanError::Conflict(id.clone()));
            }
            if let Some(entry) = self.load_service(id).await? {
                if entry.parent_id != plan_id {
                    return Err(PlanError::Conflict(id.clone()));
                }
            }
        }
        Ok(())
    }

    /// Write the plan and its service entries, then remove the entries of
    /// services `previous` linked that `document` no longer does. Returns the
    /// removed ids in `previous` document order.
    async fn persist(&self, document: &PlanDocument, previous: Option<&PlanDocument>) -> Result<Vec<String>, PlanError> {
        self.check_services(document).await?;

        let plan_id = document.object_id();
        let services = document.linked_services();
        self.store.set(&plan_key(plan_id), &document.to_bytes()).await?;
        for service in &services {
            let entry = ServiceEntry::new(service, plan_id);
            self.store.set(&service_key(&service.object_id), &entry.to_bytes()).await?;
        }

        let mut dropped: Vec<String> = Vec::new();
        for old in previous.map(PlanDocument::linked_services).unwrap_or_default() {
            if services.iter().any(|s| s.object_id == old.object_id) || dropped.contains(&old.object_id) {
                continue;
            }
            self.store.delete(&service_key(&old.object_id)).await?;
            dropped.push(old.object_id);
        }
        Ok(dropped)
    }

    async fn publish(&self, events: Vec<ChangeEvent>) -> Result<PublishOutcome, PlanError> {
        match self.publisher.publish_all(&events).await {
            Ok(count) => Ok(PublishOutcome::Published { events: count }),
            Err((published, err)) if self.options.strict_publish => {
                warn!(published, total = events.len(), error = %err, "Publish failed after commit");
                Err(err.into())
            }
            Err((published, err)) => {
                warn!(published, total = events.len(), error = %err, "Publish failed after commit, index will lag");
                Ok(PublishOutcome::Failed {
                    published,
                    error: err.to_string(),
                })
            }
        }
    }
}

async fn observe<T, F>(operation: &'static str, fut: F) -> Result<T, PlanError>
where
    F: Future<Output = Result<T, PlanError>>,
{
    let _timer = LatencyTimer::new(operation);
    let result = fut.await;
    let outcome = match &result {
        Ok(_) => "success",
        Err(e) => e.outcome(),
    };
    metrics::record_operation(operation, outcome);
    result
}

fn plan_key(object_id: &str) -> String {
    format!("plan:{object_id}")
}

fn service_key(object_id: &str) -> String {
    format!("service:{object_id}")
}

fn check_precondition(current: &PlanDocument, expected: Option<&str>) -> Result<(), PlanError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = current.fingerprint();
    if fingerprint::matches(expected, &actual) {
        Ok(())
    } else {
        Err(PlanError::PreconditionFailed {
            expected: expected.to_string(),
            actual,
        })
    }
}

fn ensure_same_id(path_id: &str, body_id: &str) -> Result<(), PlanError> {
    if path_id == body_id {
        Ok(())
    } else {
        Err(PlanError::InvalidDocument(format!(
            "objectId '{body_id}' does not match '{path_id}'"
        )))
    }
}

fn corruption(object_id: &str, err: impl std::fmt::Display) -> PlanError {
    PlanError::Storage(StorageError::Corruption {
        id: object_id.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::{ChangeAction, EntityKind};
    use crate::queue::memory::InMemoryQueue;
    use crate::storage::memory::InMemoryStore;
    use crate::validation::StructuralValidator;
    use serde_json::json;

    struct Fixture {
        repo: PlanRepository,
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryQueue>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let repo = PlanRepository::new(
            store.clone(),
            Arc::new(StructuralValidator::new()),
            ChangePublisher::new(queue.clone()),
        );
        Fixture { repo, store, queue }
    }

    fn queued(queue: &InMemoryQueue) -> Vec<ChangeEvent> {
        queue
            .pending_payloads()
            .iter()
            .map(|p| ChangeEvent::from_slice(p).unwrap())
            .collect()
    }

    fn plan() -> Value {
        json!({
            "objectId": "plan-1",
            "planType": "inNetwork",
            "linkedPlanServices": [
                {"objectId": "svc-a", "name": "Yearly physical"},
                {"objectId": "svc-b", "name": "Well baby"}
            ]
        })
    }

    #[tokio::test]
    async fn test_create_stores_plan_and_services() {
        let f = fixture();
        let mutation = f.repo.create(plan()).await.unwrap();
        assert_eq!(mutation.object_id, "plan-1");
        assert!(mutation.publish.is_published());

        assert_eq!(f.store.len(), 3);
        let entry = f.repo.get_service("svc-b").await.unwrap();
        assert_eq!(entry.parent_id, "plan-1");
        assert_eq!(entry.service["name"], "Well baby");

        let events = queued(&f.queue);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "create_plan");
        assert_eq!(events[0].payload["linkedPlanServices"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();

        let mut second = plan();
        second["planType"] = json!("outOfNetwork");
        let err = f.repo.create(second).await.unwrap_err();
        assert!(matches!(err, PlanError::Conflict(id) if id == "plan-1"));

        match f.repo.get("plan-1", None).await.unwrap() {
            PlanRead::Found { document, .. } => assert_eq!(document.get("planType"), Some(&json!("inNetwork"))),
            other => panic!("expected Found, got {:?}", other),
        }
        assert_eq!(queued(&f.queue).len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_without_side_effects() {
        let f = fixture();
        let err = f
            .repo
            .create(json!({"objectId": "p", "linkedPlanServices": [{"name": "no id"}]}))
            .await
            .unwrap_err();
        match err {
            PlanError::ValidationFailed { path, .. } => assert_eq!(path, "linkedPlanServices -> 0 -> objectId"),
            other => panic!("expected ValidationFailed, got {:?}", other),
        }
        assert!(f.store.is_empty());
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_not_modified() {
        let f = fixture();
        let created = f.repo.create(plan()).await.unwrap();

        let quoted = format!("\"{}\"", created.fingerprint);
        assert!(matches!(
            f.repo.get("plan-1", Some(&quoted)).await.unwrap(),
            PlanRead::NotModified { .. }
        ));
        assert!(matches!(
            f.repo.get("plan-1", Some("stale")).await.unwrap(),
            PlanRead::Found { .. }
        ));
        assert!(matches!(f.repo.get("nope", None).await, Err(PlanError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stale_replace_is_rejected() {
        let f = fixture();
        let created = f.repo.create(plan()).await.unwrap();

        let mut updated = plan();
        updated["planType"] = json!("outOfNetwork");
        let second = f.repo.replace("plan-1", updated.clone(), Some(&created.fingerprint)).await.unwrap();
        assert_ne!(second.fingerprint, created.fingerprint);

        let err = f.repo.replace("plan-1", plan(), Some(&created.fingerprint)).await.unwrap_err();
        match err {
            PlanError::PreconditionFailed { expected, actual } => {
                assert_eq!(expected, created.fingerprint);
                assert_eq!(actual, second.fingerprint);
            }
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }

        match f.repo.get("plan-1", None).await.unwrap() {
            PlanRead::Found { fingerprint, .. } => assert_eq!(fingerprint, second.fingerprint),
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unconditional_replace_overwrites() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();
        let mutation = f.repo.replace("plan-1", json!({"objectId": "plan-1"}), None).await.unwrap();
        assert!(mutation.publish.is_published());

        let events = queued(&f.queue);
        assert_eq!(events.last().unwrap().label(), "update_plan");
    }

    #[tokio::test]
    async fn test_replace_rejects_other_object_id() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();
        let err = f.repo.replace("plan-1", json!({"objectId": "plan-2"}), None).await.unwrap_err();
        assert!(matches!(err, PlanError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_replace_missing_is_not_found() {
        let f = fixture();
        let err = f.repo.replace("plan-1", plan(), None).await.unwrap_err();
        assert!(matches!(err, PlanError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_replace_skips_validation_when_disabled() {
        let f = fixture();
        let repo = f.repo.with_options(RepositoryOptions {
            validate_on_replace: false,
            strict_publish: false,
        });
        assert!(!repo.options().validate_on_replace);
        repo.create(plan()).await.unwrap();
        // Not an array: the structural validator would reject this
        repo.replace("plan-1", json!({"objectId": "plan-1", "linkedPlanServices": "none"}), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_patch_appends_services() {
        let f = fixture();
        f.repo
            .create(json!({"objectId": "plan-1", "linkedPlanServices": [{"objectId": "A"}]}))
            .await
            .unwrap();

        let partial = json!({"linkedPlanServices": [{"objectId": "X"}], "planStatus": "active"});
        f.repo.patch("plan-1", partial.clone(), None).await.unwrap();
        f.repo.patch("plan-1", partial, None).await.unwrap();

        let PlanRead::Found { document, .. } = f.repo.get("plan-1", None).await.unwrap() else {
            panic!("expected Found");
        };
        let ids: Vec<String> = document.linked_services().into_iter().map(|s| s.object_id).collect();
        assert_eq!(ids, vec!["A", "X", "X"]);
        assert_eq!(document.get("planStatus"), Some(&json!("active")));
    }

    #[tokio::test]
    async fn test_patch_failing_validation_persists_nothing() {
        let f = fixture();
        let created = f.repo.create(plan()).await.unwrap();

        let err = f
            .repo
            .patch("plan-1", json!({"linkedPlanServices": [42]}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::ValidationFailed { .. }));

        let PlanRead::Found { fingerprint, .. } = f.repo.get("plan-1", None).await.unwrap() else {
            panic!("expected Found");
        };
        assert_eq!(fingerprint, created.fingerprint);
        assert_eq!(queued(&f.queue).len(), 1);
    }

    #[tokio::test]
    async fn test_patch_checks_precondition() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();
        let err = f
            .repo
            .patch("plan-1", json!({"planType": "x"}), Some("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_delete_cascades_children_first() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();
        let deletion = f.repo.delete("plan-1").await.unwrap();
        assert_eq!(deletion.removed_services, vec!["svc-a", "svc-b"]);
        assert!(f.store.is_empty());

        let events: Vec<ChangeEvent> = queued(&f.queue).into_iter().skip(1).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| (e.action, e.entity_kind)).collect::<Vec<_>>(),
            vec![
                (ChangeAction::Delete, EntityKind::Service),
                (ChangeAction::Delete, EntityKind::Service),
                (ChangeAction::Delete, EntityKind::Plan),
            ]
        );
        assert!(events[..2].iter().all(|e| e.parent_id.as_deref() == Some("plan-1")));

        assert!(matches!(f.repo.delete("plan-1").await, Err(PlanError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_service_entries() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();
        f.store.delete("service:svc-a").await.unwrap();
        let deletion = f.repo.delete("plan-1").await.unwrap();
        assert_eq!(deletion.removed_services.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_storage_error() {
        let f = fixture();
        f.store.set("plan:plan-1", b"not json").await.unwrap();
        let err = f.repo.get("plan-1", None).await.unwrap_err();
        assert!(matches!(err, PlanError::Storage(StorageError::Corruption { .. })));

        f.store.set("service:svc-a", br#"{"objectId":"svc-a"}"#).await.unwrap();
        let err = f.repo.get_service("svc-a").await.unwrap_err();
        assert!(matches!(err, PlanError::Storage(StorageError::Corruption { .. })));
    }

    #[tokio::test]
    async fn test_service_id_of_existing_plan_conflicts() {
        let f = fixture();
        let first = f.repo.create(json!({"objectId": "P1", "planType": "a"})).await.unwrap();

        let err = f
            .repo
            .create(json!({"objectId": "P2", "linkedPlanServices": [{"objectId": "P1"}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Conflict(id) if id == "P1"));

        match f.repo.get("P1", None).await.unwrap() {
            PlanRead::Found { fingerprint, document } => {
                assert_eq!(fingerprint, first.fingerprint);
                assert_eq!(document.get("planType"), Some(&json!("a")));
            }
            other => panic!("expected Found, got {:?}", other),
        }
        assert!(matches!(f.repo.get("P2", None).await, Err(PlanError::NotFound(_))));
        assert!(matches!(f.repo.get_service("P1").await, Err(PlanError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_plan_id_of_existing_service_conflicts() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();
        let err = f.repo.create(json!({"objectId": "svc-a"})).await.unwrap_err();
        assert!(matches!(err, PlanError::Conflict(id) if id == "svc-a"));
        assert_eq!(f.repo.get_service("svc-a").await.unwrap().parent_id, "plan-1");
    }

    #[tokio::test]
    async fn test_service_owned_by_another_plan_conflicts() {
        let f = fixture();
        f.repo.create(plan()).await.unwrap();
        f.repo.create(json!({"objectId": "plan-2"})).await.unwrap();

        let err = f
            .repo
            .patch("plan-2", json!({"linkedPlanServices": [{"objectId": "svc-b"}]}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Conflict(id) if id == "svc-b"));
        assert_eq!(f.repo.get_service("svc-b").await.unwrap().parent_id, "plan-1");
        assert_eq!(queued(&f.queue).len(), 2);
    }

    #[tokio::test]
    async fn test_service_reusing_plan_id_is_invalid() {
        let f = fixture();
        let err = f
            .repo
            .create(json!({"objectId": "P1", "linkedPlanServices": [{"objectId": "P1"}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidDocument(_)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_replace_removes_dropped_services() {
        let f = fixture();
        f.repo
            .create(json!({"objectId": "P1", "linkedPlanServices": [{"objectId": "S1"}, {"objectId": "S2"}]}))
            .await
            .unwrap();

        let mutation = f
            .repo
            .replace("P1", json!({"objectId": "P1", "linkedPlanServices": [{"objectId": "S2"}]}), None)
            .await
            .unwrap();
        assert!(matches!(mutation.publish, PublishOutcome::Published { events: 2 }));
        assert!(matches!(f.repo.get_service("S1").await, Err(PlanError::NotFound(_))));
        assert_eq!(f.repo.get_service("S2").await.unwrap().parent_id, "P1");

        let events: Vec<ChangeEvent> = queued(&f.queue).into_iter().skip(1).collect();
        assert_eq!(events[0].label(), "delete_service");
        assert_eq!(events[0].object_id(), Some("S1"));
        assert_eq!(events[0].parent_id.as_deref(), Some("P1"));
        assert_eq!(events[1].label(), "update_plan");

        // S1 is free again and another plan may claim it
        f.repo
            .create(json!({"objectId": "P2", "linkedPlanServices": [{"objectId": "S1"}]}))
            .await
            .unwrap();
        assert_eq!(f.repo.get_service("S1").await.unwrap().parent_id, "P2");
    }

    #[tokio::test]
    async fn test_replace_then_delete_leaves_no_service_entries() {
        let f = fixture();
        f.repo
            .create(json!({"objectId": "P1", "linkedPlanServices": [{"objectId": "S1"}]}))
            .await
            .unwrap();
        f.repo.replace("P1", json!({"objectId": "P1"}), None).await.unwrap();
        let deletion = f.repo.delete("P1").await.unwrap();
        assert!(deletion.removed_services.is_empty());

        assert!(matches!(f.repo.get_service("S1").await, Err(PlanError::NotFound(_))));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_emits_event_per_service_entry() {
        let f = fixture();
        f.repo
            .create(json!({"objectId": "P1", "linkedPlanServices": [{"objectId": "A"}]}))
            .await
            .unwrap();
        let partial = json!({"linkedPlanServices": [{"objectId": "X"}]});
        f.repo.patch("P1", partial.clone(), None).await.unwrap();
        f.repo.patch("P1", partial, None).await.unwrap();

        let deletion = f.repo.delete("P1").await.unwrap();
        assert_eq!(deletion.removed_services, vec!["A", "X", "X"]);
        assert!(matches!(deletion.publish, PublishOutcome::Published { events: 4 }));

        let labels: Vec<&str> = queued(&f.queue).iter().skip(3).map(ChangeEvent::label).collect();
        assert_eq!(labels, vec!["delete_service", "delete_service", "delete_service", "delete_plan"]);
        assert!(f.store.is_empty());
    }
}
