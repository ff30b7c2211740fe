// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events.
//!
//! Every committed mutation of the primary store is described by a
//! [`ChangeEvent`] and handed to the [`publisher::ChangePublisher`]. The index
//! sync worker consumes the same events on the other side of the queue.
//!
//! # Wire Format
//!
//! Events travel as JSON:
//!
//! ```text
//! {"eventId":"6f1c...","action":"create","entityKind":"plan",
//!  "payload":{"objectId":"plan-1",...},"emittedAt":1735776000000}
//!
//! {"eventId":"9a2e...","action":"delete","entityKind":"service",
//!  "payload":{"objectId":"svc-1"},"parentId":"plan-1","emittedAt":1735776000012}
//! ```
//!
//! `eventId` and `emittedAt` exist for log correlation only. Applying an event
//! never depends on them, so redelivered copies apply identically.

pub mod publisher;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::document::{LinkedService, PlanDocument, OBJECT_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Plan,
    Service,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_id: String,
    pub action: ChangeAction,
    pub entity_kind: EntityKind,
    pub payload: Value,
    /// Owning plan, set on every service event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub emitted_at: i64,
}

impl ChangeEvent {
    fn new(action: ChangeAction, entity_kind: EntityKind, payload: Value, parent_id: Option<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            action,
            entity_kind,
            payload,
            parent_id,
            emitted_at: now_millis(),
        }
    }

    /// Full plan, embedded services included.
    pub fn create_plan(plan: &PlanDocument) -> Self {
        Self::new(ChangeAction::Create, EntityKind::Plan, plan.to_value(), None)
    }

    /// Full document after replace or patch.
    pub fn update_plan(plan: &PlanDocument) -> Self {
        Self::new(ChangeAction::Update, EntityKind::Plan, plan.to_value(), None)
    }

    pub fn delete_plan(object_id: &str) -> Self {
        Self::new(ChangeAction::Delete, EntityKind::Plan, json!({ OBJECT_ID: object_id }), None)
    }

    pub fn create_service(service: &LinkedService, parent_id: &str) -> Self {
        Self::new(ChangeAction::Create, EntityKind::Service, service.to_value(), Some(parent_id.to_string()))
    }

    pub fn update_service(service: &LinkedService, parent_id: &str) -> Self {
        Self::new(ChangeAction::Update, EntityKind::Service, service.to_value(), Some(parent_id.to_string()))
    }

    pub fn delete_service(object_id: &str, parent_id: &str) -> Self {
        Self::new(
            ChangeAction::Delete,
            EntityKind::Service,
            json!({ OBJECT_ID: object_id }),
            Some(parent_id.to_string()),
        )
    }

    /// The `objectId` the payload refers to, if present.
    #[must_use]
    pub fn object_id(&self) -> Option<&str> {
        self.payload.get(OBJECT_ID).and_then(Value::as_str)
    }

    /// Short label such as `delete_service`, used in logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match (self.action, self.entity_kind) {
            (ChangeAction::Create, EntityKind::Plan) => "create_plan",
            (ChangeAction::Update, EntityKind::Plan) => "update_plan",
            (ChangeAction::Delete, EntityKind::Plan) => "delete_plan",
            (ChangeAction::Create, EntityKind::Service) => "create_service",
            (ChangeAction::Update, EntityKind::Service) => "update_service",
            (ChangeAction::Delete, EntityKind::Service) => "delete_service",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
