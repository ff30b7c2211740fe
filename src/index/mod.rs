// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search index adapters.
//!
//! Plans and services live in one collection and are told apart by a join
//! field:
//!
//! ```text
//! plan-1   join_field = "plan"
//! svc-1    join_field = {"name": "service", "parent": "plan-1"}   routing = plan-1
//! ```
//!
//! A service must be written with routing equal to its parent id so it lands
//! on the parent's shard; parent-scoped queries (`parent_id`, `has_parent`)
//! only see it there.
//!
//! Implementations:
//! - [`memory::InMemoryIndex`]: join-aware, enforces routing on children
//! - [`elastic::ElasticIndex`]: Elasticsearch over its REST API

pub mod query;
pub mod memory;
pub mod elastic;

pub use query::IndexQuery;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Join field carrying the parent/child relation.
pub const JOIN_FIELD: &str = "join_field";
/// Parent relation name.
pub const PLAN_RELATION: &str = "plan";
/// Child relation name.
pub const SERVICE_RELATION: &str = "service";
/// Denormalized parent id copied onto indexed services.
pub const PARENT_ID_FIELD: &str = "parent_id";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Search index unavailable: {0}")]
    Unavailable(String),
    #[error("Search index request failed with status {status}: {body}")]
    Request { status: u16, body: String },
    #[error("Document '{0}' not found")]
    NotFound(String),
    #[error("Child document '{id}' requires routing to its parent '{parent}'")]
    MissingRouting { id: String, parent: String },
    #[error("Malformed index response: {0}")]
    Response(String),
}

impl IndexError {
    /// Unreachable cluster, 5xx or 429: worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Request { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// A document returned by a search.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    pub routing: Option<String>,
    pub source: Value,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create or fully replace a document.
    async fn index_doc(&self, id: &str, body: &Value, routing: Option<&str>) -> Result<(), IndexError>;

    /// Merge `partial` into an existing document. With `upsert`, a missing
    /// document is created from `partial`; without it, a missing document is
    /// [`IndexError::NotFound`].
    async fn update_doc(&self, id: &str, partial: &Value, routing: Option<&str>, upsert: bool) -> Result<(), IndexError>;

    /// Delete a document. Deleting an absent document succeeds.
    async fn delete_doc(&self, id: &str, routing: Option<&str>) -> Result<(), IndexError>;

    async fn get_doc(&self, id: &str, routing: Option<&str>) -> Result<Option<IndexHit>, IndexError>;

    async fn search(&self, query: &IndexQuery) -> Result<Vec<IndexHit>, IndexError>;

    /// Delete every matching document, returning how many were removed.
    async fn delete_by_query(&self, query: &IndexQuery) -> Result<u64, IndexError>;

    /// Services currently joined to `parent_id`.
    async fn search_by_parent(&self, parent_id: &str) -> Result<Vec<IndexHit>, IndexError> {
        self.search(&IndexQuery::children_of(parent_id)).await
    }
}

/// Join value for a plan document.
#[must_use]
pub fn plan_join() -> Value {
    Value::String(PLAN_RELATION.to_string())
}

/// Join value for a service owned by `parent_id`.
#[must_use]
pub fn service_join(parent_id: &str) -> Value {
    json!({"name": SERVICE_RELATION, "parent": parent_id})
}

/// Parent id named by a document's join field, if it is a child.
#[must_use]
pub fn join_parent(source: &Value) -> Option<&str> {
    source.get(JOIN_FIELD)?.get("parent")?.as_str()
}

/// Relation name of a document's join field (`plan` or `service`).
#[must_use]
pub fn join_name(source: &Value) -> Option<&str> {
    match source.get(JOIN_FIELD)? {
        Value::String(name) => Some(name.as_str()),
        Value::Object(obj) => obj.get("name").and_then(Value::as_str),
        _ => None,
    }
}

/// Plan body as indexed: the parent's own fields tagged with the plan relation.
#[must_use]
pub fn plan_body(mut fields: Map<String, Value>) -> Value {
    fields.insert(JOIN_FIELD.to_string(), plan_join());
    Value::Object(fields)
}

/// Service body as indexed: tagged with the child relation and parent id.
#[must_use]
pub fn service_body(mut fields: Map<String, Value>, parent_id: &str) -> Value {
    fields.insert(PARENT_ID_FIELD.to_string(), Value::String(parent_id.to_string()));
    fields.insert(JOIN_FIELD.to_string(), service_join(parent_id));
    Value::Object(fields)
}
