// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Plan documents.
//!
//! A [`PlanDocument`] is a JSON object with a mandatory string `objectId` and
//! an optional ordered `linkedPlanServices` array. Each linked service is
//! itself an object with its own `objectId`; the repository and the index
//! both treat those as independent entities owned by the plan.
//!
//! # Example
//!
//! ```
//! use plan_sync::document::PlanDocument;
//! use serde_json::json;
//!
//! let plan = PlanDocument::from_value(json!({
//!     "objectId": "plan-1",
//!     "planType": "inNetwork",
//!     "linkedPlanServices": [{"objectId": "svc-1", "objectType": "planservice"}]
//! })).unwrap();
//!
//! assert_eq!(plan.object_id(), "plan-1");
//! assert_eq!(plan.linked_services().len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::fingerprint;

/// Identifier field shared by plans and linked services.
pub const OBJECT_ID: &str = "objectId";
/// Embedded collection of linked services.
pub const LINKED_SERVICES: &str = "linkedPlanServices";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("document must be a JSON object")]
    NotAnObject,
    #[error("document is missing a non-empty string objectId")]
    MissingObjectId,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A stored plan: a typed field map with a guaranteed `objectId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct PlanDocument {
    fields: Map<String, Value>,
}

impl PlanDocument {
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(fields) => Self::from_fields(fields),
            _ => Err(DocumentError::NotAnObject),
        }
    }

    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, DocumentError> {
        match fields.get(OBJECT_ID).and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(Self { fields }),
            _ => Err(DocumentError::MissingObjectId),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    #[must_use]
    pub fn object_id(&self) -> &str {
        // Checked non-empty at construction and never removed.
        self.fields.get(OBJECT_ID).and_then(Value::as_str).unwrap_or_default()
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Linked services that carry a usable `objectId`, in document order.
    ///
    /// Entries without an id cannot be addressed in either store and are skipped.
    #[must_use]
    pub fn linked_services(&self) -> Vec<LinkedService> {
        match self.fields.get(LINKED_SERVICES) {
            Some(Value::Array(items)) => items.iter().filter_map(LinkedService::from_value).collect(),
            _ => Vec::new(),
        }
    }

    /// Split into the parent's own fields and its embedded services.
    #[must_use]
    pub fn into_parts(mut self) -> (Map<String, Value>, Vec<LinkedService>) {
        let services = match self.fields.remove(LINKED_SERVICES) {
            Some(Value::Array(items)) => items.iter().filter_map(LinkedService::from_value).collect(),
            _ => Vec::new(),
        };
        (self.fields, services)
    }

    /// Shallow merge used by PATCH.
    ///
    /// `linkedPlanServices` entries in `partial` are appended to the existing
    /// collection, never replaced or deduplicated. Every other top-level field
    /// in `partial` overwrites the existing field wholesale. The result is not
    /// validated here; callers must validate before persisting.
    #[must_use]
    pub fn merge_patch(&self, partial: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = self.fields.clone();
        for (key, value) in partial {
            if key == LINKED_SERVICES {
                match (merged.get_mut(LINKED_SERVICES), value) {
                    (Some(Value::Array(existing)), Value::Array(extra)) => {
                        existing.extend(extra.iter().cloned());
                    }
                    _ => {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Bytes as written to the primary store.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        fingerprint::canonical_bytes(&Value::Object(self.fields.clone()))
    }

    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint::fingerprint(&Value::Object(self.fields.clone()))
    }
}

impl TryFrom<Value> for PlanDocument {
    type Error = DocumentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<PlanDocument> for Value {
    fn from(doc: PlanDocument) -> Self {
        Value::Object(doc.fields)
    }
}

/// A service embedded in a plan, addressable on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedService {
    pub object_id: String,
    pub body: Map<String, Value>,
}

impl LinkedService {
    pub fn from_value(value: &Value) -> Option<Self> {
        let body = value.as_object()?;
        let object_id = body.get(OBJECT_ID)?.as_str()?;
        if object_id.is_empty() {
            return None;
        }
        Some(Self {
            object_id: object_id.to_string(),
            body: body.clone(),
        })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// A linked service as stored on its own, tagged with the plan that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "parentId")]
    pub parent_id: String,
    pub service: Value,
}

impl ServiceEntry {
    #[must_use]
    pub fn new(service: &LinkedService, parent_id: &str) -> Self {
        Self {
            parent_id: parent_id.to_string(),
            service: service.to_value(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let value = serde_json::json!({"parentId": self.parent_id, "service": self.service});
        fingerprint::canonical_bytes(&value)
    }
}
