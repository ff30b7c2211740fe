// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structural validation seam.
//!
//! The repository calls a [`Validator`] on create, on replace (configurable)
//! and always on the merged result of a patch. Full JSON-schema rules live
//! outside this crate; [`StructuralValidator`] enforces the shape the sync
//! pipeline itself relies on.

use serde_json::Value;
use thiserror::Error;

use crate::document::{LINKED_SERVICES, OBJECT_ID};

/// A structural violation, located by field path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid data in {}: {}", display_path(.path), .message)]
pub struct ValidationError {
    /// Path segments from the document root; empty means the root itself.
    pub path: Vec<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }

    /// Path rendered as `linkedPlanServices -> 1 -> objectId`.
    #[must_use]
    pub fn path_string(&self) -> String {
        display_path(&self.path)
    }
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "unknown field".to_string()
    } else {
        path.join(" -> ")
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, document: &Value) -> Result<(), ValidationError>;
}

/// Accepts every document. Useful when validation happens upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(&self, _document: &Value) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Checks the invariants the sync pipeline depends on:
///
/// - the document is an object with a non-empty string `objectId`
/// - any configured required top-level fields are present and non-null
/// - `linkedPlanServices`, when present, is an array of objects, each with a
///   non-empty string `objectId`
#[derive(Debug, Clone, Default)]
pub struct StructuralValidator {
    required: Vec<String>,
}

impl StructuralValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an additional top-level field.
    #[must_use]
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    fn check_object_id(value: Option<&Value>, path: &[String]) -> Result<(), ValidationError> {
        let mut field_path = path.to_vec();
        field_path.push(OBJECT_ID.to_string());
        match value {
            Some(Value::String(s)) if !s.is_empty() => Ok(()),
            Some(Value::String(_)) => Err(ValidationError::new(field_path, "objectId must not be empty")),
            Some(_) => Err(ValidationError::new(field_path, "objectId must be a string")),
            None => Err(ValidationError::new(field_path, "'objectId' is a required property")),
        }
    }
}

impl Validator for StructuralValidator {
    fn validate(&self, document: &Value) -> Result<(), ValidationError> {
        let Some(fields) = document.as_object() else {
            return Err(ValidationError::new(Vec::new(), "document must be an object"));
        };

        Self::check_object_id(fields.get(OBJECT_ID), &[])?;

        for field in &self.required {
            match fields.get(field) {
                Some(Value::Null) | None => {
                    return Err(ValidationError::new(
                        vec![field.clone()],
                        format!("'{}' is a required property", field),
                    ));
                }
                Some(_) => {}
            }
        }

        if let Some(services) = fields.get(LINKED_SERVICES) {
            let Some(items) = services.as_array() else {
                return Err(ValidationError::new(
                    vec![LINKED_SERVICES.to_string()],
                    "linkedPlanServices must be an array",
                ));
            };
            for (i, item) in items.iter().enumerate() {
                let path = vec![LINKED_SERVICES.to_string(), i.to_string()];
                let Some(service) = item.as_object() else {
                    return Err(ValidationError::new(path, "linked service must be an object"));
                };
                Self::check_object_id(service.get(OBJECT_ID), &path)?;
            }
        }

        Ok(())
    }
}
