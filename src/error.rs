// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

use crate::cdc::publisher::PublishError;
use crate::document::DocumentError;
use crate::storage::traits::StorageError;
use crate::validation::ValidationError;

/// Errors returned by [`crate::repository::PlanRepository`].
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Plan '{0}' not found")]
    NotFound(String),
    #[error("Plan '{0}' already exists")]
    Conflict(String),
    #[error("Fingerprint mismatch: expected {expected}, current {actual}")]
    PreconditionFailed { expected: String, actual: String },
    #[error("Invalid data in {path}: {message}")]
    ValidationFailed { path: String, message: String },
    #[error("Change committed but not published: {0}")]
    PublishFailed(String),
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PlanError {
    /// Stable label for metrics.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::PublishFailed(_) => "publish_failed",
            Self::InvalidDocument(_) => "invalid_document",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<ValidationError> for PlanError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationFailed {
            path: err.path_string(),
            message: err.message,
        }
    }
}

impl From<DocumentError> for PlanError {
    fn from(err: DocumentError) -> Self {
        Self::InvalidDocument(err.to_string())
    }
}

impl From<PublishError> for PlanError {
    fn from(err: PublishError) -> Self {
        Self::PublishFailed(err.to_string())
    }
}
