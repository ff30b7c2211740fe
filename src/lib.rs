// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Plan Sync
//!
//! A plan repository with fingerprint (ETag) concurrency control, and a
//! durable, ordered pipeline that keeps a parent/child search index
//! eventually consistent with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Plan Repository                        │
//! │  • create / get / replace / patch / delete                 │
//! │  • If-Match style fingerprint preconditions                │
//! │  • linked services stored as their own entries             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (commit to primary store, then publish)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Durable Change Queue                       │
//! │  • at-least-once, FIFO, prefetch 1                         │
//! │  • Redis reliable queue (ready / processing lists)         │
//! │  • dead-letter list for poison events                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (apply fully, then ack)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Index Sync Worker                         │
//! │  • plans indexed with join_field = "plan"                  │
//! │  • services indexed as children, routed to their plan      │
//! │  • plan delete cascades to children by query               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plan_sync::{PlanRead, PlanSyncConfig, PlanSyncService};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = PlanSyncService::connect(PlanSyncConfig::default())
//!         .await
//!         .expect("Failed to connect");
//!     service.start_worker();
//!
//!     let repo = service.repository();
//!     let created = repo
//!         .create(json!({
//!             "objectId": "plan-1",
//!             "linkedPlanServices": [{"objectId": "svc-1"}]
//!         }))
//!         .await
//!         .expect("Failed to create");
//!
//!     // Conditional read: the current fingerprint short-circuits the body
//!     let read = repo.get("plan-1", Some(&created.fingerprint)).await.unwrap();
//!     assert!(matches!(read, PlanRead::NotModified { .. }));
//!
//!     service.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`repository`]: the [`PlanRepository`] and its mutation results
//! - [`document`]: plan documents and the patch merge
//! - [`fingerprint`]: canonical JSON hashing
//! - [`storage`]: primary store backends (Redis, memory)
//! - [`cdc`]: change events and the publisher
//! - [`queue`]: durable queue backends (Redis, memory)
//! - [`index`]: search index backends (Elasticsearch, memory) and queries
//! - [`worker`]: the index sync worker
//! - [`service`]: wiring and lifecycle

pub mod config;
pub mod document;
pub mod error;
pub mod fingerprint;
pub mod storage;
pub mod validation;
pub mod resilience;
pub mod cdc;
pub mod queue;
pub mod index;
pub mod repository;
pub mod worker;
pub mod service;
pub mod metrics;
pub mod logging;

pub use config::PlanSyncConfig;
pub use document::{LinkedService, PlanDocument, ServiceEntry};
pub use error::PlanError;
pub use storage::traits::{PrimaryStore, StorageError};
pub use validation::{StructuralValidator, ValidationError, Validator};
pub use cdc::{ChangeAction, ChangeEvent, EntityKind};
pub use cdc::publisher::{ChangePublisher, PublishError};
pub use queue::{Delivery, DurableQueue, QueueError};
pub use index::{IndexError, IndexHit, IndexQuery, SearchIndex};
pub use repository::{Deletion, Mutation, PlanRead, PlanRepository, PublishOutcome, RepositoryOptions};
pub use worker::{ApplyError, IndexSyncWorker, Outcome, WorkerConfig, WorkerStats};
pub use service::{PlanSyncService, ServiceError, ServiceState};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
