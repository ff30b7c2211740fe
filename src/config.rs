// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for plan-sync.
//!
//! # Example
//!
//! ```
//! use plan_sync::PlanSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = PlanSyncConfig::default();
//! assert_eq!(config.queue_name, "elastic_queue");
//! assert_eq!(config.max_delivery_attempts, 5);
//!
//! // Full config
//! let config = PlanSyncConfig {
//!     redis_url: "redis://cache.internal:6379".into(),
//!     redis_prefix: Some("plans:".into()),
//!     index_url: "http://search.internal:9200".into(),
//!     strict_publish: true,
//!     ..Default::default()
//! };
//! ```
//!
//! # Environment
//!
//! [`PlanSyncConfig::load`] reads `PLAN_SYNC__<FIELD>` variables on top of
//! the defaults, e.g. `PLAN_SYNC__INDEX_NAME=plans_v2`.

use std::time::Duration;

use serde::Deserialize;

use crate::repository::RepositoryOptions;
use crate::worker::WorkerConfig;

/// Configuration for the repository, the queue and the index worker.
///
/// All fields have defaults pointing at local Redis and Elasticsearch.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanSyncConfig {
    /// Redis connection string for the primary store and the queue
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix for primary store entries (e.g. "plans:")
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Name of the durable change queue
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Elasticsearch base URL
    #[serde(default = "default_index_url")]
    pub index_url: String,

    /// Search index holding plans and services
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Deliveries of one event before it is dead-lettered
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Worker receive block time; bounds shutdown latency
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Validate replacement bodies on PUT
    #[serde(default = "default_true")]
    pub validate_on_replace: bool,

    /// Fail mutations whose change events could not be queued
    #[serde(default)]
    pub strict_publish: bool,

    /// "production" switches logs to JSON
    #[serde(default = "default_app_env")]
    pub app_env: String,

    /// `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_queue_name() -> String { "elastic_queue".to_string() }
fn default_index_url() -> String { "http://localhost:9200".to_string() }
fn default_index_name() -> String { "plans".to_string() }
fn default_max_delivery_attempts() -> u32 { 5 }
fn default_receive_timeout_ms() -> u64 { 1000 }
fn default_true() -> bool { true }
fn default_app_env() -> String { "development".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for PlanSyncConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            redis_prefix: None,
            queue_name: default_queue_name(),
            index_url: default_index_url(),
            index_name: default_index_name(),
            max_delivery_attempts: default_max_delivery_attempts(),
            receive_timeout_ms: default_receive_timeout_ms(),
            validate_on_replace: default_true(),
            strict_publish: false,
            app_env: default_app_env(),
            log_level: default_log_level(),
        }
    }
}

impl PlanSyncConfig {
    /// Defaults overlaid with `PLAN_SYNC__*` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("PLAN_SYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    #[must_use]
    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            validate_on_replace: self.validate_on_replace,
            strict_publish: self.strict_publish,
        }
    }

    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_delivery_attempts: self.max_delivery_attempts.max(1),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            ..WorkerConfig::default()
        }
    }
}
