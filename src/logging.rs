// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscriber setup for binaries. Libraries only emit `tracing` events.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::PlanSyncConfig;

/// Install the global subscriber: JSON in production, compact otherwise.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &PlanSyncConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.is_production() {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .finish()
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .finish()
            .try_init()
    }
}
