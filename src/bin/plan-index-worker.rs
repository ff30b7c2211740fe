// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index sync worker process.
//!
//! Consumes the change queue and applies events to the search index until
//! interrupted. Configured through `PLAN_SYNC__*` environment variables.

use plan_sync::logging::init_tracing;
use plan_sync::{PlanSyncConfig, PlanSyncService};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PlanSyncConfig::load()?;
    init_tracing(&config)?;

    info!(
        queue = %config.queue_name,
        index = %config.index_name,
        max_attempts = config.max_delivery_attempts,
        "plan-index-worker starting"
    );

    let service = PlanSyncService::connect(config).await?;
    service.start_worker();

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, finishing current delivery");
    service.shutdown().await;

    let stats = service.worker_stats();
    info!(
        applied = stats.applied,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        "plan-index-worker stopped"
    );
    Ok(())
}
