// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic plan-sync usage example.
//!
//! Demonstrates, fully in process:
//! 1. Creating a plan with linked services
//! 2. Conditional reads and a stale-fingerprint write
//! 3. Patching in an extra service
//! 4. Watching the worker project everything into the search index
//! 5. Deleting the plan and its children
//! 6. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use plan_sync::{PlanError, PlanRead, PlanSyncConfig, PlanSyncService, SearchIndex};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             plan-sync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Start an in-memory service and its worker
    // ─────────────────────────────────────────────────────────────────────────
    let service = PlanSyncService::in_memory(PlanSyncConfig {
        receive_timeout_ms: 50,
        ..Default::default()
    });
    service.start_worker();
    println!("✅ Service state: {}\n", service.state());

    let repo = service.repository();
    let index = service.index();

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Create
    // ─────────────────────────────────────────────────────────────────────────
    let created = repo
        .create(json!({
            "objectId": "12xvxc345ssdsds-508",
            "objectType": "plan",
            "planType": "inNetwork",
            "creationDate": "12-12-2017",
            "planCostShares": {"deductible": 2000, "copay": 23, "objectId": "1234vxc2324sdf-501"},
            "linkedPlanServices": [
                {"objectId": "27283xvx9asdff-504", "objectType": "planservice", "name": "Yearly physical"},
                {"objectId": "27283xvx9sdf-507", "objectType": "planservice", "name": "Well baby"}
            ]
        }))
        .await?;
    println!("📝 Created {} (ETag {})", created.object_id, &created.fingerprint[..12]);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Conditional read, then a write with a stale fingerprint
    // ─────────────────────────────────────────────────────────────────────────
    if let PlanRead::NotModified { .. } = repo.get(&created.object_id, Some(&created.fingerprint)).await? {
        println!("📖 GET with current ETag → 304 Not Modified");
    }

    let patched = repo
        .patch(
            &created.object_id,
            json!({"linkedPlanServices": [{"objectId": "3728xvx-600", "name": "Dental"}]}),
            Some(&created.fingerprint),
        )
        .await?;
    println!("🩹 Patched, new ETag {}", &patched.fingerprint[..12]);

    match repo
        .replace(&created.object_id, json!({"objectId": created.object_id.clone()}), Some(&created.fingerprint))
        .await
    {
        Err(PlanError::PreconditionFailed { .. }) => println!("⛔ PUT with the old ETag → 412 Precondition Failed"),
        other => println!("unexpected: {other:?}"),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Wait for the worker to catch up
    // ─────────────────────────────────────────────────────────────────────────
    let children = wait_for(|| index.search_by_parent(&created.object_id), 3).await?;
    println!("\n🔎 Services joined to the plan in the index:");
    for hit in &children {
        println!(
            "   {} (routing {}) {}",
            hit.id,
            hit.routing.as_deref().unwrap_or("-"),
            hit.source.get("name").and_then(|v| v.as_str()).unwrap_or("")
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Delete: children first, then the plan
    // ─────────────────────────────────────────────────────────────────────────
    let deletion = repo.delete(&created.object_id).await?;
    println!("\n🗑️  Deleted plan and {} services", deletion.removed_services.len());
    wait_for(|| index.search_by_parent(&created.object_id), 0).await?;
    println!("   Index holds no dangling children");

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown and metrics
    // ─────────────────────────────────────────────────────────────────────────
    service.shutdown().await;
    let stats = service.worker_stats();
    println!(
        "\n🛑 Worker stopped: applied={} requeued={} dead_lettered={}",
        stats.applied, stats.requeued, stats.dead_lettered
    );
    dump_metrics(&snapshotter);

    Ok(())
}

async fn wait_for<F, Fut>(search: F, expected: usize) -> Result<Vec<plan_sync::IndexHit>, plan_sync::IndexError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<plan_sync::IndexHit>, plan_sync::IndexError>>,
{
    for _ in 0..100 {
        let hits = search().await?;
        if hits.len() == expected {
            return Ok(hits);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    search().await
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("   {}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();

    println!("\n📊 Metrics:");
    for line in lines {
        println!("{line}");
    }
}
