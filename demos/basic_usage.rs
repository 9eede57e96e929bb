// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cdn-storage usage example.
//!
//! Demonstrates:
//! 1. Initializing an in-memory buffer and two local storage units
//! 2. Streaming log lines for one step into the buffer
//! 3. Completing the item and letting resync copy it to both units
//! 4. Reading the content back through each unit
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! Everything lives in a temp dir; no external services are needed.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use cdn_storage::{
    hash_bytes, ApiRef, Configuration, ConvergentConfig, Database, DriverRegistry, Item, ItemStatus, ItemType,
    KeyedCodec, LoadOptions, RunningStorageUnits, StorageConfiguration, Unit,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::io::AsyncReadExt;

fn local_unit(root: &std::path::Path, name: &str, interval_ms: u64, salt: &str, secret: &str) -> StorageConfiguration {
    StorageConfiguration {
        name: name.into(),
        sync_interval_ms: interval_ms,
        kind: "local".into(),
        params: serde_json::json!({ "path": root.join(name) }),
        encryption: vec![ConvergentConfig {
            cipher: "aes-gcm".into(),
            locator_salt: salt.into(),
            secret_value: secret.into(),
        }],
    }
}

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
    println!("║            cdn-storage: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and initialize
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    println!("📦 Working directory: {}", dir.path().display());

    let config = Configuration {
        storages: vec![
            local_unit(dir.path(), "local_storage", 200, "salt-a", "secret-a"),
            local_unit(dir.path(), "local_storage_2", 350, "salt-b", "secret-b"),
        ],
        ..Default::default()
    };
    let db = Database::connect(&format!("sqlite://{}?mode=rwc", dir.path().join("cdn.db").display())).await?;
    let codec = Arc::new(KeyedCodec::new("signing-secret", "encryption-secret"));
    let units = RunningStorageUnits::init(config, db, codec, &DriverRegistry::with_defaults()).await?;
    println!("   State: {}", units.state());

    units.start()?;
    println!("   ✅ Resync running for {} units", units.storages().len());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Stream log lines into the buffer
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Buffering step output...");
    let mut item = Item::new(
        ApiRef {
            project_key: "PROJ".into(),
            workflow_name: Some("build".into()),
            step_order: Some(0),
            step_name: Some("compile".into()),
            ..Default::default()
        },
        ItemType::StepLog,
    )?;
    units.index().insert_item(&mut item).await?;

    let mut buffered = units.new_item_unit(units.buffer().as_ref(), &item)?;
    let lines = ["this is the first log", "this is the second log"];
    for (order, line) in lines.iter().enumerate() {
        units.buffer().add(&buffered, order as f64, line).await?;
        println!("   └─ [{}] {}", order, line);
    }
    units.insert_item_unit(&mut buffered).await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Complete the item and wait for resync
    // ─────────────────────────────────────────────────────────────────────────
    item.hash = hash_bytes(lines.join("\n").as_bytes());
    item.status = ItemStatus::Completed;
    units.index().update_item(&mut item).await?;
    println!("\n⏳ Item {} completed, waiting for resync...", item.id);

    for unit in units.storages() {
        while !unit.item_exists(&item).await? {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        println!("   └─ {} holds the item at {}", unit.name(), unit.new_locator(&item)?);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Read back
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading back through each unit...");
    for unit in units.storages() {
        let mapping = units
            .load_item_unit_by_unit(unit.id(), &item.id, LoadOptions::WITH_DECRYPTION)
            .await?;
        let mut content = String::new();
        unit.new_reader(&mapping).await?.read_to_string(&mut content).await?;
        println!("   └─ {}: {:?}", unit.name(), content);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    units.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", units.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print every captured metric, grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = Vec::new();
    let mut gauges = Vec::new();
    let mut histograms = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = format!("{}{}", key.name(), label_str);

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    println!("   ┌─ Counters");
    for (name, value) in &counters {
        println!("   │  └─ {} = {}", name, value);
    }
    println!("   ├─ Gauges");
    for (name, value) in &gauges {
        println!("   │  └─ {} = {:.2}", name, value);
    }
    println!("   └─ Histograms");
    for (name, count, sum) in &histograms {
        println!("      └─ {} count={} sum={:.4}", name, count, sum);
    }
}
