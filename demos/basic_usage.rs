// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic message-ingest usage example.
//!
//! Demonstrates:
//! 1. Starting the engine on a throwaway SQLite file
//! 2. Staging a batch with duplicates
//! 3. Committing staged records and attachments
//! 4. Syncing a scope and reading its checkpoint
//! 5. Hitting the rate limiter
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::time::Duration;

use message_ingest::{
    Attachment, BackpressurePolicy, EngineState, IngestConfig, IngestEngine, RateLimiterConfig,
    Record, ScopeKey, StagingStatus,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the engine emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           message-ingest: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring message-ingest...");
    let dir = tempfile::tempdir()?;
    let config = IngestConfig {
        sql_url: Some(format!("sqlite://{}/ingest.db?mode=rwc", dir.path().display())),
        // Small bucket so step 5 has something to show
        rate_limit: RateLimiterConfig::new(20.0, 5.0, 20.0),
        backpressure: BackpressurePolicy::Reject,
        ..Default::default()
    };

    let mut engine = IngestEngine::new(config)?;
    println!("   State: {}", engine.state());

    println!("\n🚀 Starting engine...");
    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Running);
    println!("   ✅ Engine ready! State: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Stage a batch (with one repeat)
    // ─────────────────────────────────────────────────────────────────────────
    let scope = ScopeKey::new(100, 456);
    let batch = vec![
        Record::new(787, scope, 1, "first!"),
        Record::new(788, scope, 2, "hello there"),
        Record::new(789, scope, 1, "general kenobi").with_reply_to(788),
        Record::new(788, scope, 2, "hello there"),
    ];

    println!("\n📝 Staging {} records...", batch.len());
    let outcome = engine.stage_batch(&batch, true).await?;
    println!("   └─ staged={} duplicates={}", outcome.staged, outcome.duplicates);

    let again = engine.stage_batch(&batch[..1], true).await?;
    println!("   └─ re-staging 787: staged={} duplicates={}", again.staged, again.duplicates);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Commit records, then their attachments
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏳ Committing staged records...");
    let committed = engine.process_staged_batch(None).await?;
    println!("   ✅ Committed {} records", committed);

    let files = vec![Attachment::new(9001, 789, "kenobi.gif", "https://cdn.example/kenobi.gif")];
    let staged_files = engine.stage_attachments(789, &files).await?;
    let committed_files = engine.process_staged_attachments(None).await?;
    println!("   └─ attachments: staged={} committed={}", staged_files, committed_files);

    let stats = engine.staging_stats().await?;
    println!(
        "   └─ staging: pending={} completed={}",
        stats.records_in(StagingStatus::Pending),
        stats.records_in(StagingStatus::Completed)
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Sync the scope
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Syncing scope {}...", scope);
    let first = engine.sync_scope(100, 456, None).await?;
    let second = engine.sync_scope(100, 456, None).await?;
    println!("   └─ first pass: {} new, second pass: {} new", first, second);
    if let Some(checkpoint) = engine.get_checkpoint(100, 456).await? {
        println!("   └─ checkpoint {} → last_message_id={}", checkpoint.id, checkpoint.last_message_id);
    }

    let replies = engine.replies_to(788).await?;
    println!("   └─ replies to 788: {:?}", replies.iter().map(|r| r.id).collect::<Vec<_>>());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Exhaust the bucket
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚦 Hammering sync until the limiter pushes back...");
    let mut admitted = 0;
    loop {
        match engine.sync_scope(100, 456, None).await {
            Ok(_) => admitted += 1,
            Err(e) if e.is_rate_limited() => {
                println!("   └─ refused after {} calls: {}", admitted, e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!("   └─ is_rate_limited: {}", engine.is_rate_limited());
    tokio::time::sleep(Duration::from_millis(1100)).await;
    println!("   └─ after 1.1s: {:.1} tokens", engine.available_tokens());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Health and raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🩺 Health:");
    println!("   └─ {}", serde_json::to_string(&engine.health().await)?);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
