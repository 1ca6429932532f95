//! Driftsync demo - two devices, one backend.
//!
//! This demo walks through the engine's main flows:
//! - registering a record kind and enabling sync on two engines
//! - a local write on device A reaching device B through the backend
//! - last-write-wins resolution when both devices mutate the same record
//! - presence gating the realtime channel
//!
//! Run with: cargo run -p two_devices
//! Set RUST_LOG=driftsync_engine=debug for engine internals.

use chrono::Utc;
use driftsync_engine::{EngineConfig, SyncEngine, SyncHandle};
use driftsync_model::{EnvelopeCodec, OwnerId, RecordKind, SyncRecord};
use driftsync_store::{LocalStore, MemoryBackend, MemoryLocalStore, MemoryTimestampStore};
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type Device = (
    SyncEngine<MemoryLocalStore, MemoryBackend>,
    MemoryLocalStore,
    SyncHandle,
);

async fn start_device(name: &str, backend: &MemoryBackend) -> Result<Device, Box<dyn Error>> {
    let local = MemoryLocalStore::new();
    let engine = SyncEngine::with_timestamp_store(
        EngineConfig::default().with_drain_interval(Duration::from_millis(200)),
        local.clone(),
        backend.clone(),
        Arc::new(MemoryTimestampStore::new()),
    );
    let notes = engine.register("notes", "notes_v1", Arc::new(EnvelopeCodec))?;
    engine.set_user_id(Some(OwnerId::new("ada"))).await?;
    engine.enable_sync().await?;
    println!("[{name}] online, subscribed to backend: {}", engine.is_subscribed_to_backend());
    Ok((engine, local, notes))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let backend = MemoryBackend::new();
    let kind = RecordKind::new("notes");

    let (engine_a, local_a, notes_a) = start_device("device-a", &backend).await?;
    let (engine_b, local_b, notes_b) = start_device("device-b", &backend).await?;

    // Device A captures a note while B is elsewhere.
    let note_id = Uuid::new_v4().to_string();
    println!("\n[device-a] writing note {note_id}");
    local_a
        .insert(
            &kind,
            &SyncRecord::new(note_id.as_str(), Utc::now())
                .with_owner("ada")
                .with_field("title", json!("buy oat milk")),
        )
        .await?;
    engine_a.flush().await;
    engine_b.flush().await;

    let on_b = local_b.records(&kind);
    println!("[device-b] sees {} record(s): {:?}", on_b.len(), on_b[0].fields.get("title"));

    // Device B edits the same note a moment later; its newer timestamp
    // wins on every replica.
    println!("\n[device-b] editing the note");
    local_b
        .replace(
            &kind,
            &SyncRecord::new(note_id.as_str(), Utc::now())
                .with_owner("ada")
                .with_field("title", json!("buy oat milk and coffee")),
        )
        .await?;
    engine_b.flush().await;
    engine_a.flush().await;

    let on_a = local_a.records(&kind);
    println!("[device-a] now sees: {:?}", on_a[0].fields.get("title"));

    // Device A learns that no other device has been active for an hour;
    // the presence gate drops its realtime channel and skips pulls.
    println!("\n[device-a] other devices idle, presence gate closes");
    engine_a
        .set_last_time_other_device_was_active(Some(Utc::now() - chrono::Duration::hours(1)))
        .await?;
    println!(
        "[device-a] subscribed to backend: {}",
        engine_a.is_subscribed_to_backend()
    );

    println!("\ncounters:");
    println!(
        "  device-a pushed={} pulled={} full_syncs={}",
        engine_a.pushed_count(&notes_a),
        engine_a.pulled_count(&notes_a),
        engine_a.full_sync_count()
    );
    println!(
        "  device-b pushed={} pulled={} full_syncs={}",
        engine_b.pushed_count(&notes_b),
        engine_b.pulled_count(&notes_b),
        engine_b.full_sync_count()
    );

    engine_a.dispose();
    engine_b.dispose();
    Ok(())
}
