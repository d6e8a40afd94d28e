//! Scénarios de réconciliation de bout en bout sur la table en mémoire.

use bintel_kernel::backing::{MemoryTable, TelemetryTable};
use bintel_kernel::clock::ManualClock;
use bintel_kernel::config::EngineConfig;
use bintel_kernel::connection::ConnectionState;
use bintel_kernel::fleet::seed_fleet;
use bintel_kernel::models::{ChangeKind, DeviceStatus, TelemetryRow, UpdateSource};
use bintel_kernel::reconcile::IngestOutcome;
use bintel_kernel::TelemetryEngine;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poll.interval_ms = 20;
    config.reconnect.initial_backoff_ms = 10;
    config.reconnect.max_backoff_ms = 40;
    config.synthetic.tick_ms = 10;
    config.synthetic.seed = Some(42);
    config
}

fn engine_on(table: &Arc<MemoryTable>, config: EngineConfig) -> TelemetryEngine {
    TelemetryEngine::new(config, seed_fleet(), table.clone(), table.clone()).unwrap()
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn row_at(bin: u32, fill: f64, created_at: &str) -> TelemetryRow {
    TelemetryRow { created_at: Some(created_at.to_string()), ..TelemetryRow::reading(bin, fill, None) }
}

#[tokio::test]
async fn same_record_on_both_channels_applies_once() {
    let table = Arc::new(MemoryTable::new());
    let mut config = fast_config();
    config.poll.interval_ms = 60_000;
    config.synthetic.update_probability = 0.0;
    let engine = engine_on(&table, config);
    assert_eq!(engine.device(1001).unwrap().fill_level, 0.0);

    let record = row_at(1001, 45.0, "1970-01-01T00:00:00.100Z");
    table.insert_silently(record.clone());
    engine.start();
    eventually("poll applies the record", || engine.status().poll.applied == 1).await;
    eventually("push connected", || engine.connection_state() == ConnectionState::Connected).await;

    table.emit(ChangeKind::Insert, record).await;
    eventually("push sees the redelivery", || engine.status().push.duplicates == 1).await;

    let older = row_at(1001, 10.0, "1970-01-01T00:00:00.090Z");
    table.emit(ChangeKind::Insert, older).await;
    eventually("push sees the late record", || engine.status().push.duplicates == 2).await;

    assert_eq!(engine.device(1001).unwrap().fill_level, 45.0);
    assert_eq!(engine.snapshot().revision, 1);
    assert_eq!(engine.status().push.applied, 0);
    assert_eq!(engine.status().poll.applied, 1);
    engine.stop();
}

#[tokio::test]
async fn critical_count_matches_recount_while_running() {
    let table = Arc::new(MemoryTable::new());
    let mut config = fast_config();
    config.synthetic.update_probability = 1.0;
    config.synthetic.delta_min = -30;
    config.synthetic.delta_max = 30;
    let engine = engine_on(&table, config);
    engine.start();

    for i in 0..50u32 {
        engine.simulate(1001, f64::from(i * 7 % 101), None);
        let snapshot = engine.snapshot();
        let recount = snapshot.devices.iter().filter(|d| d.status == DeviceStatus::Critical).count();
        assert_eq!(snapshot.stats.critical_bins, recount);
        assert_eq!(snapshot.stats.total_bins, 8);
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    engine.stop();
}

#[tokio::test]
async fn poll_alone_converges_when_push_is_down() {
    let table = Arc::new(MemoryTable::new());
    table.fail_next_subscribes(usize::MAX);
    let engine = engine_on(&table, fast_config());
    engine.start();

    table.insert(TelemetryRow::reading(1001, 72.0, Some(81.0))).await.unwrap();
    eventually("poll applies the row", || engine.device(1001).is_some_and(|d| d.fill_level == 72.0)).await;

    let device = engine.device(1001).unwrap();
    assert_eq!(device.status, DeviceStatus::Warning);
    assert_eq!(device.battery_level, 81.0);
    assert_ne!(engine.connection_state(), ConnectionState::Connected);
    assert!(engine.status().push.failures > 0);
    engine.stop();
}

#[tokio::test]
async fn transient_fetch_failures_do_not_stop_polling() {
    let table = Arc::new(MemoryTable::new());
    table.fail_next_fetches(3);
    let engine = engine_on(&table, fast_config());
    engine.start();

    table.insert_silently(TelemetryRow::reading(1001, 33.0, None));
    eventually("row applied after failures", || engine.device(1001).is_some_and(|d| d.fill_level == 33.0)).await;
    assert!(engine.status().poll.failures >= 3);
    assert!(engine.is_running());
    engine.stop();
}

#[tokio::test]
async fn push_delivers_without_waiting_for_poll() {
    let table = Arc::new(MemoryTable::new());
    let mut config = fast_config();
    config.poll.interval_ms = 60_000;
    let engine = engine_on(&table, config);
    engine.start();
    eventually("push connected", || engine.connection_state() == ConnectionState::Connected).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.subscribe(move |u| {
        if u.device_id == 1001 {
            sink.lock().push(u.source);
        }
    });

    table.insert(TelemetryRow::reading(1001, 58.0, None)).await.unwrap();
    eventually("push applies the row", || engine.device(1001).is_some_and(|d| d.fill_level == 58.0)).await;
    assert_eq!(*seen.lock(), vec![UpdateSource::Push]);
    assert!(engine.liveness().is_live());
    engine.stop();
}

#[tokio::test]
async fn stop_is_safe_before_start_and_repeatable() {
    let table = Arc::new(MemoryTable::new());
    let engine = engine_on(&table, fast_config());
    engine.stop();
    engine.start();
    eventually("subscribed", || table.live_feeds() == 1).await;
    engine.stop();
    engine.stop();
    eventually("feed released", || table.live_feeds() == 0).await;
    assert!(!engine.is_running());

    let calls = table.fetch_calls();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(table.fetch_calls(), calls);
}

#[tokio::test]
async fn dedup_survives_restart() {
    let table = Arc::new(MemoryTable::new());
    let engine = engine_on(&table, fast_config());
    let record = row_at(1001, 45.0, "2024-05-01T12:00:00Z");
    table.insert_silently(record.clone());
    engine.poll_channel().poll_once().await.unwrap();

    engine.start();
    engine.stop();
    engine.start();
    assert_eq!(engine.push_channel().handle_row(ChangeKind::Insert, &record), Some(IngestOutcome::Duplicate));
    engine.stop();
}

#[tokio::test]
async fn engines_are_independent() {
    let (ta, tb) = (Arc::new(MemoryTable::new()), Arc::new(MemoryTable::new()));
    let a = engine_on(&ta, fast_config());
    let b = engine_on(&tb, fast_config());

    a.simulate(1002, 95.0, None);
    assert_eq!(a.device(1002).unwrap().status, DeviceStatus::Critical);
    assert_eq!(b.device(1002).unwrap().fill_level, 30.0);

    let hits = Arc::new(Mutex::new(0));
    let counter = hits.clone();
    b.subscribe(move |_| *counter.lock() += 1);
    a.simulate(1003, 10.0, None);
    assert_eq!(*hits.lock(), 0);
}

#[test]
fn stalled_instrumented_bin_is_forced_idle_once() {
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
    let table = Arc::new(MemoryTable::new());
    let engine =
        TelemetryEngine::with_clock(fast_config(), seed_fleet(), table.clone(), table.clone(), clock.clone()).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.subscribe(move |u| sink.lock().push((u.source, u.fill_level)));

    engine.simulate(1001, 77.0, None);
    assert!(engine.liveness().is_live());

    clock.advance(time::Duration::seconds(119));
    assert!(!engine.liveness().check());
    assert_eq!(engine.device(1001).unwrap().fill_level, 77.0);

    clock.advance(time::Duration::seconds(2));
    assert!(engine.liveness().check());
    assert!(!engine.liveness().check());

    let device = engine.device(1001).unwrap();
    assert_eq!(device.fill_level, 0.0);
    assert_eq!(device.status, DeviceStatus::Normal);
    assert_eq!(*events.lock(), vec![(UpdateSource::Manual, 77.0), (UpdateSource::Liveness, 0.0)]);
}
