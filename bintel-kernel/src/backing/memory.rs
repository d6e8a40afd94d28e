//! Table de télémétrie en mémoire.
//!
//! Implémente les deux côtés du backing store pour faire tourner le moteur
//! sans Postgres ni broker. On peut y injecter des pannes (lectures en échec,
//! abonnements refusés, flux coupés) pour passer par les chemins de reprise.

use super::{ChangeEvent, ChangeFeed, ChangeSubscription, TelemetryTable};
use crate::error::StoreError;
use crate::models::{ChangeKind, DeviceId, TelemetryRow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;

const FEED_CAPACITY: usize = 64;

#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<Vec<TelemetryRow>>,
    next_id: Mutex<i64>,
    feeds: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
    failing_fetches: AtomicUsize,
    failing_subscribes: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stocke une ligne sans émettre d'événement (une écriture ratée par le
    /// canal push).
    pub fn insert_silently(&self, row: TelemetryRow) -> TelemetryRow {
        let row = self.stamp(row);
        self.rows.lock().push(row.clone());
        row
    }

    /// Émet un événement sans toucher à la table (une relivraison).
    pub async fn emit(&self, kind: ChangeKind, row: TelemetryRow) {
        self.broadcast(ChangeEvent::Row { kind, row }).await;
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Termine chaque abonnement actif avec `event` (Closed ou Error).
    pub async fn drop_feeds(&self, event: ChangeEvent) {
        let feeds: Vec<_> = std::mem::take(&mut *self.feeds.lock());
        for feed in feeds {
            let _ = feed.send(event.clone()).await;
        }
    }

    pub fn live_feeds(&self) -> usize {
        let mut feeds = self.feeds.lock();
        feeds.retain(|f| !f.is_closed());
        feeds.len()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<TelemetryRow> {
        self.rows.lock().clone()
    }

    fn stamp(&self, mut row: TelemetryRow) -> TelemetryRow {
        let mut next_id = self.next_id.lock();
        *next_id += 1;
        row.id = Some(*next_id);
        if row.created_at.is_none() {
            row.created_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        }
        row
    }

    async fn broadcast(&self, event: ChangeEvent) {
        let feeds: Vec<_> = {
            let mut feeds = self.feeds.lock();
            feeds.retain(|f| !f.is_closed());
            feeds.clone()
        };
        for feed in feeds {
            let _ = feed.send(event.clone()).await;
        }
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn created_at(row: &TelemetryRow) -> Option<OffsetDateTime> {
    row.created_at.as_deref().and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

/// Plus récent d'abord ; les lignes sans date passent en dernier, l'id départage.
fn newest_first(rows: &mut [TelemetryRow]) {
    rows.sort_by(|a, b| created_at(b).cmp(&created_at(a)).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl TelemetryTable for MemoryTable {
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<TelemetryRow>, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&self.failing_fetches) {
            return Err(StoreError::Unavailable("injected fetch failure".into()));
        }
        let mut rows = self.rows.lock().clone();
        newest_first(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn fetch_latest(&self, device_id: DeviceId) -> Result<Option<TelemetryRow>, StoreError> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .iter()
            .filter(|r| r.bin_id == Some(i64::from(device_id)))
            .cloned()
            .collect();
        newest_first(&mut rows);
        Ok(rows.into_iter().next())
    }

    async fn insert(&self, row: TelemetryRow) -> Result<(), StoreError> {
        let row = self.insert_silently(row);
        self.broadcast(ChangeEvent::Row { kind: ChangeKind::Insert, row }).await;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryTable {
    async fn subscribe(&self) -> Result<ChangeSubscription, StoreError> {
        if Self::take_fault(&self.failing_subscribes) {
            return Err(StoreError::Unavailable("injected subscribe failure".into()));
        }
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        tx.send(ChangeEvent::Acknowledged).await.map_err(|_| StoreError::Closed)?;
        self.feeds.lock().push(tx);
        Ok(ChangeSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_rows_are_newest_first_and_limited() {
        let table = MemoryTable::new();
        for (i, ts) in ["2024-01-01T00:00:01Z", "2024-01-01T00:00:03Z", "2024-01-01T00:00:02Z"].iter().enumerate() {
            let row = TelemetryRow { created_at: Some(ts.to_string()), ..TelemetryRow::reading(1001, i as f64, None) };
            table.insert_silently(row);
        }
        let rows = table.fetch_recent(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].created_at.as_deref(), Some("2024-01-01T00:00:03Z"));
        assert_eq!(rows[1].created_at.as_deref(), Some("2024-01-01T00:00:02Z"));
    }

    #[tokio::test]
    async fn ordering_ignores_fraction_width() {
        let table = MemoryTable::new();
        table.insert_silently(TelemetryRow { created_at: Some("2024-01-01T00:00:01.5Z".into()), ..TelemetryRow::reading(1001, 1.0, None) });
        table.insert_silently(TelemetryRow { created_at: Some("2024-01-01T00:00:01Z".into()), ..TelemetryRow::reading(1001, 2.0, None) });
        table.insert_silently(TelemetryRow { created_at: Some("2024-01-01T00:00:02Z".into()), ..TelemetryRow::reading(1001, 3.0, None) });
        let fills: Vec<_> = table.fetch_recent(3).await.unwrap().iter().map(|r| r.fill_level).collect();
        assert_eq!(fills, vec![Some(3.0), Some(1.0), Some(2.0)]);
        assert_eq!(table.fetch_latest(1001).await.unwrap().unwrap().fill_level, Some(3.0));
    }

    #[tokio::test]
    async fn emitted_events_reach_feeds_without_a_row() {
        let table = MemoryTable::new();
        let mut sub = table.subscribe().await.unwrap();
        assert_eq!(sub.next().await, Some(ChangeEvent::Acknowledged));
        table.emit(ChangeKind::Update, TelemetryRow::reading(1002, 5.0, None)).await;
        assert!(matches!(sub.next().await, Some(ChangeEvent::Row { kind: ChangeKind::Update, .. })));
        assert!(table.rows().is_empty());
    }

    #[tokio::test]
    async fn injected_fetch_failures_are_consumed() {
        let table = MemoryTable::new();
        table.fail_next_fetches(1);
        assert!(table.fetch_recent(5).await.is_err());
        assert!(table.fetch_recent(5).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_receive_ack_then_inserts() {
        let table = MemoryTable::new();
        let mut sub = table.subscribe().await.unwrap();
        assert_eq!(sub.next().await, Some(ChangeEvent::Acknowledged));
        table.insert(TelemetryRow::reading(1001, 33.0, Some(90.0))).await.unwrap();
        match sub.next().await {
            Some(ChangeEvent::Row { kind: ChangeKind::Insert, row }) => assert_eq!(row.fill_level, Some(33.0)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_subscription_is_released() {
        let table = MemoryTable::new();
        let sub = table.subscribe().await.unwrap();
        assert_eq!(table.live_feeds(), 1);
        drop(sub);
        assert_eq!(table.live_feeds(), 0);
    }

    #[tokio::test]
    async fn latest_row_for_one_device() {
        let table = MemoryTable::new();
        table.insert_silently(TelemetryRow { created_at: Some("2024-01-01T00:00:01Z".into()), ..TelemetryRow::reading(1001, 10.0, None) });
        table.insert_silently(TelemetryRow { created_at: Some("2024-01-01T00:00:05Z".into()), ..TelemetryRow::reading(1001, 20.0, None) });
        table.insert_silently(TelemetryRow { created_at: Some("2024-01-01T00:00:09Z".into()), ..TelemetryRow::reading(1002, 99.0, None) });
        let latest = table.fetch_latest(1001).await.unwrap().unwrap();
        assert_eq!(latest.fill_level, Some(20.0));
        assert!(table.fetch_latest(1003).await.unwrap().is_none());
    }
}
