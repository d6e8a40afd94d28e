use crate::clock::Clock;
use crate::dedup::Deduplicator;
use crate::fleet::{DevicePatch, FleetStateStore};
use crate::liveness::LivenessMonitor;
use crate::models::{Device, DeviceId, NormalizedUpdate};
use crate::subscribers::SubscriberRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Applied(Device),
    Duplicate,
    UnknownDevice,
}

/// Compteurs cumulés d'un canal.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    received: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub received: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub malformed: u64,
    /// Lectures ou tentatives d'abonnement en échec.
    pub failures: u64,
}

impl ChannelCounters {
    pub fn record(&self, outcome: &IngestOutcome) {
        self.received.fetch_add(1, Ordering::Relaxed);
        match outcome {
            IngestOutcome::Applied(_) => self.applied.fetch_add(1, Ordering::Relaxed),
            IngestOutcome::Duplicate => self.duplicates.fetch_add(1, Ordering::Relaxed),
            IngestOutcome::UnknownDevice => 0,
        };
    }

    pub fn record_malformed(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Fin de chaîne commune aux deux canaux : dédup, mutation du store, puis
/// liveness et diffusion.
pub struct Reconciler {
    store: Arc<FleetStateStore>,
    // Tenu de l'acceptation à l'application : deux canaux ne peuvent pas
    // appliquer un ancien enregistrement après un plus récent.
    dedup: Mutex<Deduplicator>,
    liveness: Arc<LivenessMonitor>,
    subscribers: Arc<SubscriberRegistry>,
}

impl Reconciler {
    pub fn new(
        store: Arc<FleetStateStore>,
        liveness: Arc<LivenessMonitor>,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            store,
            dedup: Mutex::new(Deduplicator::new()),
            liveness,
            subscribers,
        }
    }

    pub fn ingest(&self, update: NormalizedUpdate) -> IngestOutcome {
        if !self.store.contains(update.device_id) {
            debug!(device_id = update.device_id, "update for device outside the fleet, dropped");
            return IngestOutcome::UnknownDevice;
        }

        let device = {
            let mut dedup = self.dedup.lock();
            if !dedup.accept(&update) {
                debug!(
                    device_id = update.device_id,
                    timestamp = update.timestamp,
                    source = ?update.source,
                    "duplicate or stale update dropped"
                );
                return IngestOutcome::Duplicate;
            }
            let patch = DevicePatch {
                fill_level: Some(update.fill_level),
                battery_level: update.battery_level,
                status: update.status,
            };
            let applied = self.store.mutate_then(
                update.device_id,
                |_| Some(patch),
                |_| self.subscribers.enqueue(update.clone()),
            );
            match applied {
                Ok(Some(device)) => device,
                Ok(None) => return IngestOutcome::Duplicate,
                Err(e) => {
                    warn!(error = %e, "accepted update could not be applied");
                    return IngestOutcome::UnknownDevice;
                }
            }
        };

        self.liveness.observe(&update);
        self.subscribers.flush();
        IngestOutcome::Applied(device)
    }

    pub fn last_applied(&self, device_id: DeviceId) -> Option<i64> {
        self.dedup.lock().last_applied(device_id)
    }

    /// Horloge du store, pour horodater les événements reçus sans date.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.store.clock()
    }
}
