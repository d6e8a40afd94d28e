/**
 * LIVENESS MONITOR - Détection du capteur figé sur le bac instrumenté
 *
 * RÔLE : à chaque tick, si l'appareil suivi était live et que rien n'est
 * arrivé depuis plus que le timeout, le forcer à 0 / normal. Un capteur mort
 * n'affiche jamais un niveau haut figé.
 *
 * FONCTIONNEMENT : le drapeau live ne revient que quand le réconciliateur
 * applique une nouvelle mise à jour canal pour cet appareil.
 */

use crate::fleet::{DevicePatch, FleetStateStore};
use crate::models::{unix_millis, DeviceId, DeviceStatus, NormalizedUpdate, UpdateSource};
use crate::subscribers::SubscriberRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub device_id: DeviceId,
    pub live: bool,
    pub timeout_secs: u64,
}

pub struct LivenessMonitor {
    device_id: DeviceId,
    tick: Duration,
    timeout: Duration,
    live: AtomicBool,
    store: Arc<FleetStateStore>,
    subscribers: Arc<SubscriberRegistry>,
}

impl LivenessMonitor {
    pub fn new(
        device_id: DeviceId,
        tick: Duration,
        timeout: Duration,
        store: Arc<FleetStateStore>,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            device_id,
            tick,
            timeout,
            live: AtomicBool::new(false),
            store,
            subscribers,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Appelé par le réconciliateur après application d'une mise à jour canal.
    pub fn observe(&self, update: &NormalizedUpdate) {
        if update.device_id != self.device_id || !update.source.is_channel() {
            return;
        }
        if !self.live.swap(true, Ordering::AcqRel) {
            info!(device_id = self.device_id, source = ?update.source, "instrumented device reporting");
        }
    }

    /// Une évaluation. Renvoie true si l'appareil a été forcé au repos.
    pub fn check(&self) -> bool {
        if !self.is_live() {
            return false;
        }

        let now = self.store.clock().now();
        let timeout = time::Duration::try_from(self.timeout).unwrap_or(time::Duration::MAX);
        let forced = self.store.mutate_then(
            self.device_id,
            |device| {
                if now - device.last_updated <= timeout {
                    return None;
                }
                // Remis à false sous le verrou du store : une mise à jour canal
                // qui arrive juste après réarme toujours le drapeau.
                self.live.store(false, Ordering::Release);
                Some(DevicePatch {
                    fill_level: Some(0.0),
                    battery_level: None,
                    status: Some(DeviceStatus::Normal),
                })
            },
            |device| {
                self.subscribers.enqueue(NormalizedUpdate {
                    device_id: device.id,
                    fill_level: device.fill_level,
                    battery_level: None,
                    status: Some(device.status),
                    timestamp: unix_millis(now),
                    source: UpdateSource::Liveness,
                });
            },
        );

        match forced {
            Ok(Some(_)) => {
                warn!(
                    device_id = self.device_id,
                    timeout_secs = self.timeout.as_secs(),
                    "instrumented device silent past timeout, reset to idle"
                );
                self.subscribers.flush();
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "liveness device missing from fleet");
                false
            }
        }
    }

    pub fn report(&self) -> LivenessReport {
        LivenessReport {
            device_id: self.device_id,
            live: self.is_live(),
            timeout_secs: self.timeout.as_secs(),
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            device_id = self.device_id,
            tick_secs = self.tick.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "starting liveness monitor"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + self.tick, self.tick);
            loop {
                interval.tick().await;
                self.check();
            }
        })
    }
}
