/**
 * TÉLÉMÉTRIE SYNTHÉTIQUE - Marche aléatoire pour les bacs sans capteur
 *
 * RÔLE : à chaque tick, chaque bac simulé bouge son remplissage d'un petit
 * delta borné. Il peut aussi être collecté (servicing + baisse du niveau) ou
 * perdre un point de batterie.
 *
 * FONCTIONNEMENT : écrit directement dans le store, sans passer par la
 * dédup. Le bac instrumenté est exclu.
 */

use crate::config::SyntheticConf;
use crate::fleet::{DevicePatch, FleetStateStore};
use crate::models::{clamp_percent, unix_millis, Device, DeviceId, DeviceStatus, NormalizedUpdate, UpdateSource};
use crate::subscribers::SubscriberRegistry;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SyntheticTelemetryGenerator {
    conf: SyntheticConf,
    excluded: HashSet<DeviceId>,
    store: Arc<FleetStateStore>,
    subscribers: Arc<SubscriberRegistry>,
    rng: Mutex<StdRng>,
}

impl SyntheticTelemetryGenerator {
    pub fn new(
        conf: SyntheticConf,
        excluded: impl IntoIterator<Item = DeviceId>,
        store: Arc<FleetStateStore>,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        let rng = match conf.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            conf,
            excluded: excluded.into_iter().collect(),
            store,
            subscribers,
            rng: Mutex::new(rng),
        }
    }

    pub fn is_simulated(&self, id: DeviceId) -> bool {
        !self.excluded.contains(&id)
    }

    /// Un pas de simulation sur tous les bacs simulés. Renvoie le nombre
    /// d'appareils modifiés.
    pub fn tick(&self) -> usize {
        let mut changed = 0;
        {
            let mut rng = self.rng.lock();
            for id in self.store.device_ids() {
                if !self.is_simulated(id) {
                    continue;
                }
                let applied = self.store.mutate_then(
                    id,
                    |device| propose(&self.conf, &mut *rng, device),
                    |device| self.subscribers.enqueue(synthetic_event(device)),
                );
                match applied {
                    Ok(Some(_)) => changed += 1,
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "simulated device vanished"),
                }
            }
        }

        self.subscribers.flush();
        if changed > 0 {
            debug!(changed, "synthetic tick");
        }
        changed
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.conf.tick();
        info!(
            tick_ms = self.conf.tick_ms,
            simulated = self.store.device_ids().iter().filter(|id| self.is_simulated(**id)).count(),
            "starting synthetic telemetry"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                self.tick();
            }
        })
    }
}

fn synthetic_event(device: &Device) -> NormalizedUpdate {
    NormalizedUpdate {
        device_id: device.id,
        fill_level: device.fill_level,
        battery_level: Some(device.battery_level),
        status: Some(device.status),
        timestamp: unix_millis(device.last_updated),
        source: UpdateSource::Synthetic,
    }
}

/// Prochain état d'un appareil, ou `None` s'il passe ce tick.
fn propose<R: Rng>(conf: &SyntheticConf, rng: &mut R, device: &Device) -> Option<DevicePatch> {
    if !rng.gen_bool(conf.update_probability) {
        return None;
    }

    let delta = f64::from(rng.gen_range(conf.delta_min..=conf.delta_max));
    let mut fill = clamp_percent(device.fill_level + delta);
    let mut status = DeviceStatus::from_fill_level(fill);

    if rng.gen_bool(conf.servicing_probability) {
        status = DeviceStatus::Servicing;
        fill = (fill - conf.collection_drop).max(0.0);
    }

    let battery = if rng.gen_bool(conf.battery_drain_probability) {
        (device.battery_level - 1.0).max(0.0)
    } else {
        device.battery_level
    };

    Some(DevicePatch {
        fill_level: Some(fill),
        battery_level: Some(battery),
        status: Some(status),
    })
}
