/**
 * FLEET STATE STORE - Vue mémoire de référence de chaque bac
 *
 * RÔLE : point de mutation unique pour push, poll, liveness et simulateur.
 *
 * FONCTIONNEMENT : chaque mutation est un read-modify-write sous un seul
 * verrou, suivi d'un recomptage complet des stats sous ce même verrou.
 * `snapshot()` ne voit jamais une mise à jour à moitié appliquée.
 */

use crate::clock::{Clock, SystemClock};
use crate::error::FleetError;
use crate::models::{clamp_percent, Category, Device, DeviceId, DeviceStatus, FleetStats, Location};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Champs qu'une mise à jour peut fixer. Un champ absent garde sa valeur,
/// sauf le statut, recalculé depuis le remplissage s'il n'est pas donné.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DevicePatch {
    pub fill_level: Option<f64>,
    pub battery_level: Option<f64>,
    pub status: Option<DeviceStatus>,
}

impl DevicePatch {
    pub fn fill(fill_level: f64) -> Self {
        Self { fill_level: Some(fill_level), ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub devices: Vec<Device>,
    pub stats: FleetStats,
    /// Nombre de mutations appliquées depuis le démarrage.
    pub revision: u64,
}

impl FleetSnapshot {
    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

struct FleetTable {
    devices: BTreeMap<DeviceId, Device>,
    stats: FleetStats,
    revision: u64,
    collections: u64,
}

pub struct FleetStateStore {
    table: Mutex<FleetTable>,
    clock: Arc<dyn Clock>,
}

impl FleetStateStore {
    pub fn new(devices: Vec<Device>) -> Self {
        Self::with_clock(devices, Arc::new(SystemClock))
    }

    pub fn with_clock(devices: Vec<Device>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let devices: BTreeMap<_, _> = devices
            .into_iter()
            .map(|mut d| {
                d.fill_level = clamp_percent(d.fill_level);
                d.battery_level = clamp_percent(d.battery_level);
                d.last_updated = now;
                (d.id, d)
            })
            .collect();
        let stats = FleetStats::compute(devices.values(), 0);
        Self {
            table: Mutex::new(FleetTable { devices, stats, revision: 0, collections: 0 }),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.table.lock().devices.contains_key(&id)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.table.lock().devices.keys().copied().collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.table.lock().devices.get(&id).cloned()
    }

    /// Applique `patch` à l'appareil `id`, sans condition.
    pub fn apply_update(&self, id: DeviceId, patch: DevicePatch) -> Result<Device, FleetError> {
        self.mutate(id, |_| Some(patch))?
            .ok_or(FleetError::UnknownDevice(id))
    }

    /// Read-modify-write d'un appareil. `decide` voit l'état courant sous le
    /// verrou et renvoie le patch à appliquer, ou `None` pour n'y rien changer.
    pub fn mutate<F>(&self, id: DeviceId, decide: F) -> Result<Option<Device>, FleetError>
    where
        F: FnOnce(&Device) -> Option<DevicePatch>,
    {
        self.mutate_then(id, decide, |_| {})
    }

    /// Comme `mutate`, et `applied` voit le nouvel état encore sous le
    /// verrou. Sert à mettre les notifications en file dans l'ordre des
    /// mutations.
    pub fn mutate_then<F, G>(&self, id: DeviceId, decide: F, applied: G) -> Result<Option<Device>, FleetError>
    where
        F: FnOnce(&Device) -> Option<DevicePatch>,
        G: FnOnce(&Device),
    {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let device = table.devices.get_mut(&id).ok_or(FleetError::UnknownDevice(id))?;

        let Some(patch) = decide(device) else {
            return Ok(None);
        };

        let was_servicing = device.status == DeviceStatus::Servicing;
        apply_patch(device, patch, now);
        let entering_service = !was_servicing && device.status == DeviceStatus::Servicing;
        let updated = device.clone();

        if entering_service {
            table.collections += 1;
        }
        table.revision += 1;
        table.stats = FleetStats::compute(table.devices.values(), table.collections);
        applied(&updated);

        Ok(Some(updated))
    }

    pub fn stats(&self) -> FleetStats {
        self.table.lock().stats
    }

    pub fn revision(&self) -> u64 {
        self.table.lock().revision
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        let table = self.table.lock();
        FleetSnapshot {
            devices: table.devices.values().cloned().collect(),
            stats: table.stats,
            revision: table.revision,
        }
    }
}

fn apply_patch(device: &mut Device, patch: DevicePatch, now: OffsetDateTime) {
    if let Some(fill) = patch.fill_level {
        device.fill_level = clamp_percent(fill);
    }
    if let Some(battery) = patch.battery_level {
        device.battery_level = clamp_percent(battery);
    }
    device.status = patch
        .status
        .unwrap_or_else(|| DeviceStatus::from_fill_level(device.fill_level));
    device.last_updated = now;
}

/// Flotte par défaut : parcs de Manhattan, 1001 est le bac instrumenté.
pub fn seed_fleet() -> Vec<Device> {
    let now = OffsetDateTime::now_utc();
    let bin = |id, lat, lng, address: &str, fill: f64, status, battery: f64, category| Device {
        id,
        location: Location { lat, lng, address: address.to_string() },
        fill_level: fill,
        capacity: 100,
        battery_level: battery,
        status,
        category,
        last_updated: now,
    };
    use Category::*;
    use DeviceStatus::*;
    vec![
        bin(1001, 40.7128, -74.006, "Central Park East, New York", 0.0, Normal, 100.0, General),
        bin(1002, 40.7138, -74.013, "Madison Square, New York", 30.0, Normal, 92.0, Recyclable),
        bin(1003, 40.7118, -74.009, "Bryant Park, New York", 88.0, Critical, 64.0, Organic),
        bin(1004, 40.7148, -74.016, "Union Square, New York", 45.0, Normal, 78.0, General),
        bin(1005, 40.7158, -74.003, "Battery Park, New York", 92.0, Critical, 56.0, Recyclable),
        bin(1006, 40.7168, -74.018, "Washington Square Park, New York", 15.0, Normal, 94.0, Organic),
        bin(1007, 40.7108, -74.001, "High Line Park, New York", 68.0, Warning, 72.0, General),
        bin(1008, 40.7188, -74.011, "Times Square, New York", 50.0, Normal, 83.0, Recyclable),
    ]
}
