use crate::models::{DeviceId, NormalizedUpdate};
use std::collections::HashMap;

/// Dernier horodatage source appliqué, par appareil.
///
/// Seule barrière entre les deux canaux : le premier qui livre un
/// enregistrement gagne, l'autre copie est jetée. Les égalités sont rejetées,
/// une relivraison ne fait donc rien.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last_applied: HashMap<DeviceId, i64>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renvoie true si l'appelant doit appliquer `update` ; l'horodatage est retenu.
    pub fn accept(&mut self, update: &NormalizedUpdate) -> bool {
        match self.last_applied.get(&update.device_id) {
            Some(&last) if update.timestamp <= last => false,
            _ => {
                self.last_applied.insert(update.device_id, update.timestamp);
                true
            }
        }
    }

    pub fn last_applied(&self, device_id: DeviceId) -> Option<i64> {
        self.last_applied.get(&device_id).copied()
    }

    pub fn tracked_devices(&self) -> usize {
        self.last_applied.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpdateSource;

    fn upd(device_id: DeviceId, fill: f64, ts: i64) -> NormalizedUpdate {
        NormalizedUpdate {
            device_id,
            fill_level: fill,
            battery_level: None,
            status: None,
            timestamp: ts,
            source: UpdateSource::Poll,
        }
    }

    #[test]
    fn same_record_twice_is_accepted_once() {
        let mut dedup = Deduplicator::new();
        let u = upd(1001, 45.0, 100);
        assert!(dedup.accept(&u));
        assert!(!dedup.accept(&u));
        assert_eq!(dedup.last_applied(1001), Some(100));
    }

    #[test]
    fn older_record_is_rejected() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.accept(&upd(1001, 45.0, 100)));
        assert!(!dedup.accept(&upd(1001, 10.0, 90)));
        assert_eq!(dedup.last_applied(1001), Some(100));
    }

    #[test]
    fn devices_are_independent() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.accept(&upd(1, 1.0, 500)));
        assert!(dedup.accept(&upd(2, 1.0, 10)));
        assert!(dedup.accept(&upd(2, 1.0, 11)));
        assert_eq!(dedup.tracked_devices(), 2);
    }
}
