/**
 * ABONNÉS - Diffusion des mises à jour appliquées
 *
 * RÔLE : liste ordonnée de callbacks notifiés après chaque mutation de la
 * flotte. Les événements sont mis en file sous le verrou du store, dans
 * l'ordre d'application, puis livrés par un seul thread à la fois : un
 * abonné lent ne peut pas inverser deux mises à jour d'un même bac.
 */

use crate::models::NormalizedUpdate;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

pub type UpdateCallback = Arc<dyn Fn(&NormalizedUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, UpdateCallback)>>,
    pending: Mutex<VecDeque<NormalizedUpdate>>,
    // Tenu par le thread qui vide la file.
    dispatching: Mutex<()>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&NormalizedUpdate) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    /// Renvoie false si `id` n'est pas (ou plus) enregistré.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(sid, _)| *sid != id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Met un événement en file sans le livrer. À appeler sous le verrou qui
    /// ordonne les mutations.
    pub fn enqueue(&self, update: NormalizedUpdate) {
        self.pending.lock().push_back(update);
    }

    /// Livre la file dans l'ordre. Si un autre thread est déjà en train de
    /// livrer, il se charge aussi de nos événements.
    pub fn flush(&self) {
        loop {
            {
                let Some(_dispatching) = self.dispatching.try_lock() else {
                    return;
                };
                loop {
                    let next = self.pending.lock().pop_front();
                    match next {
                        Some(update) => self.deliver(&update),
                        None => break,
                    }
                }
            }
            // Un événement arrivé entre le dernier pop et le relâchement.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }

    pub fn notify(&self, update: &NormalizedUpdate) {
        self.enqueue(update.clone());
        self.flush();
    }

    /// Appelle chaque abonné dans l'ordre d'inscription. Un callback qui
    /// panique est journalisé et n'empêche pas les autres.
    fn deliver(&self, update: &NormalizedUpdate) {
        let callbacks: Vec<UpdateCallback> = self.callbacks.lock().iter().map(|(_, cb)| cb.clone()).collect();
        debug!(device_id = update.device_id, subscribers = callbacks.len(), "notifying subscribers");
        for cb in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(update))).is_err() {
                error!(device_id = update.device_id, "subscriber callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpdateSource;

    fn update() -> NormalizedUpdate {
        NormalizedUpdate {
            device_id: 1001,
            fill_level: 12.0,
            battery_level: None,
            status: None,
            timestamp: 1,
            source: UpdateSource::Push,
        }
    }

    #[test]
    fn notifies_in_registration_order() {
        let reg = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            reg.subscribe(move |_| seen.lock().push(tag));
        }
        reg.notify(&update());
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let reg = SubscriberRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let id = reg.subscribe(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        reg.notify(&update());
        assert!(reg.unsubscribe(id));
        assert!(!reg.unsubscribe(id));
        reg.notify(&update());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn queued_events_wait_for_flush() {
        let reg = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        reg.subscribe(move |u| sink.lock().push(u.timestamp));

        reg.enqueue(NormalizedUpdate { timestamp: 1, ..update() });
        reg.enqueue(NormalizedUpdate { timestamp: 2, ..update() });
        assert!(seen.lock().is_empty());
        reg.flush();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn reentrant_notify_keeps_order() {
        let reg = Arc::new(SubscriberRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (inner, sink) = (Arc::downgrade(&reg), seen.clone());
        reg.subscribe(move |u| {
            sink.lock().push(u.timestamp);
            if u.timestamp == 1 {
                if let Some(reg) = inner.upgrade() {
                    reg.notify(&NormalizedUpdate { timestamp: 2, ..u.clone() });
                }
            }
        });
        reg.notify(&update());
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let reg = SubscriberRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        reg.subscribe(|_| panic!("boom"));
        let h = hits.clone();
        reg.subscribe(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        reg.notify(&update());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
