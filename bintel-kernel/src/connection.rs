/**
 * CONNEXION - Cycle de vie du canal push
 *
 * RÔLE : connecting → connected → disconnected (→ connecting à la reconnexion).
 * Lu seulement par les panneaux d'état ; la réconciliation n'en dépend pas,
 * le poll tourne dans tous les états.
 */

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Une tentative d'abonnement commence.
    Connect,
    /// Le store a confirmé l'abonnement.
    Acknowledged,
    Failed(String),
    Closed,
}

impl ConnectionState {
    /// État suivant pour `event`, ou `None` si l'événement ne s'applique pas ici.
    pub fn on(self, event: &ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, event) {
            (_, ConnectionEvent::Connect) => Some(Connecting),
            (Connecting, ConnectionEvent::Acknowledged) => Some(Connected),
            (Connecting | Connected, ConnectionEvent::Failed(_) | ConnectionEvent::Closed) => Some(Disconnected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub state: ConnectionState,
    pub reconnects: u32,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct ConnectionStateMachine {
    state: Arc<watch::Sender<ConnectionState>>,
    reconnects: Arc<AtomicU32>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: Arc::new(tx),
            reconnects: Arc::new(AtomicU32::new(0)),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver réveillé à chaque changement d'état.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Passe un événement dans la machine et renvoie l'état obtenu.
    pub fn handle(&self, event: ConnectionEvent) -> ConnectionState {
        if let ConnectionEvent::Failed(reason) = &event {
            *self.last_error.lock() = Some(reason.clone());
        }

        let mut result = self.current();
        self.state.send_if_modified(|state| match state.on(&event) {
            Some(next) if next != *state => {
                info!(from = ?*state, to = ?next, "push channel state changed");
                *state = next;
                result = next;
                true
            }
            Some(_) => false,
            None => {
                debug!(state = ?*state, ?event, "ignoring connection event");
                false
            }
        });
        result
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> ConnectionReport {
        ConnectionReport {
            state: self.current(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
