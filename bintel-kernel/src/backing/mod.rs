/**
 * BACKING STORE - Ports vers la table de télémétrie
 *
 * RÔLE :
 * Le kernel ne possède pas la table, il la lit de deux façons :
 * - TelemetryTable = côté pull (lignes récentes, dernière ligne d'un bac, insert)
 * - ChangeFeed     = côté push (événements INSERT/UPDATE sur la table)
 *
 * ADAPTATEURS :
 * - rest   : table HTTP façon PostgREST (reqwest)
 * - mqtt   : événements relayés sur un topic MQTT (rumqttc)
 * - memory : table en mémoire qui fait les deux, avec injection de pannes
 */

pub mod memory;
pub mod mqtt;
pub mod rest;

use crate::error::StoreError;
use crate::models::{ChangeKind, DeviceId, TelemetryRow};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::MemoryTable;
pub use mqtt::MqttChangeFeed;
pub use rest::RestTable;

#[async_trait]
pub trait TelemetryTable: Send + Sync {
    /// Les `limit` lignes les plus récentes, la plus récente en tête.
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<TelemetryRow>, StoreError>;

    async fn fetch_latest(&self, device_id: DeviceId) -> Result<Option<TelemetryRow>, StoreError>;

    async fn insert(&self, row: TelemetryRow) -> Result<(), StoreError>;

    /// Test d'accès peu coûteux.
    async fn ping(&self) -> Result<(), StoreError> {
        self.fetch_recent(1).await.map(|_| ())
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<ChangeSubscription, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// Le store a confirmé l'abonnement.
    Acknowledged,
    Row { kind: ChangeKind, row: TelemetryRow },
    Error(String),
    Closed,
}

/// Enveloppe d'un événement sur le fil : `{"type":"INSERT","table":"bin_updates","record":{..}}`.
#[derive(Debug, Deserialize)]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: String,
    pub record: TelemetryRow,
}

/// Abonnement actif. Le dropper libère le transport sous-jacent.
pub struct ChangeSubscription {
    events: mpsc::Receiver<ChangeEvent>,
    transport: Option<JoinHandle<()>>,
}

impl ChangeSubscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { events, transport: None }
    }

    /// Lie une tâche de transport à la durée de vie de l'abonnement.
    pub fn with_transport(mut self, task: JoinHandle<()>) -> Self {
        self.transport = Some(task);
        self
    }

    /// Événement suivant ; `None` une fois le transport disparu.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.transport.take() {
            task.abort();
        }
    }
}
