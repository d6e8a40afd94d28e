use super::{ChangeEvent, ChangeFeed, ChangeMessage, ChangeSubscription};
use crate::config::MqttConf;
use crate::error::StoreError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const FEED_CAPACITY: usize = 64;

/// Flux de changements relayé sur un topic MQTT, une enveloppe JSON par ligne.
///
/// Chaque `subscribe` ouvre son propre client et sa boucle d'événements ; la
/// boucle tourne comme tâche de transport de l'abonnement et meurt avec lui.
#[derive(Clone)]
pub struct MqttChangeFeed {
    conf: MqttConf,
    table: String,
}

impl MqttChangeFeed {
    pub fn new(conf: MqttConf, table: impl Into<String>) -> Self {
        Self { conf, table: table.into() }
    }
}

#[async_trait]
impl ChangeFeed for MqttChangeFeed {
    async fn subscribe(&self) -> Result<ChangeSubscription, StoreError> {
        let client_id = format!("bintel-kernel-{}", Uuid::new_v4().simple());
        let mut opts = MqttOptions::new(client_id, &self.conf.host, self.conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        opts.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        client.subscribe(&self.conf.topic, QoS::AtLeastOnce).await?;

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let topic = self.conf.topic.clone();
        let table = self.table.clone();

        let transport = tokio::spawn(async move {
            // Garde le canal de requêtes ouvert tant que la boucle tourne.
            let _client = client;
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::SubAck(_))) => ChangeEvent::Acknowledged,
                    Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == topic => {
                        match decode(&p.payload, &table) {
                            Some(event) => event,
                            None => continue,
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        let _ = tx.send(ChangeEvent::Closed).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(ChangeEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    debug!("change subscription dropped, closing MQTT loop");
                    return;
                }
            }
        });

        Ok(ChangeSubscription::new(rx).with_transport(transport))
    }
}

/// Enveloppe → événement. Les lignes d'autres tables sont ignorées, les
/// payloads illisibles journalisés puis ignorés.
fn decode(payload: &[u8], table: &str) -> Option<ChangeEvent> {
    match serde_json::from_slice::<ChangeMessage>(payload) {
        Ok(msg) if msg.table == table => Some(ChangeEvent::Row { kind: msg.kind, row: msg.record }),
        Ok(msg) => {
            debug!(table = %msg.table, "change event for another table ignored");
            None
        }
        Err(e) => {
            warn!(error = %e, payload = %String::from_utf8_lossy(payload), "invalid change event JSON");
            None
        }
    }
}
