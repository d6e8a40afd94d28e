/**
 * PUSH CHANNEL - Abonnement temps réel aux changements de la table
 *
 * RÔLE : tient un abonnement logique et passe chaque INSERT/UPDATE au
 * réconciliateur sous forme de NormalizedUpdate.
 *
 * FONCTIONNEMENT : pilote la machine d'état de connexion et se reconnecte
 * avec un backoff exponentiel après erreur. Quand il tombe, seul le poll
 * reste : la fraîcheur baisse, pas la justesse.
 */

use crate::backing::{ChangeEvent, ChangeFeed, ChangeSubscription, TelemetryTable};
use crate::config::{ProbeConf, ReconnectConf};
use crate::connection::{ConnectionEvent, ConnectionStateMachine};
use crate::models::{unix_millis, ChangeKind, TelemetryRow, UpdateSource};
use crate::reconcile::{ChannelCounters, ChannelStats, IngestOutcome, Reconciler};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct PushChannel {
    feed: Arc<dyn ChangeFeed>,
    table: Arc<dyn TelemetryTable>,
    reconciler: Arc<Reconciler>,
    connection: ConnectionStateMachine,
    reconnect: ReconnectConf,
    probe: ProbeConf,
    probe_sent: AtomicBool,
    counters: ChannelCounters,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Comment un abonnement s'est terminé.
enum SessionEnd {
    Failed,
    Closed,
}

impl PushChannel {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        table: Arc<dyn TelemetryTable>,
        reconciler: Arc<Reconciler>,
        connection: ConnectionStateMachine,
        reconnect: ReconnectConf,
        probe: ProbeConf,
    ) -> Self {
        Self {
            feed,
            table,
            reconciler,
            connection,
            reconnect,
            probe,
            probe_sent: AtomicBool::new(false),
            counters: ChannelCounters::default(),
            task: Mutex::new(None),
        }
    }

    /// Démarre l'écoute ; une écoute en cours est d'abord arrêtée.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
            debug!("push channel restarted, previous subscription released");
        }
        info!("starting push subscription");
        *task = Some(tokio::spawn(self.clone().run()));
    }

    /// Libère l'abonnement. Sans effet si rien n'est démarré.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            self.connection.handle(ConnectionEvent::Closed);
            info!("push subscription stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    async fn run(self: Arc<Self>) {
        let initial = Duration::from_millis(self.reconnect.initial_backoff_ms);
        let max = Duration::from_millis(self.reconnect.max_backoff_ms).max(initial);
        let mut backoff = initial;

        loop {
            self.connection.handle(ConnectionEvent::Connect);
            let end = match self.feed.subscribe().await {
                Ok(subscription) => self.listen(subscription, &mut backoff, initial).await,
                Err(e) => {
                    warn!(error = %e, "push subscribe failed");
                    self.counters.record_failure();
                    self.connection.handle(ConnectionEvent::Failed(e.to_string()));
                    SessionEnd::Failed
                }
            };

            if !self.reconnect.enabled {
                info!("push reconnect disabled, poll channel continues alone");
                return;
            }
            if let SessionEnd::Closed = end {
                debug!("push subscription closed by the store");
            }
            info!(backoff_ms = backoff.as_millis() as u64, "push channel reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max);
            self.connection.increment_reconnects();
        }
    }

    async fn listen(
        &self,
        mut subscription: ChangeSubscription,
        backoff: &mut Duration,
        initial: Duration,
    ) -> SessionEnd {
        while let Some(event) = subscription.next().await {
            match event {
                ChangeEvent::Acknowledged => {
                    self.connection.handle(ConnectionEvent::Acknowledged);
                    *backoff = initial;
                    self.send_probe_once();
                }
                ChangeEvent::Row { kind, row } => {
                    self.handle_row(kind, &row);
                }
                ChangeEvent::Error(reason) => {
                    warn!(%reason, "push subscription error");
                    self.counters.record_failure();
                    self.connection.handle(ConnectionEvent::Failed(reason));
                    return SessionEnd::Failed;
                }
                ChangeEvent::Closed => {
                    self.connection.handle(ConnectionEvent::Closed);
                    return SessionEnd::Closed;
                }
            }
        }
        self.connection.handle(ConnectionEvent::Closed);
        SessionEnd::Closed
    }

    /// Normalise un événement et le réconcilie. `None` pour les lignes qui
    /// n'atteignent pas le réconciliateur (mal formées, auto-test).
    pub fn handle_row(&self, kind: ChangeKind, row: &TelemetryRow) -> Option<IngestOutcome> {
        if row.bin_id == Some(i64::from(self.probe.device_id)) {
            info!(device_id = self.probe.device_id, "self-test probe delivered over push");
            return None;
        }

        let received_at = unix_millis(self.reconciler.clock().now());
        let update = match row.normalize(kind, UpdateSource::Push, received_at) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, ?row, "malformed push record rejected");
                self.counters.record_malformed();
                return None;
            }
        };

        let outcome = self.reconciler.ingest(update);
        self.counters.record(&outcome);
        if let IngestOutcome::Applied(device) = &outcome {
            debug!(device_id = device.id, fill = device.fill_level, "push update applied");
        }
        Some(outcome)
    }

    fn send_probe_once(&self) {
        if !self.probe.enabled || self.probe_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let row = TelemetryRow {
            battery_level: Some(100.0),
            status: Some("normal".into()),
            ..TelemetryRow::reading(self.probe.device_id, rand::random::<f64>() * 100.0, None)
        };
        let table = self.table.clone();
        info!(device_id = self.probe.device_id, "inserting self-test probe");
        tokio::spawn(async move {
            if let Err(e) = table.insert(row).await {
                error!(error = %e, "self-test probe insert failed");
            }
        });
    }
}
