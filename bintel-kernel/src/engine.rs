/**
 * MOTEUR TÉLÉMÉTRIE - Propriétaire du pipeline de réconciliation
 *
 * RÔLE : branche push, poll, liveness et simulateur sur un seul store de
 * flotte. Possède le registre d'abonnés et la machine d'état de connexion.
 *
 * FONCTIONNEMENT : start() lance les quatre tâches d'un bloc, stop() les
 * arrête toutes. Plusieurs moteurs peuvent cohabiter dans un process, rien
 * n'est global.
 */

use crate::backing::{ChangeFeed, TelemetryTable};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::connection::{ConnectionReport, ConnectionState, ConnectionStateMachine};
use crate::error::{ConfigError, StoreError};
use crate::fleet::{FleetSnapshot, FleetStateStore};
use crate::liveness::{LivenessMonitor, LivenessReport};
use crate::models::{unix_millis, Device, DeviceId, FleetStats, NormalizedUpdate, TelemetryRow, UpdateSource};
use crate::poll::PollChannel;
use crate::push::PushChannel;
use crate::reconcile::{ChannelStats, IngestOutcome, Reconciler};
use crate::subscribers::{SubscriberRegistry, SubscriptionId};
use crate::synthetic::SyntheticTelemetryGenerator;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Tout ce qu'affiche un panneau d'état.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub connection: ConnectionReport,
    pub liveness: LivenessReport,
    pub push: ChannelStats,
    pub poll: ChannelStats,
    pub revision: u64,
}

#[derive(Default)]
struct Tasks {
    poll: Option<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
    synthetic: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) -> bool {
        let mut any = false;
        for task in [self.poll.take(), self.liveness.take(), self.synthetic.take()].into_iter().flatten() {
            task.abort();
            any = true;
        }
        any
    }
}

pub struct TelemetryEngine {
    table: Arc<dyn TelemetryTable>,
    store: Arc<FleetStateStore>,
    subscribers: Arc<SubscriberRegistry>,
    connection: ConnectionStateMachine,
    reconciler: Arc<Reconciler>,
    liveness: Arc<LivenessMonitor>,
    push: Arc<PushChannel>,
    poll: Arc<PollChannel>,
    synthetic: Arc<SyntheticTelemetryGenerator>,
    tasks: Mutex<Tasks>,
}

impl TelemetryEngine {
    pub fn new(
        config: EngineConfig,
        devices: Vec<Device>,
        table: Arc<dyn TelemetryTable>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, devices, table, feed, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        devices: Vec<Device>,
        table: Arc<dyn TelemetryTable>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = Arc::new(FleetStateStore::with_clock(devices, clock));
        let subscribers = Arc::new(SubscriberRegistry::new());
        let connection = ConnectionStateMachine::new();

        let live = &config.liveness;
        let liveness = Arc::new(LivenessMonitor::new(
            live.device_id,
            live.tick(),
            live.timeout(),
            store.clone(),
            subscribers.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(store.clone(), liveness.clone(), subscribers.clone()));

        let push = Arc::new(PushChannel::new(
            feed,
            table.clone(),
            reconciler.clone(),
            connection.clone(),
            config.reconnect.clone(),
            config.probe.clone(),
        ));
        let poll = Arc::new(PollChannel::new(
            table.clone(),
            reconciler.clone(),
            config.poll.interval(),
            config.poll.limit,
            live.device_id,
        ));
        let synthetic = Arc::new(SyntheticTelemetryGenerator::new(
            config.synthetic.clone(),
            [live.device_id],
            store.clone(),
            subscribers.clone(),
        ));

        Ok(Self {
            table,
            store,
            subscribers,
            connection,
            reconciler,
            liveness,
            push,
            poll,
            synthetic,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Lance les quatre tâches. Un second appel les redémarre.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.abort_all() {
            info!("engine already running, restarting tasks");
        }
        self.push.start();
        tasks.poll = Some(self.poll.clone().spawn());
        tasks.liveness = Some(self.liveness.clone().spawn());
        tasks.synthetic = Some(self.synthetic.clone().spawn());
        info!(devices = self.store.device_ids().len(), "telemetry engine started");
    }

    /// Arrête les tâches et libère l'abonnement push. Sans effet avant
    /// `start`, rappelable à volonté.
    pub fn stop(&self) {
        let had_tasks = self.tasks.lock().abort_all();
        let had_push = self.push.is_running();
        self.push.stop();
        if had_tasks || had_push {
            info!("telemetry engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let tasks = self.tasks.lock();
        tasks.poll.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&NormalizedUpdate) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.store.snapshot()
    }

    pub fn stats(&self) -> FleetStats {
        self.store.stats()
    }

    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.store.device(id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.current()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            connection: self.connection.report(),
            liveness: self.liveness.report(),
            push: self.push.stats(),
            poll: self.poll.stats(),
            revision: self.store.revision(),
        }
    }

    /// Injecte une lecture via la dédup, horodatée à l'instant.
    pub fn simulate(&self, device_id: DeviceId, fill_level: f64, battery_level: Option<f64>) -> IngestOutcome {
        let update = NormalizedUpdate {
            device_id,
            fill_level,
            battery_level,
            status: None,
            timestamp: unix_millis(self.store.clock().now()),
            source: UpdateSource::Manual,
        };
        info!(device_id, fill_level, "manual reading injected");
        self.reconciler.ingest(update)
    }

    pub async fn recent_rows(&self, limit: usize) -> Result<Vec<TelemetryRow>, StoreError> {
        self.table.fetch_recent(limit).await
    }

    pub fn poll_channel(&self) -> &Arc<PollChannel> {
        &self.poll
    }

    pub fn push_channel(&self) -> &Arc<PushChannel> {
        &self.push
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }
}

impl Drop for TelemetryEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemoryTable;
    use crate::fleet::seed_fleet;

    fn engine(config: EngineConfig) -> (Arc<MemoryTable>, TelemetryEngine) {
        let table = Arc::new(MemoryTable::new());
        let engine = TelemetryEngine::new(config, seed_fleet(), table.clone(), table.clone()).unwrap();
        (table, engine)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.liveness.timeout_secs = 0;
        let table = Arc::new(MemoryTable::new());
        assert!(TelemetryEngine::new(config, seed_fleet(), table.clone(), table).is_err());
    }

    #[test]
    fn stop_before_start_is_noop() {
        let (_, engine) = engine(EngineConfig::default());
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn simulate_goes_through_dedup() {
        let (_, engine) = engine(EngineConfig::default());
        assert!(matches!(engine.simulate(1003, 91.0, Some(50.0)), IngestOutcome::Applied(_)));
        assert_eq!(engine.device(1003).unwrap().fill_level, 91.0);
        assert_eq!(engine.simulate(4242, 10.0, None), IngestOutcome::UnknownDevice);
    }

    #[test]
    fn subscribers_see_manual_updates() {
        let (_, engine) = engine(EngineConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = engine.subscribe(move |u| sink.lock().push((u.device_id, u.source)));

        engine.simulate(1002, 12.0, None);
        assert!(engine.unsubscribe(id));
        engine.simulate(1002, 13.0, None);
        assert_eq!(*seen.lock(), vec![(1002, UpdateSource::Manual)]);
    }

    #[tokio::test]
    async fn start_twice_restarts_and_stop_releases_feed() {
        let (table, engine) = engine(EngineConfig::default());
        engine.start();
        engine.start();
        assert!(engine.is_running());

        for _ in 0..100 {
            if table.live_feeds() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(table.live_feeds(), 1);

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        for _ in 0..100 {
            if table.live_feeds() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(table.live_feeds(), 0);
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }
}
