use crate::backing::TelemetryTable;
use crate::error::StoreError;
use crate::models::{ChangeKind, DeviceId, UpdateSource};
use crate::reconcile::{ChannelCounters, ChannelStats, IngestOutcome, Reconciler};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Bilan d'un tick de poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub unknown: usize,
}

/// Lecture périodique des lignes les plus récentes. Garde la flotte juste
/// quand le canal push est tombé.
pub struct PollChannel {
    table: Arc<dyn TelemetryTable>,
    reconciler: Arc<Reconciler>,
    interval: Duration,
    limit: usize,
    bootstrap_device: DeviceId,
    counters: ChannelCounters,
}

impl PollChannel {
    pub fn new(
        table: Arc<dyn TelemetryTable>,
        reconciler: Arc<Reconciler>,
        interval: Duration,
        limit: usize,
        bootstrap_device: DeviceId,
    ) -> Self {
        Self {
            table,
            reconciler,
            interval,
            limit,
            bootstrap_device,
            counters: ChannelCounters::default(),
        }
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    /// Une lecture + réconciliation. Les lignes arrivent de la plus récente à
    /// la plus ancienne et sont appliquées dans l'ordre inverse.
    pub async fn poll_once(&self) -> Result<PollReport, StoreError> {
        let rows = match self.table.fetch_recent(self.limit).await {
            Ok(rows) => rows,
            Err(e) => {
                self.counters.record_failure();
                return Err(e);
            }
        };

        let mut report = PollReport { fetched: rows.len(), ..Default::default() };
        for row in rows.iter().rev() {
            let update = match row.normalize_stored(ChangeKind::Insert, UpdateSource::Poll) {
                Ok(update) => update,
                Err(e) => {
                    warn!(error = %e, ?row, "malformed polled record rejected");
                    self.counters.record_malformed();
                    report.malformed += 1;
                    continue;
                }
            };
            let outcome = self.reconciler.ingest(update);
            self.counters.record(&outcome);
            match outcome {
                IngestOutcome::Applied(_) => report.applied += 1,
                IngestOutcome::Duplicate => report.duplicates += 1,
                IngestOutcome::UnknownDevice => report.unknown += 1,
            }
        }
        Ok(report)
    }

    /// Test d'accès au store, puis dernière ligne du bac instrumenté. Les
    /// échecs sont seulement journalisés.
    pub async fn bootstrap(&self) -> Option<IngestOutcome> {
        if let Err(e) = self.table.ping().await {
            warn!(error = %e, "backing store unreachable at start-up, polling anyway");
            self.counters.record_failure();
            return None;
        }
        info!("backing store reachable");

        let row = match self.table.fetch_latest(self.bootstrap_device).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!(device_id = self.bootstrap_device, "no stored reading to bootstrap from");
                return None;
            }
            Err(e) => {
                warn!(error = %e, device_id = self.bootstrap_device, "bootstrap fetch failed");
                self.counters.record_failure();
                return None;
            }
        };

        match row.normalize_stored(ChangeKind::Insert, UpdateSource::Poll) {
            Ok(update) => {
                let outcome = self.reconciler.ingest(update);
                self.counters.record(&outcome);
                Some(outcome)
            }
            Err(e) => {
                warn!(error = %e, "malformed bootstrap record rejected");
                self.counters.record_malformed();
                None
            }
        }
    }

    /// Bootstrap, puis ticks sans fin. Un tick en échec n'arrête pas la boucle.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(interval_ms = self.interval.as_millis() as u64, limit = self.limit, "starting poll channel");
        tokio::spawn(async move {
            self.bootstrap().await;
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.poll_once().await {
                    Ok(report) if report.applied > 0 => {
                        debug!(fetched = report.fetched, applied = report.applied, "poll tick applied rows");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "poll fetch failed, retrying next tick"),
                }
            }
        })
    }
}
