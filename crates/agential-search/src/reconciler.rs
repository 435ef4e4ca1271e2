//! Periodic reconciliation of the lexical and vector stores.
//!
//! Each pass looks at canonical records touched since the previous pass.
//! Ids with an active job are still settling and are carried into the next
//! pass. For settled ids the two recorded hashes must agree, and each store
//! must actually hold what the record says it holds. Disagreements are
//! consistency faults: logged at ERROR and broadcast, never repaired here.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use agential_core::defaults::{EVENT_BUS_CAPACITY, RECONCILE_INTERVAL_SECS};
use agential_core::{
    CanonicalId, CanonicalRecord, CanonicalStore, ContentHash, Error, JobStore, LexicalStore,
    Result, StoreSide, VectorStore,
};

/// A detected disagreement for one canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum ConsistencyEvent {
    /// The record shows the two stores on different hashes with no job in flight.
    Diverged {
        canonical_id: CanonicalId,
        content_hash: ContentHash,
        lexical_hash: Option<ContentHash>,
        vector_hash: Option<ContentHash>,
        detected_at: DateTime<Utc>,
    },
    /// A store holds something other than what the record says it holds.
    Drift {
        canonical_id: CanonicalId,
        side: StoreSide,
        recorded: Option<ContentHash>,
        stored: Option<ContentHash>,
        detected_at: DateTime<Utc>,
    },
}

impl ConsistencyEvent {
    pub fn canonical_id(&self) -> &CanonicalId {
        match self {
            ConsistencyEvent::Diverged { canonical_id, .. }
            | ConsistencyEvent::Drift { canonical_id, .. } => canonical_id,
        }
    }

    /// The event as a `ConsistencyFault` error, for callers that want one.
    pub fn to_error(&self) -> Error {
        let detail = match self {
            ConsistencyEvent::Diverged {
                lexical_hash,
                vector_hash,
                ..
            } => format!(
                "lexical at {}, vector at {}",
                short(lexical_hash.as_ref()),
                short(vector_hash.as_ref())
            ),
            ConsistencyEvent::Drift {
                side,
                recorded,
                stored,
                ..
            } => format!(
                "{} store holds {}, record says {}",
                side,
                short(stored.as_ref()),
                short(recorded.as_ref())
            ),
        };
        Error::ConsistencyFault {
            canonical_id: self.canonical_id().to_string(),
            detail,
        }
    }
}

fn short(hash: Option<&ContentHash>) -> &str {
    hash.map(|h| h.short()).unwrap_or("<none>")
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Settled ids that were checked.
    pub checked: usize,
    /// Ids with an active job, deferred to the next pass.
    pub carried: usize,
    pub faults: Vec<ConsistencyEvent>,
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(RECONCILE_INTERVAL_SECS),
        }
    }
}

impl ReconcilerConfig {
    /// Read `RECONCILE_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let interval = std::env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Self::default().interval);
        Self { interval }
    }
}

#[derive(Default)]
struct PassState {
    last_pass: Option<DateTime<Utc>>,
    carried: BTreeSet<CanonicalId>,
}

/// Detects divergence between the two stores.
pub struct Reconciler {
    canonical: Arc<dyn CanonicalStore>,
    lexical: Arc<dyn LexicalStore>,
    vector: Arc<dyn VectorStore>,
    jobs: Arc<dyn JobStore>,
    events: broadcast::Sender<ConsistencyEvent>,
    state: Mutex<PassState>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        canonical: Arc<dyn CanonicalStore>,
        lexical: Arc<dyn LexicalStore>,
        vector: Arc<dyn VectorStore>,
        jobs: Arc<dyn JobStore>,
        config: ReconcilerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            canonical,
            lexical,
            vector,
            jobs,
            events,
            state: Mutex::new(PassState::default()),
            config,
        }
    }

    /// Subscribe to consistency fault events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsistencyEvent> {
        self.events.subscribe()
    }

    /// Run one pass over ids touched since the previous pass.
    pub async fn run_pass(&self) -> Result<ReconcileReport> {
        self.run_pass_at(Utc::now()).await
    }

    /// `run_pass` with an explicit pass timestamp.
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let start = Instant::now();
        let mut state = self.state.lock().await;
        let since = state.last_pass.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let mut records = self.canonical.touched_since(since).await?;
        for id in std::mem::take(&mut state.carried) {
            if records.iter().any(|r| r.canonical_id == id) {
                continue;
            }
            if let Some(record) = self.canonical.get(&id).await? {
                records.push(record);
            }
        }

        let mut report = ReconcileReport::default();
        for record in records {
            if self.jobs.has_active_for(&record.canonical_id).await? {
                trace!(
                    subsystem = "search",
                    component = "reconciler",
                    canonical_id = %record.canonical_id,
                    "Job in flight, carrying to next pass"
                );
                state.carried.insert(record.canonical_id);
                report.carried += 1;
                continue;
            }

            report.checked += 1;
            for event in self.check(&record, now).await? {
                self.surface(&event);
                report.faults.push(event);
            }
        }

        state.last_pass = Some(now);
        info!(
            subsystem = "search",
            component = "reconciler",
            op = "reconcile",
            record_count = report.checked,
            carried = report.carried,
            faults = report.faults.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    async fn check(
        &self,
        record: &CanonicalRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsistencyEvent>> {
        let mut events = Vec::new();

        if !record.is_consistent() {
            events.push(ConsistencyEvent::Diverged {
                canonical_id: record.canonical_id.clone(),
                content_hash: record.content_hash.clone(),
                lexical_hash: record.lexical_hash.clone(),
                vector_hash: record.vector_hash.clone(),
                detected_at: now,
            });
        }

        let lexical = self.lexical.stored_hash(&record.canonical_id).await?;
        let vector = self.vector.stored_hash(&record.canonical_id).await?;
        for (side, stored) in [(StoreSide::Lexical, lexical), (StoreSide::Vector, vector)] {
            let recorded = record.side_hash(side).cloned();
            if stored != recorded {
                events.push(ConsistencyEvent::Drift {
                    canonical_id: record.canonical_id.clone(),
                    side,
                    recorded,
                    stored,
                    detected_at: now,
                });
            }
        }

        if events.is_empty() {
            trace!(
                subsystem = "search",
                component = "reconciler",
                canonical_id = %record.canonical_id,
                "Consistent"
            );
        }
        Ok(events)
    }

    fn surface(&self, event: &ConsistencyEvent) {
        let fault = event.to_error();
        error!(
            subsystem = "search",
            component = "reconciler",
            canonical_id = %event.canonical_id(),
            error = %fault,
            "Consistency fault detected"
        );
        // No subscribers is fine; the log line is the record of last resort.
        let _ = self.events.send(event.clone());
    }

    /// Run a pass every `interval` until the handle shuts down.
    pub fn spawn(self: &Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let reconciler = Arc::clone(self);
        let interval = self.config.interval;

        let task = tokio::spawn(async move {
            info!(
                subsystem = "search",
                component = "reconciler",
                interval_secs = interval.as_secs(),
                "Reconciler started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "search", component = "reconciler", "Reconciler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = reconciler.run_pass().await {
                            warn!(
                                subsystem = "search",
                                component = "reconciler",
                                error = %e,
                                "Reconciliation pass failed"
                            );
                        }
                    }
                }
            }
        });

        debug!(subsystem = "search", component = "reconciler", "Reconciler task spawned");
        ReconcilerHandle { shutdown_tx, task }
    }
}

/// Handle to a running reconciler loop.
pub struct ReconcilerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("reconciler panicked: {}", e)))
    }
}
