//! Worker pool: fixed per-kind executors pulling from the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agential_core::defaults::{
    EVENT_BUS_CAPACITY, JOB_POLL_INTERVAL_MS, JOB_SWEEP_INTERVAL_SECS, JOB_TIMEOUT_SECS,
    WORKERS_EMBED, WORKERS_INGEST, WORKERS_KG_LINK, WORKERS_OCR, WORKERS_REINDEX,
    WORKERS_SUMMARIZE,
};
use agential_core::{Error, Job, JobKind, JobOutcome, JobState, Result};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::lane::env_or;
use crate::scheduler::Scheduler;

fn default_workers(kind: JobKind) -> usize {
    match kind {
        JobKind::Ingest => WORKERS_INGEST,
        JobKind::Summarize => WORKERS_SUMMARIZE,
        JobKind::Embed => WORKERS_EMBED,
        JobKind::Ocr => WORKERS_OCR,
        JobKind::KgLink => WORKERS_KG_LINK,
        JobKind::Reindex => WORKERS_REINDEX,
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle wait between polls when nothing is eligible.
    pub poll_interval: Duration,
    /// Overall bound on one handler execution.
    pub job_timeout: Duration,
    /// How often every lane is swept for TTL expiry.
    pub sweep_interval: Duration,
    workers: HashMap<JobKind, usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(JOB_POLL_INTERVAL_MS),
            job_timeout: Duration::from_secs(JOB_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(JOB_SWEEP_INTERVAL_SECS),
            workers: JobKind::ALL
                .into_iter()
                .map(|k| (k, default_workers(k)))
                .collect(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Idle poll interval |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job execution timeout |
    /// | `JOB_SWEEP_INTERVAL_SECS` | `60` | TTL sweep interval |
    /// | `WORKERS_<KIND>` | per kind | Workers for that kind, e.g. `WORKERS_KG_LINK` |
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(env_or(
                "JOB_POLL_INTERVAL_MS",
                JOB_POLL_INTERVAL_MS,
            )),
            job_timeout: Duration::from_secs(env_or("JOB_TIMEOUT_SECS", JOB_TIMEOUT_SECS)),
            sweep_interval: Duration::from_secs(
                env_or("JOB_SWEEP_INTERVAL_SECS", JOB_SWEEP_INTERVAL_SECS).max(1),
            ),
            workers: JobKind::ALL
                .into_iter()
                .map(|k| {
                    let key = format!("WORKERS_{}", k.as_str().to_uppercase());
                    (k, env_or(&key, default_workers(k)))
                })
                .collect(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the worker count for one kind; zero disables the kind.
    pub fn with_workers(mut self, kind: JobKind, count: usize) -> Self {
        self.workers.insert(kind, count);
        self
    }

    pub fn workers(&self, kind: JobKind) -> usize {
        self.workers.get(&kind).copied().unwrap_or(0)
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    WorkerStarted {
        worker_id: String,
    },
    JobStarted {
        job_id: Uuid,
        kind: JobKind,
        worker_id: String,
    },
    JobCompleted {
        job_id: Uuid,
        kind: JobKind,
        duration_ms: u64,
    },
    JobRetrying {
        job_id: Uuid,
        kind: JobKind,
        attempt: i32,
        error: String,
    },
    /// Terminal `failed`.
    JobFailed {
        job_id: Uuid,
        kind: JobKind,
        error: String,
    },
    JobDeadLettered {
        job_id: Uuid,
        kind: JobKind,
        error: String,
    },
    JobsExpired {
        count: usize,
    },
    WorkerStopped {
        worker_id: String,
    },
}

/// One handler per job kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any earlier one for the same kind.
    pub fn register<H: JobHandler + 'static>(&mut self, handler: H) {
        let kind = handler.kind();
        self.handlers.insert(kind, Arc::new(handler));
        debug!(job_kind = %kind, "Registered job handler");
    }

    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop taking new jobs and wait for in-flight executions to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker pool task failed: {}", e)))
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Fixed set of per-kind workers over one scheduler.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<Scheduler>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            scheduler,
            registry: Arc::new(registry),
            config,
            event_tx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn every worker plus the TTL sweeper and return a control handle.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let event_rx = self.event_tx.subscribe();

        let mut tasks = JoinSet::new();
        let mut total = 0;
        for kind in self.registry.kinds() {
            for index in 0..self.config.workers(kind) {
                let worker = Worker {
                    id: format!("{}-{}", kind, index),
                    kind,
                    scheduler: Arc::clone(&self.scheduler),
                    registry: Arc::clone(&self.registry),
                    config: self.config.clone(),
                    event_tx: self.event_tx.clone(),
                };
                tasks.spawn(worker.run(stop_rx.clone()));
                total += 1;
            }
        }
        tasks.spawn(sweep_loop(
            Arc::clone(&self.scheduler),
            self.config.sweep_interval,
            self.event_tx.clone(),
            stop_rx,
        ));

        info!(
            subsystem = "jobs",
            component = "worker",
            workers = total,
            kinds = ?self.registry.kinds(),
            "Worker pool started"
        );

        let task = tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            info!(subsystem = "jobs", component = "worker", "Worker pool shutting down");
            let _ = stop_tx.send(true);
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = ?e, "Worker task panicked");
                }
            }
            info!(subsystem = "jobs", component = "worker", "Worker pool stopped");
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }
}

async fn sweep_loop(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    event_tx: broadcast::Sender<WorkerEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = sleep(interval) => {}
        }
        match scheduler.sweep_expired().await {
            Ok(0) => {}
            Ok(count) => {
                let _ = event_tx.send(WorkerEvent::JobsExpired { count });
            }
            Err(e) => error!(error = %e, "TTL sweep failed"),
        }
    }
}

struct Worker {
    id: String,
    kind: JobKind,
    scheduler: Arc<Scheduler>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        debug!(worker_id = %self.id, "Worker started");
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted {
            worker_id: self.id.clone(),
        });
        let notify = self.scheduler.notifier();

        while !*stop_rx.borrow() {
            match self.scheduler.next_for(&self.id, &[self.kind]).await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        _ = notify.notified() => {}
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to select next job");
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped {
            worker_id: self.id.clone(),
        });
        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn execute(&self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let kind = job.kind;
        let attempt = job.attempt_count + 1;

        info!(
            subsystem = "jobs",
            component = "worker",
            worker_id = %self.id,
            job_id = %job_id,
            job_kind = %kind,
            lane = %job.lane,
            attempt,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            kind,
            worker_id: self.id.clone(),
        });

        let result = match self.registry.get(kind) {
            Some(handler) => {
                let ctx = JobContext::new(job, self.id.clone());
                match tokio::time::timeout(self.config.job_timeout, handler.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            job_id = %job_id,
                            job_kind = %kind,
                            timeout_secs = self.config.job_timeout.as_secs(),
                            "Job exceeded timeout"
                        );
                        JobResult::Retry(format!(
                            "job exceeded timeout of {}s",
                            self.config.job_timeout.as_secs()
                        ))
                    }
                }
            }
            None => JobResult::Fatal(format!("no handler registered for job kind {}", kind)),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        if let Err(e) = self.record(job_id, kind, attempt, result, duration_ms).await {
            error!(
                job_id = %job_id,
                job_kind = %kind,
                error = %e,
                "Failed to record job outcome"
            );
            // The slot must come back even when the store write failed, and
            // the job must not sit in `running` with no queue entry.
            self.scheduler.requeue(job_id).await;
        }
    }

    async fn record(
        &self,
        job_id: Uuid,
        kind: JobKind,
        attempt: i32,
        result: JobResult,
        duration_ms: u64,
    ) -> Result<()> {
        match result {
            JobResult::Success(result_ref) => {
                self.scheduler
                    .store()
                    .mark_terminal(job_id, JobOutcome::Completed { result_ref })
                    .await?;
                self.scheduler.release(job_id).await;
                info!(
                    job_id = %job_id,
                    job_kind = %kind,
                    duration_ms,
                    "Job completed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                    job_id,
                    kind,
                    duration_ms,
                });
            }
            JobResult::Retry(error) => {
                let job = self.scheduler.fail(job_id, error.clone()).await?;
                let event = if job.state == JobState::DeadLettered {
                    WorkerEvent::JobDeadLettered {
                        job_id,
                        kind,
                        error,
                    }
                } else {
                    WorkerEvent::JobRetrying {
                        job_id,
                        kind,
                        attempt,
                        error,
                    }
                };
                let _ = self.event_tx.send(event);
            }
            JobResult::Fatal(error) => {
                self.scheduler.dead_letter(job_id, error.clone()).await?;
                let _ = self.event_tx.send(WorkerEvent::JobDeadLettered {
                    job_id,
                    kind,
                    error,
                });
            }
            JobResult::Failed(error) => {
                self.scheduler
                    .store()
                    .mark_terminal(
                        job_id,
                        JobOutcome::Failed {
                            error: error.clone(),
                        },
                    )
                    .await?;
                self.scheduler.release(job_id).await;
                warn!(
                    job_id = %job_id,
                    job_kind = %kind,
                    error = %error,
                    duration_ms,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    kind,
                    error,
                });
            }
        }
        Ok(())
    }
}
