//! Priority scheduler and admission controller.
//!
//! Lanes are served in strict priority order (hot, vlm_ocr, maintenance,
//! backfill). A lane is skipped when its gate is closed or when its
//! admitted plus running count is at `max_in_flight`. Within a lane, eligible
//! jobs leave in enqueue order.
//!
//! All lane bookkeeping lives behind one async mutex, and every Job Store
//! write that accompanies a lane change happens while that mutex is held,
//! so concurrent submit/next/fail calls never double-dispatch or drift the
//! counters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use agential_core::{
    Error, Job, JobKind, JobState, JobStore, Lane, NewJob, RejectReason, Result, StateChange,
    SubmitResult,
};

use crate::backoff::RetryPolicy;
use crate::gate::{GateView, ResourceGate};
use crate::lane::{LaneConfig, SchedulerConfig};

/// A job waiting in its lane, either queued or admitted.
#[derive(Debug, Clone)]
struct QueuedJob {
    id: Uuid,
    kind: JobKind,
    enqueued_at: DateTime<Utc>,
    next_eligible_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            enqueued_at: job.enqueued_at,
            next_eligible_at: job.next_eligible_at,
        }
    }

    fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.map_or(true, |t| t <= now)
    }

    fn is_expired_at(&self, config: &LaneConfig, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(config.ttl).map_or(false, |ttl| now - self.enqueued_at > ttl)
    }
}

/// Per-lane queue and in-flight bookkeeping.
#[derive(Debug)]
struct LaneState {
    config: LaneConfig,
    queue: VecDeque<QueuedJob>,
    /// Admitted at submit, holding a slot until a worker picks them up.
    admitted: VecDeque<QueuedJob>,
    running: usize,
}

impl LaneState {
    fn new(config: LaneConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            admitted: VecDeque::new(),
            running: 0,
        }
    }

    fn depth(&self) -> usize {
        self.queue.len()
    }

    fn in_flight(&self) -> usize {
        self.admitted.len() + self.running
    }

    fn has_slot(&self) -> bool {
        self.in_flight() < self.config.max_in_flight
    }

    /// Insert keeping enqueue order; retries normally land at the back.
    fn enqueue(&mut self, entry: QueuedJob) {
        let pos = self
            .queue
            .iter()
            .rposition(|q| (q.enqueued_at, q.id) <= (entry.enqueued_at, entry.id))
            .map_or(0, |p| p + 1);
        self.queue.insert(pos, entry);
    }
}

/// Where an in-flight job holds its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Admitted,
    Running,
}

struct SchedulerInner {
    lanes: [LaneState; 4],
    slots: HashMap<Uuid, (Lane, Slot)>,
}

impl SchedulerInner {
    fn lane(&self, lane: Lane) -> &LaneState {
        &self.lanes[lane.index()]
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneState {
        &mut self.lanes[lane.index()]
    }

    fn view(&self) -> GateView {
        GateView::new(
            Lane::ALL.map(|l| self.lane(l).depth()),
            Lane::ALL.map(|l| self.lane(l).in_flight()),
        )
    }

    /// Give back a slot. Returns false when the job held none.
    fn free_slot(&mut self, job_id: Uuid) -> bool {
        let Some((lane, slot)) = self.slots.remove(&job_id) else {
            return false;
        };
        let state = self.lane_mut(lane);
        match slot {
            Slot::Admitted => state.admitted.retain(|q| q.id != job_id),
            Slot::Running => state.running = state.running.saturating_sub(1),
        }
        true
    }
}

/// Per-lane counters reported by `stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub lane: Lane,
    pub depth: usize,
    pub in_flight: usize,
    pub max_depth: usize,
    pub max_in_flight: usize,
    pub gate_open: bool,
}

/// Priority scheduler over the four lanes.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    inner: Mutex<SchedulerInner>,
    gates: HashMap<Lane, Arc<dyn ResourceGate>>,
    retry: RetryPolicy,
    max_attempts: i32,
    /// Kinds some worker can run; `None` accepts every kind.
    serviceable: Option<HashSet<JobKind>>,
    notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        let retry = config.retry.clone();
        let max_attempts = config.max_attempts;
        let lanes = config.into_lanes().map(LaneState::new);
        Self {
            store,
            inner: Mutex::new(SchedulerInner {
                lanes,
                slots: HashMap::new(),
            }),
            gates: HashMap::new(),
            retry,
            max_attempts,
            serviceable: None,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Restrict submissions to the kinds that have a registered handler.
    /// Any other kind is dead-lettered at submit as fatal.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = JobKind>) -> Self {
        self.serviceable = Some(kinds.into_iter().collect());
        self
    }

    fn serves(&self, kind: JobKind) -> bool {
        self.serviceable
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }

    /// Attach a resource gate to a lane, replacing any previous one.
    pub fn with_gate(mut self, lane: Lane, gate: Arc<dyn ResourceGate>) -> Self {
        self.gates.insert(lane, gate);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Woken whenever work may have become available.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    fn gate_open(&self, lane: Lane, view: &GateView) -> bool {
        self.gates.get(&lane).map_or(true, |g| g.is_open(view))
    }

    /// Submit a job.
    ///
    /// A kind with no handler is recorded as dead-lettered and returned as
    /// `Error::Fatal`.
    pub async fn submit(&self, new: NewJob) -> Result<SubmitResult> {
        self.submit_at(new, Utc::now()).await
    }

    /// `submit` with an explicit clock.
    #[instrument(skip(self, new), fields(subsystem = "jobs", component = "scheduler", op = "submit", job_kind = %new.kind, lane = %new.lane()))]
    pub async fn submit_at(&self, mut new: NewJob, now: DateTime<Utc>) -> Result<SubmitResult> {
        new.max_attempts.get_or_insert(self.max_attempts);
        let lane = new.lane();
        let mut inner = self.inner.lock().await;

        if !self.serves(new.kind) {
            let job = Job::new(new, now);
            self.store.insert(&job).await?;
            let reason = format!("unsupported job kind: no handler for {}", job.kind);
            self.store
                .update_state(job.id, StateChange::dead_letter(None, reason.clone()))
                .await?;
            warn!(job_id = %job.id, "Unsupported job kind, dead-lettered at submit");
            return Err(Error::Fatal(format!("job {}: {}", job.id, reason)));
        }

        if let Some(canonical_id) = &new.canonical_id {
            if let Some(existing) = self.store.find_active(canonical_id, new.kind).await? {
                debug!(
                    canonical_id = %canonical_id,
                    job_id = %existing.id,
                    "Coalesced onto active job"
                );
                return Ok(SubmitResult::Coalesced(existing.id));
            }
        }

        let state = inner.lane(lane);
        let depth = state.depth();
        if depth >= state.config.max_depth {
            warn!(
                depth,
                max_depth = state.config.max_depth,
                "Admission rejected, lane full"
            );
            return Ok(SubmitResult::Rejected(RejectReason::LaneFull {
                depth,
                max_depth: state.config.max_depth,
            }));
        }

        let admit =
            state.queue.is_empty() && state.has_slot() && self.gate_open(lane, &inner.view());

        let mut job = Job::new(new, now);
        if admit {
            job.apply(&StateChange::admit(), now)?;
        }
        self.store.insert(&job).await?;

        let result = if admit {
            inner.lane_mut(lane).admitted.push_back(QueuedJob::from_job(&job));
            inner.slots.insert(job.id, (lane, Slot::Admitted));
            SubmitResult::Admitted(job.id)
        } else {
            inner.lane_mut(lane).enqueue(QueuedJob::from_job(&job));
            SubmitResult::Queued(job.id)
        };
        drop(inner);

        debug!(job_id = %job.id, admitted = admit, "Job submitted");
        self.notify.notify_waiters();
        Ok(result)
    }

    /// Next job for any kind.
    pub async fn next(&self, worker_id: &str) -> Result<Option<Job>> {
        self.next_for_at(worker_id, &JobKind::ALL, Utc::now()).await
    }

    /// Next job whose kind is in `kinds`.
    pub async fn next_for(&self, worker_id: &str, kinds: &[JobKind]) -> Result<Option<Job>> {
        self.next_for_at(worker_id, kinds, Utc::now()).await
    }

    /// Select, mark running and return the next job.
    ///
    /// Expired pending jobs met along the way are dead-lettered.
    pub async fn next_for_at(
        &self,
        worker_id: &str,
        kinds: &[JobKind],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().await;

        for lane in Lane::ALL {
            self.expire_admitted(&mut inner, lane, now).await?;
            let state = inner.lane(lane);
            if state.admitted.is_empty() && state.queue.is_empty() {
                continue;
            }
            // A closed gate holds back admitted jobs as well as queued ones.
            if !self.gate_open(lane, &inner.view()) {
                debug!(
                    subsystem = "jobs",
                    component = "scheduler",
                    lane = %lane,
                    "Gate closed, skipping lane"
                );
                continue;
            }

            // Admitted jobs already hold a slot.
            let admitted_pos = inner
                .lane(lane)
                .admitted
                .iter()
                .position(|q| kinds.contains(&q.kind));
            if let Some(pos) = admitted_pos {
                let job_id = inner.lane(lane).admitted[pos].id;
                let job = self.store.update_state(job_id, StateChange::start()).await?;
                let state = inner.lane_mut(lane);
                state.admitted.remove(pos);
                state.running += 1;
                inner.slots.insert(job_id, (lane, Slot::Running));
                debug!(
                    subsystem = "jobs",
                    component = "scheduler",
                    op = "next",
                    worker_id,
                    job_id = %job_id,
                    lane = %lane,
                    "Dispatched admitted job"
                );
                return Ok(Some(job));
            }

            if !inner.lane(lane).has_slot() {
                debug!(
                    subsystem = "jobs",
                    component = "scheduler",
                    lane = %lane,
                    in_flight = inner.lane(lane).in_flight(),
                    "Lane at max in-flight, skipping"
                );
                continue;
            }

            let mut idx = 0;
            while idx < inner.lane(lane).queue.len() {
                let entry = inner.lane(lane).queue[idx].clone();
                if entry.is_expired_at(&inner.lane(lane).config, now) {
                    self.expire(&mut inner, lane, idx, now).await?;
                    continue;
                }
                if !kinds.contains(&entry.kind) || !entry.is_eligible_at(now) {
                    idx += 1;
                    continue;
                }

                let job = self.store.update_state(entry.id, StateChange::start()).await?;
                let state = inner.lane_mut(lane);
                state.queue.remove(idx);
                state.running += 1;
                inner.slots.insert(entry.id, (lane, Slot::Running));
                debug!(
                    subsystem = "jobs",
                    component = "scheduler",
                    op = "next",
                    worker_id,
                    job_id = %entry.id,
                    lane = %lane,
                    attempt = job.attempt_count,
                    "Dispatched queued job"
                );
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Dead-letter the queued entry at `idx` for exceeding the lane TTL.
    async fn expire(
        &self,
        inner: &mut SchedulerInner,
        lane: Lane,
        idx: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(entry) = inner.lane(lane).queue.get(idx).cloned() else {
            return Ok(());
        };
        self.record_expiry(inner.lane(lane), &entry, now).await?;
        inner.lane_mut(lane).queue.remove(idx);
        Ok(())
    }

    /// Dead-letter admitted entries nobody picked up within the lane TTL and
    /// free their slots. Returns how many were expired.
    async fn expire_admitted(
        &self,
        inner: &mut SchedulerInner,
        lane: Lane,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let state = inner.lane(lane);
        let stale: Vec<QueuedJob> = state
            .admitted
            .iter()
            .filter(|q| q.is_expired_at(&state.config, now))
            .cloned()
            .collect();
        for entry in &stale {
            self.record_expiry(inner.lane(lane), entry, now).await?;
            inner.free_slot(entry.id);
        }
        Ok(stale.len())
    }

    async fn record_expiry(
        &self,
        state: &LaneState,
        entry: &QueuedJob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lane = state.config.lane;
        let reason = format!(
            "expired: waiting since {} exceeded lane TTL of {}s",
            entry.enqueued_at.to_rfc3339(),
            state.config.ttl.as_secs()
        );
        match self
            .store
            .update_state(entry.id, StateChange::dead_letter(None, reason))
            .await
        {
            Ok(_) => {
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    job_id = %entry.id,
                    lane = %lane,
                    waited_secs = (now - entry.enqueued_at).num_seconds(),
                    "Job dead-lettered after TTL"
                );
                Ok(())
            }
            // Already moved on in the store; just drop the stale entry.
            Err(Error::InvalidTransition { .. }) | Err(Error::JobNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Dead-letter every waiting job past its lane TTL, gates notwithstanding.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut expired = 0;
        for lane in Lane::ALL {
            expired += self.expire_admitted(&mut inner, lane, now).await?;
            let mut idx = 0;
            while idx < inner.lane(lane).queue.len() {
                if inner.lane(lane).queue[idx].is_expired_at(&inner.lane(lane).config, now) {
                    self.expire(&mut inner, lane, idx, now).await?;
                    expired += 1;
                } else {
                    idx += 1;
                }
            }
        }
        if expired > 0 {
            info!(
                subsystem = "jobs",
                component = "scheduler",
                op = "sweep_expired",
                record_count = expired,
                "Expired jobs dead-lettered"
            );
        }
        Ok(expired)
    }

    /// Record a failed attempt: retry with backoff or dead-letter when exhausted.
    pub async fn fail(&self, job_id: Uuid, error: impl Into<String>) -> Result<Job> {
        self.fail_at(job_id, error, Utc::now()).await
    }

    pub async fn fail_at(
        &self,
        job_id: Uuid,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let error = error.into();
        let mut inner = self.inner.lock().await;
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        let attempt = job.attempt_count + 1;
        let updated = if attempt >= job.max_attempts {
            let updated = self
                .store
                .update_state(job_id, StateChange::dead_letter(Some(attempt), error.clone()))
                .await?;
            warn!(
                subsystem = "jobs",
                component = "scheduler",
                job_id = %job_id,
                job_kind = %job.kind,
                attempt,
                max_attempts = job.max_attempts,
                error = %error,
                "Attempts exhausted, job dead-lettered"
            );
            updated
        } else {
            let delay = self.retry.delay_for(attempt);
            let eligible_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let updated = self
                .store
                .update_state(
                    job_id,
                    StateChange::retry(attempt, now, eligible_at, error.clone()),
                )
                .await?;
            // Requeue bypasses the depth cap; the job was already admitted once.
            inner
                .lane_mut(job.lane)
                .enqueue(QueuedJob::from_job(&updated));
            warn!(
                subsystem = "jobs",
                component = "scheduler",
                job_id = %job_id,
                job_kind = %job.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, scheduled for retry"
            );
            updated
        };

        inner.free_slot(job_id);
        drop(inner);
        self.notify.notify_waiters();
        Ok(updated)
    }

    /// Dead-letter now, for fatal errors.
    pub async fn dead_letter(&self, job_id: Uuid, error: impl Into<String>) -> Result<Job> {
        let error = error.into();
        let mut inner = self.inner.lock().await;
        let job = self
            .store
            .update_state(job_id, StateChange::dead_letter(None, error.clone()))
            .await?;
        if !inner.free_slot(job_id) {
            // A queued job can be dead-lettered directly too.
            let lane = inner.lane_mut(job.lane);
            lane.queue.retain(|q| q.id != job_id);
        }
        drop(inner);
        warn!(
            subsystem = "jobs",
            component = "scheduler",
            job_id = %job_id,
            job_kind = %job.kind,
            error = %error,
            "Job dead-lettered"
        );
        self.notify.notify_waiters();
        Ok(job)
    }

    /// Return an in-flight slot once the worker has recorded a terminal outcome.
    pub async fn release(&self, job_id: Uuid) -> bool {
        let released = self.inner.lock().await.free_slot(job_id);
        if released {
            self.notify.notify_waiters();
        }
        released
    }

    /// Put a running job back in its lane after its outcome could not be
    /// recorded, freeing the slot either way. No attempt is charged.
    ///
    /// Returns false when the job was not requeued. If the store refuses the
    /// requeue as well, the job stays `running` there until the next `restore`.
    pub async fn requeue(&self, job_id: Uuid) -> bool {
        self.requeue_at(job_id, Utc::now()).await
    }

    pub async fn requeue_at(&self, job_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        let requeued = match self
            .store
            .update_state(job_id, StateChange::requeue(now))
            .await
        {
            Ok(job) => {
                inner.lane_mut(job.lane).enqueue(QueuedJob::from_job(&job));
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    job_id = %job_id,
                    lane = %job.lane,
                    "Job requeued after its outcome was lost"
                );
                true
            }
            // Already terminal; only the slot is left to free.
            Err(Error::InvalidTransition { .. }) => false,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "scheduler",
                    job_id = %job_id,
                    error = %e,
                    "Job stranded as running until the next restore"
                );
                false
            }
        };
        inner.free_slot(job_id);
        drop(inner);
        self.notify.notify_waiters();
        requeued
    }

    /// Rebuild lane queues from the Job Store after a restart.
    ///
    /// Jobs left admitted or running by a lost worker go back to pending
    /// without being charged an attempt.
    pub async fn restore(&self) -> Result<usize> {
        self.restore_at(Utc::now()).await
    }

    pub async fn restore_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        for lane in Lane::ALL {
            let state = inner.lane_mut(lane);
            state.queue.clear();
            state.admitted.clear();
            state.running = 0;
        }
        inner.slots.clear();

        let mut requeued = 0;
        for orphaned in [JobState::Admitted, JobState::Running] {
            for job in self.store.list_by_state(orphaned, i64::MAX).await? {
                self.store
                    .update_state(job.id, StateChange::requeue(now))
                    .await?;
                requeued += 1;
            }
        }

        let pending = self.store.list_by_state(JobState::Pending, i64::MAX).await?;
        let mut restored = 0;
        for job in &pending {
            if !self.serves(job.kind) {
                let reason = format!("unsupported job kind: no handler for {}", job.kind);
                self.store
                    .update_state(job.id, StateChange::dead_letter(None, reason))
                    .await?;
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    job_id = %job.id,
                    job_kind = %job.kind,
                    "Unsupported job kind, dead-lettered on restore"
                );
                continue;
            }
            inner.lane_mut(job.lane).enqueue(QueuedJob::from_job(job));
            restored += 1;
        }
        drop(inner);

        info!(
            subsystem = "jobs",
            component = "scheduler",
            op = "restore",
            record_count = restored,
            requeued,
            "Lane queues restored"
        );
        self.notify.notify_waiters();
        Ok(restored)
    }

    /// Per-lane depth and in-flight counters, in priority order.
    pub async fn stats(&self) -> Vec<LaneStats> {
        let inner = self.inner.lock().await;
        let view = inner.view();
        Lane::ALL
            .into_iter()
            .map(|lane| {
                let state = inner.lane(lane);
                LaneStats {
                    lane,
                    depth: state.depth(),
                    in_flight: state.in_flight(),
                    max_depth: state.config.max_depth,
                    max_in_flight: state.config.max_in_flight,
                    gate_open: self.gate_open(lane, &view),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agential_core::CanonicalId;
    use agential_db::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn scheduler_with(config: SchedulerConfig) -> (Arc<MemoryJobStore>, Scheduler) {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = Scheduler::new(store.clone(), config.with_retry(RetryPolicy::immediate()));
        (store, scheduler)
    }

    fn scheduler() -> (Arc<MemoryJobStore>, Scheduler) {
        scheduler_with(SchedulerConfig::default())
    }

    fn job(kind: JobKind) -> NewJob {
        NewJob::new(kind, json!({}))
    }

    #[tokio::test]
    async fn test_first_submit_is_admitted_then_queued_when_full() {
        let (store, s) = scheduler_with(
            SchedulerConfig::default()
                .with_lane(LaneConfig::default_for(Lane::Hot).with_max_in_flight(1)),
        );
        let first = s.submit(job(JobKind::Summarize)).await.unwrap();
        let SubmitResult::Admitted(id) = first else {
            panic!("expected Admitted, got {:?}", first);
        };
        assert_eq!(
            store.get(id).await.unwrap().unwrap().state,
            JobState::Admitted
        );

        let second = s.submit(job(JobKind::Summarize)).await.unwrap();
        assert!(matches!(second, SubmitResult::Queued(_)));

        let stats = s.stats().await;
        assert_eq!(stats[0].in_flight, 1);
        assert_eq!(stats[0].depth, 1);
    }

    #[tokio::test]
    async fn test_configured_attempt_limit_applies_when_unset() {
        let (store, s) = scheduler_with(SchedulerConfig::default().with_max_attempts(5));
        let plain = s.submit(job(JobKind::Embed)).await.unwrap().job_id().unwrap();
        let own = s
            .submit(job(JobKind::Embed).with_max_attempts(2))
            .await
            .unwrap()
            .job_id()
            .unwrap();
        assert_eq!(store.get(plain).await.unwrap().unwrap().max_attempts, 5);
        assert_eq!(store.get(own).await.unwrap().unwrap().max_attempts, 2);
    }

    #[tokio::test]
    async fn test_rejects_at_max_depth() {
        let (_, s) = scheduler_with(
            SchedulerConfig::default().with_lane(
                LaneConfig::default_for(Lane::VlmOcr)
                    .with_max_depth(2)
                    .with_max_in_flight(1),
            ),
        );
        // One admitted, two queued, the fourth bounces.
        for _ in 0..3 {
            s.submit(job(JobKind::Ocr)).await.unwrap();
        }
        let result = s.submit(job(JobKind::Ocr)).await.unwrap();
        assert_eq!(
            result,
            SubmitResult::Rejected(RejectReason::LaneFull {
                depth: 2,
                max_depth: 2
            })
        );
        let err = result.into_result(Lane::VlmOcr).unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { .. }));
    }

    #[tokio::test]
    async fn test_coalesces_duplicate_canonical_id_and_kind() {
        let (_, s) = scheduler();
        let id = CanonicalId::arxiv("2401.01234").unwrap();
        let first = s
            .submit(job(JobKind::Ingest).with_canonical_id(id.clone()))
            .await
            .unwrap();
        let dup = s
            .submit(job(JobKind::Ingest).with_canonical_id(id.clone()))
            .await
            .unwrap();
        assert_eq!(dup, SubmitResult::Coalesced(first.job_id().unwrap()));

        // Different kind for the same id is a separate job.
        let other = s
            .submit(job(JobKind::Embed).with_canonical_id(id))
            .await
            .unwrap();
        assert_ne!(other.job_id(), first.job_id());
    }

    #[tokio::test]
    async fn test_priority_across_lanes() {
        let (_, s) = scheduler();
        let t0 = Utc::now();
        let backfill = s
            .submit_at(job(JobKind::Ingest).with_lane(Lane::Backfill), t0)
            .await
            .unwrap();
        let maintenance = s
            .submit_at(job(JobKind::Reindex), t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let hot = s
            .submit_at(job(JobKind::Summarize), t0 + chrono::Duration::seconds(2))
            .await
            .unwrap();

        let order: Vec<Uuid> = [
            s.next("w").await.unwrap().unwrap().id,
            s.next("w").await.unwrap().unwrap().id,
            s.next("w").await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(
            order,
            vec![
                hot.job_id().unwrap(),
                maintenance.job_id().unwrap(),
                backfill.job_id().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_lane() {
        let (_, s) = scheduler_with(
            SchedulerConfig::default()
                .with_lane(LaneConfig::default_for(Lane::Hot).with_max_in_flight(1)),
        );
        let a = s.submit(job(JobKind::Embed)).await.unwrap();
        let b = s.submit(job(JobKind::Embed)).await.unwrap();
        let c = s.submit(job(JobKind::Embed)).await.unwrap();

        let first = s.next("w").await.unwrap().unwrap();
        assert_eq!(first.id, a.job_id().unwrap());
        assert!(s.next("w").await.unwrap().is_none());

        s.release(first.id).await;
        assert_eq!(s.next("w").await.unwrap().unwrap().id, b.job_id().unwrap());
        s.release(b.job_id().unwrap()).await;
        assert_eq!(s.next("w").await.unwrap().unwrap().id, c.job_id().unwrap());
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_max() {
        let (_, s) = scheduler_with(
            SchedulerConfig::default()
                .with_lane(LaneConfig::default_for(Lane::Maintenance).with_max_in_flight(2)),
        );
        for _ in 0..5 {
            s.submit(job(JobKind::KgLink)).await.unwrap();
        }
        let mut running = Vec::new();
        while let Some(job) = s.next("w").await.unwrap() {
            running.push(job.id);
        }
        assert_eq!(running.len(), 2);
        assert_eq!(s.stats().await[Lane::Maintenance.index()].in_flight, 2);

        s.release(running[0]).await;
        assert!(s.next("w").await.unwrap().is_some());
        assert!(s.next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_gate_falls_through_to_lower_lane() {
        let open = Arc::new(AtomicBool::new(false));
        let gate_flag = open.clone();
        let (store, s) = scheduler();
        let s = s.with_gate(
            Lane::VlmOcr,
            Arc::new(move |_: &GateView| gate_flag.load(Ordering::SeqCst)),
        );

        let ocr = s.submit(job(JobKind::Ocr)).await.unwrap();
        assert!(matches!(ocr, SubmitResult::Queued(_)));
        let maint = s.submit(job(JobKind::Reindex)).await.unwrap();

        let picked = s.next("w").await.unwrap().unwrap();
        assert_eq!(picked.id, maint.job_id().unwrap());

        // Skipped, not failed.
        let ocr_job = store.get(ocr.job_id().unwrap()).await.unwrap().unwrap();
        assert_eq!(ocr_job.state, JobState::Pending);
        assert_eq!(ocr_job.attempt_count, 0);

        open.store(true, Ordering::SeqCst);
        assert_eq!(
            s.next("w").await.unwrap().unwrap().id,
            ocr.job_id().unwrap()
        );
    }

    #[tokio::test]
    async fn test_closed_gate_holds_back_admitted_job() {
        let open = Arc::new(AtomicBool::new(true));
        let gate_flag = open.clone();
        let (store, s) = scheduler();
        let s = s.with_gate(
            Lane::VlmOcr,
            Arc::new(move |_: &GateView| gate_flag.load(Ordering::SeqCst)),
        );

        let ocr = s.submit(job(JobKind::Ocr)).await.unwrap();
        assert!(matches!(ocr, SubmitResult::Admitted(_)));

        open.store(false, Ordering::SeqCst);
        assert!(s.next("w").await.unwrap().is_none());
        let ocr_job = store.get(ocr.job_id().unwrap()).await.unwrap().unwrap();
        assert_eq!(ocr_job.state, JobState::Admitted);

        open.store(true, Ordering::SeqCst);
        assert_eq!(
            s.next("w").await.unwrap().unwrap().id,
            ocr.job_id().unwrap()
        );
    }

    #[tokio::test]
    async fn test_unsupported_kind_dead_lettered_at_submit() {
        let (store, s) = scheduler_with(
            SchedulerConfig::default()
                .with_lane(LaneConfig::default_for(Lane::Maintenance).with_max_in_flight(1)),
        );
        let s = s.with_kinds([JobKind::Reindex]);

        let err = s.submit(job(JobKind::KgLink)).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        let dead = store
            .list_by_state(JobState::DeadLettered, 10)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].kind, JobKind::KgLink);
        assert!(dead[0].last_error.as_deref().unwrap().contains("unsupported"));

        // The lane's only slot is still free for the kind that has a worker.
        let reindex = s.submit(job(JobKind::Reindex)).await.unwrap();
        assert!(matches!(reindex, SubmitResult::Admitted(_)));
        let picked = s.next_for("w", &[JobKind::Reindex]).await.unwrap();
        assert_eq!(picked.map(|j| j.id), reindex.job_id());
    }

    #[tokio::test]
    async fn test_unpicked_admitted_job_expires_and_frees_slot() {
        let (store, s) = scheduler_with(
            SchedulerConfig::default().with_lane(
                LaneConfig::default_for(Lane::Maintenance)
                    .with_max_in_flight(1)
                    .with_ttl(Duration::from_secs(60)),
            ),
        );
        let t0 = Utc::now();
        let kg = s.submit_at(job(JobKind::KgLink), t0).await.unwrap();
        assert!(matches!(kg, SubmitResult::Admitted(_)));
        let reindex = s
            .submit_at(job(JobKind::Reindex), t0 + chrono::Duration::seconds(100))
            .await
            .unwrap();
        assert!(matches!(reindex, SubmitResult::Queued(_)));

        let sweep_at = t0 + chrono::Duration::seconds(90);
        assert_eq!(s.sweep_expired_at(sweep_at).await.unwrap(), 1);
        assert_eq!(
            store.get(kg.job_id().unwrap()).await.unwrap().unwrap().state,
            JobState::DeadLettered
        );
        assert_eq!(s.stats().await[Lane::Maintenance.index()].in_flight, 0);

        let later = t0 + chrono::Duration::seconds(110);
        let picked = s
            .next_for_at("w", &[JobKind::Reindex], later)
            .await
            .unwrap();
        assert_eq!(picked.map(|j| j.id), reindex.job_id());
    }

    #[tokio::test]
    async fn test_restore_dead_letters_unsupported_kinds() {
        let store = Arc::new(MemoryJobStore::new());
        let s = Scheduler::new(store.clone(), SchedulerConfig::default());
        let ocr = s.submit(job(JobKind::Ocr)).await.unwrap().job_id().unwrap();
        let ingest = s.submit(job(JobKind::Ingest)).await.unwrap().job_id().unwrap();

        let restarted =
            Scheduler::new(store.clone(), SchedulerConfig::default()).with_kinds([JobKind::Ingest]);
        assert_eq!(restarted.restore().await.unwrap(), 1);
        assert_eq!(
            store.get(ocr).await.unwrap().unwrap().state,
            JobState::DeadLettered
        );
        assert_eq!(
            restarted.next("w").await.unwrap().map(|j| j.id),
            Some(ingest)
        );
    }

    #[test]
    fn test_queued_entry_eligibility_and_expiry() {
        let t0 = Utc::now();
        let mut entry = QueuedJob::from_job(&Job::new(job(JobKind::Embed), t0));
        let config = LaneConfig::default_for(Lane::Hot).with_ttl(Duration::from_secs(60));

        assert!(entry.is_eligible_at(t0));
        assert!(!entry.is_expired_at(&config, t0 + chrono::Duration::seconds(60)));
        assert!(entry.is_expired_at(&config, t0 + chrono::Duration::seconds(61)));

        entry.next_eligible_at = Some(t0 + chrono::Duration::seconds(5));
        assert!(!entry.is_eligible_at(t0));
        assert!(entry.is_eligible_at(t0 + chrono::Duration::seconds(5)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submit_and_next_never_double_dispatch() {
        const SUBMITTERS: usize = 8;
        const PER_SUBMITTER: usize = 25;
        const TOTAL: usize = SUBMITTERS * PER_SUBMITTER;
        const MAX_IN_FLIGHT: usize = 4;

        let store = Arc::new(MemoryJobStore::new());
        let s = Arc::new(Scheduler::new(
            store,
            SchedulerConfig::default().with_lane(
                LaneConfig::default_for(Lane::Hot)
                    .with_max_depth(TOTAL)
                    .with_max_in_flight(MAX_IN_FLIGHT),
            ),
        ));
        let dispatched = Arc::new(AtomicUsize::new(0));
        let holding = Arc::new(AtomicUsize::new(0));

        let mut submitters = Vec::new();
        for _ in 0..SUBMITTERS {
            let s = s.clone();
            submitters.push(tokio::spawn(async move {
                for _ in 0..PER_SUBMITTER {
                    let result = s.submit(job(JobKind::Summarize)).await.unwrap();
                    assert!(result.job_id().is_some(), "unexpected {:?}", result);
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut workers = Vec::new();
        for w in 0..6 {
            let s = s.clone();
            let dispatched = dispatched.clone();
            let holding = holding.clone();
            workers.push(tokio::spawn(async move {
                let worker_id = format!("w{}", w);
                let mut seen = Vec::new();
                while dispatched.load(Ordering::SeqCst) < TOTAL {
                    match s.next(&worker_id).await.unwrap() {
                        Some(job) => {
                            let held = holding.fetch_add(1, Ordering::SeqCst) + 1;
                            assert!(held <= MAX_IN_FLIGHT, "{} jobs in flight", held);
                            assert!(s.stats().await[0].in_flight <= MAX_IN_FLIGHT);
                            seen.push(job.id);
                            dispatched.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            holding.fetch_sub(1, Ordering::SeqCst);
                            assert!(s.release(job.id).await);
                        }
                        None => tokio::task::yield_now().await,
                    }
                }
                seen
            }));
        }

        tokio::time::timeout(Duration::from_secs(30), async {
            for handle in submitters {
                handle.await.unwrap();
            }
            let mut all = HashSet::new();
            for handle in workers {
                for id in handle.await.unwrap() {
                    assert!(all.insert(id), "job {} dispatched twice", id);
                }
            }
            assert_eq!(all.len(), TOTAL);
        })
        .await
        .expect("concurrent dispatch did not finish");

        let stats = s.stats().await;
        assert_eq!(stats[0].in_flight, 0);
        assert_eq!(stats[0].depth, 0);
    }

    #[tokio::test]
    async fn test_attempts_bounded_then_dead_lettered() {
        let (store, s) = scheduler();
        let id = s
            .submit(job(JobKind::Summarize).with_max_attempts(3))
            .await
            .unwrap()
            .job_id()
            .unwrap();

        let mut executions = 0;
        while let Some(job) = s.next("w").await.unwrap() {
            executions += 1;
            s.fail(job.id, "provider timeout").await.unwrap();
        }
        assert_eq!(executions, 3);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLettered);
        assert_eq!(job.attempt_count, 3);
        assert_eq!(job.last_error.as_deref(), Some("provider timeout"));
        assert_eq!(s.stats().await[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let store = Arc::new(MemoryJobStore::new());
        let s = Scheduler::new(
            store.clone(),
            SchedulerConfig::default().with_retry(RetryPolicy {
                base: Duration::from_secs(10),
                max: Duration::from_secs(60),
                jitter: Duration::ZERO,
            }),
        );
        let t0 = Utc::now();
        s.submit_at(job(JobKind::Embed), t0).await.unwrap();
        let job = s
            .next_for_at("w", &JobKind::ALL, t0)
            .await
            .unwrap()
            .unwrap();
        let retried = s.fail_at(job.id, "503", t0).await.unwrap();
        assert_eq!(retried.state, JobState::Pending);
        assert_eq!(
            retried.next_eligible_at,
            Some(t0 + chrono::Duration::seconds(10))
        );

        let early = t0 + chrono::Duration::seconds(5);
        assert!(s
            .next_for_at("w", &JobKind::ALL, early)
            .await
            .unwrap()
            .is_none());
        let later = t0 + chrono::Duration::seconds(11);
        let again = s
            .next_for_at("w", &JobKind::ALL, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_dead_letters_instead_of_running() {
        let (store, s) = scheduler_with(
            SchedulerConfig::default().with_lane(
                LaneConfig::default_for(Lane::Backfill)
                    .with_ttl(Duration::from_secs(60))
                    .with_max_in_flight(1),
            ),
        );
        let t0 = Utc::now();
        let blocker = s
            .submit_at(job(JobKind::Ingest).with_lane(Lane::Backfill), t0)
            .await
            .unwrap();
        let stale = s
            .submit_at(job(JobKind::Ingest).with_lane(Lane::Backfill), t0)
            .await
            .unwrap();

        let running = s
            .next_for_at("w", &JobKind::ALL, t0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.id, blocker.job_id().unwrap());
        s.release(running.id).await;

        let late = t0 + chrono::Duration::seconds(120);
        assert!(s
            .next_for_at("w", &JobKind::ALL, late)
            .await
            .unwrap()
            .is_none());
        let stale_job = store.get(stale.job_id().unwrap()).await.unwrap().unwrap();
        assert_eq!(stale_job.state, JobState::DeadLettered);
        assert!(stale_job.last_error.unwrap().contains("TTL"));
    }

    #[tokio::test]
    async fn test_sweep_expired_reaches_gated_lanes() {
        let (store, s) = scheduler();
        let s = s.with_gate(Lane::VlmOcr, Arc::new(|_: &GateView| false));
        let t0 = Utc::now();
        let ocr = s.submit_at(job(JobKind::Ocr), t0).await.unwrap();

        let late = t0 + chrono::Duration::hours(2);
        assert_eq!(s.sweep_expired_at(late).await.unwrap(), 1);
        assert_eq!(
            store
                .get(ocr.job_id().unwrap())
                .await
                .unwrap()
                .unwrap()
                .state,
            JobState::DeadLettered
        );
    }

    #[tokio::test]
    async fn test_next_for_filters_kinds() {
        let (_, s) = scheduler();
        s.submit(job(JobKind::Summarize)).await.unwrap();
        let embed = s.submit(job(JobKind::Embed)).await.unwrap();

        let picked = s.next_for("embedder-0", &[JobKind::Embed]).await.unwrap();
        assert_eq!(picked.map(|j| j.id), embed.job_id());
        assert!(s
            .next_for("embedder-0", &[JobKind::Embed])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_retry_requeue_bypasses_depth_cap() {
        let (store, s) = scheduler_with(
            SchedulerConfig::default().with_lane(
                LaneConfig::default_for(Lane::Hot)
                    .with_max_depth(1)
                    .with_max_in_flight(1),
            ),
        );
        let first = s.submit(job(JobKind::Embed)).await.unwrap();
        s.submit(job(JobKind::Embed)).await.unwrap();
        let running = s.next("w").await.unwrap().unwrap();
        assert_eq!(running.id, first.job_id().unwrap());

        // Lane is at depth 1; the retry still goes back in.
        s.fail(running.id, "transient").await.unwrap();
        assert_eq!(s.stats().await[0].depth, 2);
        assert_eq!(
            store.get(running.id).await.unwrap().unwrap().state,
            JobState::Pending
        );
    }

    #[tokio::test]
    async fn test_restore_requeues_orphans_without_charging() {
        let store = Arc::new(MemoryJobStore::new());
        let s = Scheduler::new(store.clone(), SchedulerConfig::default());
        let a = s.submit(job(JobKind::Ingest)).await.unwrap().job_id().unwrap();
        let b = s.submit(job(JobKind::Ingest)).await.unwrap().job_id().unwrap();
        let running = s.next("w").await.unwrap().unwrap();
        assert_eq!(running.id, a);

        // Simulate a restart: new scheduler over the same store.
        let restarted = Scheduler::new(store.clone(), SchedulerConfig::default());
        assert_eq!(restarted.restore().await.unwrap(), 2);

        let job_a = store.get(a).await.unwrap().unwrap();
        assert_eq!(job_a.state, JobState::Pending);
        assert_eq!(job_a.attempt_count, 0);
        assert_eq!(
            store.get(b).await.unwrap().unwrap().state,
            JobState::Pending
        );
        assert_eq!(restarted.stats().await[0].depth, 2);
        assert!(restarted.next("w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_requeue_returns_running_job_to_its_lane() {
        let (store, s) = scheduler();
        let id = s.submit(job(JobKind::Embed)).await.unwrap().job_id().unwrap();
        s.next("w").await.unwrap().unwrap();

        assert!(s.requeue(id).await);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(s.stats().await[0].in_flight, 0);
        assert_eq!(s.next("w").await.unwrap().map(|j| j.id), Some(id));
    }

    #[tokio::test]
    async fn test_requeue_of_terminal_job_only_frees_slot() {
        let (store, s) = scheduler();
        let id = s.submit(job(JobKind::Embed)).await.unwrap().job_id().unwrap();
        s.next("w").await.unwrap().unwrap();
        store
            .mark_terminal(id, agential_core::JobOutcome::Completed { result_ref: None })
            .await
            .unwrap();

        assert!(!s.requeue(id).await);
        assert_eq!(s.stats().await[0].in_flight, 0);
        assert_eq!(s.stats().await[0].depth, 0);
    }

    #[tokio::test]
    async fn test_fatal_dead_letters_and_frees_slot() {
        let (store, s) = scheduler();
        let id = s.submit(job(JobKind::Ingest)).await.unwrap().job_id().unwrap();
        s.next("w").await.unwrap().unwrap();
        s.dead_letter(id, "malformed payload").await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLettered);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(s.stats().await[0].in_flight, 0);
        assert!(!s.release(id).await);
    }
}
