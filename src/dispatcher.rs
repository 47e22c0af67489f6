//! Priority-aware admission in front of a token bucket.
//!
//! Urgent callers try the bucket directly. Everyone else waits in one FIFO
//! queue per priority; a background task sweeps the queues from most to least
//! urgent, handing out tokens and dropping requests that waited too long.
//! Every queued request is resolved exactly once: admitted, dropped by the
//! weighted-timeout rule, expired at its deadline, or rejected on shutdown.

use crate::error::{PacerError, PacerResult};
use crate::feedback::{FeedbackController, RateChange};
use crate::limiter_config::LimiterConfig;
use crate::metrics::{LimiterStats, StatsCollector};
use crate::persistence::{PersistedState, StateStore};
use crate::priority::Priority;
use crate::token_bucket::TokenBucket;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type RequestId = Uuid;

/// Default pause between two drain sweeps
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(10);

/// How a queued request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Admitted,
    Dropped,
    Expired,
    Shutdown,
}

/// One caller waiting for a token
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    responder: oneshot::Sender<Decision>,
}

#[derive(Debug, Default)]
struct PriorityQueues {
    queues: [VecDeque<PendingRequest>; Priority::COUNT],
}

impl PriorityQueues {
    fn get_mut(&mut self, priority: Priority) -> &mut VecDeque<PendingRequest> {
        &mut self.queues[priority.index()]
    }

    fn len(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    fn push(&mut self, request: PendingRequest) {
        self.get_mut(request.priority).push_back(request);
    }

    /// Remove by identity; position may have shifted since enqueue
    fn remove(&mut self, priority: Priority, id: RequestId) -> Option<PendingRequest> {
        let queue = self.get_mut(priority);
        let position = queue.iter().position(|r| r.id == id)?;
        queue.remove(position)
    }

    fn drain_all(&mut self) -> Vec<PendingRequest> {
        self.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }
}

/// Point-in-time view of a dispatcher
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub endpoint: String,
    pub running: bool,
    pub current_rate: f64,
    pub tokens_available: f64,
    pub capacity: u32,
    pub queue_lengths: BTreeMap<Priority, usize>,
    pub avg_response_time_ms: Option<f64>,
    pub avg_queue_wait_ms: Option<f64>,
    pub stats: LimiterStats,
}

/// Construction options that are not part of an endpoint's tuning
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub idle_delay: Duration,
    pub state_store: Option<StateStore>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            idle_delay: DEFAULT_IDLE_DELAY,
            state_store: None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    endpoint: String,
    config: LimiterConfig,
    bucket: TokenBucket,
    queues: Mutex<PriorityQueues>,
    feedback: FeedbackController,
    stats: StatsCollector,
    store: Option<StateStore>,
    idle_delay: Duration,
    stopped: AtomicBool,
    wake: Notify,
}

impl Shared {
    /// One pass over every queue, most urgent first
    fn sweep(&self) {
        let now = Instant::now();
        let mut queues = self.queues.lock();

        for priority in Priority::ALL {
            let queue = queues.get_mut(priority);

            while let Some(front) = queue.front() {
                let waited = now.saturating_duration_since(front.enqueued_at);

                let verdict = if front.responder.is_closed() {
                    None
                } else if front.deadline.is_some_and(|d| d <= now) {
                    Some(Decision::Expired)
                } else if self.config.exceeds_weighted_wait(priority, waited) {
                    // Checked before taking a token: a stale head is dropped even when the bucket is empty
                    Some(Decision::Dropped)
                } else if self.bucket.try_acquire(1) {
                    Some(Decision::Admitted)
                } else {
                    break;
                };

                let Some(request) = queue.pop_front() else {
                    break;
                };
                let Some(decision) = verdict else {
                    debug!(endpoint = %self.endpoint, request_id = %request.id, "discarding abandoned request");
                    continue;
                };

                let delivered = request.responder.send(decision).is_ok();
                match decision {
                    Decision::Admitted if delivered => {
                        self.stats.record_admitted();
                        self.feedback.record_queue_wait(waited);
                    }
                    // Caller went away after the check above; hand the token back
                    Decision::Admitted => self.bucket.release(1),
                    Decision::Dropped => {
                        self.stats.record_dropped();
                        debug!(
                            endpoint = %self.endpoint,
                            request_id = %request.id,
                            priority = %priority,
                            waited_ms = waited.as_millis() as u64,
                            "dropped request after weighted wait"
                        );
                    }
                    Decision::Expired | Decision::Shutdown => {}
                }
            }
        }
    }

    fn adjust(&self, now: Instant) -> Option<RateChange> {
        let change = self.feedback.maybe_adjust(now, &self.bucket)?;
        self.stats.record_rate_change();
        Some(change)
    }

    /// Take a timed-out request back out of its queue.
    ///
    /// If it is no longer queued the sweep already resolved it while holding
    /// the same lock, so its decision is waiting in the channel.
    fn withdraw(
        &self,
        priority: Priority,
        id: RequestId,
        rx: &mut oneshot::Receiver<Decision>,
    ) -> Decision {
        let mut queues = self.queues.lock();
        if queues.remove(priority, id).is_some() {
            return Decision::Expired;
        }
        rx.try_recv().unwrap_or(Decision::Shutdown)
    }

    fn persisted_state(&self) -> PersistedState {
        PersistedState::new(
            self.bucket.rate(),
            self.feedback
                .average_response_time()
                .map(|d| d.as_secs_f64()),
            self.stats.snapshot(),
        )
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            endpoint = %self.endpoint,
            rate = self.bucket.rate(),
            capacity = self.bucket.capacity(),
            "dispatcher started"
        );

        loop {
            self.sweep();
            self.adjust(Instant::now());

            tokio::select! {
                _ = tokio::time::sleep(self.idle_delay) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(endpoint = %self.endpoint, "drain loop exited");
    }
}

/// Admission gate for one endpoint
#[derive(Debug)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build a dispatcher, restoring a learned rate if the state store has one.
    ///
    /// The drain loop does not run until [`Dispatcher::start`].
    pub fn new(
        endpoint: impl Into<String>,
        config: LimiterConfig,
        options: DispatcherOptions,
    ) -> PacerResult<Self> {
        let endpoint = endpoint.into();
        config.check().map_err(|e| match e {
            PacerError::ValidationError(msg) => {
                PacerError::ValidationError(format!("endpoint '{}': {}", endpoint, msg))
            }
            other => other,
        })?;

        let bucket = TokenBucket::with_bounds(
            config.bucket_capacity,
            config.initial_rate(),
            config.min_rate,
            config.max_rate,
        );
        let feedback = FeedbackController::new(&config);
        let mut stats = StatsCollector::new();

        if let Some(previous) = options.state_store.as_ref().and_then(StateStore::load) {
            let rate = bucket.set_rate(previous.optimal_rate);
            if let Some(avg) = previous
                .avg_response_time
                .and_then(|a| Duration::try_from_secs_f64(a).ok())
            {
                feedback.restore_average(avg);
            }
            stats = StatsCollector::from_snapshot(&previous.stats);
            info!(endpoint = %endpoint, rate, "restored learned rate");
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                endpoint,
                config,
                bucket,
                queues: Mutex::new(PriorityQueues::default()),
                feedback,
                stats,
                store: options.state_store,
                idle_delay: options.idle_delay,
                stopped: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            shutdown,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the drain loop on the current tokio runtime. Idempotent.
    pub fn start(&self) -> PacerResult<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(PacerError::InternalError(format!(
                "dispatcher '{}' has been stopped",
                self.shared.endpoint
            )));
        }

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PacerError::InternalError(format!("no tokio runtime: {}", e)))?;
        let shared = self.shared.clone();
        *worker = Some(runtime.spawn(shared.run(self.shutdown.subscribe())));
        Ok(())
    }

    /// Stop the drain loop, reject everything still queued and persist state
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.send_replace(true);
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!(endpoint = %self.shared.endpoint, error = %e, "drain loop ended abnormally");
            }
        }

        let pending = self.shared.queues.lock().drain_all();
        for request in pending {
            let _ = request.responder.send(Decision::Shutdown);
        }

        self.save_state();
        info!(endpoint = %self.shared.endpoint, rate = self.shared.bucket.rate(), "dispatcher stopped");
    }

    /// Wait for a token.
    ///
    /// Returns `false` when the request was dropped by the weighted-timeout
    /// rule, its `deadline` passed, or the dispatcher stopped. Hitting the
    /// limit is an expected outcome, not an error.
    pub async fn acquire(
        &self,
        priority: Priority,
        deadline: Option<Instant>,
        id: Option<RequestId>,
    ) -> bool {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            debug!(endpoint = %shared.endpoint, "acquire on stopped dispatcher");
            return false;
        }

        if priority.uses_fast_path() && shared.bucket.try_acquire(1) {
            shared.stats.record_admitted();
            return true;
        }

        let now = Instant::now();
        if deadline.is_some_and(|d| d <= now) {
            shared.stats.record_timed_out();
            return false;
        }

        let id = id.unwrap_or_else(Uuid::new_v4);
        let (tx, mut rx) = oneshot::channel();
        {
            let mut queues = shared.queues.lock();
            // Checked under the lock so stop() cannot miss this entry
            if shared.stopped.load(Ordering::Acquire) {
                return false;
            }
            queues.push(PendingRequest {
                id,
                priority,
                enqueued_at: now,
                deadline,
                responder: tx,
            });
        }
        shared.stats.record_queued();
        shared.wake.notify_one();

        let decision = match deadline {
            None => (&mut rx).await.unwrap_or(Decision::Shutdown),
            Some(deadline) => {
                let wait = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), &mut rx);
                match wait.await {
                    Ok(received) => received.unwrap_or(Decision::Shutdown),
                    Err(_) => shared.withdraw(priority, id, &mut rx),
                }
            }
        };

        match decision {
            Decision::Admitted => true,
            Decision::Expired => {
                shared.stats.record_timed_out();
                debug!(endpoint = %shared.endpoint, request_id = %id, priority = %priority, "deadline expired while queued");
                false
            }
            Decision::Dropped | Decision::Shutdown => false,
        }
    }

    /// [`Dispatcher::acquire`] with a relative timeout
    pub async fn acquire_within(&self, priority: Priority, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        self.acquire(priority, deadline, None).await
    }

    /// Report how an admitted call went
    pub fn record_response(&self, duration: Duration, success: bool, priority: Priority) {
        self.shared.stats.record_response(success);
        self.shared.feedback.record_response(duration, success, priority);
    }

    /// Run the feedback check now instead of waiting for the drain loop
    pub fn maybe_adjust(&self, now: Instant) -> Option<RateChange> {
        self.shared.adjust(now)
    }

    /// Rough time until a new request at `priority` would be admitted
    pub fn estimated_wait(&self, priority: Priority) -> Duration {
        let ahead: usize = {
            let queues = self.shared.queues.lock();
            Priority::ALL
                .iter()
                .filter(|p| **p <= priority)
                .map(|p| queues.len(*p))
                .sum()
        };
        let needed = u32::try_from(ahead + 1).unwrap_or(u32::MAX);
        self.shared.bucket.estimated_wait(needed)
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.shared.queues.lock().len(priority)
    }

    pub fn queue_lengths(&self) -> BTreeMap<Priority, usize> {
        let queues = self.shared.queues.lock();
        Priority::ALL.iter().map(|p| (*p, queues.len(*p))).collect()
    }

    pub fn get_status(&self) -> LimiterStatus {
        let feedback = &self.shared.feedback;
        LimiterStatus {
            endpoint: self.shared.endpoint.clone(),
            running: self.is_running(),
            current_rate: self.shared.bucket.rate(),
            tokens_available: self.shared.bucket.available_tokens(),
            capacity: self.shared.bucket.capacity(),
            queue_lengths: self.queue_lengths(),
            avg_response_time_ms: feedback
                .average_response_time()
                .map(|d| d.as_secs_f64() * 1000.0),
            avg_queue_wait_ms: feedback
                .average_queue_wait()
                .map(|d| d.as_secs_f64() * 1000.0),
            stats: self.shared.stats.snapshot(),
        }
    }

    /// Write the learned rate now; a no-op without a state store
    pub fn save_state(&self) {
        if let Some(store) = &self.shared.store {
            store.save(&self.shared.persisted_state());
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.shared.config
    }

    pub fn current_rate(&self) -> f64 {
        self.shared.bucket.rate()
    }

    pub fn stats(&self) -> LimiterStats {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.shared.stopped.load(Ordering::Acquire)
    }
}
