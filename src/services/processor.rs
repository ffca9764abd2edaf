//! Task processor: intake, worker pool, dispatch, retry, batching.
//!
//! Workers pop the dispatch queue, consult the dedup cache, select a
//! provider via the coordinator, reserve quota, invoke the provider
//! under a deadline, and settle the outcome. Transient failures are
//! absorbed through requeue-with-backoff; terminal errors land on the
//! task record and the event bus.
//!
//! No lock is held across a provider invocation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::RetryConfig;
use crate::domain::models::{
    DispatchQueue, EventPayload, Fingerprint, ProviderId, Task, TaskKindRegistry, TaskStatus,
};
use crate::domain::ports::{Clock, CostEstimate, Provider, ProviderFailure, SystemClock, TaskStore};
use crate::services::coordinator::ProviderCoordinator;
use crate::services::dedup_cache::{DedupCache, DedupClaim, DedupDecision, FollowerOutcome};
use crate::services::event_bus::EventBus;
use crate::services::quota::QuotaLedger;
use crate::services::registry::{InvocationOutcome, ProviderRegistry};

/// Processor tuning knobs, extracted from the top-level config.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub worker_count: usize,
    pub retry: RetryConfig,
    pub request_timeout_ms: u64,
    pub follower_timeout_ms: u64,
}

impl ProcessorConfig {
    pub fn from_config(config: &crate::domain::models::Config) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            retry: config.retry.clone(),
            request_timeout_ms: config.request_timeout_ms,
            follower_timeout_ms: config.dedup.follower_timeout_ms,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_config(&crate::domain::models::Config::default())
    }
}

struct ProcessorInner {
    store: Arc<dyn TaskStore>,
    registry: Arc<ProviderRegistry>,
    coordinator: Arc<ProviderCoordinator>,
    ledger: Arc<QuotaLedger>,
    cache: Arc<DedupCache>,
    event_bus: Arc<EventBus>,
    kinds: TaskKindRegistry,
    config: ProcessorConfig,
    clock: Arc<dyn Clock>,

    queue: Mutex<DispatchQueue>,
    queue_notify: Notify,

    /// Cancel signals for tasks currently Running.
    cancel_signals: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    /// Tasks whose cancellation was requested but not yet applied.
    cancel_requested: Mutex<HashSet<Uuid>>,

    /// Provider that last succeeded per workflow run, for affinity.
    run_affinity: Mutex<HashMap<Uuid, ProviderId>>,

    /// Wakes `wait_terminal` pollers on every terminal transition.
    completion_notify: Notify,

    shutdown: watch::Sender<bool>,
}

/// Task intake and dispatch engine.
pub struct TaskProcessor {
    inner: Arc<ProcessorInner>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ProviderRegistry>,
        coordinator: Arc<ProviderCoordinator>,
        ledger: Arc<QuotaLedger>,
        cache: Arc<DedupCache>,
        event_bus: Arc<EventBus>,
        kinds: TaskKindRegistry,
        config: ProcessorConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ProcessorInner {
                store,
                registry,
                coordinator,
                ledger,
                cache,
                event_bus,
                kinds,
                config,
                clock: Arc::new(SystemClock),
                queue: Mutex::new(DispatchQueue::new()),
                queue_notify: Notify::new(),
                cancel_signals: Mutex::new(HashMap::new()),
                cancel_requested: Mutex::new(HashSet::new()),
                run_affinity: Mutex::new(HashMap::new()),
                completion_notify: Notify::new(),
                shutdown,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        // Only callable before `start`, while the inner Arc is unique.
        Arc::get_mut(&mut self.inner)
            .expect("with_clock must be called before start")
            .clock = clock;
        self
    }

    /// Spawn the worker pool.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.inner.config.worker_count {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(inner, worker_id).await;
            }));
        }
        info!(worker_count = self.inner.config.worker_count, "task processor started");
    }

    /// Signal workers to stop and wait for them to drain.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.queue_notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        info!("task processor stopped");
    }

    /// Submit a task. Rejects unregistered kinds; honors idempotency
    /// keys by returning the original task id.
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind), err)]
    pub async fn submit(&self, mut task: Task) -> OrchestratorResult<Uuid> {
        if !self.inner.kinds.contains(&task.kind) {
            return Err(OrchestratorError::UnknownTaskKind(task.kind.to_string()));
        }

        if let Some(key) = &task.idempotency_key {
            if let Some(existing) = self.inner.store.get_by_idempotency_key(key).await? {
                debug!(existing_id = %existing.id, "idempotent resubmission");
                return Ok(existing.id);
            }
        }

        let task_id = task.id;
        self.inner.store.insert(&task).await?;
        self.inner.event_bus.publish(EventPayload::TaskSubmitted {
            task_id,
            kind: task.kind.to_string(),
            priority: task.priority,
        });

        self.inner.transition_and_store(&mut task, TaskStatus::Queued).await?;
        self.inner.enqueue(&task).await;
        Ok(task_id)
    }

    /// Fetch a task record.
    pub async fn get_task(&self, id: Uuid) -> OrchestratorResult<Task> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(id))
    }

    /// Cancel a task. Queued tasks cancel immediately; running tasks
    /// are signalled and reach Cancelled within the request timeout.
    /// Cancelling a terminal task is a no-op.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: Uuid) -> OrchestratorResult<()> {
        let task = self.get_task(id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }

        self.inner.cancel_requested.lock().await.insert(id);

        let removed = {
            let mut queue = self.inner.queue.lock().await;
            queue.remove(id)
        };

        if removed || matches!(task.status, TaskStatus::Pending | TaskStatus::Queued) {
            // Not picked up by a worker yet; settle directly. A worker
            // that races us wins the version check and will observe
            // the cancel request instead.
            if let Some(mut current) = self.inner.store.get(id).await? {
                if matches!(current.status, TaskStatus::Pending | TaskStatus::Queued) {
                    match self
                        .inner
                        .transition_and_store(&mut current, TaskStatus::Cancelled)
                        .await
                    {
                        Ok(()) | Err(OrchestratorError::ConcurrencyConflict { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            return Ok(());
        }

        // Running: signal the worker.
        if let Some(signal) = self.inner.cancel_signals.lock().await.get(&id) {
            let _ = signal.send(true);
        }
        Ok(())
    }

    /// Wait until a task reaches a terminal status.
    pub async fn wait_terminal(
        &self,
        id: Uuid,
        timeout: std::time::Duration,
    ) -> OrchestratorResult<TaskStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before the status check so a
            // transition between check and wait cannot be missed.
            let notified = self.inner.completion_notify.notified();
            let task = self.get_task(id).await?;
            if task.status.is_terminal() || task.status == TaskStatus::Failed {
                return Ok(task.status);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(OrchestratorError::Timeout(
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ));
            }
        }
    }

    /// Record a run's successful provider so later stages stick to it.
    pub async fn affinity_for_run(&self, run_id: Uuid) -> Option<ProviderId> {
        self.inner.run_affinity.lock().await.get(&run_id).cloned()
    }

    /// Cancel every non-terminal task spawned by a workflow run.
    /// Returns the number of cancellations issued.
    pub async fn cancel_tasks_of_run(&self, run_id: Uuid) -> OrchestratorResult<usize> {
        let tasks = self.inner.store.list_by_run(run_id).await?;
        let mut cancelled = 0;
        for task in tasks {
            if !task.status.is_terminal() && task.status != TaskStatus::Failed {
                self.cancel(task.id).await?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Queue depth plus per-status counts.
    pub async fn stats(&self) -> OrchestratorResult<ProcessorStats> {
        let queued = self.inner.queue.lock().await.len();
        let by_status = self.inner.store.count_by_status().await?;
        Ok(ProcessorStats { queued, by_status })
    }

    /// Subscribe to engine events (passthrough to the bus).
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.inner.event_bus.clone()
    }
}

/// Processor statistics snapshot.
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub queued: usize,
    pub by_status: HashMap<TaskStatus, u64>,
}

impl ProcessorInner {
    async fn enqueue(&self, task: &Task) {
        let mut queue = self.queue.lock().await;
        queue.push(task.id, task.priority, task.ready_at, task.created_at);
        drop(queue);
        self.queue_notify.notify_one();
    }

    /// Apply a status transition, persist it, and publish the event.
    async fn transition_and_store(
        &self,
        task: &mut Task,
        to: TaskStatus,
    ) -> OrchestratorResult<()> {
        let from = task.status;
        task.transition_to(to)?;
        self.store.update(task).await?;
        self.event_bus.publish(EventPayload::TaskStatusChanged {
            task_id: task.id,
            from,
            to,
            provider_id: task.assigned_provider_id.clone(),
        });
        if to.is_terminal() || to == TaskStatus::Failed {
            // A settled task needs no cancel bookkeeping.
            self.cancel_requested.lock().await.remove(&task.id);
            self.cancel_signals.lock().await.remove(&task.id);
            self.completion_notify.notify_waiters();
        }
        Ok(())
    }

    async fn finish_cancel_bookkeeping(&self, task_id: Uuid) {
        self.cancel_requested.lock().await.remove(&task_id);
        self.cancel_signals.lock().await.remove(&task_id);
        self.completion_notify.notify_waiters();
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Exponential backoff with jitter for the given invocation count.
    fn backoff_delay(&self, attempts: u32) -> ChronoDuration {
        let exponent = attempts.saturating_sub(1).min(16);
        let raw = self
            .config
            .retry
            .backoff_base_ms
            .saturating_mul(2_u64.saturating_pow(exponent));
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered = (raw as f64 * rand::thread_rng().gen_range(0.5..1.5)) as u64;
        let capped = jittered.min(self.config.retry.backoff_max_ms);
        ChronoDuration::milliseconds(i64::try_from(capped.max(1)).unwrap_or(1))
    }

    fn dedup_enabled(&self, task: &Task) -> bool {
        self.kinds
            .options(&task.kind)
            .map_or(true, |options| !options.no_dedup)
    }
}

/// One worker: pop ready tasks and process them until shutdown.
async fn worker_loop(inner: Arc<ProcessorInner>, worker_id: usize) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    debug!(worker_id, "worker started");

    loop {
        if inner.is_shutting_down() {
            break;
        }

        let now = inner.clock.now();
        let popped = {
            let mut queue = inner.queue.lock().await;
            queue.pop_ready(now)
        };

        match popped {
            Some(entry) => {
                process_entry(&inner, entry.task_id).await;
            }
            None => {
                // Sleep until the next entry ripens, new work arrives,
                // or shutdown. The 200 ms floor bounds clock drift.
                let wait = {
                    let queue = inner.queue.lock().await;
                    queue
                        .next_ready_at()
                        .map_or(std::time::Duration::from_millis(200), |at| {
                            (at - now)
                                .to_std()
                                .unwrap_or(std::time::Duration::from_millis(1))
                                .min(std::time::Duration::from_millis(200))
                        })
                };
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    () = inner.queue_notify.notified() => {}
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Process one popped queue entry through the full dispatch pipeline.
async fn process_entry(inner: &Arc<ProcessorInner>, task_id: Uuid) {
    let mut task = match inner.store.get(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!(%task_id, "queued task vanished from store");
            return;
        }
        Err(e) => {
            error!(%task_id, error = %e, "failed to load queued task");
            return;
        }
    };

    if task.status != TaskStatus::Queued {
        // Cancelled (or otherwise settled) while waiting in the queue.
        return;
    }

    // Apply a cancellation that raced the queue pop.
    if inner.cancel_requested.lock().await.contains(&task_id) {
        let _ = inner.transition_and_store(&mut task, TaskStatus::Cancelled).await;
        inner.finish_cancel_bookkeeping(task_id).await;
        return;
    }

    if inner.transition_and_store(&mut task, TaskStatus::Running).await.is_err() {
        return;
    }

    // Register the cancel signal for the running phase.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    inner.cancel_signals.lock().await.insert(task_id, cancel_tx);

    run_task(inner, &mut task, cancel_rx).await;

    inner.cancel_signals.lock().await.remove(&task_id);
}

/// Dedup consult, selection, reservation, invocation, settlement.
async fn run_task(inner: &Arc<ProcessorInner>, task: &mut Task, cancel_rx: watch::Receiver<bool>) {
    // Step 2: dedup cache.
    let claim = if inner.dedup_enabled(task) {
        let fingerprint = Fingerprint::of_task(task);
        match inner.cache.get_or_claim(&fingerprint, task.id).await {
            DedupDecision::Hit {
                result,
                producer_task_id,
            } => {
                task.result = Some(result);
                inner.event_bus.publish(EventPayload::TaskDeduplicated {
                    task_id: task.id,
                    producer_task_id: Some(producer_task_id),
                    from_cache: true,
                });
                let _ = inner.transition_and_store(task, TaskStatus::Succeeded).await;
                return;
            }
            DedupDecision::Follower(handle) => {
                inner.event_bus.publish(EventPayload::TaskDeduplicated {
                    task_id: task.id,
                    producer_task_id: Some(handle.producer_task_id),
                    from_cache: false,
                });
                follow_producer(inner, task, handle, cancel_rx).await;
                return;
            }
            DedupDecision::Claim(claim) => Some(claim),
        }
    } else {
        None
    };

    execute_claimed(inner, task, claim, cancel_rx).await;
}

/// Follower path: suspend until the producer settles.
async fn follow_producer(
    inner: &Arc<ProcessorInner>,
    task: &mut Task,
    handle: crate::services::dedup_cache::FollowerHandle,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let timeout = std::time::Duration::from_millis(inner.config.follower_timeout_ms);
    let outcome = tokio::select! {
        outcome = handle.wait(timeout) => outcome,
        _ = cancel_rx.changed() => {
            let _ = inner.transition_and_store(task, TaskStatus::Cancelled).await;
            inner.finish_cancel_bookkeeping(task.id).await;
            return;
        }
    };

    match outcome {
        FollowerOutcome::Published(result) => {
            task.result = Some(result);
            let _ = inner.transition_and_store(task, TaskStatus::Succeeded).await;
        }
        FollowerOutcome::Abandoned | FollowerOutcome::TimedOut => {
            // Re-queue as a fresh task; the producer's error is not
            // inherited.
            let now = inner.clock.now();
            if task.requeue_for_capacity(now).is_ok() {
                let _ = inner.store.update(task).await;
                inner.enqueue(task).await;
            }
        }
    }
}

/// Producer path: select, reserve, invoke, settle.
async fn execute_claimed(
    inner: &Arc<ProcessorInner>,
    task: &mut Task,
    claim: Option<DedupClaim>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    // Step 3: provider selection over registry snapshots.
    let snapshots = inner.registry.list().await;
    let estimates = inner.registry.estimate_costs(task).await;
    let costs: HashMap<ProviderId, u64> =
        estimates.iter().map(|(id, e)| (id.clone(), e.units)).collect();

    let affinity = match task.parent_run_id {
        Some(run_id) => inner.run_affinity.lock().await.get(&run_id).cloned(),
        None => None,
    };

    let provider_id = match inner
        .coordinator
        .select(task, &snapshots, &costs, affinity.as_ref())
        .await
    {
        Ok(provider_id) => provider_id,
        Err(OrchestratorError::CapabilityMismatch { kind }) => {
            task.last_error = Some(format!("no provider serves kind '{kind}'"));
            abandon_claim(inner, claim).await;
            let _ = inner.transition_and_store(task, TaskStatus::Failed).await;
            return;
        }
        Err(err) => {
            // NoProviderAvailable: return to the queue with a delay.
            abandon_claim(inner, claim).await;
            requeue_with_delay(inner, task, inner.backoff_delay(task.attempts + 1), &err).await;
            return;
        }
    };

    // Step 4: quota reservation.
    let default_estimate = CostEstimate::units(1);
    let estimate = estimates.get(&provider_id).unwrap_or(&default_estimate);
    let reservation = match inner
        .ledger
        .try_reserve(&provider_id, estimate.sub_key.as_deref(), estimate.units)
        .await
    {
        Ok(reservation) => reservation,
        Err(err @ OrchestratorError::QuotaExhausted { .. }) => {
            // Align the retry with the window reset when it is sooner
            // than the capped backoff.
            let delay = match &err {
                OrchestratorError::QuotaExhausted { reset_at, .. } => {
                    let until_reset = *reset_at - inner.clock.now();
                    let backoff = inner.backoff_delay(task.attempts + 1);
                    if until_reset > ChronoDuration::zero() && until_reset < backoff {
                        until_reset
                    } else {
                        backoff
                    }
                }
                _ => inner.backoff_delay(task.attempts + 1),
            };
            abandon_claim(inner, claim).await;
            requeue_with_delay(inner, task, delay, &err).await;
            return;
        }
        Err(err) => {
            abandon_claim(inner, claim).await;
            requeue_with_delay(inner, task, inner.backoff_delay(task.attempts + 1), &err).await;
            return;
        }
    };

    // Step 5: invoke under min(task.deadline, request_timeout).
    let Some((handle, _inflight)) = inner.registry.checkout(&provider_id).await else {
        // Deregistered between selection and checkout.
        inner.ledger.refund(&reservation).await;
        abandon_claim(inner, claim).await;
        let err = OrchestratorError::NoProviderAvailable { task_id: task.id };
        requeue_with_delay(inner, task, inner.backoff_delay(task.attempts + 1), &err).await;
        return;
    };

    task.assign_provider(provider_id.clone());
    if inner.store.update(task).await.is_err() {
        inner.ledger.refund(&reservation).await;
        abandon_claim(inner, claim).await;
        return;
    }

    // Opportunistic batching: pull further ready, fingerprint-distinct
    // tasks this provider can serve and dispatch them in one call.
    let batch_capacity = snapshots
        .iter()
        .find(|s| s.spec.id == provider_id)
        .filter(|s| s.spec.capabilities.flags.batching)
        .map_or(1, |s| s.spec.capabilities.max_batch_size.max(1));
    if batch_capacity > 1 {
        let extra = gather_batch_members(inner, &provider_id, batch_capacity - 1).await;
        if !extra.is_empty() {
            let primary = BatchMember {
                task: task.clone(),
                claim,
                reservation,
            };
            let mut members = vec![primary];
            members.extend(extra);
            execute_batch_members(inner, handle.as_ref(), &provider_id, members).await;
            return;
        }
    }

    let now = inner.clock.now();
    let timeout_ms = match task.deadline {
        Some(deadline) => {
            let until = (deadline - now).num_milliseconds().max(0);
            u64::try_from(until)
                .unwrap_or(0)
                .min(inner.config.request_timeout_ms)
        }
        None => inner.config.request_timeout_ms,
    };
    let deadline = now + ChronoDuration::milliseconds(i64::try_from(timeout_ms).unwrap_or(0));

    let invocation = tokio::select! {
        result = invoke_with_timeout(handle.as_ref(), task, deadline, timeout_ms) => Some(result),
        _ = cancel_rx.changed() => None,
    };

    match invocation {
        None => {
            // Cancelled mid-flight.
            inner.ledger.refund(&reservation).await;
            abandon_claim(inner, claim).await;
            let _ = inner.transition_and_store(task, TaskStatus::Cancelled).await;
            inner.finish_cancel_bookkeeping(task.id).await;
        }
        Some(Ok(response)) => {
            // A cancel that raced the invocation start wins over the
            // result.
            if inner.cancel_requested.lock().await.contains(&task.id) {
                inner.ledger.refund(&reservation).await;
                abandon_claim(inner, claim).await;
                let _ = inner.transition_and_store(task, TaskStatus::Cancelled).await;
                inner.finish_cancel_bookkeeping(task.id).await;
                return;
            }
            inner.ledger.commit(&reservation).await;
            inner
                .registry
                .observe(&provider_id, InvocationOutcome::Success { latency_ms: response.latency_ms })
                .await;
            if let Some(claim) = claim {
                inner.cache.publish(claim, response.output.clone()).await;
            }
            task.result = Some(response.output);
            if let Some(run_id) = task.parent_run_id {
                inner.run_affinity.lock().await.insert(run_id, provider_id);
            }
            let _ = inner.transition_and_store(task, TaskStatus::Succeeded).await;
        }
        Some(Err(failure)) => {
            inner.ledger.refund(&reservation).await;
            if failure.retryable {
                inner.registry.observe(&provider_id, InvocationOutcome::Failure).await;
            }
            abandon_claim(inner, claim).await;
            settle_failure(inner, task, &failure).await;
        }
    }
}

/// Provider call bounded by the computed timeout.
async fn invoke_with_timeout(
    handle: &dyn Provider,
    task: &Task,
    deadline: DateTime<Utc>,
    timeout_ms: u64,
) -> Result<crate::domain::ports::ProviderResponse, ProviderFailure> {
    let timeout = std::time::Duration::from_millis(timeout_ms);
    match tokio::time::timeout(timeout, handle.execute(task, deadline)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ProviderFailure::timeout(format!(
            "invocation exceeded {timeout_ms} ms"
        ))),
    }
}

/// Retry-or-fail decision after a provider failure.
async fn settle_failure(inner: &Arc<ProcessorInner>, task: &mut Task, failure: &ProviderFailure) {
    if failure.retryable {
        if task.attempts > inner.config.retry.max_retries {
            task.last_error = Some(failure.message.clone());
            inner.event_bus.publish(EventPayload::TaskDeadLettered {
                task_id: task.id,
                attempts: task.attempts,
                error: failure.message.clone(),
            });
            let _ = inner.transition_and_store(task, TaskStatus::DeadLettered).await;
            return;
        }

        let delay = inner.backoff_delay(task.attempts);
        let ready_at = inner.clock.now() + delay;
        inner.event_bus.publish(EventPayload::TaskRetrying {
            task_id: task.id,
            attempt: task.attempts,
            max_retries: inner.config.retry.max_retries,
            error: failure.message.clone(),
        });
        let from = task.status;
        if task.requeue_after_failure(ready_at, failure.message.clone()).is_ok() {
            if inner.store.update(task).await.is_ok() {
                inner.event_bus.publish(EventPayload::TaskStatusChanged {
                    task_id: task.id,
                    from,
                    to: TaskStatus::Queued,
                    provider_id: None,
                });
                inner.enqueue(task).await;
            }
        }
    } else {
        task.last_error = Some(failure.message.clone());
        let _ = inner.transition_and_store(task, TaskStatus::Failed).await;
    }
}

async fn requeue_with_delay(
    inner: &Arc<ProcessorInner>,
    task: &mut Task,
    delay: ChronoDuration,
    err: &OrchestratorError,
) {
    let ready_at = inner.clock.now() + delay;
    debug!(task_id = %task.id, error = %err, ready_at = %ready_at, "requeueing task");
    let from = task.status;
    if task.requeue_for_capacity(ready_at).is_ok() && inner.store.update(task).await.is_ok() {
        inner.event_bus.publish(EventPayload::TaskStatusChanged {
            task_id: task.id,
            from,
            to: TaskStatus::Queued,
            provider_id: None,
        });
        inner.enqueue(task).await;
    }
}

async fn abandon_claim(inner: &Arc<ProcessorInner>, claim: Option<DedupClaim>) {
    if let Some(claim) = claim {
        inner.cache.abandon(claim).await;
    }
}

/// One task participating in a batched invocation.
struct BatchMember {
    task: Task,
    claim: Option<DedupClaim>,
    reservation: crate::domain::models::Reservation,
}

/// Pull up to `limit` additional ready tasks this provider can serve.
///
/// Tasks that pop but do not qualify (wrong kind, dedup follower,
/// no quota headroom) are returned to the queue; queue order among
/// exact ties is perturbed only for the entries considered here.
async fn gather_batch_members(
    inner: &Arc<ProcessorInner>,
    provider_id: &ProviderId,
    limit: usize,
) -> Vec<BatchMember> {
    let Some(snapshot) = inner.registry.get(provider_id).await else {
        return Vec::new();
    };

    let mut members = Vec::new();
    let mut put_back = Vec::new();

    while members.len() < limit {
        let now = inner.clock.now();
        let entry = {
            let mut queue = inner.queue.lock().await;
            queue.pop_ready(now)
        };
        let Some(entry) = entry else { break };

        let Ok(Some(mut candidate)) = inner.store.get(entry.task_id).await else {
            continue;
        };
        if candidate.status != TaskStatus::Queued {
            continue;
        }

        let eligible = snapshot
            .spec
            .capabilities
            .supports(&candidate.kind, &candidate.required_flags)
            && !candidate.excluded_providers.contains(provider_id)
            && !inner.cancel_requested.lock().await.contains(&candidate.id);
        if !eligible {
            put_back.push(entry);
            continue;
        }

        // Claim dedup; anything but a fresh claim is handled by the
        // normal single-task path on a later pop.
        let claim = if inner.dedup_enabled(&candidate) {
            let fingerprint = Fingerprint::of_task(&candidate);
            match inner.cache.get_or_claim(&fingerprint, candidate.id).await {
                DedupDecision::Claim(claim) => Some(claim),
                DedupDecision::Hit { result, producer_task_id } => {
                    candidate.result = Some(result);
                    inner.event_bus.publish(EventPayload::TaskDeduplicated {
                        task_id: candidate.id,
                        producer_task_id: Some(producer_task_id),
                        from_cache: true,
                    });
                    let _ = inner.transition_and_store(&mut candidate, TaskStatus::Running).await;
                    let _ = inner.transition_and_store(&mut candidate, TaskStatus::Succeeded).await;
                    continue;
                }
                DedupDecision::Follower(_) => {
                    put_back.push(entry);
                    continue;
                }
            }
        } else {
            None
        };

        let estimate = {
            let estimates = inner.registry.estimate_costs(&candidate).await;
            estimates
                .get(provider_id)
                .cloned()
                .unwrap_or_else(|| CostEstimate::units(1))
        };
        let reservation = match inner
            .ledger
            .try_reserve(provider_id, estimate.sub_key.as_deref(), estimate.units)
            .await
        {
            Ok(reservation) => reservation,
            Err(_) => {
                abandon_claim(inner, claim).await;
                put_back.push(entry);
                continue;
            }
        };

        if inner.transition_and_store(&mut candidate, TaskStatus::Running).await.is_err() {
            inner.ledger.refund(&reservation).await;
            abandon_claim(inner, claim).await;
            continue;
        }
        candidate.assign_provider(provider_id.clone());
        if inner.store.update(&candidate).await.is_err() {
            inner.ledger.refund(&reservation).await;
            abandon_claim(inner, claim).await;
            continue;
        }

        members.push(BatchMember {
            task: candidate,
            claim,
            reservation,
        });
    }

    // Return non-qualifying entries to the queue.
    if !put_back.is_empty() {
        let mut queue = inner.queue.lock().await;
        for entry in put_back {
            queue.push(entry.task_id, entry.priority, entry.ready_at, entry.created_at);
        }
    }

    members
}

/// Dispatch a batch in one provider call; settle each sub-result
/// individually so partial failures retry on their own.
async fn execute_batch_members(
    inner: &Arc<ProcessorInner>,
    handle: &dyn Provider,
    provider_id: &ProviderId,
    members: Vec<BatchMember>,
) {
    let now = inner.clock.now();
    let timeout_ms = inner.config.request_timeout_ms;
    let deadline = now + ChronoDuration::milliseconds(i64::try_from(timeout_ms).unwrap_or(0));
    let tasks: Vec<Task> = members.iter().map(|m| m.task.clone()).collect();

    debug!(provider_id = %provider_id, batch_size = tasks.len(), "dispatching batch");
    let timeout = std::time::Duration::from_millis(timeout_ms);
    let results = match tokio::time::timeout(timeout, handle.execute_batch(&tasks, deadline)).await {
        Ok(results) => results,
        Err(_elapsed) => {
            let failure = ProviderFailure::timeout(format!("batch exceeded {timeout_ms} ms"));
            members.iter().map(|_| Err(failure.clone())).collect()
        }
    };

    for (member, result) in members.into_iter().zip(results) {
        let BatchMember {
            mut task,
            claim,
            reservation,
        } = member;

        // A cancel requested mid-batch wins over the sub-result.
        if inner.cancel_requested.lock().await.contains(&task.id) {
            inner.ledger.refund(&reservation).await;
            abandon_claim(inner, claim).await;
            let _ = inner.transition_and_store(&mut task, TaskStatus::Cancelled).await;
            inner.finish_cancel_bookkeeping(task.id).await;
            continue;
        }

        match result {
            Ok(response) => {
                inner.ledger.commit(&reservation).await;
                inner
                    .registry
                    .observe(provider_id, InvocationOutcome::Success { latency_ms: response.latency_ms })
                    .await;
                if let Some(claim) = claim {
                    inner.cache.publish(claim, response.output.clone()).await;
                }
                task.result = Some(response.output);
                if let Some(run_id) = task.parent_run_id {
                    inner.run_affinity.lock().await.insert(run_id, provider_id.clone());
                }
                let _ = inner.transition_and_store(&mut task, TaskStatus::Succeeded).await;
            }
            Err(failure) => {
                inner.ledger.refund(&reservation).await;
                if failure.retryable {
                    inner.registry.observe(provider_id, InvocationOutcome::Failure).await;
                }
                abandon_claim(inner, claim).await;
                settle_failure(inner, &mut task, &failure).await;
            }
        }
    }
}
