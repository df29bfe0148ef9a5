//! The scheduler: drives pending tasks to completion under a concurrency
//! bound, then finalizes.
//!
//! Design:
//! - Outer loop: scan the task namespace, admit everything eligible, then
//!   drain the worker pool while admitting tasks announced by store events.
//!   Events are hints; admission always re-reads the record first.
//! - Quiescence with only deferred tasks left sleeps until the earliest
//!   `retry_at`. Quiescence with nothing left enqueues finalize exactly
//!   once; a clean finalize writes `end` and ends the run.
//! - Settlement is one atomic batch built by [`settle_mutations`]: the
//!   processor's own mutations plus the task's fate plus the
//!   `lastModified` stamp. A worker removes its id from the running set
//!   before committing, so a failure rewrite's own event can re-admit the
//!   task in the same drain.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::{self, JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::cache::CacheLayer;
use crate::context::Context;
use crate::domain::{meta, StoreError, TaskError, TaskId, TaskRecord};
use crate::lifecycle;
use crate::options::RunOptions;
use crate::ports::{Clock, SystemClock};
use crate::processor::{ProcessOutput, Processor};
use crate::registry::{ProcessorRegistry, RegistryError};
use crate::signal::{AbortSignal, abort_channel};
use crate::store::{Backend, Mutation, Namespace, Store, StoreEvent};

/// Scheduling verdict for a stored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Admit,
    /// Rate limited; eligible again at the given instant.
    Deferred(DateTime<Utc>),
    /// Poisoned or out of retry budget. Never admitted again.
    Excluded,
}

pub fn eligibility(task: &TaskRecord, max_retries: usize, now: DateTime<Utc>) -> Eligibility {
    if task.unrecoverable || task.transient_failures() >= max_retries {
        return Eligibility::Excluded;
    }
    match task.retry_at {
        Some(at) if at > now => Eligibility::Deferred(at),
        _ => Eligibility::Admit,
    }
}

pub struct SchedulerBuilder {
    backend: Arc<dyn Backend>,
    cache_backend: Arc<dyn Backend>,
    registry: ProcessorRegistry,
    options: RunOptions,
    clock: Arc<dyn Clock>,
    seed: Value,
    abort: Option<AbortSignal>,
}

impl SchedulerBuilder {
    pub fn new(backend: Arc<dyn Backend>, cache_backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            cache_backend,
            registry: ProcessorRegistry::new(),
            options: RunOptions::default(),
            clock: Arc::new(SystemClock),
            seed: Value::Null,
            abort: None,
        }
    }

    pub fn register(mut self, processor: Arc<dyn Processor>) -> Result<Self, RegistryError> {
        self.registry.register(processor)?;
        Ok(self)
    }

    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Payload handed to the init task on a fresh run.
    pub fn seed(mut self, seed: Value) -> Self {
        self.seed = seed;
        self
    }

    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn build(self) -> Scheduler {
        let abort = self.abort.unwrap_or_else(|| {
            // No handle kept: the signal can never be raised.
            abort_channel().1
        });
        Scheduler {
            store: Store::new(self.backend, Namespace::tasks()),
            cache_backend: self.cache_backend,
            processors: Arc::new(self.registry),
            options: self.options,
            clock: self.clock,
            seed: self.seed,
            abort,
        }
    }
}

pub struct Scheduler {
    store: Store,
    cache_backend: Arc<dyn Backend>,
    processors: Arc<ProcessorRegistry>,
    options: RunOptions,
    clock: Arc<dyn Clock>,
    seed: Value,
    abort: AbortSignal,
}

/// In-flight bookkeeping for one run.
struct Workers {
    semaphore: Arc<Semaphore>,
    pool: JoinSet<TaskId>,
    /// Ids admitted but not yet settled. Shared with the workers, which
    /// remove themselves right before committing.
    running: Arc<StdMutex<HashSet<TaskId>>>,
    /// Join-handle ids back to task ids, for harvesting panicked workers.
    by_join: HashMap<task::Id, TaskId>,
    /// Earliest `retry_at` among deferred tasks seen this pass.
    retry_min: Option<DateTime<Utc>>,
}

impl Workers {
    fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            pool: JoinSet::new(),
            running: Arc::new(StdMutex::new(HashSet::new())),
            by_join: HashMap::new(),
            retry_min: None,
        }
    }

    fn is_running(&self, id: TaskId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    fn defer_until(&mut self, at: DateTime<Utc>) {
        self.retry_min = Some(match self.retry_min {
            Some(current) => current.min(at),
            None => at,
        });
    }
}

fn remove_running(running: &StdMutex<HashSet<TaskId>>, id: TaskId) {
    running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

impl Scheduler {
    pub fn builder(backend: Arc<dyn Backend>, cache_backend: Arc<dyn Backend>) -> SchedulerBuilder {
        SchedulerBuilder::new(backend, cache_backend)
    }

    /// Run until the store is fully processed or abort is raised. Safe to
    /// call again on the same store: a completed run returns immediately,
    /// an interrupted one resumes where it stopped.
    pub async fn run(&self) -> Result<(), StoreError> {
        if let Some(end) = lifecycle::load_meta(&self.store).await?.end {
            info!(%end, "store already finalized, nothing to do");
            return Ok(());
        }

        let epoch = lifecycle::ensure_started(
            &self.store,
            self.clock.as_ref(),
            self.seed.clone(),
        )
        .await?;
        let cache = CacheLayer::new(
            Arc::clone(&self.cache_backend),
            Arc::clone(&self.clock),
            epoch,
            self.options.prefer_cache,
        );
        let ctx = Context::new(
            self.store.clone(),
            cache,
            self.options.clone(),
            Arc::clone(&self.clock),
            self.abort.clone(),
        );
        info!(
            concurrency = self.options.concurrency,
            types = ?self.processors.registered_types(),
            "scheduler starting"
        );

        let mut events = self.store.subscribe();
        let mut workers = Workers::new(self.options.concurrency);
        let mut finalize_enqueued = false;

        loop {
            if self.abort.aborted() {
                info!("abort raised, stopping");
                break;
            }
            if lifecycle::load_meta(&self.store).await?.end.is_some() {
                info!("run complete");
                break;
            }

            workers.retry_min = None;
            for (key, value) in self.store.iterate(&Namespace::tasks()).await? {
                self.admit_value(&ctx, &mut workers, &key, value);
            }
            self.drain(&ctx, &mut workers, &mut events).await?;
            if self.abort.aborted() {
                info!("abort raised, stopping");
                break;
            }

            match workers.retry_min {
                Some(at) => {
                    info!(resume_at = %at, "only deferred tasks left, sleeping");
                    tokio::select! {
                        _ = self.clock.sleep_until(at) => {}
                        _ = self.abort.raised() => {}
                    }
                }
                None => {
                    if finalize_enqueued {
                        // The finalize settled during this pass's drain; its
                        // `end` write decides how the run went.
                        if lifecycle::load_meta(&self.store).await?.end.is_some() {
                            info!("run complete");
                        } else {
                            warn!("finalize did not settle cleanly, stopping");
                        }
                        break;
                    }
                    if lifecycle::find_finalize(&self.store).await?.is_some() {
                        warn!("frozen finalize task present, stopping");
                        break;
                    }
                    lifecycle::enqueue_finalize(&self.store, self.clock.as_ref()).await?;
                    finalize_enqueued = true;
                }
            }
        }
        Ok(())
    }

    /// Drive the pool to empty, admitting tasks announced by events along
    /// the way. Failure rewrites committed by workers publish events too,
    /// so immediate retries happen inside the same drain.
    async fn drain(
        &self,
        ctx: &Context,
        workers: &mut Workers,
        events: &mut broadcast::Receiver<StoreEvent>,
    ) -> Result<(), StoreError> {
        loop {
            loop {
                match events.try_recv() {
                    Ok(event) => self.admit_event(ctx, workers, &event.key).await?,
                    Err(TryRecvError::Lagged(skipped)) => {
                        // The next outer scan catches whatever was dropped.
                        warn!(skipped, "event subscriber lagged");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
            if workers.pool.is_empty() {
                return Ok(());
            }
            tokio::select! {
                settled = workers.pool.join_next_with_id() => {
                    if let Some(settled) = settled {
                        self.harvest(ctx, workers, settled).await?;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => self.admit_event(ctx, workers, &event.key).await?,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event subscriber lagged");
                        }
                        Err(RecvError::Closed) => {}
                    }
                }
            }
        }
    }

    /// An event names a key; the record may have settled since. Re-read and
    /// admit whatever is actually there now.
    async fn admit_event(
        &self,
        ctx: &Context,
        workers: &mut Workers,
        key: &str,
    ) -> Result<(), StoreError> {
        if let Some(value) = self.store.get(&Namespace::tasks(), key).await? {
            self.admit_value(ctx, workers, key, value);
        }
        Ok(())
    }

    fn admit_value(&self, ctx: &Context, workers: &mut Workers, key: &str, value: Value) {
        if self.abort.aborted() {
            return;
        }
        let task: TaskRecord = match serde_json::from_value(value) {
            Ok(task) => task,
            Err(err) => {
                error!(key, error = %err, "unreadable task record, skipping");
                return;
            }
        };
        if workers.is_running(task.id) {
            return;
        }
        match eligibility(&task, self.options.max_retries, self.clock.now()) {
            Eligibility::Admit => {
                workers
                    .running
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(task.id);
                let task_id = task.id;
                let ctx = ctx.clone();
                let processors = Arc::clone(&self.processors);
                let running = Arc::clone(&workers.running);
                let semaphore = Arc::clone(&workers.semaphore);
                let handle = workers.pool.spawn(async move {
                    // Buffer freely, execute under the concurrency bound.
                    let _permit = semaphore.acquire_owned().await.ok();
                    execute_task(ctx, processors, running, task).await
                });
                workers.by_join.insert(handle.id(), task_id);
            }
            Eligibility::Deferred(at) => workers.defer_until(at),
            Eligibility::Excluded => {}
        }
    }

    async fn harvest(
        &self,
        ctx: &Context,
        workers: &mut Workers,
        settled: Result<(task::Id, TaskId), JoinError>,
    ) -> Result<(), StoreError> {
        match settled {
            Ok((join_id, task_id)) => {
                workers.by_join.remove(&join_id);
                remove_running(&workers.running, task_id);
            }
            Err(join_err) => {
                let task_id = workers.by_join.remove(&join_err.id());
                if let Some(task_id) = task_id {
                    remove_running(&workers.running, task_id);
                    error!(task = %task_id, error = %join_err, "worker panicked");
                    self.record_panic(ctx, task_id, &join_err).await?;
                } else {
                    error!(error = %join_err, "worker panicked before registration");
                }
            }
        }
        Ok(())
    }

    /// A panicked worker committed nothing. Release whatever it reserved and
    /// rewrite its task as a transient failure so the retry budget still
    /// applies.
    async fn record_panic(
        &self,
        ctx: &Context,
        task_id: TaskId,
        join_err: &JoinError,
    ) -> Result<(), StoreError> {
        ctx.release_reservations(task_id).await;
        let key = task_id.to_string();
        let Some(task) = self
            .store
            .get_as::<TaskRecord>(&Namespace::tasks(), &key)
            .await?
        else {
            return Ok(());
        };
        let now = ctx.now();
        let rewritten = task.with_failure(format!("worker panicked: {join_err}"), now);
        self.store
            .batch(vec![
                Mutation::put(Namespace::tasks(), key, &rewritten)?,
                Mutation::put(Namespace::meta(), meta::LAST_MODIFIED, &now)?,
            ])
            .await
    }
}

async fn execute_task(
    ctx: Context,
    processors: Arc<ProcessorRegistry>,
    running: Arc<StdMutex<HashSet<TaskId>>>,
    task: TaskRecord,
) -> TaskId {
    let task_id = task.id;
    let ctx = ctx.for_task(task_id);
    if ctx.abort().aborted() {
        remove_running(&running, task_id);
        return task_id;
    }

    if task.errors.is_empty() {
        info!(task = %task_id, task_type = %task.task_type, "starting task");
    } else {
        info!(
            task = %task_id,
            task_type = %task.task_type,
            attempt = task.transient_failures() + 1,
            "restarting task after failure"
        );
    }

    let result = match processors.get(task.task_type.as_str()) {
        Some(processor) => processor.process(&ctx, &task).await,
        None => Err(TaskError::transient(format!(
            "no processor registered for task type '{}'",
            task.task_type
        ))),
    };
    if ctx.abort().aborted() {
        // Nothing settles after abort; the task re-runs on resume.
        remove_running(&running, task_id);
        ctx.release_reservations(task_id).await;
        return task_id;
    }

    let succeeded = result.is_ok();
    let settle = settle_mutations(&task, result, ctx.now(), ctx.options().max_retries);
    // Unregister first: the settle batch may announce this task's own
    // failure rewrite, and that event must be admissible.
    remove_running(&running, task_id);
    if !succeeded {
        // The attempt's batch is discarded, so pairs it reserved must be
        // creatable again. Released before the rewrite commits, in case the
        // retry is admitted off that very event.
        ctx.release_reservations(task_id).await;
    }
    match settle {
        Ok(batch) => {
            if let Err(err) = ctx.store().batch(batch).await {
                error!(task = %task_id, error = %err, "failed to commit settlement");
            }
        }
        Err(err) => {
            error!(task = %task_id, error = %err, "failed to build settlement");
        }
    }
    if succeeded {
        // The durable registry entries are committed (or the commit failed
        // and the task will re-run wholesale); either way the in-process
        // hold is no longer needed.
        ctx.release_reservations(task_id).await;
    }
    task_id
}

/// The atomic settlement batch for one attempt.
///
/// Success deletes the task and carries the processor's mutations; a clean
/// finalize writes `end` instead of a delete, keeping the record as the
/// run's terminal audit entry. Failures rewrite the record per the failure
/// taxonomy. Every settlement except a clean finalize stamps
/// `lastModified`.
fn settle_mutations(
    task: &TaskRecord,
    result: Result<ProcessOutput, TaskError>,
    now: DateTime<Utc>,
    max_retries: usize,
) -> Result<Vec<Mutation>, StoreError> {
    let tasks = Namespace::tasks();
    let is_finalize = task.task_type.as_str() == lifecycle::FINALIZE;

    let (mut batch, clean) = match result {
        Ok(out) => {
            let mut batch = out.batch;
            if is_finalize {
                batch.push(Mutation::put(Namespace::meta(), meta::END, &now)?);
            } else {
                batch.push(Mutation::del(tasks, task.key()));
            }
            (batch, true)
        }
        Err(TaskError::RateLimit { reset_at, message }) => {
            info!(task = %task.id, %reset_at, message, "rate limited, deferring");
            let rewritten = task.clone().deferred(reset_at);
            (vec![Mutation::put(tasks, task.key(), &rewritten)?], false)
        }
        Err(TaskError::Unrecoverable(message)) => {
            warn!(task = %task.id, message, "unrecoverable failure, freezing task");
            let rewritten = task.clone().poisoned(message, now);
            (vec![Mutation::put(tasks, task.key(), &rewritten)?], false)
        }
        Err(TaskError::Transient(message)) => {
            let rewritten = task.clone().with_failure(message, now);
            if rewritten.transient_failures() >= max_retries {
                warn!(
                    task = %task.id,
                    failures = rewritten.transient_failures(),
                    "retry budget exhausted, task frozen"
                );
            } else {
                warn!(task = %task.id, "task failed, will retry");
            }
            (vec![Mutation::put(tasks, task.key(), &rewritten)?], false)
        }
    };

    if !(is_finalize && clean) {
        batch.push(Mutation::put(Namespace::meta(), meta::LAST_MODIFIED, &now)?);
    }
    Ok(batch)
}
