//! Per-run handle passed to every processor invocation.
//!
//! Design:
//! - Cheap to clone; one shared inner per run.
//! - The fan-out helpers are idempotent: a `(type, key)` pair is enqueued
//!   at most once per store lifetime. The durable side of that guarantee is
//!   the task-registry entry committed with the caller's settlement; the
//!   in-process reservation map covers the window before that commit, when
//!   two concurrent tasks try to spawn the same child. Reservations are
//!   scoped to the reserving attempt: a failed attempt discards its batch,
//!   so its reservations are released and the retry creates the same pairs
//!   again.
//! - After abort is raised, `batch` silently drops writes so a cancelled
//!   run leaves the store exactly as the last settled task did.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::{CacheFill, CacheLayer};
use crate::domain::{StoreError, TaskError, TaskId, TaskRecord, TaskType};
use crate::options::RunOptions;
use crate::ports::Clock;
use crate::processor::Processor;
use crate::signal::AbortSignal;
use crate::store::{Mutation, Namespace, Store};

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
    /// The task whose attempt this handle serves; reservations it takes are
    /// tagged with this id so they can be released when the attempt fails.
    current_task: Option<TaskId>,
}

struct ContextInner {
    store: Store,
    cache: CacheLayer,
    options: RunOptions,
    clock: Arc<dyn Clock>,
    abort: AbortSignal,
    reserved: Mutex<HashMap<String, Option<TaskId>>>,
}

impl Context {
    pub(crate) fn new(
        store: Store,
        cache: CacheLayer,
        options: RunOptions,
        clock: Arc<dyn Clock>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                store,
                cache,
                options,
                clock,
                abort,
                reserved: Mutex::new(HashMap::new()),
            }),
            current_task: None,
        }
    }

    /// Handle for one task's attempt, sharing the run state.
    pub(crate) fn for_task(&self, task: TaskId) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            current_task: Some(task),
        }
    }

    /// Drop every reservation the given task's attempt took. Called on a
    /// failed settlement, where the creating batch was discarded, and after
    /// a successful one, where the durable registry entry has taken over.
    pub(crate) async fn release_reservations(&self, task: TaskId) {
        self.inner
            .reserved
            .lock()
            .await
            .retain(|_, creator| *creator != Some(task));
    }

    #[cfg(test)]
    pub(crate) fn for_tests(backend: Arc<dyn crate::store::Backend>) -> Self {
        use crate::ports::FixedClock;
        use crate::signal::abort_channel;
        use chrono::TimeZone;

        let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(epoch));
        let cache = CacheLayer::new(Arc::clone(&backend), Arc::clone(&clock), epoch, false);
        let (handle, signal) = abort_channel();
        std::mem::forget(handle);
        Self::new(
            Store::new(backend, Namespace::tasks()),
            cache,
            RunOptions::default(),
            clock,
            signal,
        )
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn options(&self) -> &RunOptions {
        &self.inner.options
    }

    pub fn abort(&self) -> &AbortSignal {
        &self.inner.abort
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.store.get(ns, key).await
    }

    pub async fn iterate(&self, ns: &Namespace) -> Result<Vec<(String, Value)>, StoreError> {
        self.inner.store.iterate(ns).await
    }

    /// Commit a batch outside task settlement. Dropped once abort is raised.
    pub async fn batch(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        if self.inner.abort.aborted() {
            return Ok(());
        }
        self.inner.store.batch(mutations).await
    }

    pub async fn cached<F, Fut>(&self, key: &str, fill: F) -> Result<Value, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheFill, TaskError>>,
    {
        self.inner.cache.cached(key, fill).await
    }

    /// Mutations enqueueing a new `(task_type, key)` task, or an empty batch
    /// if that pair was ever enqueued before.
    pub async fn create_task(
        &self,
        task_type: &str,
        key: &str,
        payload: Value,
    ) -> Result<Vec<Mutation>, StoreError> {
        self.create_task_with(task_type, key, payload, |_| true).await
    }

    pub async fn create_task_with(
        &self,
        task_type: &str,
        key: &str,
        payload: Value,
        validate: impl FnOnce(&Value) -> bool + Send,
    ) -> Result<Vec<Mutation>, StoreError> {
        let registry_key = format!("{task_type}:{key}");

        // Held across the duplicate check so concurrent creators of the same
        // pair serialize here.
        let mut reserved = self.inner.reserved.lock().await;
        if reserved.contains_key(&registry_key) {
            return Ok(Vec::new());
        }
        if self
            .inner
            .store
            .get(&Namespace::task_registry(), &registry_key)
            .await?
            .is_some()
        {
            return Ok(Vec::new());
        }
        if !validate(&payload) {
            return Ok(Vec::new());
        }

        let task = TaskRecord::new(
            TaskId::generate(self.inner.clock.as_ref()),
            TaskType::new(task_type),
            payload,
        );
        reserved.insert(registry_key.clone(), self.current_task);
        Ok(vec![
            Mutation::put(Namespace::tasks(), task.key(), &task)?,
            Mutation::put(
                Namespace::task_registry(),
                registry_key,
                &task.id.to_string(),
            )?,
        ])
    }

    /// Like [`create_task`], but also skipped when `ns/key` already holds a
    /// value, so resources are never produced twice.
    pub async fn create_resource_task(
        &self,
        ns: &Namespace,
        task_type: &str,
        key: &str,
        payload: Value,
    ) -> Result<Vec<Mutation>, StoreError> {
        self.create_resource_task_with(ns, task_type, key, payload, |_| true)
            .await
    }

    pub async fn create_resource_task_with(
        &self,
        ns: &Namespace,
        task_type: &str,
        key: &str,
        payload: Value,
        validate: impl FnOnce(&Value) -> bool + Send,
    ) -> Result<Vec<Mutation>, StoreError> {
        if self.inner.store.get(ns, key).await?.is_some() {
            return Ok(Vec::new());
        }
        self.create_task_with(task_type, key, payload, validate).await
    }

    /// Fan out to `processor`, deriving key and payload from `item` and
    /// honoring the processor's own veto.
    pub async fn create_task_for(
        &self,
        processor: &dyn Processor,
        item: &Value,
    ) -> Result<Vec<Mutation>, TaskError> {
        let def = processor.task_def(self, item)?;
        Ok(self
            .create_task_with(processor.task_type(), &def.key, def.payload, |payload| {
                processor.validate(self, payload)
            })
            .await?)
    }

    pub async fn create_resource_task_for(
        &self,
        ns: &Namespace,
        processor: &dyn Processor,
        item: &Value,
    ) -> Result<Vec<Mutation>, TaskError> {
        let def = processor.task_def(self, item)?;
        Ok(self
            .create_resource_task_with(ns, processor.task_type(), &def.key, def.payload, |payload| {
                processor.validate(self, payload)
            })
            .await?)
    }
}
