//! Run lifecycle: bootstrap, resume and the pre-run store controls.
//!
//! Design:
//! - `ensure_started` is the resume pivot. A stored `start` means work is
//!   already in flight and nothing is re-seeded; a missing `start` means a
//!   fresh run, which commits `start`, build provenance and the init task
//!   in one batch.
//! - The controls operate on a plain [`Backend`] and must run before a
//!   scheduler attaches. `restart` keeps domain and cache namespaces so a
//!   re-crawl can reuse fetched data.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::meta::{CRAWLER_VERSION, END, LAST_MODIFIED, START, VCS_COMMIT};
use crate::domain::{RunMeta, StoreError, TaskId, TaskRecord, TaskType};
use crate::ports::Clock;
use crate::store::{Backend, Mutation, Namespace, Store};

/// Task type of the bootstrap task that seeds the first wave of work.
pub const INIT: &str = "init";
/// Task type of the terminal task that runs once everything else settled.
pub const FINALIZE: &str = "finalize";

pub async fn load_meta(store: &Store) -> Result<RunMeta, StoreError> {
    let ns = Namespace::meta();
    Ok(RunMeta {
        start: store.get_as(&ns, START).await?,
        end: store.get_as(&ns, END).await?,
        last_modified: store.get_as(&ns, LAST_MODIFIED).await?,
    })
}

/// Start a fresh run or resume an interrupted one. Returns the run's start
/// timestamp, which also serves as the cache epoch.
pub async fn ensure_started(
    store: &Store,
    clock: &dyn Clock,
    seed: Value,
) -> Result<DateTime<Utc>, StoreError> {
    let ns = Namespace::meta();
    if let Some(start) = store.get_as::<DateTime<Utc>>(&ns, START).await? {
        return Ok(start);
    }

    let start = clock.now();
    let init = TaskRecord::new(TaskId::generate(clock), TaskType::new(INIT), seed);
    let mut batch = vec![
        Mutation::put(ns.clone(), START, &start)?,
        Mutation::put(ns.clone(), CRAWLER_VERSION, &env!("CARGO_PKG_VERSION"))?,
        Mutation::put(Namespace::tasks(), init.key(), &init)?,
        Mutation::put(
            Namespace::task_registry(),
            format!("{INIT}:{INIT}"),
            &init.id.to_string(),
        )?,
    ];
    if let Some(commit) = option_env!("VCS_COMMIT") {
        batch.push(Mutation::put(ns, VCS_COMMIT, &commit)?);
    }
    store.batch(batch).await?;
    Ok(start)
}

/// Enqueue the finalize task. Caller checks [`find_finalize`] first; the
/// registry entry would otherwise block a second run's finalize anyway.
pub async fn enqueue_finalize(store: &Store, clock: &dyn Clock) -> Result<(), StoreError> {
    let task = TaskRecord::new(TaskId::generate(clock), TaskType::new(FINALIZE), Value::Null);
    store
        .batch(vec![
            Mutation::put(Namespace::tasks(), task.key(), &task)?,
            Mutation::put(
                Namespace::task_registry(),
                format!("{FINALIZE}:{FINALIZE}"),
                &task.id.to_string(),
            )?,
        ])
        .await
}

/// The pending finalize task, if one exists.
pub async fn find_finalize(store: &Store) -> Result<Option<TaskRecord>, StoreError> {
    for (_, value) in store.iterate(&Namespace::tasks()).await? {
        if let Ok(task) = serde_json::from_value::<TaskRecord>(value)
            && task.task_type.as_str() == FINALIZE
        {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

/// Wipe everything, including domain data and the cache.
pub async fn reset(backend: &dyn Backend) -> Result<(), StoreError> {
    backend.clear_all().await
}

/// Wipe run state only. Domain namespaces and the cache survive.
pub async fn restart(backend: &dyn Backend) -> Result<(), StoreError> {
    backend.clear(&Namespace::tasks()).await?;
    backend.clear(&Namespace::meta()).await?;
    backend.clear(&Namespace::task_registry()).await
}

/// Strip failure state from every task so the next run retries them all,
/// frozen and poisoned ones included.
pub async fn clear_errors(backend: &dyn Backend) -> Result<(), StoreError> {
    let ns = Namespace::tasks();
    let mut batch = Vec::new();
    for (key, value) in backend.iterate(&ns).await? {
        let mut task: TaskRecord = match serde_json::from_value(value) {
            Ok(task) => task,
            Err(_) => continue,
        };
        if task.errors.is_empty() && task.retry_at.is_none() && !task.unrecoverable {
            continue;
        }
        task.errors.clear();
        task.retry_at = None;
        task.unrecoverable = false;
        batch.push(Mutation::put(ns.clone(), key, &task)?);
    }
    backend.apply(&batch).await
}
