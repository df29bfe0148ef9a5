//! quarry-core: a persistent, resumable task-processing engine.
//!
//! Work is modeled as durable task records in a namespaced key-value store.
//! Processors turn a task into domain data plus follow-up tasks; the
//! scheduler drives pending tasks under a concurrency bound, settles each
//! attempt as one atomic batch and survives crashes by simply re-running
//! whatever is still stored.
//!
//! Modules:
//! - [`domain`]: ids, task records, failure taxonomy, run metadata.
//! - [`store`]: backends (in-memory, SQLite) and the notifying [`Store`].
//! - [`cache`]: memoizing fetch cache with pluggable expiration.
//! - [`processor`] / [`registry`]: the work contract and its type map.
//! - [`context`]: the per-run handle with idempotent task creation.
//! - [`scheduler`]: admission, draining, settlement, finalize.
//! - [`lifecycle`]: bootstrap, resume and pre-run store controls.

pub mod cache;
pub mod context;
pub mod domain;
pub mod lifecycle;
pub mod options;
pub mod ports;
pub mod processor;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod store;

pub use cache::{CacheEntry, CacheFill, CacheLayer, ExpirePolicy};
pub use context::Context;
pub use domain::{
    FailureKind, FailureRecord, StoreError, TaskError, TaskId, TaskRecord, TaskType,
};
pub use options::RunOptions;
pub use ports::{Clock, FixedClock, SystemClock};
pub use processor::{ProcessOutput, Processor, TaskDef, get_or_create};
pub use registry::{ProcessorRegistry, RegistryError};
pub use scheduler::{Eligibility, Scheduler, SchedulerBuilder, eligibility};
pub use signal::{AbortHandle, AbortSignal, abort_channel};
pub use store::{Backend, MemoryBackend, Mutation, Namespace, SqliteBackend, Store, StoreEvent};
