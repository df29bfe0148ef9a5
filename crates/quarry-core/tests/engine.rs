//! End-to-end scheduler runs against an in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::Barrier;

use quarry_core::lifecycle;
use quarry_core::{
    Backend, Clock, Context, FixedClock, MemoryBackend, Namespace, ProcessOutput, Processor, RunOptions,
    Scheduler, SchedulerBuilder, SystemClock, TaskError, TaskRecord, abort_channel,
    get_or_create,
};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn packages() -> Namespace {
    Namespace::new("packages")
}

/// Seeds one `package` resource task per seed item.
struct SeedInit;

#[async_trait]
impl Processor for SeedInit {
    fn task_type(&self) -> &str {
        lifecycle::INIT
    }

    async fn process(&self, ctx: &Context, task: &TaskRecord) -> Result<ProcessOutput, TaskError> {
        let names = task
            .payload
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut batch = Vec::new();
        for name in &names {
            let key = name.as_str().unwrap_or_default();
            batch.extend(
                ctx.create_resource_task(&packages(), "package", key, name.clone())
                    .await?,
            );
        }
        Ok(ProcessOutput::batch(batch))
    }
}

/// Produces one entry in the `packages` namespace per task.
struct PackageWriter {
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl Processor for PackageWriter {
    fn task_type(&self) -> &str {
        "package"
    }

    async fn process(&self, ctx: &Context, task: &TaskRecord) -> Result<ProcessOutput, TaskError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let name = task.payload.as_str().unwrap_or_default().to_owned();
        get_or_create(ctx, &packages(), &name, || async {
            Ok(ProcessOutput::value(json!({ "name": name })))
        })
        .await
    }
}

struct NoopFinalize {
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl Processor for NoopFinalize {
    fn task_type(&self) -> &str {
        lifecycle::FINALIZE
    }

    async fn process(&self, _ctx: &Context, _task: &TaskRecord) -> Result<ProcessOutput, TaskError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessOutput::empty())
    }
}

/// Fails every attempt with the given error.
struct AlwaysFail {
    task_type: &'static str,
    executions: Arc<AtomicU32>,
    error: Box<dyn Fn() -> TaskError + Send + Sync>,
}

#[async_trait]
impl Processor for AlwaysFail {
    fn task_type(&self) -> &str {
        self.task_type
    }

    async fn process(&self, _ctx: &Context, _task: &TaskRecord) -> Result<ProcessOutput, TaskError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

fn builder(backend: &Arc<MemoryBackend>, clock: &FixedClock) -> SchedulerBuilder {
    Scheduler::builder(
        Arc::clone(backend) as Arc<dyn Backend>,
        Arc::clone(backend) as Arc<dyn Backend>,
    )
    .clock(Arc::new(clock.clone()))
}

async fn stored_tasks(backend: &MemoryBackend) -> Vec<TaskRecord> {
    backend
        .iterate(&Namespace::tasks())
        .await
        .unwrap()
        .into_iter()
        .map(|(_, v)| serde_json::from_value(v).unwrap())
        .collect()
}

async fn meta_end(backend: &MemoryBackend) -> Option<Value> {
    backend.get(&Namespace::meta(), "end").await.unwrap()
}

#[tokio::test]
async fn full_run_seeds_processes_and_finalizes() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let finalizes = Arc::new(AtomicU32::new(0));
    let executions = Arc::new(AtomicU32::new(0));

    let scheduler = builder(&backend, &clock)
        .seed(json!(["lodash", "react", "chalk"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(PackageWriter {
            executions: Arc::clone(&executions),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::clone(&finalizes),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    let produced = backend.iterate(&packages()).await.unwrap();
    assert_eq!(produced.len(), 3);
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);
    assert!(meta_end(&backend).await.is_some());

    // Everything settled; only the terminal finalize record remains.
    let remaining = stored_tasks(&backend).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_type.as_str(), lifecycle::FINALIZE);
}

#[tokio::test]
async fn completed_store_is_not_rerun() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let finalizes = Arc::new(AtomicU32::new(0));

    let build = || {
        builder(&backend, &clock)
            .register(Arc::new(SeedInit))
            .unwrap()
            .register(Arc::new(NoopFinalize {
                executions: Arc::clone(&finalizes),
            }))
            .unwrap()
            .build()
    };
    build().run().await.unwrap();
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);

    build().run().await.unwrap();
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limited_task_waits_out_the_deferral() {
    struct RateLimitOnce {
        executions: Arc<AtomicU32>,
        reset_at: DateTime<Utc>,
    }

    #[async_trait]
    impl Processor for RateLimitOnce {
        fn task_type(&self) -> &str {
            "package"
        }

        async fn process(
            &self,
            _ctx: &Context,
            _task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            if self.executions.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(TaskError::rate_limit(self.reset_at, "quota exceeded"));
            }
            Ok(ProcessOutput::empty())
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let reset_at = start_time() + chrono::Duration::seconds(5);
    let executions = Arc::new(AtomicU32::new(0));

    let scheduler = builder(&backend, &clock)
        .seed(json!(["lodash"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(RateLimitOnce {
            executions: Arc::clone(&executions),
            reset_at,
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert!(clock.now() >= reset_at);
    assert!(meta_end(&backend).await.is_some());
}

#[tokio::test]
async fn transient_failures_freeze_at_the_retry_cap() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let executions = Arc::new(AtomicU32::new(0));

    let scheduler = builder(&backend, &clock)
        .seed(json!(["lodash"]))
        .options(RunOptions {
            max_retries: 2,
            ..RunOptions::default()
        })
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(AlwaysFail {
            task_type: "package",
            executions: Arc::clone(&executions),
            error: Box::new(|| TaskError::transient("connection reset")),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert!(meta_end(&backend).await.is_some());

    let frozen: Vec<_> = stored_tasks(&backend)
        .await
        .into_iter()
        .filter(|t| t.task_type.as_str() == "package")
        .collect();
    assert_eq!(frozen.len(), 1);
    assert_eq!(frozen[0].transient_failures(), 2);
    assert!(!frozen[0].unrecoverable);
}

#[tokio::test]
async fn unrecoverable_failure_excludes_after_one_attempt() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let executions = Arc::new(AtomicU32::new(0));

    let scheduler = builder(&backend, &clock)
        .seed(json!(["gone"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(AlwaysFail {
            task_type: "package",
            executions: Arc::clone(&executions),
            error: Box::new(|| TaskError::unrecoverable("404 not found")),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let poisoned: Vec<_> = stored_tasks(&backend)
        .await
        .into_iter()
        .filter(|t| t.unrecoverable)
        .collect();
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].errors.len(), 1);
    assert!(meta_end(&backend).await.is_some());
}

#[tokio::test]
async fn concurrent_fanout_creates_the_shared_child_once() {
    /// Two of these run in lockstep and both try to enqueue `child:shared`.
    struct Fanout {
        task_type: &'static str,
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl Processor for Fanout {
        fn task_type(&self) -> &str {
            self.task_type
        }

        async fn process(
            &self,
            ctx: &Context,
            _task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            self.barrier.wait().await;
            let batch = ctx.create_task("child", "shared", json!(null)).await?;
            self.barrier.wait().await;
            Ok(ProcessOutput::batch(batch))
        }
    }

    struct FanoutInit;

    #[async_trait]
    impl Processor for FanoutInit {
        fn task_type(&self) -> &str {
            lifecycle::INIT
        }

        async fn process(
            &self,
            ctx: &Context,
            _task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            let mut batch = ctx.create_task("fanout-a", "x", json!(null)).await?;
            batch.extend(ctx.create_task("fanout-b", "x", json!(null)).await?);
            Ok(ProcessOutput::batch(batch))
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let barrier = Arc::new(Barrier::new(2));
    let child_runs = Arc::new(AtomicU32::new(0));

    struct CountChild {
        executions: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Processor for CountChild {
        fn task_type(&self) -> &str {
            "child"
        }

        async fn process(
            &self,
            _ctx: &Context,
            _task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessOutput::empty())
        }
    }

    let scheduler = builder(&backend, &clock)
        .register(Arc::new(FanoutInit))
        .unwrap()
        .register(Arc::new(Fanout {
            task_type: "fanout-a",
            barrier: Arc::clone(&barrier),
        }))
        .unwrap()
        .register(Arc::new(Fanout {
            task_type: "fanout-b",
            barrier: Arc::clone(&barrier),
        }))
        .unwrap()
        .register(Arc::new(CountChild {
            executions: Arc::clone(&child_runs),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    assert_eq!(child_runs.load(Ordering::SeqCst), 1);
    assert!(meta_end(&backend).await.is_some());
}

#[tokio::test]
async fn existing_resource_skips_its_task() {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .apply(&[quarry_core::Mutation::put_value(
            packages(),
            "lodash",
            json!({ "name": "lodash", "cached": true }),
        )])
        .await
        .unwrap();

    let clock = FixedClock::new(start_time());
    let executions = Arc::new(AtomicU32::new(0));
    let scheduler = builder(&backend, &clock)
        .seed(json!(["lodash"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(PackageWriter {
            executions: Arc::clone(&executions),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 0);
    let existing = backend.get(&packages(), "lodash").await.unwrap().unwrap();
    assert_eq!(existing["cached"], json!(true));
}

#[tokio::test]
async fn interrupted_run_resumes_without_reseeding() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let executions = Arc::new(AtomicU32::new(0));

    // First run aborts before any task settles; the init task stays pending.
    let (handle, signal) = abort_channel();
    handle.abort();
    let interrupted = builder(&backend, &clock)
        .seed(json!(["lodash"]))
        .abort_signal(signal)
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(PackageWriter {
            executions: Arc::clone(&executions),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    interrupted.run().await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert!(meta_end(&backend).await.is_none());
    let pending = stored_tasks(&backend).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_type.as_str(), lifecycle::INIT);

    // Second run picks up the stored init task and completes.
    let resumed = builder(&backend, &clock)
        .seed(json!(["ignored-on-resume"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(PackageWriter {
            executions: Arc::clone(&executions),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    resumed.run().await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(backend.get(&packages(), "lodash").await.unwrap().is_some());
    assert!(meta_end(&backend).await.is_some());
}

#[tokio::test]
async fn abort_interrupts_a_real_deferral_sleep() {
    let backend = Arc::new(MemoryBackend::new());
    let far_future = Utc::now() + chrono::Duration::hours(1);

    let scheduler = Scheduler::builder(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::clone(&backend) as Arc<dyn Backend>,
    )
    .clock(Arc::new(SystemClock))
    .seed(json!(["lodash"]))
    .register(Arc::new(SeedInit))
    .unwrap()
    .register(Arc::new(AlwaysFail {
        task_type: "package",
        executions: Arc::new(AtomicU32::new(0)),
        error: Box::new(move || TaskError::rate_limit(far_future, "long outage")),
    }))
    .unwrap()
    .register(Arc::new(NoopFinalize {
        executions: Arc::new(AtomicU32::new(0)),
    }))
    .unwrap();

    let (handle, signal) = abort_channel();
    let scheduler = scheduler.abort_signal(signal).build();
    let run = tokio::spawn(async move { scheduler.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not stop after abort")
        .unwrap()
        .unwrap();

    // The deferred task survived untouched for the next run.
    assert!(meta_end(&backend).await.is_none());
    let pending: Vec<_> = stored_tasks(&backend)
        .await
        .into_iter()
        .filter(|t| t.task_type.as_str() == "package")
        .collect();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].retry_at.is_some());
}

#[tokio::test]
async fn panicking_processor_counts_as_a_transient_failure() {
    struct PanicOnce {
        panicked: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Processor for PanicOnce {
        fn task_type(&self) -> &str {
            "package"
        }

        async fn process(
            &self,
            _ctx: &Context,
            _task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            if self.panicked.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            Ok(ProcessOutput::empty())
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let attempts = Arc::new(AtomicU32::new(0));

    let scheduler = builder(&backend, &clock)
        .seed(json!(["lodash"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(PanicOnce {
            panicked: Arc::clone(&attempts),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(meta_end(&backend).await.is_some());
    // The panic settled as an ordinary transient failure, then the retry
    // succeeded and deleted the task.
    let remaining: Vec<_> = stored_tasks(&backend)
        .await
        .into_iter()
        .filter(|t| t.task_type.as_str() == "package")
        .collect();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn failed_parent_attempt_still_gets_its_child_created() {
    /// Enqueues a child, then fails its first attempt so the creating batch
    /// is thrown away.
    struct FlakyParent {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Processor for FlakyParent {
        fn task_type(&self) -> &str {
            "package"
        }

        async fn process(
            &self,
            ctx: &Context,
            _task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            let batch = ctx.create_task("child", "c", json!(null)).await?;
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(TaskError::transient("lost connection"));
            }
            Ok(ProcessOutput::batch(batch))
        }
    }

    struct CountChild {
        executions: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Processor for CountChild {
        fn task_type(&self) -> &str {
            "child"
        }

        async fn process(
            &self,
            _ctx: &Context,
            _task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessOutput::empty())
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let parent_attempts = Arc::new(AtomicU32::new(0));
    let child_runs = Arc::new(AtomicU32::new(0));

    let scheduler = builder(&backend, &clock)
        .seed(json!(["p"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(FlakyParent {
            attempts: Arc::clone(&parent_attempts),
        }))
        .unwrap()
        .register(Arc::new(CountChild {
            executions: Arc::clone(&child_runs),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    assert_eq!(parent_attempts.load(Ordering::SeqCst), 2);
    // The retry's batch recreated the child; it ran exactly once.
    assert_eq!(child_runs.load(Ordering::SeqCst), 1);
    assert!(meta_end(&backend).await.is_some());
}

#[tokio::test]
async fn deferral_sleep_wakes_at_the_earliest_reset() {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;

    /// Rate-limits each package once, to its own reset time, then records
    /// when the retry actually ran.
    struct StaggeredRateLimit {
        resets: HashMap<String, DateTime<Utc>>,
        deferred: StdMutex<HashSet<String>>,
        retried_at: Arc<StdMutex<Vec<(String, DateTime<Utc>)>>>,
    }

    #[async_trait]
    impl Processor for StaggeredRateLimit {
        fn task_type(&self) -> &str {
            "package"
        }

        async fn process(
            &self,
            ctx: &Context,
            task: &TaskRecord,
        ) -> Result<ProcessOutput, TaskError> {
            let name = task.payload.as_str().unwrap_or_default().to_owned();
            if self.deferred.lock().unwrap().insert(name.clone()) {
                return Err(TaskError::rate_limit(self.resets[&name], "quota"));
            }
            self.retried_at.lock().unwrap().push((name, ctx.now()));
            Ok(ProcessOutput::empty())
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let near = start_time() + chrono::Duration::seconds(5);
    let far = start_time() + chrono::Duration::seconds(9);
    let retried_at = Arc::new(StdMutex::new(Vec::new()));

    let scheduler = builder(&backend, &clock)
        .seed(json!(["near", "far"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(StaggeredRateLimit {
            resets: HashMap::from([("near".to_owned(), near), ("far".to_owned(), far)]),
            deferred: StdMutex::new(HashSet::new()),
            retried_at: Arc::clone(&retried_at),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    // The first wake-up lands on the earlier reset, not the later one; the
    // clock only jumps to the later reset for the second retry.
    let log = retried_at.lock().unwrap().clone();
    assert_eq!(
        log,
        [("near".to_owned(), near), ("far".to_owned(), far)]
    );
    assert!(meta_end(&backend).await.is_some());
}

#[tokio::test]
async fn each_attempt_settles_in_one_batch() {
    use std::sync::Mutex as StdMutex;

    use quarry_core::{Mutation, StoreError};

    /// Backend wrapper that keeps every batch handed to `apply`.
    struct RecordingBackend {
        inner: MemoryBackend,
        batches: StdMutex<Vec<Vec<Mutation>>>,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn get(
            &self,
            ns: &Namespace,
            key: &str,
        ) -> Result<Option<Value>, StoreError> {
            self.inner.get(ns, key).await
        }

        async fn apply(&self, mutations: &[Mutation]) -> Result<(), StoreError> {
            self.batches.lock().unwrap().push(mutations.to_vec());
            self.inner.apply(mutations).await
        }

        async fn iterate(&self, ns: &Namespace) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.iterate(ns).await
        }

        async fn clear(&self, ns: &Namespace) -> Result<(), StoreError> {
            self.inner.clear(ns).await
        }

        async fn clear_all(&self) -> Result<(), StoreError> {
            self.inner.clear_all().await
        }
    }

    let backend = Arc::new(RecordingBackend {
        inner: MemoryBackend::new(),
        batches: StdMutex::new(Vec::new()),
    });
    let clock = FixedClock::new(start_time());
    let scheduler = Scheduler::builder(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::clone(&backend) as Arc<dyn Backend>,
    )
    .clock(Arc::new(clock.clone()))
    .seed(json!(["lodash"]))
    .register(Arc::new(SeedInit))
    .unwrap()
    .register(Arc::new(PackageWriter {
        executions: Arc::new(AtomicU32::new(0)),
    }))
    .unwrap()
    .register(Arc::new(NoopFinalize {
        executions: Arc::new(AtomicU32::new(0)),
    }))
    .unwrap()
    .build();
    scheduler.run().await.unwrap();

    // The package's resource write, its task deletion and the lastModified
    // stamp all arrive in the same apply call.
    let batches = backend.batches.lock().unwrap().clone();
    let settles: Vec<_> = batches
        .iter()
        .filter(|batch| {
            batch.iter().any(
                |m| matches!(m, Mutation::Put { ns, .. } if ns.as_str() == "packages"),
            )
        })
        .collect();
    assert_eq!(settles.len(), 1);
    let settle = settles[0];
    assert!(
        settle
            .iter()
            .any(|m| matches!(m, Mutation::Del { ns, .. } if ns.as_str() == "tasks"))
    );
    assert!(settle.iter().any(
        |m| matches!(m, Mutation::Put { ns, key, .. } if ns.as_str() == "meta" && key == "lastModified")
    ));
}

#[tokio::test]
async fn clean_run_logs_completion_without_warnings() {
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct Capture(Arc<StdMutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Capture {
            self.clone()
        }
    }

    let capture = Capture(Arc::new(StdMutex::new(Vec::new())));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let backend = Arc::new(MemoryBackend::new());
    let clock = FixedClock::new(start_time());
    let scheduler = builder(&backend, &clock)
        .seed(json!(["lodash"]))
        .register(Arc::new(SeedInit))
        .unwrap()
        .register(Arc::new(PackageWriter {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .register(Arc::new(NoopFinalize {
            executions: Arc::new(AtomicU32::new(0)),
        }))
        .unwrap()
        .build();
    scheduler.run().await.unwrap();

    let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("run complete"));
    assert!(!output.contains("WARN"), "clean run warned: {output}");
}
