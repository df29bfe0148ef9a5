//! Demo crawl over a hard-coded package graph.
//!
//! Walks the dependency tree of a few seed packages, memoizes "registry"
//! lookups in the cache namespace and writes one record per package. State
//! lives in SQLite, so interrupting and re-running the binary resumes the
//! crawl. One package fails its first attempt on purpose to show retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use quarry_core::lifecycle;
use quarry_core::{
    Backend, CacheFill, Context, ExpirePolicy, Namespace, ProcessOutput, Processor, RunOptions,
    Scheduler, SqliteBackend, TaskDef, TaskError, TaskRecord, get_or_create,
};

const SEEDS: [&str; 2] = ["express", "chalk"];

/// name -> direct dependencies. Stands in for a registry API.
const GRAPH: [(&str, &[&str]); 8] = [
    ("express", &["body-parser", "cookie", "debug"]),
    ("chalk", &["ansi-styles", "supports-color"]),
    ("body-parser", &["debug"]),
    ("cookie", &[]),
    ("debug", &["ms"]),
    ("ms", &[]),
    ("ansi-styles", &[]),
    ("supports-color", &[]),
];

fn packages() -> Namespace {
    Namespace::new("packages")
}

#[derive(Debug, Serialize, Deserialize)]
struct PackageItem {
    name: String,
    depth: u32,
}

struct InitProcessor;

#[async_trait]
impl Processor for InitProcessor {
    fn task_type(&self) -> &str {
        lifecycle::INIT
    }

    async fn process(&self, ctx: &Context, task: &TaskRecord) -> Result<ProcessOutput, TaskError> {
        let seeds: Vec<String> = serde_json::from_value(task.payload.clone())?;
        let mut batch = Vec::new();
        for name in seeds {
            let item = serde_json::to_value(PackageItem { name, depth: 0 })?;
            batch.extend(
                ctx.create_resource_task_for(&packages(), &PackageProcessor::new(), &item)
                    .await?,
            );
        }
        Ok(ProcessOutput::batch(batch))
    }
}

struct PackageProcessor {
    flaky_tripped: AtomicBool,
}

impl PackageProcessor {
    fn new() -> Self {
        Self {
            flaky_tripped: AtomicBool::new(false),
        }
    }

    /// Pretend to hit the registry: a short delay, then the static graph.
    async fn fetch_manifest(&self, name: &str) -> Result<CacheFill, TaskError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if name == "ms" && !self.flaky_tripped.swap(true, Ordering::SeqCst) {
            return Err(TaskError::transient("simulated registry timeout"));
        }
        let deps = GRAPH
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, deps)| *deps)
            .ok_or_else(|| TaskError::unrecoverable(format!("package '{name}' not found")))?;
        Ok(CacheFill::new(
            json!({ "name": name, "dependencies": deps }),
            ExpirePolicy::Ttl {
                max_age_ms: 24 * 60 * 60 * 1000,
            },
        ))
    }
}

#[async_trait]
impl Processor for PackageProcessor {
    fn task_type(&self) -> &str {
        "package"
    }

    fn task_def(&self, _ctx: &Context, item: &Value) -> Result<TaskDef, TaskError> {
        let parsed: PackageItem = serde_json::from_value(item.clone())?;
        Ok(TaskDef::new(parsed.name, item.clone()))
    }

    fn validate(&self, ctx: &Context, payload: &Value) -> bool {
        payload["depth"].as_u64().unwrap_or(0) <= u64::from(ctx.options().max_depth)
    }

    async fn process(&self, ctx: &Context, task: &TaskRecord) -> Result<ProcessOutput, TaskError> {
        let item: PackageItem = serde_json::from_value(task.payload.clone())?;
        let name = item.name.clone();
        get_or_create(ctx, &packages(), &name, || async {
            let manifest = ctx
                .cached(&format!("manifest:{name}"), || self.fetch_manifest(&name))
                .await?;

            let mut batch = Vec::new();
            if let Some(deps) = manifest["dependencies"].as_array() {
                for dep in deps {
                    let child = serde_json::to_value(PackageItem {
                        name: dep.as_str().unwrap_or_default().to_owned(),
                        depth: item.depth + 1,
                    })?;
                    batch.extend(
                        ctx.create_resource_task_for(&packages(), self, &child)
                            .await?,
                    );
                }
            }
            Ok(ProcessOutput {
                value: Some(json!({
                    "name": name,
                    "depth": item.depth,
                    "dependencies": manifest["dependencies"],
                })),
                batch,
            })
        })
        .await
    }
}

struct FinalizeProcessor;

#[async_trait]
impl Processor for FinalizeProcessor {
    fn task_type(&self) -> &str {
        lifecycle::FINALIZE
    }

    async fn process(&self, ctx: &Context, _task: &TaskRecord) -> Result<ProcessOutput, TaskError> {
        let entries = ctx.iterate(&packages()).await?;
        info!(packages = entries.len(), "crawl finished");
        for (name, value) in entries {
            info!(package = name, depth = value["depth"].as_u64(), "crawled");
        }
        Ok(ProcessOutput::empty())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let dir = std::env::args().nth(1).unwrap_or_else(|| "quarry-data".to_owned());
    std::fs::create_dir_all(&dir)?;
    let state: Arc<dyn Backend> = Arc::new(SqliteBackend::open(format!("{dir}/state.db"))?);
    let cache: Arc<dyn Backend> = Arc::new(SqliteBackend::open(format!("{dir}/cache.db"))?);

    let scheduler = Scheduler::builder(state, cache)
        .seed(json!(SEEDS))
        .options(RunOptions {
            concurrency: 4,
            max_depth: 3,
            ..RunOptions::default()
        })
        .register(Arc::new(InitProcessor))?
        .register(Arc::new(PackageProcessor::new()))?
        .register(Arc::new(FinalizeProcessor))?
        .build();
    scheduler.run().await?;
    Ok(())
}
