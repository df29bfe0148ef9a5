//! Run-level tuning knobs.

/// Options for a single scheduler run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of tasks executing at once.
    pub concurrency: usize,
    /// Transient failures tolerated before a task is frozen.
    pub max_retries: usize,
    /// Traversal depth limit for processors that fan out recursively.
    pub max_depth: u32,
    /// Serve cache entries without freshness checks. Useful for offline
    /// reruns over previously fetched data.
    pub prefer_cache: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 2,
            max_depth: 5,
            prefer_cache: false,
        }
    }
}
