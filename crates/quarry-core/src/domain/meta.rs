//! Run metadata: one key per field in the `meta` namespace.
//!
//! `start` doubles as the cache epoch; `end` is written only at clean
//! completion and drives the resume-vs-complete decision on the next start.

use chrono::{DateTime, Utc};

pub const START: &str = "start";
pub const END: &str = "end";
pub const LAST_MODIFIED: &str = "lastModified";
pub const CRAWLER_VERSION: &str = "crawlerVersion";
pub const VCS_COMMIT: &str = "vcsCommit";

/// Snapshot of the run-control keys. Collaborators may store arbitrary
/// extra keys in the same namespace; those stay in the store.
#[derive(Debug, Clone, Default)]
pub struct RunMeta {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}
