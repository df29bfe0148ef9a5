//! Domain model: identifiers, task records, failure taxonomy, run metadata.

mod errors;
mod ids;
pub mod meta;
mod task;

pub use errors::{StoreError, TaskError};
pub use ids::{Id, IdMarker, TaskId, TaskMarker};
pub use meta::RunMeta;
pub use task::{FailureKind, FailureRecord, TaskRecord, TaskType};
