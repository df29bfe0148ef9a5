//! Maps task types to their processors. Registration is fail-fast so a
//! duplicate type shows up at wiring time, not mid-run.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::processor::Processor;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a processor for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Result<(), RegistryError> {
        let task_type = processor.task_type().to_owned();
        if self.processors.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.processors.insert(task_type, processor);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.processors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
