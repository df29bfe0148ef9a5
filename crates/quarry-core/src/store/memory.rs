//! In-memory backend for tests and throwaway runs. Nothing survives the
//! process; atomicity comes from holding the single lock across a batch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Backend, Mutation, Namespace};
use crate::domain::StoreError;

#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        let data = self.data.lock().await;
        Ok(data.get(ns.as_str()).and_then(|m| m.get(key)).cloned())
    }

    async fn apply(&self, mutations: &[Mutation]) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        for mutation in mutations {
            match mutation {
                Mutation::Put { ns, key, value } => {
                    data.entry(ns.as_str().to_owned())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                Mutation::Del { ns, key } => {
                    if let Some(m) = data.get_mut(ns.as_str()) {
                        m.remove(key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn iterate(&self, ns: &Namespace) -> Result<Vec<(String, Value)>, StoreError> {
        let data = self.data.lock().await;
        Ok(data
            .get(ns.as_str())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn clear(&self, ns: &Namespace) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.remove(ns.as_str());
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.clear();
        Ok(())
    }
}
