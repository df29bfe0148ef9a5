//! SQLite backend. One `kv` table keyed by `(ns, k)` with JSON values;
//! batches ride a SQL transaction so a crash never exposes half a settle.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::{Connection, params};
use serde_json::Value;

use super::{Backend, Mutation, Namespace};
use crate::domain::StoreError;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS kv (
                 ns TEXT NOT NULL,
                 k  TEXT NOT NULL,
                 v  TEXT NOT NULL,
                 PRIMARY KEY (ns, k)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT v FROM kv WHERE ns = ?1 AND k = ?2")?;
        let mut rows = stmt.query(params![ns.as_str(), key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn apply(&self, mutations: &[Mutation]) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for mutation in mutations {
            match mutation {
                Mutation::Put { ns, key, value } => {
                    tx.execute(
                        "INSERT INTO kv (ns, k, v) VALUES (?1, ?2, ?3)
                         ON CONFLICT (ns, k) DO UPDATE SET v = excluded.v",
                        params![ns.as_str(), key, serde_json::to_string(value)?],
                    )?;
                }
                Mutation::Del { ns, key } => {
                    tx.execute(
                        "DELETE FROM kv WHERE ns = ?1 AND k = ?2",
                        params![ns.as_str(), key],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn iterate(&self, ns: &Namespace) -> Result<Vec<(String, Value)>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT k, v FROM kv WHERE ns = ?1 ORDER BY k")?;
        let mut rows = stmt.query(params![ns.as_str()])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            entries.push((key, serde_json::from_str(&raw)?));
        }
        Ok(entries)
    }

    async fn clear(&self, ns: &Namespace) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv WHERE ns = ?1", params![ns.as_str()])?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}
