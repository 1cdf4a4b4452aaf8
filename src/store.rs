//! Storage seams for configs, tasks, logs and metric rows.
//!
//! The core never holds global mutable caches of these entities; everything
//! goes through the narrow `ConfigStore` / `TaskStore` traits. `MemoryStore`
//! backs tests and embedders; `SqliteStore` is the reference persistence
//! collaborator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::task::{EvaluationTask, MetricsResult, TaskLogEntry, TaskStatus};

// =============================================================================
// Errors and traits
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, id: Uuid) -> Result<Option<ApiConfig>, StoreError>;
    async fn list_configs(&self) -> Result<Vec<ApiConfig>, StoreError>;
    async fn upsert_config(&self, config: &ApiConfig) -> Result<(), StoreError>;
    async fn delete_config(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: Uuid) -> Result<Option<EvaluationTask>, StoreError>;
    async fn list_tasks(&self, status: Option<TaskStatus>)
        -> Result<Vec<EvaluationTask>, StoreError>;
    async fn upsert_task(&self, task: &EvaluationTask) -> Result<(), StoreError>;
    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn append_logs(&self, task_id: Uuid, entries: &[TaskLogEntry])
        -> Result<(), StoreError>;
    async fn logs(&self, task_id: Uuid) -> Result<Vec<TaskLogEntry>, StoreError>;
    async fn insert_metrics(&self, results: &[MetricsResult]) -> Result<(), StoreError>;
    async fn metrics(&self, task_id: Uuid) -> Result<Vec<MetricsResult>, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    configs: HashMap<Uuid, ApiConfig>,
    tasks: HashMap<Uuid, EvaluationTask>,
    logs: HashMap<Uuid, Vec<TaskLogEntry>>,
    metrics: HashMap<Uuid, Vec<MetricsResult>>,
}

/// Mutex-guarded maps implementing both store traits.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut MemoryInner) -> R,
    {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_config(&self, id: Uuid) -> Result<Option<ApiConfig>, StoreError> {
        self.with_inner(|inner| inner.configs.get(&id).cloned())
    }

    async fn list_configs(&self) -> Result<Vec<ApiConfig>, StoreError> {
        self.with_inner(|inner| {
            let mut configs: Vec<_> = inner.configs.values().cloned().collect();
            configs.sort_by_key(|c| c.created_at);
            configs
        })
    }

    async fn upsert_config(&self, config: &ApiConfig) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            inner.configs.insert(config.id, config.clone());
        })
    }

    async fn delete_config(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_inner(|inner| inner.configs.remove(&id).is_some())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_task(&self, id: Uuid) -> Result<Option<EvaluationTask>, StoreError> {
        self.with_inner(|inner| inner.tasks.get(&id).cloned())
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<EvaluationTask>, StoreError> {
        self.with_inner(|inner| {
            let mut tasks: Vec<_> = inner
                .tasks
                .values()
                .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
                .cloned()
                .collect();
            tasks.sort_by_key(|t| t.created_at);
            tasks
        })
    }

    async fn upsert_task(&self, task: &EvaluationTask) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            inner.tasks.insert(task.id, task.clone());
        })
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_inner(|inner| {
            inner.logs.remove(&id);
            inner.metrics.remove(&id);
            inner.tasks.remove(&id).is_some()
        })
    }

    async fn append_logs(
        &self,
        task_id: Uuid,
        entries: &[TaskLogEntry],
    ) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            inner
                .logs
                .entry(task_id)
                .or_default()
                .extend_from_slice(entries);
        })
    }

    async fn logs(&self, task_id: Uuid) -> Result<Vec<TaskLogEntry>, StoreError> {
        self.with_inner(|inner| inner.logs.get(&task_id).cloned().unwrap_or_default())
    }

    async fn insert_metrics(&self, results: &[MetricsResult]) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            for result in results {
                inner
                    .metrics
                    .entry(result.task_id)
                    .or_default()
                    .push(result.clone());
            }
        })
    }

    async fn metrics(&self, task_id: Uuid) -> Result<Vec<MetricsResult>, StoreError> {
        self.with_inner(|inner| inner.metrics.get(&task_id).cloned().unwrap_or_default())
    }
}

// =============================================================================
// SQLite store
// =============================================================================

/// SQLite-backed store. Records are stored as JSON bodies with the columns
/// needed for filtering; all calls hop to `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS api_configs (\
               id TEXT PRIMARY KEY,\
               created_at TEXT NOT NULL,\
               body TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS tasks (\
               id TEXT PRIMARY KEY,\
               status TEXT NOT NULL,\
               created_at TEXT NOT NULL,\
               body TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS task_logs (\
               task_id TEXT NOT NULL,\
               body TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS metrics_results (\
               id TEXT PRIMARY KEY,\
               task_id TEXT NOT NULL,\
               body TEXT NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);\
             CREATE INDEX IF NOT EXISTS idx_metrics_task ON metrics_results(task_id);",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&SqliteStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

/// Config serialization normally redacts credentials; the persistence row
/// must keep the plaintext bag, so it is spliced back in explicitly.
fn config_to_body(config: &ApiConfig) -> Result<String, StoreError> {
    let mut value = serde_json::to_value(config).map_err(|e| StoreError::Serde(e.to_string()))?;
    value["auth_config"] = config.auth.as_value();
    serde_json::to_string(&value).map_err(|e| StoreError::Serde(e.to_string()))
}

fn from_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Serde(e.to_string()))
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serde(e.to_string()))
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn get_config(&self, id: Uuid) -> Result<Option<ApiConfig>, StoreError> {
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT body FROM api_configs WHERE id = ?1")?;
                let mut rows = stmt.query(params![id.to_string()])?;
                match rows.next()? {
                    Some(row) => {
                        let body: String = row.get(0)?;
                        Ok(Some(from_body(&body)?))
                    }
                    None => Ok(None),
                }
            })
        })
        .await
    }

    async fn list_configs(&self) -> Result<Vec<ApiConfig>, StoreError> {
        self.blocking(|store| {
            store.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT body FROM api_configs ORDER BY created_at ASC")?;
                let mut rows = stmt.query([])?;
                let mut configs = Vec::new();
                while let Some(row) = rows.next()? {
                    let body: String = row.get(0)?;
                    configs.push(from_body(&body)?);
                }
                Ok(configs)
            })
        })
        .await
    }

    async fn upsert_config(&self, config: &ApiConfig) -> Result<(), StoreError> {
        let body = config_to_body(config)?;
        let id = config.id.to_string();
        let created_at = config.created_at.to_rfc3339();
        self.blocking(move |store| {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO api_configs (id, created_at, body) VALUES (?1, ?2, ?3)\
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                    params![id, created_at, body],
                )?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_config(&self, id: Uuid) -> Result<bool, StoreError> {
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let removed =
                    conn.execute("DELETE FROM api_configs WHERE id = ?1", params![id.to_string()])?;
                Ok(removed > 0)
            })
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn get_task(&self, id: Uuid) -> Result<Option<EvaluationTask>, StoreError> {
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT body FROM tasks WHERE id = ?1")?;
                let mut rows = stmt.query(params![id.to_string()])?;
                match rows.next()? {
                    Some(row) => {
                        let body: String = row.get(0)?;
                        Ok(Some(from_body(&body)?))
                    }
                    None => Ok(None),
                }
            })
        })
        .await
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<EvaluationTask>, StoreError> {
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let mut tasks = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(
                            "SELECT body FROM tasks WHERE status = ?1 ORDER BY created_at ASC",
                        )?;
                        let mut rows = stmt.query(params![status.as_str()])?;
                        while let Some(row) = rows.next()? {
                            let body: String = row.get(0)?;
                            tasks.push(from_body(&body)?);
                        }
                    }
                    None => {
                        let mut stmt =
                            conn.prepare("SELECT body FROM tasks ORDER BY created_at ASC")?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            let body: String = row.get(0)?;
                            tasks.push(from_body(&body)?);
                        }
                    }
                }
                Ok(tasks)
            })
        })
        .await
    }

    async fn upsert_task(&self, task: &EvaluationTask) -> Result<(), StoreError> {
        let body = to_body(task)?;
        let id = task.id.to_string();
        let status = task.status.as_str();
        let created_at = task.created_at.to_rfc3339();
        self.blocking(move |store| {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO tasks (id, status, created_at, body) VALUES (?1, ?2, ?3, ?4)\
                     ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
                    params![id, status, created_at, body],
                )?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let id = id.to_string();
                conn.execute("DELETE FROM task_logs WHERE task_id = ?1", params![id])?;
                conn.execute(
                    "DELETE FROM metrics_results WHERE task_id = ?1",
                    params![id],
                )?;
                let removed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(removed > 0)
            })
        })
        .await
    }

    async fn append_logs(
        &self,
        task_id: Uuid,
        entries: &[TaskLogEntry],
    ) -> Result<(), StoreError> {
        let bodies: Result<Vec<String>, StoreError> = entries.iter().map(to_body).collect();
        let bodies = bodies?;
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("INSERT INTO task_logs (task_id, body) VALUES (?1, ?2)")?;
                for body in &bodies {
                    stmt.execute(params![task_id.to_string(), body])?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn logs(&self, task_id: Uuid) -> Result<Vec<TaskLogEntry>, StoreError> {
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT body FROM task_logs WHERE task_id = ?1 ORDER BY rowid ASC")?;
                let mut rows = stmt.query(params![task_id.to_string()])?;
                let mut entries = Vec::new();
                while let Some(row) = rows.next()? {
                    let body: String = row.get(0)?;
                    entries.push(from_body(&body)?);
                }
                Ok(entries)
            })
        })
        .await
    }

    async fn insert_metrics(&self, results: &[MetricsResult]) -> Result<(), StoreError> {
        let rows: Result<Vec<(String, String, String)>, StoreError> = results
            .iter()
            .map(|r| Ok((r.id.to_string(), r.task_id.to_string(), to_body(r)?)))
            .collect();
        let rows = rows?;
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "INSERT INTO metrics_results (id, task_id, body) VALUES (?1, ?2, ?3)\
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                )?;
                for (id, task_id, body) in &rows {
                    stmt.execute(params![id, task_id, body])?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn metrics(&self, task_id: Uuid) -> Result<Vec<MetricsResult>, StoreError> {
        self.blocking(move |store| {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM metrics_results WHERE task_id = ?1 ORDER BY rowid ASC",
                )?;
                let mut rows = stmt.query(params![task_id.to_string()])?;
                let mut results = Vec::new();
                while let Some(row) = rows.next()? {
                    let body: String = row.get(0)?;
                    results.push(from_body(&body)?);
                }
                Ok(results)
            })
        })
        .await
    }
}
