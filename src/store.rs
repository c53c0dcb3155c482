//! SQLite persistence for executions, steps, and artifacts.
//!
//! A single long-lived connection is shared behind a mutex; all access from
//! async context goes through [`StoreHandle::call`], which runs the closure
//! on tokio's blocking pool so synchronous SQLite I/O never ties up async
//! worker threads. Batch writers inside dedicated tasks may use
//! [`StoreHandle::lock_sync`] for brief writes.
//!
//! Logs are not stored in the database; they live on disk (see `files.rs`).

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::warn;

use crate::errors::StoreError;
use crate::models::{Artifact, ArtifactType, Execution, ExecutionStatus, Step, StepStatus};

/// Message set on executions and steps that were live when the server died.
pub const INTERRUPTED_MESSAGE: &str = "server restarted during execution";

/// Async-safe handle to the store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with store access on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Store) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| StoreError::Unavailable)?;
            f(&guard)
        })
        .await
        .map_err(|_| StoreError::Unavailable)?
    }

    /// Acquire the store mutex synchronously. For batch flushing inside
    /// dedicated tasks and tests; never call on a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable)
    }
}

pub struct Store {
    conn: Connection,
}

/// Filters for listing executions. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<ExecutionStatus>,
    pub user: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregate counters for the statistics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatistics {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub average_duration_seconds: Option<f64>,
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub wal_checkpointed: bool,
    pub analyzed: bool,
    pub integrity: String,
}

impl Store {
    /// Open (or create) the database and prepare it. Idempotent.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        // WAL so dashboard reads are never blocked behind engine writes;
        // NORMAL sync trades the last few hundred ms of writes on crash
        // for throughput, torn pages are still impossible under WAL.
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -10240;
             PRAGMA mmap_size = 268435456;
             PRAGMA busy_timeout = 5000;",
        )?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                command TEXT NOT NULL,
                working_directory TEXT NOT NULL DEFAULT '.',
                status TEXT NOT NULL DEFAULT 'pending',
                exit_code INTEGER,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                environment TEXT NOT NULL DEFAULT '{}',
                user_name TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                total_steps INTEGER NOT NULL DEFAULT 0,
                completed_steps INTEGER NOT NULL DEFAULT 0,
                current_step_index INTEGER NOT NULL DEFAULT -1,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                step_index INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                exit_code INTEGER,
                error_message TEXT,
                stop_on_error INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                estimated_duration REAL,
                metadata TEXT NOT NULL DEFAULT '{}',
                UNIQUE(execution_id, step_index)
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                step_id TEXT REFERENCES steps(id) ON DELETE SET NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                file_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                mime_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                artifact_type TEXT NOT NULL DEFAULT 'other',
                created_at TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                retention_days INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_executions_created_at
                ON executions(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_executions_status
                ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_executions_user
                ON executions(user_name);
            CREATE INDEX IF NOT EXISTS idx_steps_execution
                ON steps(execution_id, step_index);
            CREATE INDEX IF NOT EXISTS idx_artifacts_execution
                ON artifacts(execution_id);
            ",
        )?;
        Ok(())
    }

    // ── Executions ────────────────────────────────────────────────────

    /// Upsert by id.
    pub fn save_execution(&self, e: &Execution) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO executions (
                    id, name, command, working_directory, status, exit_code, error_message,
                    created_at, started_at, completed_at, environment, user_name, tags,
                    total_steps, completed_steps, current_step_index, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    e.id,
                    e.name,
                    e.command,
                    e.working_directory,
                    e.status.as_str(),
                    e.exit_code,
                    e.error_message,
                    to_ts(&e.created_at),
                    e.started_at.as_ref().map(to_ts),
                    e.completed_at.as_ref().map(to_ts),
                    serde_json::to_string(&e.environment).unwrap_or_else(|_| "{}".into()),
                    e.user,
                    serde_json::to_string(&e.tags).unwrap_or_else(|_| "[]".into()),
                    e.total_steps,
                    e.completed_steps,
                    e.current_step_index,
                    serde_json::to_string(&e.metadata).unwrap_or_else(|_| "{}".into()),
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    /// Upsert several executions in one transaction.
    pub fn save_execution_batch(&self, executions: &[Execution]) -> Result<(), StoreError> {
        // Safety: the handle's mutex already guarantees single-threaded access.
        let tx = self.conn.unchecked_transaction()?;
        for e in executions {
            self.save_execution(e)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> Result<Execution, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, command, working_directory, status, exit_code, error_message,
                    created_at, started_at, completed_at, environment, user_name, tags,
                    total_steps, completed_steps, current_step_index, metadata
             FROM executions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], execution_row)?;
        match rows.next() {
            Some(row) => row?.into_execution(),
            None => Err(StoreError::not_found("execution", id)),
        }
    }

    pub fn list_executions(&self, filter: &ListFilter) -> Result<Vec<Execution>, StoreError> {
        let mut query = String::from(
            "SELECT id, name, command, working_directory, status, exit_code, error_message,
                    created_at, started_at, completed_at, environment, user_name, tags,
                    total_steps, completed_steps, current_step_index, metadata
             FROM executions WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(user) = &filter.user {
            query.push_str(" AND user_name = ?");
            args.push(Box::new(user.clone()));
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        args.push(Box::new(if filter.limit > 0 { filter.limit } else { 50 }));
        args.push(Box::new(filter.offset.max(0)));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            execution_row,
        )?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row?.into_execution()?);
        }
        Ok(executions)
    }

    /// Executions currently in a non-terminal state.
    pub fn list_active(&self) -> Result<Vec<Execution>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, command, working_directory, status, exit_code, error_message,
                    created_at, started_at, completed_at, environment, user_name, tags,
                    total_steps, completed_steps, current_step_index, metadata
             FROM executions WHERE status IN ('pending', 'running')
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], execution_row)?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row?.into_execution()?);
        }
        Ok(executions)
    }

    pub fn get_statistics(&self) -> Result<ExecutionStatistics, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }

        let average_duration_seconds: Option<f64> = self.conn.query_row(
            "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400.0)
             FROM executions
             WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let get = |k: &str| counts.get(k).copied().unwrap_or(0);
        Ok(ExecutionStatistics {
            total: counts.values().sum(),
            pending: get("pending"),
            running: get("running"),
            completed: get("completed"),
            failed: get("failed"),
            cancelled: get("cancelled"),
            average_duration_seconds,
        })
    }

    /// Cascade-delete an execution and its steps/artifacts in one
    /// transaction. On-disk files are the caller's problem (removed by the
    /// background sweep after this commits).
    pub fn delete_execution(&self, id: &str) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM artifacts WHERE execution_id = ?1", params![id])?;
        tx.execute("DELETE FROM steps WHERE execution_id = ?1", params![id])?;
        let count = tx.execute("DELETE FROM executions WHERE id = ?1", params![id])?;
        tx.commit()?;
        if count == 0 {
            return Err(StoreError::not_found("execution", id));
        }
        Ok(())
    }

    /// Boot recovery: executions left non-terminal by a crash become failed.
    /// Returns the affected execution ids. Idempotent; a second call finds
    /// nothing.
    pub fn mark_interrupted(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM executions WHERE status IN ('pending', 'running')")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        if ids.is_empty() {
            return Ok(ids);
        }

        let now = to_ts(&Utc::now());
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE steps SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE status IN ('pending', 'running')
               AND execution_id IN (SELECT id FROM executions WHERE status IN ('pending', 'running'))",
            params![INTERRUPTED_MESSAGE, now],
        )?;
        tx.execute(
            "UPDATE executions SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE status IN ('pending', 'running')",
            params![INTERRUPTED_MESSAGE, now],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    // ── Steps ─────────────────────────────────────────────────────────

    pub fn save_step(&self, s: &Step) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO steps (
                    id, execution_id, step_index, name, description, status, exit_code,
                    error_message, stop_on_error, created_at, started_at, completed_at,
                    estimated_duration, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    s.id,
                    s.execution_id,
                    s.index,
                    s.name,
                    s.description,
                    s.status.as_str(),
                    s.exit_code,
                    s.error_message,
                    s.stop_on_error as i64,
                    to_ts(&s.created_at),
                    s.started_at.as_ref().map(to_ts),
                    s.completed_at.as_ref().map(to_ts),
                    s.estimated_duration,
                    serde_json::to_string(&s.metadata).unwrap_or_else(|_| "{}".into()),
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn get_steps(&self, execution_id: &str) -> Result<Vec<Step>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, execution_id, step_index, name, description, status, exit_code,
                    error_message, stop_on_error, created_at, started_at, completed_at,
                    estimated_duration, metadata
             FROM steps WHERE execution_id = ?1 ORDER BY step_index",
        )?;
        let rows = stmt.query_map(params![execution_id], step_row)?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?.into_step()?);
        }
        Ok(steps)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn save_artifact(&self, a: &Artifact) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO artifacts (
                    id, execution_id, step_id, name, description, file_path, file_name,
                    file_size, mime_type, artifact_type, created_at, tags, retention_days,
                    metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    a.id,
                    a.execution_id,
                    a.step_id,
                    a.name,
                    a.description,
                    a.file_path,
                    a.file_name,
                    a.file_size,
                    a.mime_type,
                    a.artifact_type.as_str(),
                    to_ts(&a.created_at),
                    serde_json::to_string(&a.tags).unwrap_or_else(|_| "[]".into()),
                    a.retention_days,
                    serde_json::to_string(&a.metadata).unwrap_or_else(|_| "{}".into()),
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn get_artifact(&self, id: &str) -> Result<Artifact, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, execution_id, step_id, name, description, file_path, file_name,
                    file_size, mime_type, artifact_type, created_at, tags, retention_days,
                    metadata
             FROM artifacts WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], artifact_row)?;
        match rows.next() {
            Some(row) => row?.into_artifact(),
            None => Err(StoreError::not_found("artifact", id)),
        }
    }

    pub fn get_artifacts(&self, execution_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, execution_id, step_id, name, description, file_path, file_name,
                    file_size, mime_type, artifact_type, created_at, tags, retention_days,
                    metadata
             FROM artifacts WHERE execution_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![execution_id], artifact_row)?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row?.into_artifact()?);
        }
        Ok(artifacts)
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Checkpoint the WAL, refresh planner statistics, and verify integrity.
    pub fn optimize(&self) -> Result<OptimizeReport, StoreError> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        self.conn.execute_batch("ANALYZE;")?;
        let integrity: String =
            self.conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(OptimizeReport {
            wal_checkpointed: true,
            analyzed: true,
            integrity,
        })
    }

    /// Flush outstanding WAL frames before shutdown. The connection itself
    /// closes on drop.
    pub fn close(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Cheap liveness probe for health checks.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

fn map_sqlite(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Conflict(e.to_string());
        }
    }
    StoreError::Sqlite(e)
}

// ── Row structs ───────────────────────────────────────────────────────

struct ExecutionRow {
    id: String,
    name: String,
    command: String,
    working_directory: String,
    status: String,
    exit_code: Option<i32>,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    environment: String,
    user_name: Option<String>,
    tags: String,
    total_steps: i64,
    completed_steps: i64,
    current_step_index: i64,
    metadata: String,
}

fn execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        working_directory: row.get(3)?,
        status: row.get(4)?,
        exit_code: row.get(5)?,
        error_message: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        environment: row.get(10)?,
        user_name: row.get(11)?,
        tags: row.get(12)?,
        total_steps: row.get(13)?,
        completed_steps: row.get(14)?,
        current_step_index: row.get(15)?,
        metadata: row.get(16)?,
    })
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution, StoreError> {
        let status = ExecutionStatus::from_str(&self.status).map_err(StoreError::Corrupt)?;
        Ok(Execution {
            id: self.id,
            name: self.name,
            command: self.command,
            working_directory: self.working_directory,
            status,
            exit_code: self.exit_code,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            environment: serde_json::from_str(&self.environment).unwrap_or_default(),
            user: self.user_name,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            total_steps: self.total_steps,
            completed_steps: self.completed_steps,
            current_step_index: self.current_step_index,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
        })
    }
}

struct StepRow {
    id: String,
    execution_id: String,
    step_index: i64,
    name: String,
    description: String,
    status: String,
    exit_code: Option<i32>,
    error_message: Option<String>,
    stop_on_error: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    estimated_duration: Option<f64>,
    metadata: String,
}

fn step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        step_index: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        status: row.get(5)?,
        exit_code: row.get(6)?,
        error_message: row.get(7)?,
        stop_on_error: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        estimated_duration: row.get(12)?,
        metadata: row.get(13)?,
    })
}

impl StepRow {
    fn into_step(self) -> Result<Step, StoreError> {
        let status = StepStatus::from_str(&self.status).map_err(StoreError::Corrupt)?;
        Ok(Step {
            id: self.id,
            execution_id: self.execution_id,
            index: self.step_index,
            name: self.name,
            description: self.description,
            status,
            exit_code: self.exit_code,
            error_message: self.error_message,
            stop_on_error: self.stop_on_error != 0,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            estimated_duration: self.estimated_duration,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
            logs: Vec::new(),
        })
    }
}

struct ArtifactRow {
    id: String,
    execution_id: String,
    step_id: Option<String>,
    name: String,
    description: String,
    file_path: String,
    file_name: String,
    file_size: i64,
    mime_type: String,
    artifact_type: String,
    created_at: String,
    tags: String,
    retention_days: Option<i64>,
    metadata: String,
}

fn artifact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        step_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        file_path: row.get(5)?,
        file_name: row.get(6)?,
        file_size: row.get(7)?,
        mime_type: row.get(8)?,
        artifact_type: row.get(9)?,
        created_at: row.get(10)?,
        tags: row.get(11)?,
        retention_days: row.get(12)?,
        metadata: row.get(13)?,
    })
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<Artifact, StoreError> {
        let artifact_type =
            ArtifactType::from_str(&self.artifact_type).map_err(StoreError::Corrupt)?;
        let file_path = self.file_path;
        let missing = !file_path.is_empty() && !Path::new(&file_path).exists();
        if missing {
            warn!(artifact_id = %self.id, path = %file_path, "artifact file missing on disk");
        }
        Ok(Artifact {
            id: self.id,
            execution_id: self.execution_id,
            step_id: self.step_id,
            name: self.name,
            description: self.description,
            file_path,
            file_name: self.file_name,
            file_size: self.file_size,
            mime_type: self.mime_type,
            artifact_type,
            created_at: parse_ts(&self.created_at)?,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
            retention_days: self.retention_days,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_execution() -> Execution {
        let mut e = Execution::new("sample", "sh -c 'echo hi'");
        e.user = Some("tester".to_string());
        e.tags = vec!["ci".to_string(), "smoke".to_string()];
        e.environment
            .insert("KEY".to_string(), "value".to_string());
        e.metadata
            .insert("build".to_string(), serde_json::json!(7));
        e
    }

    #[test]
    fn test_save_and_get_execution_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut e = sample_execution();
        e.status = ExecutionStatus::Running;
        e.started_at = Some(Utc::now());
        store.save_execution(&e).unwrap();

        let loaded = store.get_execution(&e.id).unwrap();
        assert_eq!(loaded.id, e.id);
        assert_eq!(loaded.name, e.name);
        assert_eq!(loaded.command, e.command);
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.user.as_deref(), Some("tester"));
        assert_eq!(loaded.tags, e.tags);
        assert_eq!(loaded.environment, e.environment);
        assert_eq!(loaded.metadata["build"], 7);
        assert_eq!(loaded.current_step_index, -1);
    }

    #[test]
    fn test_save_is_upsert() {
        let store = Store::open_in_memory().unwrap();
        let mut e = sample_execution();
        store.save_execution(&e).unwrap();
        e.status = ExecutionStatus::Completed;
        e.exit_code = Some(0);
        store.save_execution(&e).unwrap();

        let loaded = store.get_execution(&e.id).unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.exit_code, Some(0));

        let filter = ListFilter {
            limit: 10,
            ..Default::default()
        };
        assert_eq!(store.list_executions(&filter).unwrap().len(), 1);
    }

    #[test]
    fn test_get_missing_execution_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        match store.get_execution("nope") {
            Err(StoreError::NotFound { kind, .. }) => assert_eq!(kind, "execution"),
            other => panic!("Expected NotFound, got {:?}", other.map(|e| e.id)),
        }
    }

    #[test]
    fn test_list_filters_by_status_and_user() {
        let store = Store::open_in_memory().unwrap();
        let mut a = sample_execution();
        a.status = ExecutionStatus::Completed;
        store.save_execution(&a).unwrap();
        let mut b = sample_execution();
        b.id = uuid::Uuid::new_v4().to_string();
        b.status = ExecutionStatus::Failed;
        b.user = Some("other".to_string());
        store.save_execution(&b).unwrap();

        let completed = store
            .list_executions(&ListFilter {
                status: Some(ExecutionStatus::Completed),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, a.id);

        let by_user = store
            .list_executions(&ListFilter {
                user: Some("other".to_string()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].id, b.id);
    }

    #[test]
    fn test_list_newest_first_with_pagination() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            let mut e = sample_execution();
            e.id = format!("exec-{}", i);
            e.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.save_execution(&e).unwrap();
        }
        let page = store
            .list_executions(&ListFilter {
                limit: 2,
                offset: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "exec-3");
        assert_eq!(page[1].id, "exec-2");
    }

    #[test]
    fn test_step_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let e = sample_execution();
        store.save_execution(&e).unwrap();

        let mut s = Step::new(&e.id, 0, "build");
        s.status = StepStatus::Completed;
        s.stop_on_error = false;
        s.estimated_duration = Some(12.5);
        s.metadata
            .insert("urgency".to_string(), serde_json::json!("high"));
        store.save_step(&s).unwrap();

        let steps = store.get_steps(&e.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "build");
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert!(!steps[0].stop_on_error);
        assert_eq!(steps[0].estimated_duration, Some(12.5));
        assert_eq!(steps[0].metadata["urgency"], "high");
    }

    #[test]
    fn test_steps_ordered_by_index() {
        let store = Store::open_in_memory().unwrap();
        let e = sample_execution();
        store.save_execution(&e).unwrap();
        for i in (0..4).rev() {
            store
                .save_step(&Step::new(&e.id, i, format!("s{}", i)))
                .unwrap();
        }
        let steps = store.get_steps(&e.id).unwrap();
        let indexes: Vec<i64> = steps.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_duplicate_step_index_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        let e = sample_execution();
        store.save_execution(&e).unwrap();
        store.save_step(&Step::new(&e.id, 0, "one")).unwrap();
        // Different id, same (execution_id, index): INSERT OR REPLACE keeps
        // the unique index satisfied by replacing the old row.
        store.save_step(&Step::new(&e.id, 0, "two")).unwrap();
        let steps = store.get_steps(&e.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "two");
    }

    #[test]
    fn test_artifact_roundtrip_marks_missing_file() {
        let store = Store::open_in_memory().unwrap();
        let e = sample_execution();
        store.save_execution(&e).unwrap();

        let mut a = Artifact::new(&e.id, None, "report.xml");
        a.file_path = "/definitely/not/there/report.xml".to_string();
        a.file_size = 123;
        a.mime_type = "text/xml".to_string();
        a.artifact_type = ArtifactType::Data;
        store.save_artifact(&a).unwrap();

        let loaded = store.get_artifact(&a.id).unwrap();
        assert_eq!(loaded.file_size, 123);
        assert_eq!(loaded.artifact_type, ArtifactType::Data);
        assert!(loaded.missing);
    }

    #[test]
    fn test_delete_execution_cascades() {
        let store = Store::open_in_memory().unwrap();
        let e = sample_execution();
        store.save_execution(&e).unwrap();
        store.save_step(&Step::new(&e.id, 0, "s")).unwrap();
        store
            .save_artifact(&Artifact::new(&e.id, None, "a.txt"))
            .unwrap();

        store.delete_execution(&e.id).unwrap();
        assert!(matches!(
            store.get_execution(&e.id),
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.get_steps(&e.id).unwrap().is_empty());
        assert!(store.get_artifacts(&e.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_execution_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.delete_execution("ghost"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_mark_interrupted_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let mut running = sample_execution();
        running.status = ExecutionStatus::Running;
        store.save_execution(&running).unwrap();
        let mut step = Step::new(&running.id, 0, "loop");
        step.status = StepStatus::Running;
        store.save_step(&step).unwrap();
        let mut done = sample_execution();
        done.id = uuid::Uuid::new_v4().to_string();
        done.status = ExecutionStatus::Completed;
        store.save_execution(&done).unwrap();

        let first = store.mark_interrupted().unwrap();
        assert_eq!(first, vec![running.id.clone()]);

        let e = store.get_execution(&running.id).unwrap();
        assert_eq!(e.status, ExecutionStatus::Failed);
        assert_eq!(e.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        let steps = store.get_steps(&running.id).unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);

        // Second restart finds nothing left to repair.
        let second = store.mark_interrupted().unwrap();
        assert!(second.is_empty());

        let untouched = store.get_execution(&done.id).unwrap();
        assert_eq!(untouched.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_statistics() {
        let store = Store::open_in_memory().unwrap();
        for (i, status) in [
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Running,
        ]
        .iter()
        .enumerate()
        {
            let mut e = sample_execution();
            e.id = format!("e{}", i);
            e.status = *status;
            if *status == ExecutionStatus::Completed {
                e.started_at = Some(Utc::now() - chrono::Duration::seconds(10));
                e.completed_at = Some(Utc::now());
            }
            store.save_execution(&e).unwrap();
        }

        let stats = store.get_statistics().unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 1);
        let avg = stats.average_duration_seconds.unwrap();
        assert!(avg > 8.0 && avg < 12.0, "avg was {}", avg);
    }

    #[test]
    fn test_batch_save_is_transactional() {
        let store = Store::open_in_memory().unwrap();
        let batch: Vec<Execution> = (0..3)
            .map(|i| {
                let mut e = sample_execution();
                e.id = format!("b{}", i);
                e
            })
            .collect();
        store.save_execution_batch(&batch).unwrap();
        let filter = ListFilter {
            limit: 10,
            ..Default::default()
        };
        assert_eq!(store.list_executions(&filter).unwrap().len(), 3);
    }

    #[test]
    fn test_optimize_reports_ok_integrity() {
        let store = Store::open_in_memory().unwrap();
        store.save_execution(&sample_execution()).unwrap();
        let report = store.optimize().unwrap();
        assert_eq!(report.integrity, "ok");
    }

    #[test]
    fn test_ping() {
        let store = Store::open_in_memory().unwrap();
        store.ping().unwrap();
    }

    #[tokio::test]
    async fn test_handle_call_runs_on_blocking_pool() {
        let handle = StoreHandle::new(Store::open_in_memory().unwrap());
        let e = sample_execution();
        let id = e.id.clone();
        handle
            .call(move |store| store.save_execution(&e))
            .await
            .unwrap();
        let loaded = handle
            .call(move |store| store.get_execution(&id))
            .await
            .unwrap();
        assert_eq!(loaded.name, "sample");
    }

    #[test]
    fn test_timestamps_keep_millisecond_resolution() {
        let store = Store::open_in_memory().unwrap();
        let mut e = sample_execution();
        e.created_at = "2026-03-01T10:20:30.456Z".parse().unwrap();
        store.save_execution(&e).unwrap();
        let loaded = store.get_execution(&e.id).unwrap();
        assert_eq!(loaded.created_at, e.created_at);
    }

    #[test]
    fn test_store_does_not_persist_logs() {
        let store = Store::open_in_memory().unwrap();
        let tables: Vec<String> = {
            let mut stmt = store
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table'")
                .unwrap();
            let rows = stmt.query_map([], |r| r.get::<_, String>(0)).unwrap();
            rows.map(|r| r.unwrap()).collect()
        };
        assert!(!tables.iter().any(|t| t.contains("log")));
    }
}
