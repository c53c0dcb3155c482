//! On-disk storage: step log files, ingested artifact files, and the
//! background delete worker.
//!
//! Layout under the storage root:
//!
//! ```text
//! executions/<execution_id>/step_<index>_<step_id>.log
//! executions/<execution_id>/execution.log        (lines outside any step)
//! artifacts/<execution_id>/<artifact_id>/<filename>
//! ```
//!
//! Log files are UTF-8, one entry per line, prefixed by `[RFC3339] `.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::models::{Artifact, ArtifactType, LogEntry, LogLevel, StreamKind};

#[derive(Debug, Clone)]
pub struct FileStore {
    executions_dir: PathBuf,
    artifacts_dir: PathBuf,
}

impl FileStore {
    pub fn new(executions_dir: PathBuf, artifacts_dir: PathBuf) -> Self {
        Self {
            executions_dir,
            artifacts_dir,
        }
    }

    /// Create the tree roots. Idempotent.
    pub fn init(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.executions_dir)?;
        std::fs::create_dir_all(&self.artifacts_dir)?;
        Ok(())
    }

    pub fn execution_log_dir(&self, execution_id: &str) -> PathBuf {
        self.executions_dir.join(execution_id)
    }

    pub fn step_log_path(&self, execution_id: &str, index: i64, step_id: &str) -> PathBuf {
        self.execution_log_dir(execution_id)
            .join(format!("step_{}_{}.log", index, step_id))
    }

    /// Lines read while no step was running still land in history here.
    pub fn execution_log_path(&self, execution_id: &str) -> PathBuf {
        self.execution_log_dir(execution_id).join("execution.log")
    }

    /// Append formatted lines to a log file. Blocking; called from the
    /// writer task or `spawn_blocking`.
    pub fn append_lines(&self, path: &Path, lines: &[String]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    /// Read the last `limit` entries of a log file (0 = all). Blocking.
    pub fn read_log_tail(
        &self,
        path: &Path,
        step_id: Option<&str>,
        limit: usize,
    ) -> Vec<LogEntry> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
        let start = if limit > 0 && lines.len() > limit {
            lines.len() - limit
        } else {
            0
        };
        lines[start..]
            .iter()
            .enumerate()
            .map(|(i, line)| parse_log_line(line, (start + i) as u64, step_id))
            .collect()
    }

    /// Copy a declared file into the artifact tree and fsync it before
    /// reporting success; a failed copy leaves nothing behind.
    pub async fn ingest_artifact(
        &self,
        artifact: &mut Artifact,
        source: &Path,
    ) -> std::io::Result<()> {
        let dir = self
            .artifacts_dir
            .join(&artifact.execution_id)
            .join(&artifact.id);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(&artifact.file_name);

        let result: std::io::Result<()> = async {
            tokio::fs::copy(source, &target).await?;
            let file = tokio::fs::File::open(&target).await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        artifact.file_path = target.to_string_lossy().to_string();
        Ok(())
    }

    /// Remove all on-disk state for an execution. Blocking; runs on the
    /// delete worker after the database cascade commits.
    pub fn remove_execution_files(&self, execution_id: &str) -> std::io::Result<()> {
        let logs = self.execution_log_dir(execution_id);
        if logs.exists() {
            std::fs::remove_dir_all(&logs)?;
        }
        let artifacts = self.artifacts_dir.join(execution_id);
        if artifacts.exists() {
            std::fs::remove_dir_all(&artifacts)?;
        }
        Ok(())
    }
}

/// Classify + describe a file for artifact registration.
pub fn describe_file(file_name: &str) -> (String, ArtifactType) {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let mime = match ext.as_str() {
        // mime_guess says text/xml; downstream tooling expects the
        // application type.
        "xml" => "application/xml".to_string(),
        _ => mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    };
    (mime, ArtifactType::from_extension(&ext))
}

pub fn format_log_line(timestamp: &DateTime<Utc>, content: &str) -> String {
    format!(
        "[{}] {}",
        timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        content
    )
}

fn parse_log_line(line: &str, seq: u64, step_id: Option<&str>) -> LogEntry {
    let (timestamp, content) = match line
        .strip_prefix('[')
        .and_then(|rest| rest.split_once("] "))
    {
        Some((ts, content)) => match DateTime::parse_from_rfc3339(ts) {
            Ok(dt) => (dt.with_timezone(&Utc), content.to_string()),
            Err(_) => (Utc::now(), line.to_string()),
        },
        None => (Utc::now(), line.to_string()),
    };
    LogEntry {
        seq,
        timestamp,
        stream: StreamKind::Stdout,
        content,
        step_id: step_id.map(str::to_string),
        level: LogLevel::default(),
        truncated: false,
        marker: None,
    }
}

// ── Log writer task ───────────────────────────────────────────────────

/// A write destined for one log file.
#[derive(Debug)]
pub enum LogWrite {
    Line { path: PathBuf, line: String },
    /// Ack once everything received before this point is on disk.
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct LogWriterHandle {
    tx: mpsc::Sender<LogWrite>,
}

impl LogWriterHandle {
    /// Enqueue one formatted line. Blocks when the writer is behind; log
    /// history is never dropped.
    pub async fn write(&self, path: PathBuf, line: String) {
        if self.tx.send(LogWrite::Line { path, line }).await.is_err() {
            error!("log writer is gone; line lost");
        }
    }

    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LogWrite::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Spawn the shared log writer. Batches ready lines per file so a slow
/// filesystem stalls only this task, never the engine's event loop.
pub fn spawn_log_writer(files: Arc<FileStore>) -> LogWriterHandle {
    let (tx, mut rx) = mpsc::channel::<LogWrite>(1024);

    tokio::spawn(async move {
        let mut pending: Vec<LogWrite> = Vec::new();
        loop {
            match rx.recv().await {
                Some(msg) => pending.push(msg),
                None => break,
            }
            // Drain whatever else is ready, up to a batch cap.
            while pending.len() < 256 {
                match rx.try_recv() {
                    Ok(msg) => pending.push(msg),
                    Err(_) => break,
                }
            }
            flush_batch(&files, &mut pending);
        }
        flush_batch(&files, &mut pending);
        debug!("log writer stopped");
    });

    LogWriterHandle { tx }
}

fn flush_batch(files: &FileStore, pending: &mut Vec<LogWrite>) {
    let mut grouped: HashMap<PathBuf, Vec<String>> = HashMap::new();
    let mut acks: Vec<oneshot::Sender<()>> = Vec::new();
    for msg in pending.drain(..) {
        match msg {
            LogWrite::Line { path, line } => grouped.entry(path).or_default().push(line),
            LogWrite::Flush(ack) => acks.push(ack),
        }
    }
    for (path, lines) in grouped {
        if let Err(e) = files.append_lines(&path, &lines) {
            // Retried once; after that the lines are declared lost.
            warn!(path = %path.display(), error = %e, "log append failed, retrying");
            if let Err(e) = files.append_lines(&path, &lines) {
                error!(path = %path.display(), error = %e, lost = lines.len(), "log append failed twice, lines lost");
            }
        }
    }
    for ack in acks {
        let _ = ack.send(());
    }
}

// ── Delete worker ─────────────────────────────────────────────────────

/// Spawn the background worker that removes an execution's files after its
/// database rows are gone.
pub fn spawn_delete_worker(files: Arc<FileStore>) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        while let Some(execution_id) = rx.recv().await {
            let files = files.clone();
            let id = execution_id.clone();
            let result =
                tokio::task::spawn_blocking(move || files.remove_execution_files(&id)).await;
            match result {
                Ok(Ok(())) => debug!(execution_id = %execution_id, "removed on-disk files"),
                Ok(Err(e)) => {
                    warn!(execution_id = %execution_id, error = %e, "failed to remove on-disk files")
                }
                Err(e) => error!(error = %e, "delete worker task panicked"),
            }
        }
    });
    tx
}
