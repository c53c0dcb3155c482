use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one execution. Terminal statuses accept no further mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// Coarse classification of a declared artifact, inferred from its extension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Document,
    Image,
    Data,
    Log,
    Archive,
    Other,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Data => "data",
            Self::Log => "log",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }

    /// Classify by file extension (lowercased, without the dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "md" | "txt" | "pdf" | "doc" | "docx" | "html" | "htm" | "rst" => Self::Document,
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "bmp" | "webp" => Self::Image,
            "json" | "xml" | "csv" | "yaml" | "yml" | "toml" | "parquet" | "db" => Self::Data,
            "log" => Self::Log,
            "zip" | "tar" | "gz" | "tgz" | "bz2" | "xz" | "7z" => Self::Archive,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "image" => Ok(Self::Image),
            "data" => Ok(Self::Data),
            "log" => Ok(Self::Log),
            "archive" => Ok(Self::Archive),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid artifact type: {}", s)),
        }
    }
}

/// Which child pipe a log line was read from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One run of one user-supplied command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub name: String,
    pub command: String,
    pub working_directory: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub environment: HashMap<String, String>,
    pub user: Option<String>,
    pub tags: Vec<String>,
    pub total_steps: i64,
    pub completed_steps: i64,
    /// Index of the most recent step that entered `running`, or -1.
    pub current_step_index: i64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Execution {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        let command = command.into();
        let name = {
            let n = name.into();
            if n.is_empty() { command.clone() } else { n }
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            command,
            working_directory: ".".to_string(),
            status: ExecutionStatus::Pending,
            exit_code: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            environment: HashMap::new(),
            user: None,
            tags: Vec::new(),
            total_steps: 0,
            completed_steps: 0,
            current_step_index: -1,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            (Some(start), None) => Some((Utc::now() - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.completed_steps as f64 / self.total_steps as f64) * 100.0
    }
}

/// One logical phase within an execution, bounded by marker lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub execution_id: String,
    pub index: i64,
    pub name: String,
    pub description: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub stop_on_error: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Advisory, from `META:estimated_duration:<seconds>`. Never enforced.
    pub estimated_duration: Option<f64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Hydrated from disk for detail views and snapshots; empty otherwise.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Step {
    pub fn new(execution_id: &str, index: i64, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            index,
            name: name.into(),
            description: String::new(),
            status: StepStatus::Pending,
            exit_code: None,
            error_message: None,
            stop_on_error: true,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration: None,
            metadata: serde_json::Map::new(),
            logs: Vec::new(),
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            (Some(start), None) => Some((Utc::now() - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// A file declared by the running script via an ARTIFACT marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub execution_id: String,
    pub step_id: Option<String>,
    pub name: String,
    pub description: String,
    /// Path inside the artifact tree after ingestion.
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub artifact_type: ArtifactType,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub retention_days: Option<i64>,
    /// True when the stored file can no longer be read.
    #[serde(default)]
    pub missing: bool,
}

impl Artifact {
    pub fn new(execution_id: &str, step_id: Option<String>, file_name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step_id,
            name: file_name.to_string(),
            description: String::new(),
            file_path: String::new(),
            file_name: file_name.to_string(),
            file_size: 0,
            mime_type: "application/octet-stream".to_string(),
            artifact_type: ArtifactType::Other,
            created_at: Utc::now(),
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
            retention_days: None,
            missing: false,
        }
    }

    pub fn download_url(&self) -> String {
        format!("/api/artifacts/{}/download", self.id)
    }
}

/// Severity of a log entry. Child output is `info`; the engine emits
/// `warning` entries for recoverable problems (missing artifact files,
/// escaped paths).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One line of child output, in read order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic per execution; total order equals read order.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: StreamKind,
    pub content: String,
    pub step_id: Option<String>,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    /// Marker role ("step_start", "artifact", ...) when the raw line was a marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

/// An execution with its steps and artifacts embedded, used by the detail
/// endpoint and by `initial_state` snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub steps: Vec<Step>,
    pub artifacts: Vec<Artifact>,
}
