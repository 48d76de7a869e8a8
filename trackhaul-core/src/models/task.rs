use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Converting,
    Tagging,
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Queued,
        TaskStatus::Downloading,
        TaskStatus::Converting,
        TaskStatus::Tagging,
        TaskStatus::Analyzing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Downloading through analyzing: the states that occupy a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Downloading
                | TaskStatus::Converting
                | TaskStatus::Tagging
                | TaskStatus::Analyzing
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }

    fn pipeline_rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Downloading => 1,
            TaskStatus::Converting => 2,
            TaskStatus::Tagging => 3,
            TaskStatus::Analyzing => 4,
            TaskStatus::Completed => 5,
            TaskStatus::Failed | TaskStatus::Cancelled => 6,
        }
    }

    /// Local transition rule: forward along the pipeline, or to failed/cancelled
    /// from any non-terminal state. Leaving a terminal state needs a retry.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TaskStatus::Failed | TaskStatus::Cancelled => true,
            _ => next.pipeline_rank() >= self.pipeline_rank(),
        }
    }

    /// Lenient parse of a backend status string.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "waiting" => Some(TaskStatus::Queued),
            "downloading" | "extracting" => Some(TaskStatus::Downloading),
            "converting" | "processing" => Some(TaskStatus::Converting),
            "tagging" | "metadata" => Some(TaskStatus::Tagging),
            "analyzing" => Some(TaskStatus::Analyzing),
            "completed" | "complete" => Some(TaskStatus::Completed),
            "failed" | "error" => Some(TaskStatus::Failed),
            "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Converting => "converting",
            TaskStatus::Tagging => "tagging",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asks for when adding a track to the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackRequest {
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub destination_path: Option<PathBuf>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: Uuid,
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub destination_path: PathBuf,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub status: TaskStatus,
    pub progress: f64,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub file_size_bytes: Option<u64>,
    pub downloaded_bytes: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub can_cancel: bool,
    pub can_retry: bool,
    pub queue_position: Option<u32>,
    pub result: Option<serde_json::Value>,
    /// The backend already holds this task id.
    pub submitted: bool,
    pub cancel_confirmed: bool,
    #[serde(skip)]
    pub queue_seq: u64,
    /// Registry revision of the last push merge or local command.
    #[serde(skip)]
    pub last_push_rev: u64,
}

impl DownloadTask {
    pub fn new(id: Uuid, request: TrackRequest, destination_path: PathBuf, queue_seq: u64) -> Self {
        Self {
            id,
            source_id: request.source_id,
            url: request.url,
            title: request.title,
            artist: request.artist,
            album: request.album,
            destination_path,
            quality: request.quality,
            format: request.format,
            status: TaskStatus::Queued,
            progress: 0.0,
            stage: None,
            message: None,
            file_size_bytes: None,
            downloaded_bytes: None,
            started_at: None,
            ended_at: None,
            retry_count: 0,
            error: None,
            can_cancel: true,
            can_retry: false,
            queue_position: None,
            result: None,
            submitted: false,
            cancel_confirmed: false,
            queue_seq,
            last_push_rev: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn refresh_flags(&mut self) {
        self.can_cancel = !self.status.is_terminal();
        self.can_retry = self.status.is_retryable();
    }
}
