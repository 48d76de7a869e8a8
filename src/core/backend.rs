use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::sse::SseFrame;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("request timeout: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("backend rejected {operation}: status \"{status}\"")]
    Rejected { operation: String, status: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub url: String,
    pub title: String,
    pub artist: String,
    pub download_path: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub status: String,
    #[serde(default)]
    pub queue_position: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClearKind {
    Completed,
    Failed,
}

impl ClearKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(ClearKind::Completed),
            "failed" => Some(ClearKind::Failed),
            _ => None,
        }
    }
}

/// One task as the backend reports it in the queue snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub can_cancel: Option<bool>,
    #[serde(default)]
    pub can_retry: Option<bool>,
    #[serde(default)]
    pub retry_count: Option<u32>,
}

/// The snapshot endpoint answers either with a bare list or wrapped in an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum QueueSnapshot {
    List(Vec<QueueRecord>),
    Wrapped {
        #[serde(alias = "tasks", alias = "downloads")]
        queue: Vec<QueueRecord>,
    },
}

impl QueueSnapshot {
    pub fn into_records(self) -> Vec<QueueRecord> {
        match self {
            QueueSnapshot::List(records) => records,
            QueueSnapshot::Wrapped { queue } => queue,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub downloaded_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteEvent {
    pub task_id: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub task_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Progress(ProgressEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),
}

impl PushEvent {
    pub fn task_id(&self) -> &str {
        match self {
            PushEvent::Progress(e) => &e.task_id,
            PushEvent::Complete(e) => &e.task_id,
            PushEvent::Error(e) => &e.task_id,
        }
    }

    /// Decode an event-stream frame. The event name comes from the `event:`
    /// line, or from a `type` field inside the payload when the line is absent.
    pub fn from_frame(frame: &SseFrame) -> Option<PushEvent> {
        let value: serde_json::Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Dropping undecodable push payload: {}", e);
                return None;
            }
        };
        let name = frame
            .event
            .clone()
            .or_else(|| value.get("type").and_then(|t| t.as_str()).map(str::to_string))?;
        let payload = value.get("data").cloned().unwrap_or(value);

        let decoded = match name.as_str() {
            "download_progress" => serde_json::from_value(payload).map(PushEvent::Progress),
            "download_complete" => serde_json::from_value(payload).map(PushEvent::Complete),
            "download_error" => serde_json::from_value(payload).map(PushEvent::Error),
            _ => return None,
        };
        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Dropping malformed '{}' event: {}", name, e);
                None
            }
        }
    }
}

pub type EventStream = BoxStream<'static, Result<PushEvent, BackendError>>;

/// Everything the orchestration layer asks of the download backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResponse, BackendError>;
    async fn cancel(&self, task_id: &str) -> Result<(), BackendError>;
    async fn retry(&self, task_id: &str) -> Result<(), BackendError>;
    async fn clear(&self, kind: ClearKind) -> Result<(), BackendError>;
    async fn update_settings(&self, max_concurrent_downloads: u32) -> Result<(), BackendError>;
    async fn queue_status(&self) -> Result<Vec<QueueRecord>, BackendError>;
    async fn health(&self) -> Result<HealthReport, BackendError>;
    async fn open_event_stream(&self) -> Result<EventStream, BackendError>;
}

/// Builds fresh backend clients; the reconnect strategy tears the old one down
/// and asks for a new one.
pub trait BackendConnector: Send + Sync {
    fn connect(&self) -> anyhow::Result<Arc<dyn BackendClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: Option<&str>, data: &str) -> SseFrame {
        SseFrame {
            event: event.map(str::to_string),
            data: data.to_string(),
            id: None,
        }
    }

    #[test]
    fn progress_frame_with_byte_counts() {
        let ev = PushEvent::from_frame(&frame(
            Some("download_progress"),
            r#"{"taskId":"t1","stage":"downloading","downloadedBytes":50,"totalBytes":200}"#,
        ))
        .unwrap();
        match ev {
            PushEvent::Progress(p) => {
                assert_eq!(p.task_id, "t1");
                assert_eq!(p.downloaded_bytes, Some(50));
                assert_eq!(p.total_bytes, Some(200));
                assert_eq!(p.progress, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn type_field_used_when_event_line_missing() {
        let ev = PushEvent::from_frame(&frame(
            None,
            r#"{"type":"download_error","data":{"taskId":"t2","error":"HTTP 403"}}"#,
        ))
        .unwrap();
        assert_eq!(
            ev,
            PushEvent::Error(ErrorEvent {
                task_id: "t2".into(),
                error: Some("HTTP 403".into()),
            })
        );
    }

    #[test]
    fn unknown_and_malformed_frames_are_dropped() {
        assert!(PushEvent::from_frame(&frame(Some("heartbeat"), "{}")).is_none());
        assert!(PushEvent::from_frame(&frame(Some("download_complete"), "not json")).is_none());
        assert!(PushEvent::from_frame(&frame(Some("download_complete"), r#"{"fileSize":1}"#)).is_none());
    }

    #[test]
    fn snapshot_accepts_list_and_wrapped_forms() {
        let list: QueueSnapshot =
            serde_json::from_str(r#"[{"id":"a","status":"queued"}]"#).unwrap();
        assert_eq!(list.into_records().len(), 1);

        let wrapped: QueueSnapshot = serde_json::from_str(
            r#"{"queue":[{"id":"a","status":"failed","error":"boom","canRetry":true,"retryCount":2}]}"#,
        )
        .unwrap();
        let records = wrapped.into_records();
        assert_eq!(records[0].retry_count, Some(2));
        assert_eq!(records[0].can_retry, Some(true));
    }

    #[test]
    fn enqueue_request_uses_camel_case() {
        let req = EnqueueRequest {
            url: "https://example.com/t".into(),
            title: "T".into(),
            artist: "A".into(),
            download_path: "/music/A - T.mp3".into(),
            task_id: "id-1".into(),
            quality: Some("320".into()),
            format: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["downloadPath"], "/music/A - T.mp3");
        assert_eq!(json["taskId"], "id-1");
        assert!(json.get("format").is_none());
    }
}
