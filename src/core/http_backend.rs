use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use trackhaul_core::models::settings::{BackendSettings, ProxySettings};
use url::Url;

use crate::core::backend::{
    AckResponse, BackendClient, BackendConnector, BackendError, ClearKind, EnqueueRequest,
    EnqueueResponse, EventStream, HealthReport, PushEvent, QueueRecord, QueueSnapshot,
};
use crate::core::http_client;
use crate::core::sse::SseDecoder;

fn classify(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else if err.is_connect() {
        BackendError::Connection(err.to_string())
    } else if err.is_decode() {
        BackendError::Decode(err.to_string())
    } else {
        BackendError::Transport(err.to_string())
    }
}

/// Id of the last event seen on the stream, kept across reconnects.
pub type ResumeId = Arc<Mutex<Option<String>>>;

/// REST + event-stream client for the download backend.
pub struct HttpBackend {
    base: Url,
    client: reqwest::Client,
    stream_client: reqwest::Client,
    last_event_id: ResumeId,
}

impl HttpBackend {
    pub fn new(backend: &BackendSettings, proxy: &ProxySettings) -> anyhow::Result<Self> {
        let mut base = Url::parse(&backend.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let timeout = Duration::from_millis(backend.request_timeout_ms);
        Ok(Self {
            base,
            client: http_client::build_client(backend, proxy, Some(timeout))?,
            stream_client: http_client::build_client(backend, proxy, None)?,
            last_event_id: ResumeId::default(),
        })
    }

    /// Shares the resume position with clients built earlier.
    pub fn with_last_event_id(mut self, last_event_id: ResumeId) -> Self {
        self.last_event_id = last_event_id;
        self
    }

    fn resume_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::Transport(format!("bad endpoint {}: {}", path, e)))
    }

    async fn read_json<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, BackendError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<R>().await.map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, BackendError> {
        let resp = self
            .client
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await
            .map_err(classify)?;
        Self::read_json(resp).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, BackendError> {
        let resp = self
            .client
            .get(self.endpoint(path)?)
            .send()
            .await
            .map_err(classify)?;
        Self::read_json(resp).await
    }

    async fn post_ack<B: Serialize + ?Sized>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> Result<(), BackendError> {
        let ack: AckResponse = self.post(path, body).await?;
        if ack.status != "success" {
            return Err(BackendError::Rejected {
                operation: operation.to_string(),
                status: ack.message.unwrap_or(ack.status),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResponse, BackendError> {
        let resp: EnqueueResponse = self.post("api/downloads/enqueue", request).await?;
        match resp.status.as_str() {
            "queued" | "success" => Ok(resp),
            other => Err(BackendError::Rejected {
                operation: "enqueue".into(),
                status: other.to_string(),
            }),
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<(), BackendError> {
        self.post_ack("cancel", "api/downloads/cancel", &json!({ "taskId": task_id }))
            .await
    }

    async fn retry(&self, task_id: &str) -> Result<(), BackendError> {
        self.post_ack("retry", "api/downloads/retry", &json!({ "taskId": task_id }))
            .await
    }

    async fn clear(&self, kind: ClearKind) -> Result<(), BackendError> {
        self.post_ack("clear", "api/downloads/clear", &json!({ "type": kind }))
            .await
    }

    async fn update_settings(&self, max_concurrent_downloads: u32) -> Result<(), BackendError> {
        self.post_ack(
            "settings",
            "api/downloads/settings",
            &json!({ "maxConcurrentDownloads": max_concurrent_downloads }),
        )
        .await
    }

    async fn queue_status(&self) -> Result<Vec<QueueRecord>, BackendError> {
        let snapshot: QueueSnapshot = self.get("api/downloads/queue").await?;
        Ok(snapshot.into_records())
    }

    async fn health(&self) -> Result<HealthReport, BackendError> {
        self.get("api/health").await
    }

    async fn open_event_stream(&self) -> Result<EventStream, BackendError> {
        let mut request = self
            .stream_client
            .get(self.endpoint("api/events")?)
            .header(ACCEPT, "text/event-stream");
        if let Some(id) = self.resume_id() {
            tracing::debug!("Resuming event stream after {}", id);
            request = request.header("Last-Event-ID", id);
        }
        let resp = request
            .send()
            .await
            .map_err(classify)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Http {
                status: status.as_u16(),
                body: "event stream refused".into(),
            });
        }

        let mut decoder = SseDecoder::new();
        let resume = Arc::clone(&self.last_event_id);
        let events = resp
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => {
                    let frames = decoder.feed(&bytes);
                    if let Some(id) = decoder.last_event_id() {
                        *resume.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
                    }
                    frames
                        .iter()
                        .filter_map(PushEvent::from_frame)
                        .map(Ok)
                        .collect::<Vec<_>>()
                }
                Err(e) => vec![Err(classify(e))],
            })
            .flat_map(futures::stream::iter);
        Ok(events.boxed())
    }
}

/// Builds [`HttpBackend`] instances from the current settings. Every client
/// it builds resumes the event stream where the previous one stopped.
pub struct HttpConnector {
    backend: BackendSettings,
    proxy: ProxySettings,
    last_event_id: ResumeId,
}

impl HttpConnector {
    pub fn new(backend: BackendSettings, proxy: ProxySettings) -> Self {
        Self {
            backend,
            proxy,
            last_event_id: ResumeId::default(),
        }
    }
}

impl BackendConnector for HttpConnector {
    fn connect(&self) -> anyhow::Result<Arc<dyn BackendClient>> {
        let client = HttpBackend::new(&self.backend, &self.proxy)?
            .with_last_event_id(Arc::clone(&self.last_event_id));
        tracing::debug!("Backend client created for {}", self.backend.base_url);
        Ok(Arc::new(client))
    }
}
