//! In-process backend and observer doubles shared by the async tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use trackhaul_core::core::events::EventEmitter;
use trackhaul_core::core::stats::Stats;
use trackhaul_core::models::task::DownloadTask;
use uuid::Uuid;

use crate::core::backend::{
    BackendClient, BackendConnector, BackendError, ClearKind, EnqueueRequest, EnqueueResponse,
    EventStream, HealthReport, HealthStatus, PushEvent, QueueRecord,
};

pub type EventSender = mpsc::UnboundedSender<Result<PushEvent, BackendError>>;

pub struct MockBackend {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, BackendError>>,
    snapshot: Mutex<Vec<QueueRecord>>,
    health: Mutex<HealthStatus>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<PushEvent, BackendError>>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(Vec::new()),
            health: Mutex::new(HealthStatus::Healthy),
            events: Mutex::new(None),
        })
    }

    /// Every operation fails with `err` until [`MockBackend::heal`].
    pub fn fail_all(&self, err: BackendError) {
        self.failures.lock().unwrap().insert("*".into(), err);
    }

    /// Only `op` (e.g. "enqueue", "health") fails.
    pub fn fail_op(&self, op: &str, err: BackendError) {
        self.failures.lock().unwrap().insert(op.into(), err);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn set_health(&self, status: HealthStatus) {
        *self.health.lock().unwrap() = status;
    }

    pub fn set_snapshot(&self, records: Vec<QueueRecord>) {
        *self.snapshot.lock().unwrap() = records;
    }

    /// Sender side of the next event stream the backend hands out.
    pub fn event_sender(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded();
        *self.events.lock().unwrap() = Some(rx);
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .count()
    }

    fn call(&self, op: &str, arg: &str) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(format!("{op}:{arg}"));
        let failures = self.failures.lock().unwrap();
        match failures.get(op).or_else(|| failures.get("*")) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResponse, BackendError> {
        self.call("enqueue", &request.task_id)?;
        Ok(EnqueueResponse {
            status: "queued".into(),
            queue_position: Some(self.count("enqueue") as u32),
        })
    }

    async fn cancel(&self, task_id: &str) -> Result<(), BackendError> {
        self.call("cancel", task_id)
    }

    async fn retry(&self, task_id: &str) -> Result<(), BackendError> {
        self.call("retry", task_id)
    }

    async fn clear(&self, kind: ClearKind) -> Result<(), BackendError> {
        self.call("clear", &format!("{:?}", kind))
    }

    async fn update_settings(&self, max_concurrent_downloads: u32) -> Result<(), BackendError> {
        self.call("settings", &max_concurrent_downloads.to_string())
    }

    async fn queue_status(&self) -> Result<Vec<QueueRecord>, BackendError> {
        self.call("queue", "")?;
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn health(&self) -> Result<HealthReport, BackendError> {
        self.call("health", "")?;
        Ok(HealthReport {
            status: *self.health.lock().unwrap(),
            details: None,
        })
    }

    async fn open_event_stream(&self) -> Result<EventStream, BackendError> {
        self.call("events", "")?;
        match self.events.lock().unwrap().take() {
            Some(rx) => Ok(rx.boxed()),
            None => Err(BackendError::Connection("no event stream".into())),
        }
    }
}

pub struct MockConnector {
    backend: Arc<MockBackend>,
    pub connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl BackendConnector for MockConnector {
    fn connect(&self) -> anyhow::Result<Arc<dyn BackendClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn BackendClient> = self.backend.clone();
        Ok(client)
    }
}

#[derive(Clone, Default)]
pub struct RecordingEmitter {
    pub completed: Arc<Mutex<Vec<Uuid>>>,
    pub failed: Arc<Mutex<Vec<Uuid>>>,
    pub states: Arc<Mutex<Vec<Stats>>>,
}

impl RecordingEmitter {
    pub fn completed(&self) -> Vec<Uuid> {
        self.completed.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<Uuid> {
        self.failed.lock().unwrap().clone()
    }

    pub fn last_stats(&self) -> Option<Stats> {
        self.states.lock().unwrap().last().copied()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit_queue_state(&self, _tasks: &[DownloadTask], stats: &Stats) {
        self.states.lock().unwrap().push(*stats);
    }

    fn emit_task_completed(&self, task: &DownloadTask) {
        self.completed.lock().unwrap().push(task.id);
    }

    fn emit_task_failed(&self, task: &DownloadTask) {
        self.failed.lock().unwrap().push(task.id);
    }
}
