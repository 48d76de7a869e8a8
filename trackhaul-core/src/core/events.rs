use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::stats::Stats;
use crate::models::task::DownloadTask;

/// Observer for queue changes. The manager calls it after every registry
/// mutation and on terminal transitions.
pub trait EventEmitter: Send + Sync + Clone + 'static {
    fn emit_queue_state(&self, tasks: &[DownloadTask], stats: &Stats);
    /// Fired exactly once per task id.
    fn emit_task_completed(&self, task: &DownloadTask);
    fn emit_task_failed(&self, task: &DownloadTask);
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum QueueEvent {
    QueueState { tasks: Vec<DownloadTask>, stats: Stats },
    TaskCompleted(DownloadTask),
    TaskFailed(DownloadTask),
}

/// Publishes queue events on a broadcast channel so any number of
/// subscribers can follow the queue without knowing about the manager.
#[derive(Clone)]
pub struct ChannelEmitter {
    tx: broadcast::Sender<QueueEvent>,
}

impl ChannelEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit_queue_state(&self, tasks: &[DownloadTask], stats: &Stats) {
        self.send(QueueEvent::QueueState {
            tasks: tasks.to_vec(),
            stats: *stats,
        });
    }

    fn emit_task_completed(&self, task: &DownloadTask) {
        self.send(QueueEvent::TaskCompleted(task.clone()));
    }

    fn emit_task_failed(&self, task: &DownloadTask) {
        self.send(QueueEvent::TaskFailed(task.clone()));
    }
}
