use trackhaul_core::core::events::EventEmitter;
use trackhaul_core::core::stats::Stats;
use trackhaul_core::models::task::DownloadTask;

/// Emitter for the headless daemon: queue changes go to the log.
#[derive(Clone, Default)]
pub struct LogEmitter;

impl EventEmitter for LogEmitter {
    fn emit_queue_state(&self, _tasks: &[DownloadTask], stats: &Stats) {
        tracing::debug!(
            total = stats.total,
            active = stats.active,
            queued = stats.queued,
            completed = stats.completed,
            failed = stats.failed,
            "queue-state-update"
        );
    }

    fn emit_task_completed(&self, task: &DownloadTask) {
        tracing::info!(
            task_id = %task.id,
            path = %task.destination_path.display(),
            "Saved '{}' by {}",
            task.title,
            task.artist
        );
    }

    fn emit_task_failed(&self, task: &DownloadTask) {
        tracing::warn!(
            task_id = %task.id,
            retries = task.retry_count,
            "'{}' failed: {}",
            task.title,
            task.error.as_deref().unwrap_or("unknown error")
        );
    }
}
