//! Merging backend progress into the registry.
//!
//! Two feeds update the same tasks: push events from the event stream and the
//! periodic queue snapshot. A snapshot only overrides a task when nothing
//! fresher touched it after the snapshot request went out (see
//! [`apply_snapshot`]).

use chrono::Utc;
use trackhaul_core::models::task::{DownloadTask, TaskStatus};
use uuid::Uuid;

use crate::core::backend::{PushEvent, QueueRecord};
use crate::core::queue::DownloadQueue;

/// Status changes the caller has to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed(Uuid),
    Failed(Uuid),
}

pub fn stage_to_status(stage: &str) -> Option<TaskStatus> {
    match stage.trim().to_ascii_lowercase().as_str() {
        "extracting" | "downloading" => Some(TaskStatus::Downloading),
        "converting" | "processing" => Some(TaskStatus::Converting),
        "metadata" | "tagging" => Some(TaskStatus::Tagging),
        "analyzing" => Some(TaskStatus::Analyzing),
        "complete" | "completed" => Some(TaskStatus::Completed),
        "error" | "failed" => Some(TaskStatus::Failed),
        "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
        _ => None,
    }
}

/// Explicit percentage wins; otherwise derive it from byte counts.
pub fn compute_progress(
    percent: Option<f64>,
    downloaded_bytes: Option<u64>,
    total_bytes: Option<u64>,
) -> Option<f64> {
    let raw = match (percent, downloaded_bytes, total_bytes) {
        (Some(p), _, _) if p.is_finite() => p,
        (_, Some(done), Some(total)) if total > 0 => done as f64 / total as f64 * 100.0,
        _ => return None,
    };
    Some(raw.clamp(0.0, 100.0))
}

fn transition(id: Uuid, before: TaskStatus, after: TaskStatus) -> Option<Transition> {
    if before == after {
        return None;
    }
    match after {
        TaskStatus::Completed => Some(Transition::Completed(id)),
        TaskStatus::Failed => Some(Transition::Failed(id)),
        _ => None,
    }
}

fn advance(task: &mut DownloadTask, next: TaskStatus, error: Option<String>) -> bool {
    if !task.status.can_advance_to(next) {
        return false;
    }
    task.status = next;
    match next {
        TaskStatus::Completed => {
            task.progress = 100.0;
            task.ended_at.get_or_insert_with(Utc::now);
        }
        TaskStatus::Failed => {
            task.error = Some(error.unwrap_or_else(|| "download failed".to_string()));
            task.ended_at.get_or_insert_with(Utc::now);
        }
        TaskStatus::Cancelled => {
            task.cancel_confirmed = true;
            task.ended_at.get_or_insert_with(Utc::now);
        }
        _ => {}
    }
    task.refresh_flags();
    true
}

/// Merges one push event. Events for ids the registry does not track are
/// ignored, as are backward moves along the pipeline.
pub fn apply_push_event(queue: &mut DownloadQueue, event: &PushEvent) -> Option<Transition> {
    let Ok(id) = Uuid::parse_str(event.task_id()) else {
        tracing::debug!("Push event for foreign task id '{}'", event.task_id());
        return None;
    };
    queue.find(id)?;
    let rev = queue.bump_revision();
    let slot_free = queue.has_free_slot();
    let task = queue.find_mut(id)?;
    let before = task.status;
    task.submitted = true;
    task.last_push_rev = rev;

    if before.is_terminal() {
        // Only a late cancellation report matters here: it confirms an
        // optimistic local cancel.
        if before == TaskStatus::Cancelled {
            if let PushEvent::Progress(p) = event {
                if p.stage.as_deref().and_then(stage_to_status) == Some(TaskStatus::Cancelled) {
                    task.cancel_confirmed = true;
                }
            }
        }
        return None;
    }

    match event {
        PushEvent::Progress(p) => {
            if let Some(pct) = compute_progress(p.progress, p.downloaded_bytes, p.total_bytes) {
                task.progress = task.progress.max(pct);
            }
            if p.downloaded_bytes.is_some() {
                task.downloaded_bytes = p.downloaded_bytes;
            }
            if p.total_bytes.is_some() {
                task.file_size_bytes = p.total_bytes;
            }
            if p.message.is_some() {
                task.message = p.message.clone();
            }
            if let Some(stage) = &p.stage {
                task.stage = Some(stage.clone());
                if let Some(next) = stage_to_status(stage) {
                    if before == TaskStatus::Queued && next.is_active() && !slot_free {
                        tracing::debug!("Holding {} queued, no free slot for {}", id, next);
                    } else {
                        advance(task, next, p.message.clone());
                    }
                }
            }
        }
        PushEvent::Complete(c) => {
            if c.file_size.is_some() {
                task.file_size_bytes = c.file_size;
            }
            if c.quality.is_some() {
                task.quality = c.quality.clone();
            }
            if c.format.is_some() {
                task.format = c.format.clone();
            }
            if c.result.is_some() {
                task.result = c.result.clone();
            }
            task.stage = Some("completed".to_string());
            advance(task, TaskStatus::Completed, None);
        }
        PushEvent::Error(e) => {
            task.stage = Some("error".to_string());
            advance(task, TaskStatus::Failed, e.error.clone());
        }
    }

    tracing::debug!("Merged push for {}: {} -> {} ({:.1}%)", id, before, task.status, task.progress);
    transition(id, before, task.status)
}

/// Overwrites tracked tasks with the backend snapshot. `epoch` is the registry
/// revision captured before the snapshot was requested; tasks touched after it
/// keep their local state.
pub fn apply_snapshot(
    queue: &mut DownloadQueue,
    records: &[QueueRecord],
    epoch: u64,
) -> Vec<Transition> {
    let mut transitions = Vec::new();
    let mut changed = false;

    for record in records {
        let Ok(id) = Uuid::parse_str(&record.id) else {
            continue;
        };
        let slot_free = queue.has_free_slot();
        let Some(task) = queue.find_mut(id) else {
            continue;
        };
        if task.last_push_rev > epoch {
            tracing::debug!("Keeping fresher state for {} over snapshot", id);
            continue;
        }
        let Some(status) = TaskStatus::parse(&record.status) else {
            tracing::warn!("Snapshot reports unknown status '{}' for {}", record.status, id);
            continue;
        };

        let before = task.status;
        let status = if before == TaskStatus::Queued && status.is_active() && !slot_free {
            tracing::debug!("Snapshot has {} {}, holding it queued until a slot frees", id, status);
            TaskStatus::Queued
        } else {
            status
        };
        task.status = status;
        task.progress = if status == TaskStatus::Completed {
            100.0
        } else {
            record
                .progress
                .filter(|p| p.is_finite())
                .map(|p| p.clamp(0.0, 100.0))
                .unwrap_or(task.progress)
        };
        if record.stage.is_some() {
            task.stage = record.stage.clone();
        }
        if record.message.is_some() {
            task.message = record.message.clone();
        }
        task.error = record.error.clone();
        if let Some(count) = record.retry_count {
            task.retry_count = task.retry_count.max(count);
        }
        task.can_cancel = record.can_cancel.unwrap_or(!status.is_terminal());
        task.can_retry = record.can_retry.unwrap_or(status.is_retryable());
        task.submitted = true;
        if status.is_terminal() {
            task.ended_at.get_or_insert_with(Utc::now);
        } else {
            task.ended_at = None;
        }
        task.cancel_confirmed = status == TaskStatus::Cancelled;

        changed |= before != status;
        if let Some(t) = transition(id, before, status) {
            transitions.push(t);
        }
    }

    if changed {
        queue.bump_revision();
    }
    transitions
}
