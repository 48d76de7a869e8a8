use serde::Serialize;
use trackhaul_core::core::events::EventEmitter;
use trackhaul_core::core::stats::Stats;
use trackhaul_core::models::task::{DownloadTask, TrackRequest};
use uuid::Uuid;

use crate::core::backend::ClearKind;
use crate::core::queue::QueueError;
use crate::core::recovery::{RecoveryAction, RecoveryStats};
use crate::AppState;

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResult {
    pub task_id: Option<Uuid>,
    pub already_queued: bool,
    pub existing_task_id: Option<Uuid>,
}

fn parse_id(task_id: &str) -> Result<Uuid, String> {
    Uuid::parse_str(task_id.trim()).map_err(|e| format!("Invalid task id '{}': {}", task_id, e))
}

/// Duplicates are not an error for the caller: they get the id of the task
/// that already covers the track.
pub async fn enqueue_download<E: EventEmitter>(
    state: &AppState<E>,
    request: TrackRequest,
) -> Result<EnqueueResult, String> {
    match state.manager.enqueue(request).await {
        Ok(id) => Ok(EnqueueResult {
            task_id: Some(id),
            already_queued: false,
            existing_task_id: None,
        }),
        Err(QueueError::Duplicate { task_id, .. }) => Ok(EnqueueResult {
            task_id: None,
            already_queued: true,
            existing_task_id: Some(task_id),
        }),
        Err(e) => Err(e.to_string()),
    }
}

pub async fn cancel_download<E: EventEmitter>(
    state: &AppState<E>,
    task_id: String,
) -> Result<(), String> {
    let id = parse_id(&task_id)?;
    state.manager.cancel(id).await.map_err(|e| e.to_string())
}

pub async fn retry_download<E: EventEmitter>(
    state: &AppState<E>,
    task_id: String,
) -> Result<DownloadTask, String> {
    let id = parse_id(&task_id)?;
    state.manager.retry(id).await.map_err(|e| e.to_string())
}

pub async fn clear_downloads<E: EventEmitter>(
    state: &AppState<E>,
    kind: String,
) -> Result<usize, String> {
    let kind = ClearKind::parse(&kind)
        .ok_or_else(|| format!("Unknown clear filter '{}', expected completed or failed", kind))?;
    Ok(state.manager.clear(kind).await)
}

pub async fn get_queue_state<E: EventEmitter>(
    state: &AppState<E>,
) -> Result<Vec<DownloadTask>, String> {
    Ok(state.manager.get_state().await)
}

pub async fn get_queue_stats<E: EventEmitter>(state: &AppState<E>) -> Result<Stats, String> {
    Ok(state.manager.stats().await)
}

pub async fn refresh_queue<E: EventEmitter>(state: &AppState<E>) -> Result<usize, String> {
    state.manager.reconcile().await.map_err(|e| e.to_string())
}

pub async fn update_max_concurrent<E: EventEmitter>(
    state: &AppState<E>,
    max: u32,
) -> Result<(), String> {
    state
        .manager
        .set_max_concurrent(max)
        .await
        .map_err(|e| e.to_string())
}

pub fn get_recovery_stats<E: EventEmitter>(state: &AppState<E>) -> Result<RecoveryStats, String> {
    Ok(state.manager.recovery().get_recovery_stats())
}

pub fn get_recovery_history<E: EventEmitter>(
    state: &AppState<E>,
) -> Result<Vec<RecoveryAction>, String> {
    Ok(state.manager.recovery().get_recovery_history())
}

pub fn reset_circuit_breaker<E: EventEmitter>(state: &AppState<E>) -> Result<(), String> {
    state.manager.recovery().reset_circuit_breaker();
    Ok(())
}
