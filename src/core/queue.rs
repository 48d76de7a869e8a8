use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use trackhaul_core::core::stats::Stats;
use trackhaul_core::models::task::{DownloadTask, TaskStatus, TrackRequest};
use uuid::Uuid;

use crate::core::backend::{BackendError, ClearKind, EnqueueRequest};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("'{source_id}' is already queued as task {task_id}")]
    Duplicate { source_id: String, task_id: Uuid },
    #[error("unknown task {0}")]
    NotFound(Uuid),
    #[error("task {id} cannot be cancelled while {status}")]
    NotCancellable { id: Uuid, status: TaskStatus },
    #[error("task {id} cannot be retried while {status}")]
    NotRetryable { id: Uuid, status: TaskStatus },
    #[error("task {0} is still being handed to the backend")]
    HandOverPending(Uuid),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The task registry. Plain data plus synchronous rules; the manager owns it
/// behind a mutex and does all I/O outside the lock.
pub struct DownloadQueue {
    pub tasks: Vec<DownloadTask>,
    pub max_concurrent: u32,
    revision: u64,
    next_seq: u64,
    completion_notified: HashSet<Uuid>,
    handing_over: HashSet<Uuid>,
    progress_throttle: ProgressThrottle,
}

/// What admission asks of the caller for a task that just got a slot.
#[derive(Debug)]
pub enum Admission {
    /// First hand-over: send this request to the backend.
    Submit(EnqueueRequest),
    /// The backend already holds the task from before a retry.
    Resume,
}

impl DownloadQueue {
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            tasks: Vec::new(),
            max_concurrent: max_concurrent.max(1),
            revision: 0,
            next_seq: 0,
            completion_notified: HashSet::new(),
            handing_over: HashSet::new(),
            progress_throttle: ProgressThrottle::new(PROGRESS_EMIT_INTERVAL_MS),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn find(&self, id: Uuid) -> Option<&DownloadTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_mut(&mut self, id: Uuid) -> Option<&mut DownloadTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn in_flight_for_source(&self, source_id: &str) -> Option<Uuid> {
        self.tasks
            .iter()
            .find(|t| t.source_id == source_id && !t.is_terminal())
            .map(|t| t.id)
    }

    pub fn enqueue(
        &mut self,
        request: TrackRequest,
        destination_path: PathBuf,
    ) -> Result<Uuid, QueueError> {
        validate(&request)?;
        if let Some(existing) = self.in_flight_for_source(&request.source_id) {
            return Err(QueueError::Duplicate {
                source_id: request.source_id,
                task_id: existing,
            });
        }
        let id = Uuid::new_v4();
        let seq = self.next_seq();
        self.tasks
            .push(DownloadTask::new(id, request, destination_path, seq));
        self.bump_revision();
        Ok(id)
    }

    pub fn active_count(&self) -> u32 {
        self.tasks.iter().filter(|t| t.status.is_active()).count() as u32
    }

    pub fn has_free_slot(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    /// Queued tasks, oldest first, limited to the free slots. Retried tasks
    /// the backend already holds take their turn like any other.
    pub fn next_queued_ids(&self) -> Vec<Uuid> {
        let slots = self.max_concurrent.saturating_sub(self.active_count()) as usize;
        if slots == 0 {
            return Vec::new();
        }
        let mut waiting: Vec<&DownloadTask> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && !self.handing_over.contains(&t.id))
            .collect();
        waiting.sort_by_key(|t| t.queue_seq);
        waiting.into_iter().take(slots).map(|t| t.id).collect()
    }

    /// Claims a concurrency slot for the task. A task the backend has not
    /// seen yet is recorded as being handed over until
    /// [`finish_hand_over`](Self::finish_hand_over).
    pub fn mark_admitted(&mut self, id: Uuid) -> Option<Admission> {
        if self.handing_over.contains(&id) {
            return None;
        }
        let task = self.find_mut(id)?;
        if task.status != TaskStatus::Queued {
            return None;
        }
        task.status = TaskStatus::Downloading;
        task.started_at.get_or_insert_with(Utc::now);
        task.refresh_flags();
        if task.submitted {
            self.bump_revision();
            return Some(Admission::Resume);
        }
        let request = EnqueueRequest {
            url: task.url.clone(),
            title: task.title.clone(),
            artist: task.artist.clone(),
            download_path: task.destination_path.to_string_lossy().to_string(),
            task_id: task.id.to_string(),
            quality: task.quality.clone(),
            format: task.format.clone(),
        };
        self.handing_over.insert(id);
        self.bump_revision();
        Some(Admission::Submit(request))
    }

    pub fn is_handing_over(&self, id: Uuid) -> bool {
        self.handing_over.contains(&id)
    }

    /// The backend answered the enqueue call for `id`, either way.
    pub fn finish_hand_over(&mut self, id: Uuid) {
        self.handing_over.remove(&id);
    }

    pub fn mark_submitted(&mut self, id: Uuid, queue_position: Option<u32>) -> bool {
        let Some(task) = self.find_mut(id) else {
            return false;
        };
        task.submitted = true;
        task.queue_position = queue_position;
        self.bump_revision();
        true
    }

    /// Moves a live task to `failed`. Terminal tasks are left alone.
    pub fn mark_failed(&mut self, id: Uuid, error: impl Into<String>) -> bool {
        let Some(task) = self.find_mut(id) else {
            return false;
        };
        if !task.status.can_advance_to(TaskStatus::Failed) {
            return false;
        }
        task.status = TaskStatus::Failed;
        task.error = Some(error.into());
        task.ended_at.get_or_insert_with(Utc::now);
        task.refresh_flags();
        self.bump_revision();
        true
    }

    /// `confirmed` is false when the backend has been asked but has not yet
    /// reported the cancellation itself.
    pub fn mark_cancelled(&mut self, id: Uuid, confirmed: bool) -> bool {
        let Some(task) = self.find_mut(id) else {
            return false;
        };
        if !task.status.can_advance_to(TaskStatus::Cancelled) {
            return false;
        }
        task.status = TaskStatus::Cancelled;
        task.cancel_confirmed = confirmed;
        task.ended_at.get_or_insert_with(Utc::now);
        task.refresh_flags();
        self.touch(id);
        true
    }

    /// Records a local command on the task so that a snapshot requested
    /// before it cannot roll it back.
    pub fn touch(&mut self, id: Uuid) {
        let rev = self.bump_revision();
        if let Some(task) = self.find_mut(id) {
            task.last_push_rev = rev;
        }
    }

    /// Removes terminal tasks of the given kind. `Failed` also takes
    /// cancelled tasks.
    pub fn clear(&mut self, kind: ClearKind) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|t| match kind {
            ClearKind::Completed => t.status != TaskStatus::Completed,
            ClearKind::Failed => !matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled),
        });
        let removed = before - self.tasks.len();
        if removed > 0 {
            self.bump_revision();
        }
        removed
    }

    /// True the first time it is called for a completed task id.
    pub fn take_completion_notice(&mut self, id: Uuid) -> bool {
        match self.find(id) {
            Some(t) if t.status == TaskStatus::Completed => self.completion_notified.insert(id),
            _ => false,
        }
    }

    /// Rate limit for publishing plain progress updates. Status changes are
    /// always published.
    pub fn should_publish_progress(&mut self) -> bool {
        self.progress_throttle.should_emit()
    }

    pub fn get_state(&self) -> Vec<DownloadTask> {
        self.tasks.clone()
    }

    pub fn stats(&self) -> Stats {
        Stats::from_tasks(&self.tasks)
    }
}

const PROGRESS_EMIT_INTERVAL_MS: u64 = 250;

pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            last_emit: None,
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

fn validate(request: &TrackRequest) -> Result<(), QueueError> {
    if request.source_id.trim().is_empty() {
        return Err(QueueError::Validation("missing source id".into()));
    }
    if request.url.trim().is_empty() {
        return Err(QueueError::Validation("missing url".into()));
    }
    if let Err(e) = url::Url::parse(&request.url) {
        return Err(QueueError::Validation(format!("bad url '{}': {}", request.url, e)));
    }
    if request.title.trim().is_empty() {
        return Err(QueueError::Validation("missing title".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str) -> TrackRequest {
        TrackRequest {
            source_id: source.into(),
            url: format!("https://example.com/{}", source),
            title: format!("Title {}", source),
            artist: "Artist".into(),
            ..Default::default()
        }
    }

    fn add(q: &mut DownloadQueue, source: &str) -> Uuid {
        q.enqueue(request(source), PathBuf::from(format!("{}.mp3", source)))
            .unwrap()
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let mut q = DownloadQueue::new(2);
        let mut r = request("a");
        r.url = String::new();
        assert!(matches!(
            q.enqueue(r, PathBuf::from("a.mp3")),
            Err(QueueError::Validation(_))
        ));
        let mut r = request("a");
        r.source_id = "  ".into();
        assert!(matches!(
            q.enqueue(r, PathBuf::from("a.mp3")),
            Err(QueueError::Validation(_))
        ));
        let mut r = request("a");
        r.url = "not a url".into();
        assert!(matches!(
            q.enqueue(r, PathBuf::from("a.mp3")),
            Err(QueueError::Validation(_))
        ));
        assert!(q.tasks.is_empty());
    }

    #[test]
    fn duplicate_in_flight_is_rejected_and_size_unchanged() {
        let mut q = DownloadQueue::new(2);
        let first = add(&mut q, "a");
        let err = q
            .enqueue(request("a"), PathBuf::from("a.mp3"))
            .unwrap_err();
        match err {
            QueueError::Duplicate { task_id, .. } => assert_eq!(task_id, first),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(q.tasks.len(), 1);
    }

    #[test]
    fn terminal_task_does_not_block_re_enqueue() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            let mut q = DownloadQueue::new(2);
            let first = add(&mut q, "a");
            q.find_mut(first).unwrap().status = terminal;
            let second = add(&mut q, "a");
            assert_ne!(first, second);
            assert_eq!(q.tasks.len(), 2);
        }
    }

    #[test]
    fn next_queued_respects_slots_and_fifo() {
        let mut q = DownloadQueue::new(3);
        let ids: Vec<Uuid> = ["a", "b", "c", "d"].iter().map(|s| add(&mut q, s)).collect();
        assert_eq!(q.next_queued_ids(), ids[..3].to_vec());

        for id in q.next_queued_ids() {
            q.mark_admitted(id).unwrap();
        }
        assert_eq!(q.active_count(), 3);
        assert!(q.next_queued_ids().is_empty());
    }

    #[test]
    fn retried_backend_task_keeps_its_fifo_turn() {
        let mut q = DownloadQueue::new(1);
        let a = add(&mut q, "a");
        let b = add(&mut q, "b");
        q.mark_submitted(a, Some(1));
        assert_eq!(q.next_queued_ids(), vec![a]);

        assert!(matches!(q.mark_admitted(a), Some(Admission::Resume)));
        assert!(!q.is_handing_over(a));
        assert_eq!(q.active_count(), 1);
        assert!(!q.has_free_slot());
        assert!(q.next_queued_ids().is_empty());
        assert_eq!(q.find(b).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn task_being_handed_over_is_not_admitted_twice() {
        let mut q = DownloadQueue::new(2);
        let a = add(&mut q, "a");
        assert!(matches!(q.mark_admitted(a), Some(Admission::Submit(_))));
        assert!(q.is_handing_over(a));

        // Cancelled and put back before the enqueue call returned.
        q.find_mut(a).unwrap().status = TaskStatus::Queued;
        assert!(q.next_queued_ids().is_empty());
        assert!(q.mark_admitted(a).is_none());

        q.finish_hand_over(a);
        assert_eq!(q.next_queued_ids(), vec![a]);
    }

    #[test]
    fn admission_builds_backend_request() {
        let mut q = DownloadQueue::new(1);
        let a = add(&mut q, "a");
        let Some(Admission::Submit(req)) = q.mark_admitted(a) else {
            panic!("expected a hand-over request");
        };
        assert_eq!(req.task_id, a.to_string());
        assert_eq!(req.download_path, "a.mp3");
        let task = q.find(a).unwrap();
        assert_eq!(task.status, TaskStatus::Downloading);
        assert!(task.started_at.is_some());
        assert!(q.mark_admitted(a).is_none());
    }

    #[test]
    fn mark_failed_keeps_retry_count_and_enables_retry() {
        let mut q = DownloadQueue::new(1);
        let a = add(&mut q, "a");
        q.mark_admitted(a);
        assert!(q.mark_failed(a, "connection refused"));
        let t = q.find(a).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 0);
        assert!(t.can_retry);
        assert!(!t.can_cancel);
        assert!(!q.mark_failed(a, "again"));
    }

    #[test]
    fn clear_by_kind() {
        let mut q = DownloadQueue::new(1);
        let a = add(&mut q, "a");
        let b = add(&mut q, "b");
        let c = add(&mut q, "c");
        let _d = add(&mut q, "d");
        q.find_mut(a).unwrap().status = TaskStatus::Completed;
        q.find_mut(b).unwrap().status = TaskStatus::Failed;
        q.find_mut(c).unwrap().status = TaskStatus::Cancelled;

        assert_eq!(q.clear(ClearKind::Completed), 1);
        assert_eq!(q.clear(ClearKind::Failed), 2);
        assert_eq!(q.tasks.len(), 1);
        assert_eq!(q.clear(ClearKind::Failed), 0);
    }

    #[test]
    fn completion_notice_is_given_once() {
        let mut q = DownloadQueue::new(1);
        let a = add(&mut q, "a");
        assert!(!q.take_completion_notice(a));
        q.find_mut(a).unwrap().status = TaskStatus::Completed;
        assert!(q.take_completion_notice(a));
        assert!(!q.take_completion_notice(a));
    }

    #[test]
    fn throttle_lets_first_emit_through() {
        let mut t = ProgressThrottle::new(60_000);
        assert!(t.should_emit());
        assert!(!t.should_emit());
        let mut open = ProgressThrottle::new(0);
        assert!(open.should_emit());
        assert!(open.should_emit());
    }

    #[test]
    fn revision_moves_on_mutation() {
        let mut q = DownloadQueue::new(1);
        let r0 = q.revision();
        let a = add(&mut q, "a");
        let r1 = q.revision();
        assert!(r1 > r0);
        q.mark_admitted(a);
        assert!(q.revision() > r1);
    }
}
