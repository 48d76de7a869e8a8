use serde::Serialize;

use crate::models::task::{DownloadTask, TaskStatus};

/// Summary counters over the task registry. Always derived, never stored.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub active: usize,
    pub queued: usize,
}

impl Stats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a DownloadTask>) -> Self {
        let mut stats = Stats::default();
        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Queued => stats.queued += 1,
                s if s.is_active() => stats.active += 1,
                _ => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::TrackRequest;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn with_status(status: TaskStatus) -> DownloadTask {
        let mut t = DownloadTask::new(
            Uuid::new_v4(),
            TrackRequest::default(),
            PathBuf::from("x.mp3"),
            0,
        );
        t.status = status;
        t
    }

    #[test]
    fn counts_every_bucket() {
        let tasks: Vec<_> = TaskStatus::ALL.iter().map(|s| with_status(*s)).collect();
        let stats = Stats::from_tasks(&tasks);
        assert_eq!(
            stats,
            Stats {
                total: 8,
                completed: 1,
                failed: 1,
                cancelled: 1,
                active: 4,
                queued: 1,
            }
        );
    }

    #[test]
    fn empty_registry() {
        assert_eq!(Stats::from_tasks(&Vec::<DownloadTask>::new()), Stats::default());
    }
}
