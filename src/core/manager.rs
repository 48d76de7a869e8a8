use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trackhaul_core::core::events::EventEmitter;
use trackhaul_core::core::stats::Stats;
use trackhaul_core::models::settings::AppSettings;
use trackhaul_core::models::task::{DownloadTask, TaskStatus, TrackRequest};
use uuid::Uuid;

use crate::core::backend::{BackendError, ClearKind, EnqueueRequest, PushEvent};
use crate::core::filename;
use crate::core::health::HealthMonitor;
use crate::core::progress::{self, Transition};
use crate::core::queue::{Admission, DownloadQueue, QueueError};
use crate::core::recovery::{ErrorContext, ErrorRecoveryService};
use crate::core::retry::{self, RetryPolicy};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent: u32,
    pub output_dir: PathBuf,
    pub quality: String,
    pub format: String,
    pub reconcile_interval: Duration,
    pub stream_backoff: RetryPolicy,
}

impl ManagerConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            max_concurrent: settings.advanced.max_concurrent_downloads.max(1),
            output_dir: settings.download.default_output_dir.clone(),
            quality: settings.download.quality.clone(),
            format: settings.download.format.clone(),
            reconcile_interval: Duration::from_millis(settings.advanced.reconcile_interval_ms.max(1)),
            stream_backoff: RetryPolicy::new(
                Duration::from_millis(settings.advanced.stream_reconnect_initial_ms),
                Duration::from_millis(settings.advanced.stream_reconnect_max_ms),
            ),
        }
    }
}

/// Owns the registry and drives admission, cancellation, retries and the
/// two progress feeds. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DownloadManager<E: EventEmitter> {
    queue: Arc<tokio::sync::Mutex<DownloadQueue>>,
    recovery: Arc<ErrorRecoveryService>,
    emitter: E,
    config: Arc<ManagerConfig>,
    shutdown: CancellationToken,
}

impl<E: EventEmitter> DownloadManager<E> {
    pub fn new(config: ManagerConfig, recovery: Arc<ErrorRecoveryService>, emitter: E) -> Self {
        let queue = DownloadQueue::new(config.max_concurrent);
        let shutdown = recovery.shutdown_token();
        Self {
            queue: Arc::new(tokio::sync::Mutex::new(queue)),
            recovery,
            emitter,
            config: Arc::new(config),
            shutdown,
        }
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryService> {
        &self.recovery
    }

    fn publish(&self, q: &DownloadQueue) {
        self.emitter.emit_queue_state(&q.tasks, &q.stats());
    }

    fn announce(&self, q: &mut DownloadQueue, transitions: &[Transition]) {
        for transition in transitions {
            match *transition {
                Transition::Completed(id) => {
                    if q.take_completion_notice(id) {
                        if let Some(task) = q.find(id) {
                            info!("Download completed: {} ({})", task.title, id);
                            self.emitter.emit_task_completed(task);
                        }
                    }
                }
                Transition::Failed(id) => {
                    if let Some(task) = q.find(id) {
                        warn!(
                            "Download failed: {} ({}): {}",
                            task.title,
                            id,
                            task.error.as_deref().unwrap_or("unknown error")
                        );
                        self.emitter.emit_task_failed(task);
                    }
                }
            }
        }
    }

    fn fail_task(&self, q: &mut DownloadQueue, id: Uuid, error: String) {
        if q.mark_failed(id, error) {
            self.announce(q, &[Transition::Failed(id)]);
        }
    }

    pub async fn enqueue(&self, mut request: TrackRequest) -> Result<Uuid, QueueError> {
        if request.quality.is_none() {
            request.quality = Some(self.config.quality.clone());
        }
        if request.format.is_none() {
            request.format = Some(self.config.format.clone());
        }
        let destination = match &request.destination_path {
            Some(path) => path.clone(),
            None => filename::default_destination(
                &self.config.output_dir,
                &request.artist,
                &request.title,
                request.format.as_deref().unwrap_or(&self.config.format),
            ),
        };

        let id = {
            let mut q = self.queue.lock().await;
            let id = q.enqueue(request, destination)?;
            if let Some(task) = q.find(id) {
                info!("Queued '{}' by {} as {}", task.title, task.artist, id);
            }
            self.publish(&q);
            id
        };

        self.try_start_next().await;
        Ok(id)
    }

    /// Admits queued tasks into free slots. Slots are claimed under the lock;
    /// the backend hand-over runs on its own task.
    pub async fn try_start_next(&self) {
        let admitted = {
            let mut q = self.queue.lock().await;
            let ids = q.next_queued_ids();
            let mut admitted: Vec<(Uuid, EnqueueRequest, u32)> = Vec::new();
            let mut resumed = false;
            for id in ids {
                match q.mark_admitted(id) {
                    Some(Admission::Submit(request)) => {
                        let retry_count = q.find(id).map(|t| t.retry_count).unwrap_or(0);
                        admitted.push((id, request, retry_count));
                    }
                    Some(Admission::Resume) => {
                        debug!("Resumed {}, backend already holds it", id);
                        resumed = true;
                    }
                    None => {}
                }
            }
            if resumed || !admitted.is_empty() {
                self.publish(&q);
            }
            admitted
        };

        for (id, request, retry_count) in admitted {
            debug!("Admitted {}", id);
            tokio::spawn(self.clone().submit(id, request, retry_count));
        }
    }

    fn submit(
        self,
        id: Uuid,
        request: EnqueueRequest,
        retry_count: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.submit_inner(id, request, retry_count).await;
        })
    }

    async fn submit_inner(&self, id: Uuid, request: EnqueueRequest, retry_count: u32) {
        let ctx = ErrorContext::for_task("enqueue", id, retry_count);
        let result = self
            .recovery
            .execute(ctx, move |client| {
                let request = request.clone();
                async move { client.enqueue(&request).await }
            })
            .await;

        match result {
            Ok(resp) => {
                let cancelled_meanwhile = {
                    let mut q = self.queue.lock().await;
                    q.finish_hand_over(id);
                    q.mark_submitted(id, resp.queue_position);
                    self.publish(&q);
                    q.find(id).map(|t| t.status) == Some(TaskStatus::Cancelled)
                };
                debug!("Backend accepted {} at position {:?}", id, resp.queue_position);
                if cancelled_meanwhile {
                    if let Err(e) = self.send_cancel(id, retry_count).await {
                        warn!("Cancel of {} after hand-over failed: {}", id, e);
                    }
                }
            }
            Err(e) => {
                {
                    let mut q = self.queue.lock().await;
                    q.finish_hand_over(id);
                    if let Some(task) = q.find_mut(id) {
                        if task.status == TaskStatus::Cancelled {
                            task.cancel_confirmed = true;
                        }
                    }
                    self.fail_task(&mut q, id, e.to_string());
                    self.publish(&q);
                }
                self.try_start_next().await;
            }
        }
    }

    async fn send_cancel(&self, id: Uuid, retry_count: u32) -> Result<(), BackendError> {
        let task_id = id.to_string();
        self.recovery
            .execute(ErrorContext::for_task("cancel", id, retry_count), move |client| {
                let task_id = task_id.clone();
                async move { client.cancel(&task_id).await }
            })
            .await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), QueueError> {
        let pending_backend = {
            let mut q = self.queue.lock().await;
            let task = q.find(id).ok_or(QueueError::NotFound(id))?;
            if task.is_terminal() {
                return Err(QueueError::NotCancellable {
                    id,
                    status: task.status,
                });
            }
            if task.submitted {
                Some(task.retry_count)
            } else {
                // Not handed over yet; an in-flight hand-over cancels on arrival.
                let confirmed = task.status == TaskStatus::Queued;
                q.mark_cancelled(id, confirmed);
                info!("Cancelled {} locally", id);
                self.publish(&q);
                None
            }
        };

        if let Some(retry_count) = pending_backend {
            let result = self.send_cancel(id, retry_count).await;
            let mut q = self.queue.lock().await;
            match result {
                Ok(()) => {
                    q.mark_cancelled(id, false);
                    info!("Cancel requested for {}", id);
                    self.publish(&q);
                }
                Err(e) => {
                    self.fail_task(&mut q, id, format!("cancel failed: {}", e));
                    self.publish(&q);
                    drop(q);
                    self.try_start_next().await;
                    return Err(e.into());
                }
            }
        }

        self.try_start_next().await;
        Ok(())
    }

    /// Puts a failed or cancelled task back in the queue and returns it as
    /// reset, before admission picks it up. Refused while the task's first
    /// enqueue call is still out.
    pub async fn retry(&self, id: Uuid) -> Result<DownloadTask, QueueError> {
        let (submitted, retry_count) = {
            let q = self.queue.lock().await;
            let task = q.find(id).ok_or(QueueError::NotFound(id))?;
            retry::ensure_retryable(task)?;
            ensure_sole_claim(&q, task)?;
            if q.is_handing_over(id) {
                return Err(QueueError::HandOverPending(id));
            }
            (task.submitted, task.retry_count)
        };

        if submitted {
            let task_id = id.to_string();
            let result = self
                .recovery
                .execute(ErrorContext::for_task("retry", id, retry_count), move |client| {
                    let task_id = task_id.clone();
                    async move { client.retry(&task_id).await }
                })
                .await;
            if let Err(e) = result {
                let mut q = self.queue.lock().await;
                if let Some(task) = q.find_mut(id) {
                    task.error = Some(format!("retry failed: {}", e));
                    task.refresh_flags();
                }
                self.publish(&q);
                return Err(e.into());
            }
        }

        let snapshot = {
            let mut q = self.queue.lock().await;
            let seq = q.next_seq();
            let task = q.find(id).ok_or(QueueError::NotFound(id))?;
            retry::ensure_retryable(task)?;
            ensure_sole_claim(&q, task)?;
            if q.is_handing_over(id) {
                return Err(QueueError::HandOverPending(id));
            }
            let task = q.find_mut(id).ok_or(QueueError::NotFound(id))?;
            retry::reset_for_retry(task, seq);
            let snapshot = task.clone();
            q.touch(id);
            info!("Retrying {} (attempt {})", id, snapshot.retry_count);
            self.publish(&q);
            snapshot
        };

        self.try_start_next().await;
        Ok(snapshot)
    }

    /// Removes finished tasks locally, then asks the backend to do the same.
    pub async fn clear(&self, kind: ClearKind) -> usize {
        let removed = {
            let mut q = self.queue.lock().await;
            let removed = q.clear(kind);
            self.publish(&q);
            removed
        };
        let result = self
            .recovery
            .execute(ErrorContext::new("clear"), move |client| async move {
                client.clear(kind).await
            })
            .await;
        if let Err(e) = result {
            warn!("Backend clear of {:?} tasks failed: {}", kind, e);
        }
        info!("Cleared {} {:?} tasks", removed, kind);
        removed
    }

    /// Applies a new concurrency cap. Active tasks are never preempted.
    pub async fn set_max_concurrent(&self, max: u32) -> Result<(), QueueError> {
        if max == 0 {
            return Err(QueueError::Validation(
                "max concurrent downloads must be at least 1".into(),
            ));
        }
        {
            let mut q = self.queue.lock().await;
            q.max_concurrent = max;
            self.publish(&q);
        }
        self.push_max_concurrent(max).await;
        self.try_start_next().await;
        Ok(())
    }

    /// Keeps the backend's own limit in line with the local cap.
    async fn push_max_concurrent(&self, max: u32) {
        let result = self
            .recovery
            .execute(ErrorContext::new("update_settings"), move |client| async move {
                client.update_settings(max).await
            })
            .await;
        if let Err(e) = result {
            warn!("Backend did not take max concurrent {}: {}", max, e);
        }
    }

    pub async fn max_concurrent(&self) -> u32 {
        self.queue.lock().await.max_concurrent
    }

    pub async fn get_state(&self) -> Vec<DownloadTask> {
        self.queue.lock().await.get_state()
    }

    pub async fn get_task(&self, id: Uuid) -> Option<DownloadTask> {
        self.queue.lock().await.find(id).cloned()
    }

    pub async fn stats(&self) -> Stats {
        self.queue.lock().await.stats()
    }

    pub async fn on_push_event(&self, event: PushEvent) {
        let frees_slot = {
            let mut q = self.queue.lock().await;
            let transition = progress::apply_push_event(&mut q, &event);
            if let Some(t) = transition {
                self.announce(&mut q, &[t]);
                self.publish(&q);
            } else if q.should_publish_progress() {
                self.publish(&q);
            }
            transition.is_some()
        };
        if frees_slot {
            self.try_start_next().await;
        }
    }

    /// Pulls the backend snapshot and merges it. Returns the number of
    /// records the backend reported.
    pub async fn reconcile(&self) -> Result<usize, QueueError> {
        let epoch = self.queue.lock().await.revision();
        let records = self
            .recovery
            .execute(ErrorContext::new("queue_status"), |client| async move {
                client.queue_status().await
            })
            .await?;
        {
            let mut q = self.queue.lock().await;
            let transitions = progress::apply_snapshot(&mut q, &records, epoch);
            self.announce(&mut q, &transitions);
            self.publish(&q);
        }
        self.try_start_next().await;
        Ok(records.len())
    }

    pub fn spawn_reconcile_loop(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            // tokio::time::interval rejects a zero period.
            let period = this.config.reconcile_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.reconcile().await {
                            warn!("Reconciliation failed: {}", e);
                        }
                    }
                }
            }
            debug!("Reconcile loop stopped");
        })
    }

    /// Keeps one event-stream connection open, reconnecting with back-off.
    pub fn spawn_event_stream(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            while !this.shutdown.is_cancelled() {
                let opened = this
                    .recovery
                    .execute(ErrorContext::new("open_event_stream"), |client| async move {
                        client.open_event_stream().await
                    })
                    .await;
                match opened {
                    Ok(mut stream) => {
                        info!("Event stream connected");
                        attempt = 0;
                        loop {
                            tokio::select! {
                                _ = this.shutdown.cancelled() => return,
                                next = stream.next() => match next {
                                    Some(Ok(event)) => this.on_push_event(event).await,
                                    Some(Err(e)) => {
                                        warn!("Event stream error: {}", e);
                                        break;
                                    }
                                    None => {
                                        info!("Event stream closed by backend");
                                        break;
                                    }
                                }
                            }
                        }
                        // Catch up on whatever was pushed while disconnected.
                        if let Err(e) = this.reconcile().await {
                            warn!("Reconciliation after stream drop failed: {}", e);
                        }
                    }
                    Err(e) => warn!("Event stream unavailable: {}", e),
                }

                let delay = this.config.stream_backoff.calculate_delay(attempt);
                attempt = attempt.saturating_add(1);
                debug!("Reconnecting event stream in {:?}", delay);
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("Event stream loop stopped");
        })
    }

    /// Pushes the cap to the backend, then starts the reconcile loop, the
    /// event stream and the health monitor.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(
            "Download manager starting (max {} concurrent)",
            self.config.max_concurrent
        );
        let this = self.clone();
        let sync_cap = tokio::spawn(async move {
            let max = this.max_concurrent().await;
            this.push_max_concurrent(max).await;
        });
        vec![
            sync_cap,
            self.spawn_reconcile_loop(),
            self.spawn_event_stream(),
            HealthMonitor::new(self.recovery.clone()).spawn(),
        ]
    }

    pub fn shutdown(&self) {
        info!("Download manager shutting down");
        self.shutdown.cancel();
        self.recovery.shutdown();
    }
}

/// A retried task must not run next to a newer task for the same source.
fn ensure_sole_claim(q: &DownloadQueue, task: &DownloadTask) -> Result<(), QueueError> {
    match q.in_flight_for_source(&task.source_id) {
        Some(other) if other != task.id => Err(QueueError::Duplicate {
            source_id: task.source_id.clone(),
            task_id: other,
        }),
        _ => Ok(()),
    }
}
