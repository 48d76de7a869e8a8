//! Circuit breaker and recovery strategies around every backend call.
//!
//! Calls are never short-circuited: while the circuit is open they are still
//! attempted, and a success after `recovery_timeout` closes it again. Failures
//! pick a recovery strategy that runs in the background, one at a time.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trackhaul_core::models::settings::RecoverySettings;
use uuid::Uuid;

use crate::core::backend::{BackendClient, BackendConnector, BackendError, HealthStatus};

pub const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Reconnect,
    Fallback,
    CircuitBreaker,
    HealthCheck,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub strategy: RecoveryStrategy,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: String,
    pub task_id: Option<String>,
    pub retry_count: u32,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn for_task(operation: impl Into<String>, task_id: impl ToString, retry_count: u32) -> Self {
        Self {
            operation: operation.into(),
            task_id: Some(task_id.to_string()),
            retry_count,
        }
    }

    /// Operation name plus the task it concerns, as logged and recorded.
    pub fn describe(&self) -> String {
        match &self.task_id {
            Some(id) => format!("{} for task {}", self.operation, id),
            None => self.operation.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub recovery_timeout: Duration,
    pub health_check_interval: Duration,
    pub degraded_recheck_delay: Duration,
}

impl From<&RecoverySettings> for RecoveryConfig {
    fn from(s: &RecoverySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            circuit_breaker_threshold: s.circuit_breaker_threshold.max(1),
            recovery_timeout: Duration::from_millis(s.recovery_timeout_ms),
            health_check_interval: Duration::from_millis(s.health_check_interval_ms.max(1)),
            degraded_recheck_delay: Duration::from_millis(s.degraded_recheck_delay_ms),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::from(&RecoverySettings::default())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub total_attempts: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub by_strategy: HashMap<RecoveryStrategy, usize>,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub recovery_in_progress: bool,
    pub last_action_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ErrorRecoveryService {
    config: RecoveryConfig,
    connector: Arc<dyn BackendConnector>,
    client: RwLock<Arc<dyn BackendClient>>,
    breaker: Mutex<Breaker>,
    history: Mutex<VecDeque<RecoveryAction>>,
    recovery_in_progress: AtomicBool,
    shutdown: CancellationToken,
}

impl ErrorRecoveryService {
    pub fn new(
        config: RecoveryConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> anyhow::Result<Arc<Self>> {
        let client = connector.connect()?;
        Ok(Arc::new(Self {
            config,
            connector,
            client: RwLock::new(client),
            breaker: Mutex::new(Breaker::default()),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            recovery_in_progress: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// The current backend client. Reconnects swap it out.
    pub fn client(&self) -> Arc<dyn BackendClient> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `op` against the backend and feeds the outcome to the breaker.
    /// `op` may run twice when the fallback strategy kicks in.
    pub async fn execute<T, F, Fut>(
        self: &Arc<Self>,
        ctx: ErrorContext,
        op: F,
    ) -> Result<T, BackendError>
    where
        F: Fn(Arc<dyn BackendClient>) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let started = Instant::now();
        let err = match op(self.client()).await {
            Ok(value) => {
                self.record_success();
                return Ok(value);
            }
            Err(err) => err,
        };

        self.record_failure();
        let strategy = self.select_strategy(&ctx, &err);
        let description = ctx.describe();
        warn!(
            "{} failed ({}), recovery strategy {:?}",
            description, err, strategy
        );
        self.push_action(strategy, &description, Err(err.to_string()), started.elapsed());

        if strategy == RecoveryStrategy::Fallback {
            let started = Instant::now();
            match op(self.client()).await {
                Ok(value) => {
                    self.record_success();
                    self.push_action(strategy, &description, Ok(()), started.elapsed());
                    info!("{} recovered on fallback attempt", description);
                    return Ok(value);
                }
                Err(second) => {
                    self.record_failure();
                    self.push_action(
                        strategy,
                        &description,
                        Err(second.to_string()),
                        started.elapsed(),
                    );
                    self.trigger_recovery(&description, RecoveryStrategy::Retry);
                    return Err(second);
                }
            }
        }

        self.trigger_recovery(&description, strategy);
        Err(err)
    }

    pub fn select_strategy(&self, ctx: &ErrorContext, err: &BackendError) -> RecoveryStrategy {
        let message = err.to_string().to_lowercase();
        if self.is_circuit_breaker_open() {
            RecoveryStrategy::CircuitBreaker
        } else if message.contains("timeout") {
            RecoveryStrategy::Fallback
        } else if message.contains("connection") {
            RecoveryStrategy::Reconnect
        } else if ctx.retry_count >= self.config.max_retries {
            RecoveryStrategy::CircuitBreaker
        } else {
            RecoveryStrategy::Retry
        }
    }

    /// Starts a background recovery unless one is already running. Returns
    /// whether a new recovery was started.
    pub fn trigger_recovery(self: &Arc<Self>, operation: &str, strategy: RecoveryStrategy) -> bool {
        if self
            .recovery_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Recovery already running, ignoring {:?} for {}", strategy, operation);
            return false;
        }
        let this = Arc::clone(self);
        let operation = operation.to_string();
        tokio::spawn(async move {
            this.run_recovery(&operation, strategy).await;
            this.recovery_in_progress.store(false, Ordering::SeqCst);
        });
        true
    }

    async fn run_recovery(&self, operation: &str, strategy: RecoveryStrategy) {
        info!("Starting {:?} recovery for {}", strategy, operation);
        let mut recovered = self.attempt(operation, strategy).await;
        if !recovered && strategy == RecoveryStrategy::HealthCheck {
            recovered = self.attempt(operation, RecoveryStrategy::Reconnect).await;
        }
        while self.is_circuit_breaker_open() && !self.shutdown.is_cancelled() {
            recovered = self.attempt(operation, RecoveryStrategy::CircuitBreaker).await;
        }
        if recovered {
            info!("Recovery for {} finished", operation);
        } else {
            error!("Recovery for {} did not restore the backend", operation);
        }
    }

    async fn attempt(&self, operation: &str, strategy: RecoveryStrategy) -> bool {
        let started = Instant::now();
        let outcome = match strategy {
            RecoveryStrategy::Retry => {
                if !self.pause(self.config.retry_delay).await {
                    return false;
                }
                self.probe().await
            }
            RecoveryStrategy::Reconnect => match self.connector.connect() {
                Ok(client) => {
                    *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
                    debug!("Backend client rebuilt");
                    self.probe().await
                }
                Err(e) => Err(format!("reconnect failed: {e}")),
            },
            RecoveryStrategy::CircuitBreaker => {
                self.force_open();
                if !self.pause(self.until_half_open()).await {
                    return false;
                }
                self.probe().await
            }
            RecoveryStrategy::HealthCheck | RecoveryStrategy::Fallback => self.probe().await,
        };
        let ok = outcome.is_ok();
        self.push_action(strategy, operation, outcome, started.elapsed());
        ok
    }

    /// Lightweight read against the backend that counts toward the breaker.
    pub async fn probe(&self) -> Result<(), String> {
        match self.client().health().await {
            Ok(report) if report.status != HealthStatus::Unhealthy => {
                self.record_success();
                Ok(())
            }
            Ok(_) => {
                self.record_failure();
                Err("backend reports unhealthy".to_string())
            }
            Err(e) => {
                self.record_failure();
                Err(e.to_string())
            }
        }
    }

    /// Sleeps unless shut down first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn record_success(&self) {
        let mut breaker = lock(&self.breaker);
        if let Some(opened) = breaker.opened_at {
            if opened.elapsed() >= self.config.recovery_timeout {
                breaker.opened_at = None;
                info!("Circuit breaker closed");
            }
        }
        breaker.consecutive_failures = 0;
    }

    fn record_failure(&self) {
        let mut breaker = lock(&self.breaker);
        breaker.consecutive_failures += 1;
        match breaker.opened_at {
            Some(opened) if opened.elapsed() >= self.config.recovery_timeout => {
                breaker.opened_at = Some(Instant::now());
                warn!("Half-open probe failed, circuit stays open");
            }
            None if breaker.consecutive_failures >= self.config.circuit_breaker_threshold => {
                breaker.opened_at = Some(Instant::now());
                warn!(
                    "Circuit breaker opened after {} consecutive failures",
                    breaker.consecutive_failures
                );
            }
            _ => {}
        }
    }

    fn force_open(&self) {
        let mut breaker = lock(&self.breaker);
        if breaker.opened_at.is_none() {
            breaker.opened_at = Some(Instant::now());
            warn!("Circuit breaker forced open");
        }
    }

    fn until_half_open(&self) -> Duration {
        match lock(&self.breaker).opened_at {
            Some(opened) => self.config.recovery_timeout.saturating_sub(opened.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn push_action(
        &self,
        strategy: RecoveryStrategy,
        description: &str,
        outcome: Result<(), String>,
        elapsed: Duration,
    ) {
        let mut history = lock(&self.history);
        if history.len() >= MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(RecoveryAction {
            id: Uuid::new_v4(),
            strategy,
            description: description.to_string(),
            timestamp: Utc::now(),
            success: outcome.is_ok(),
            error: outcome.err(),
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn is_circuit_breaker_open(&self) -> bool {
        lock(&self.breaker).opened_at.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.breaker).consecutive_failures
    }

    pub fn is_recovery_in_progress(&self) -> bool {
        self.recovery_in_progress.load(Ordering::SeqCst)
    }

    pub fn get_recovery_history(&self) -> Vec<RecoveryAction> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn get_recovery_stats(&self) -> RecoveryStats {
        let history = lock(&self.history);
        let total = history.len();
        let successful = history.iter().filter(|a| a.success).count();
        let mut by_strategy = HashMap::new();
        for action in history.iter() {
            *by_strategy.entry(action.strategy).or_insert(0) += 1;
        }
        let breaker = lock(&self.breaker);
        RecoveryStats {
            total_attempts: total,
            successful,
            failed: total - successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            by_strategy,
            circuit_open: breaker.opened_at.is_some(),
            consecutive_failures: breaker.consecutive_failures,
            recovery_in_progress: self.is_recovery_in_progress(),
            last_action_at: history.back().map(|a| a.timestamp),
        }
    }

    pub fn reset_circuit_breaker(&self) {
        let mut breaker = lock(&self.breaker);
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
        info!("Circuit breaker reset manually");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
