use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::backend::HealthStatus;
use crate::core::recovery::{ErrorRecoveryService, RecoveryStrategy};

/// What one health round concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Degraded twice in a row; left alone.
    Degraded,
    RecoveryTriggered,
    Skipped,
}

/// Periodically asks the backend how it is doing and hands unhealthy
/// answers to the recovery service.
pub struct HealthMonitor {
    recovery: Arc<ErrorRecoveryService>,
}

impl HealthMonitor {
    pub fn new(recovery: Arc<ErrorRecoveryService>) -> Self {
        Self { recovery }
    }

    pub async fn check_once(&self) -> HealthVerdict {
        if self.recovery.is_recovery_in_progress() {
            debug!("Health check skipped, recovery running");
            return HealthVerdict::Skipped;
        }

        let mut status = self.fetch().await;
        if status == Some(HealthStatus::Degraded) {
            debug!("Backend degraded, re-checking");
            let delay = self.recovery.config().degraded_recheck_delay;
            let token = self.recovery.shutdown_token();
            tokio::select! {
                _ = token.cancelled() => return HealthVerdict::Skipped,
                _ = tokio::time::sleep(delay) => {}
            }
            status = self.fetch().await;
        }

        match status {
            Some(HealthStatus::Healthy) => HealthVerdict::Healthy,
            Some(HealthStatus::Degraded) => {
                warn!("Backend still degraded");
                HealthVerdict::Degraded
            }
            Some(HealthStatus::Unhealthy) | None => {
                if self
                    .recovery
                    .trigger_recovery("health_check", RecoveryStrategy::HealthCheck)
                {
                    HealthVerdict::RecoveryTriggered
                } else {
                    HealthVerdict::Skipped
                }
            }
        }
    }

    async fn fetch(&self) -> Option<HealthStatus> {
        match self.recovery.client().health().await {
            Ok(report) => Some(report.status),
            Err(e) => {
                warn!("Health check failed: {}", e);
                None
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let token = self.recovery.shutdown_token();
        // tokio::time::interval rejects a zero period.
        let interval = self
            .recovery
            .config()
            .health_check_interval
            .max(Duration::from_millis(1));
        tokio::spawn(async move {
            info!("Health monitor started ({:?} interval)", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_once().await;
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}
