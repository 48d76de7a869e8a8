use std::sync::Arc;

use trackhaul_core::core::events::EventEmitter;
use trackhaul_core::fs_paths::{AppPaths, DesktopPaths};
use trackhaul_core::models::settings::AppSettings;

use crate::core::backend::BackendConnector;
use crate::core::manager::{DownloadManager, ManagerConfig};
use crate::core::recovery::{ErrorRecoveryService, RecoveryConfig};

pub mod commands;
pub mod core;
pub mod storage;

pub struct AppState<E: EventEmitter> {
    pub manager: DownloadManager<E>,
    pub paths: Arc<dyn AppPaths>,
}

impl<E: EventEmitter> AppState<E> {
    pub fn new(manager: DownloadManager<E>, paths: Arc<dyn AppPaths>) -> Self {
        Self { manager, paths }
    }

    pub fn from_settings(
        settings: &AppSettings,
        paths: Arc<dyn AppPaths>,
        connector: Arc<dyn BackendConnector>,
        emitter: E,
    ) -> anyhow::Result<Self> {
        let recovery = ErrorRecoveryService::new(RecoveryConfig::from(&settings.recovery), connector)?;
        let mut config = ManagerConfig::from_settings(settings);
        if config.output_dir.as_os_str().is_empty() {
            config.output_dir = paths.music_dir();
        }
        let manager = DownloadManager::new(config, recovery, emitter);
        Ok(Self::new(manager, paths))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let paths: Arc<dyn AppPaths> = Arc::new(DesktopPaths);
    let settings_file = storage::config::settings_path(paths.as_ref());
    let settings = storage::config::load_settings(paths.as_ref());
    if !settings_file.exists() {
        if let Err(e) = storage::config::save_settings(paths.as_ref(), &settings) {
            tracing::warn!("Could not write default settings: {}", e);
        }
    }
    tracing::info!(
        "Using backend {} (settings at {})",
        settings.backend.base_url,
        settings_file.display()
    );

    let connector = Arc::new(core::http_backend::HttpConnector::new(
        settings.backend.clone(),
        settings.proxy.clone(),
    ));
    let state = AppState::from_settings(&settings, paths, connector, core::events::LogEmitter)?;
    let handles = state.manager.start();

    tokio::signal::ctrl_c().await?;
    state.manager.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Stopped");
    Ok(())
}
