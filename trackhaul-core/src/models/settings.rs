use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub schema_version: u32,
    #[serde(default)]
    pub backend: BackendSettings,
    pub download: DownloadSettings,
    pub advanced: AdvancedSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Shared signing key, passed through untouched on every request.
    #[serde(default)]
    pub signing_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            signing_key: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub default_output_dir: PathBuf,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default = "default_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_stream_reconnect_initial_ms")]
    pub stream_reconnect_initial_ms: u64,
    #[serde(default = "default_stream_reconnect_max_ms")]
    pub stream_reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_degraded_recheck_delay_ms")]
    pub degraded_recheck_delay_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            degraded_recheck_delay_ms: default_degraded_recheck_delay_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8765".into()
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_quality() -> String {
    "320".into()
}

fn default_format() -> String {
    "mp3".into()
}

fn default_max_concurrent_downloads() -> u32 {
    3
}

fn default_reconcile_interval_ms() -> u64 {
    5_000
}

fn default_stream_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_stream_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_degraded_recheck_delay_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_proxy_type() -> String {
    "http".into()
}

fn default_proxy_port() -> u16 {
    8080
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            schema_version: 1,
            backend: BackendSettings::default(),
            download: DownloadSettings {
                default_output_dir: dirs::audio_dir()
                    .or_else(dirs::download_dir)
                    .unwrap_or_else(|| PathBuf::from(".")),
                quality: default_quality(),
                format: default_format(),
            },
            advanced: AdvancedSettings {
                max_concurrent_downloads: default_max_concurrent_downloads(),
                reconcile_interval_ms: default_reconcile_interval_ms(),
                stream_reconnect_initial_ms: default_stream_reconnect_initial_ms(),
                stream_reconnect_max_ms: default_stream_reconnect_max_ms(),
            },
            recovery: RecoverySettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let raw = r#"{
            "schema_version": 1,
            "download": { "default_output_dir": "/tmp/music" },
            "advanced": { "max_concurrent_downloads": 5 }
        }"#;
        let s: AppSettings = serde_json::from_str(raw).unwrap();
        assert_eq!(s.advanced.max_concurrent_downloads, 5);
        assert_eq!(s.advanced.reconcile_interval_ms, 5_000);
        assert_eq!(s.recovery.circuit_breaker_threshold, 5);
        assert_eq!(s.recovery.recovery_timeout_ms, 30_000);
        assert_eq!(s.download.format, "mp3");
        assert!(!s.proxy.enabled);
    }
}
