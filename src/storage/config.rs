use std::path::PathBuf;

use trackhaul_core::fs_paths::AppPaths;
use trackhaul_core::models::settings::AppSettings;

const STORE_PATH: &str = "settings.json";

pub fn settings_path(paths: &dyn AppPaths) -> PathBuf {
    paths.data_dir().join(STORE_PATH)
}

/// Missing or unreadable settings fall back to defaults.
pub fn load_settings(paths: &dyn AppPaths) -> AppSettings {
    let path = settings_path(paths);
    let raw = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(_) => return AppSettings::default(),
    };

    match serde_json::from_str::<AppSettings>(&raw) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Ignoring corrupt settings at {}: {}", path.display(), e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(paths: &dyn AppPaths, settings: &AppSettings) -> anyhow::Result<()> {
    let path = settings_path(paths);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackhaul_core::fs_paths::FixedPaths;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FixedPaths::new(dir.path());
        let settings = load_settings(&paths);
        assert_eq!(settings.advanced.max_concurrent_downloads, 3);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FixedPaths::new(dir.path());
        let mut settings = AppSettings::default();
        settings.advanced.max_concurrent_downloads = 7;
        settings.backend.signing_key = "k".into();
        save_settings(&paths, &settings).unwrap();

        let loaded = load_settings(&paths);
        assert_eq!(loaded.advanced.max_concurrent_downloads, 7);
        assert_eq!(loaded.backend.signing_key, "k");
        assert!(!settings_path(&paths).with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FixedPaths::new(dir.path());
        std::fs::create_dir_all(paths.data_dir()).unwrap();
        std::fs::write(settings_path(&paths), "{ not json").unwrap();
        assert_eq!(
            load_settings(&paths).recovery.circuit_breaker_threshold,
            5
        );
    }
}
