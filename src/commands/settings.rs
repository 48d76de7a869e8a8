use trackhaul_core::core::events::EventEmitter;
use trackhaul_core::models::settings::AppSettings;

use crate::storage::config;
use crate::AppState;

pub fn get_settings<E: EventEmitter>(state: &AppState<E>) -> Result<AppSettings, String> {
    Ok(config::load_settings(state.paths.as_ref()))
}

/// Applies a partial JSON patch. Concurrency changes take effect right away;
/// backend address and recovery tuning apply on the next start.
pub async fn update_settings<E: EventEmitter>(
    state: &AppState<E>,
    partial: String,
) -> Result<AppSettings, String> {
    let mut current = config::load_settings(state.paths.as_ref());
    let old_max = current.advanced.max_concurrent_downloads;

    let patch: serde_json::Value =
        serde_json::from_str(&partial).map_err(|e| format!("Invalid JSON: {}", e))?;
    let mut current_val =
        serde_json::to_value(&current).map_err(|e| format!("Serialize: {}", e))?;
    merge_json(&mut current_val, &patch);
    current =
        serde_json::from_value(current_val).map_err(|e| format!("Deserialize: {}", e))?;
    validate(&current)?;
    config::save_settings(state.paths.as_ref(), &current).map_err(|e| format!("Save: {}", e))?;

    if old_max != current.advanced.max_concurrent_downloads {
        state
            .manager
            .set_max_concurrent(current.advanced.max_concurrent_downloads)
            .await
            .map_err(|e| e.to_string())?;
    }

    Ok(current)
}

pub async fn reset_settings<E: EventEmitter>(state: &AppState<E>) -> Result<AppSettings, String> {
    let defaults = AppSettings::default();
    config::save_settings(state.paths.as_ref(), &defaults).map_err(|e| format!("Save: {}", e))?;
    state
        .manager
        .set_max_concurrent(defaults.advanced.max_concurrent_downloads)
        .await
        .map_err(|e| e.to_string())?;
    Ok(defaults)
}

fn validate(settings: &AppSettings) -> Result<(), String> {
    if settings.advanced.max_concurrent_downloads == 0 {
        return Err("max_concurrent_downloads must be at least 1".into());
    }
    let periods = [
        ("reconcile_interval_ms", settings.advanced.reconcile_interval_ms),
        ("health_check_interval_ms", settings.recovery.health_check_interval_ms),
    ];
    for (name, value) in periods {
        if value == 0 {
            return Err(format!("{} must be at least 1", name));
        }
    }
    Ok(())
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) else {
        return;
    };
    for (key, value) in patch_obj {
        if value.is_object() && base_obj.get(key).is_some_and(|v| v.is_object()) {
            if let Some(existing) = base_obj.get_mut(key) {
                merge_json(existing, value);
            }
        } else {
            base_obj.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{MockBackend, MockConnector, RecordingEmitter};
    use serde_json::json;
    use std::sync::Arc;
    use trackhaul_core::fs_paths::FixedPaths;

    #[test]
    fn merge_is_deep_and_partial() {
        let mut base = json!({ "advanced": { "max_concurrent_downloads": 3, "reconcile_interval_ms": 5000 }, "schema_version": 1 });
        merge_json(&mut base, &json!({ "advanced": { "max_concurrent_downloads": 5 } }));
        assert_eq!(base["advanced"]["max_concurrent_downloads"], 5);
        assert_eq!(base["advanced"]["reconcile_interval_ms"], 5000);
        assert_eq!(base["schema_version"], 1);
    }

    #[tokio::test]
    async fn update_persists_and_applies_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let state = AppState::from_settings(
            &AppSettings::default(),
            Arc::new(FixedPaths::new(dir.path())),
            MockConnector::new(backend.clone()),
            RecordingEmitter::default(),
        )
        .unwrap();

        let updated = update_settings(
            &state,
            r#"{"advanced":{"max_concurrent_downloads":6},"backend":{"signing_key":"s"}}"#.into(),
        )
        .await
        .unwrap();
        assert_eq!(updated.advanced.max_concurrent_downloads, 6);
        assert_eq!(state.manager.max_concurrent().await, 6);
        assert!(backend.calls().contains(&"settings:6".to_string()));

        let stored = get_settings(&state).unwrap();
        assert_eq!(stored.backend.signing_key, "s");
        assert_eq!(stored.advanced.reconcile_interval_ms, 5000);

        assert!(update_settings(&state, "{oops".into()).await.is_err());
        assert!(update_settings(&state, r#"{"advanced":{"max_concurrent_downloads":0}}"#.into())
            .await
            .is_err());
        let err = update_settings(&state, r#"{"advanced":{"reconcile_interval_ms":0}}"#.into())
            .await
            .unwrap_err();
        assert!(err.contains("reconcile_interval_ms"), "{err}");
        assert!(update_settings(&state, r#"{"recovery":{"health_check_interval_ms":0}}"#.into())
            .await
            .is_err());
        assert_eq!(get_settings(&state).unwrap().advanced.reconcile_interval_ms, 5000);

        let reset = reset_settings(&state).await.unwrap();
        assert_eq!(reset.advanced.max_concurrent_downloads, 3);
        assert_eq!(state.manager.max_concurrent().await, 3);
    }
}
