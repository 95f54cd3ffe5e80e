use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Persisted window blob. Keys unknown to this core ride along in `extra`
/// and are written back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub size: [u32; 2],
    pub position: [i32; 2],
    pub maximized: bool,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: [1280, 720],
            position: [0, 0],
            maximized: false,
            extra: serde_json::Map::new(),
        }
    }
}

impl WindowConfig {
    /// A missing or unreadable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        let Ok(bytes) = fs::read(path) else {
            return Self::default();
        };
        match serde_json::from_slice(&bytes) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("ignoring malformed config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_unknown_keys() {
        let source = serde_json::json!({
            "size": [1920, 1080],
            "position": [10, 20],
            "maximized": true,
            "editorLayout": {"panes": 3},
            "lastProject": "demo"
        });
        let config: WindowConfig = serde_json::from_value(source).unwrap();
        assert_eq!(config.size, [1920, 1080]);
        assert!(config.maximized);

        let written = serde_json::to_value(&config).unwrap();
        assert_eq!(written["editorLayout"]["panes"], 3);
        assert_eq!(written["lastProject"], "demo");
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = WindowConfig::load(Path::new("/nonexistent/helio-window.json"));
        assert_eq!(config, WindowConfig::default());
    }

    #[test]
    fn save_and_load_round_trip() {
        let mut path = std::env::temp_dir();
        path.push(format!("helio-config-{}.json", std::process::id()));
        let mut config = WindowConfig::default();
        config.size = [800, 600];
        config.save(&path).unwrap();
        let loaded = WindowConfig::load(&path);
        assert_eq!(loaded, config);
        fs::remove_file(&path).ok();
    }
}
