use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// A loaded plugin manifest (`plugin.json`).
///
/// Only the fields the network engine consumes are modeled; the rule values
/// stay raw JSON until the rule compiler coerces them, so a malformed
/// manifest degrades to "match nothing" instead of failing to parse.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub game_page: Option<String>,
    #[serde(default)]
    pub network_watcher_rules: Option<serde_json::Value>,
    #[serde(default)]
    pub network_cache_rules: Option<serde_json::Value>,
    /// Overrides the default per-plugin cache directory.
    #[serde(default)]
    pub cache_path: Option<String>,
    /// Directory the manifest was loaded from.
    #[serde(default)]
    pub path: Option<String>,
    /// Absolute path of the manifest file itself.
    #[serde(default, rename = "JSONpath")]
    pub json_path: Option<String>,
}

impl PluginManifest {
    /// Load a manifest from disk and stamp `path` / `JSONpath` from the
    /// file location.
    pub fn load(manifest_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(manifest_path)?;
        let mut manifest: PluginManifest = serde_json::from_str(&content)?;
        if manifest.name.is_empty() {
            return Err(Error::Config(format!(
                "Manifest {} has no plugin name",
                manifest_path.display()
            )));
        }
        manifest.json_path = Some(manifest_path.display().to_string());
        manifest.path = manifest_path
            .parent()
            .map(|p| p.display().to_string());
        Ok(manifest)
    }
}

/// Application configuration (`config.json`): the set of registered plugins.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub plugins: Vec<PluginManifest>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Missing or unreadable config files fall back to the defaults.
    pub fn load_or_default(paths: &Paths) -> Self {
        let config_path = paths.config_file();
        match Self::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                if config_path.exists() {
                    tracing::warn!(error = %e, "Failed to load config, using defaults");
                }
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Register a plugin. Rejects a manifest that is already registered
    /// (matched on its manifest file path).
    pub fn add_plugin(&mut self, manifest: PluginManifest) -> Result<()> {
        if let Some(json_path) = manifest.json_path.as_deref() {
            if self
                .plugins
                .iter()
                .any(|p| p.json_path.as_deref() == Some(json_path))
            {
                return Err(Error::Config(format!(
                    "Plugin manifest {} is already registered",
                    json_path
                )));
            }
        }
        self.plugins.push(manifest);
        Ok(())
    }

    pub fn remove_plugin(&mut self, name: &str) -> bool {
        let before = self.plugins.len();
        self.plugins.retain(|p| p.name != name);
        self.plugins.len() != before
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginManifest> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Re-read a registered plugin's manifest from disk, keeping its
    /// registration paths.
    pub fn reload_plugin(&mut self, name: &str) -> Result<&PluginManifest> {
        let slot = self
            .plugins
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(format!("Plugin '{}' is not registered", name)))?;
        let json_path = slot
            .json_path
            .clone()
            .ok_or_else(|| Error::Config(format!("Plugin '{}' has no manifest path", name)))?;
        *slot = PluginManifest::load(Path::new(&json_path))?;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_file(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_manifest_load_stamps_paths() {
        let temp = TempDir::new().unwrap();
        let path = manifest_file(
            temp.path(),
            "plugin.json",
            r#"{ "name": "demo", "gamePage": "https://game.example/play" }"#,
        );

        let manifest = PluginManifest::load(&path).unwrap();
        assert_eq!(manifest.name, "demo");
        assert_eq!(manifest.json_path.as_deref(), Some(path.display().to_string().as_str()));
        assert_eq!(
            manifest.path.as_deref(),
            Some(temp.path().display().to_string().as_str())
        );
    }

    #[test]
    fn test_manifest_keeps_raw_rule_values() {
        let temp = TempDir::new().unwrap();
        let path = manifest_file(
            temp.path(),
            "plugin.json",
            r#"{
  "name": "demo",
  "networkWatcherRules": { "request": true, "headers": ["Content-Type"] },
  "networkCacheRules": { "GET": ["assets"] }
}"#,
        );

        let manifest = PluginManifest::load(&path).unwrap();
        let rules = manifest.network_watcher_rules.unwrap();
        assert_eq!(rules["request"], serde_json::json!(true));
        assert!(manifest.network_cache_rules.unwrap().get("GET").is_some());
    }

    #[test]
    fn test_add_remove_reload_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = manifest_file(temp.path(), "plugin.json", r#"{ "name": "demo" }"#);

        let mut config = Config::default();
        let manifest = PluginManifest::load(&path).unwrap();
        config.add_plugin(manifest.clone()).unwrap();
        assert!(config.add_plugin(manifest).is_err());

        // Manifest changes on disk are picked up by reload
        std::fs::write(&path, r#"{ "name": "demo", "gamePage": "https://x/y" }"#).unwrap();
        let reloaded = config.reload_plugin("demo").unwrap();
        assert_eq!(reloaded.game_page.as_deref(), Some("https://x/y"));

        let paths = Paths::with_base(temp.path().join("base"));
        config.save(&paths.config_file()).unwrap();
        let loaded = Config::load_or_default(&paths);
        assert_eq!(loaded.plugins.len(), 1);

        let mut loaded = loaded;
        assert!(loaded.remove_plugin("demo"));
        assert!(!loaded.remove_plugin("demo"));
    }

    #[test]
    fn test_corrupt_config_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let paths = Paths::with_base(temp.path().to_path_buf());
        std::fs::write(paths.config_file(), "{ not json").unwrap();
        let config = Config::load_or_default(&paths);
        assert!(config.plugins.is_empty());
    }
}
