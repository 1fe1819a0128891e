use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrontendSettings {
    pub model_id: String,
    /// "npu", "cpu-gpu", or empty for the hardware default.
    pub preferred_backend: String,
    pub audience: String,
    pub auto_init_engine: bool,
    pub max_answer_tokens: usize,
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            model_id: "omnineural-4b".into(),
            preferred_backend: String::new(),
            audience: "general".into(),
            auto_init_engine: true,
            max_answer_tokens: 512,
        }
    }
}

pub struct SettingsManager {
    path: PathBuf,
    inner: RwLock<FrontendSettings>,
}

impl SettingsManager {
    pub fn new() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let settings = load_settings(&config_path).unwrap_or_default();
        Ok(Self {
            path: config_path,
            inner: RwLock::new(settings),
        })
    }

    #[cfg(test)]
    fn at(path: PathBuf) -> Self {
        let settings = load_settings(&path).unwrap_or_default();
        Self {
            path,
            inner: RwLock::new(settings),
        }
    }

    pub fn read(&self) -> FrontendSettings {
        self.inner.read().clone()
    }

    pub fn write(&self, settings: FrontendSettings) -> Result<()> {
        let mut guard = self.inner.write();
        *guard = settings;
        persist_settings(self.path.as_path(), &guard)
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs =
        ProjectDirs::from("com", "LifeLens", "LifeLens").context("missing project directories")?;
    let dir = project_dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}

fn load_settings(path: &Path) -> Result<FrontendSettings> {
    if !path.exists() {
        return Ok(FrontendSettings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    let parsed = serde_json::from_slice(&bytes).context("config json could not be parsed")?;
    Ok(parsed)
}

fn persist_settings(path: &Path, settings: &FrontendSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let manager = SettingsManager::at(path.clone());
        let mut settings = manager.read();
        settings.model_id = "smolvlm2-2.2b-instruct".into();
        settings.preferred_backend = "cpu-gpu".into();
        settings.auto_init_engine = false;
        manager.write(settings).unwrap();

        let reloaded = SettingsManager::at(path);
        let settings = reloaded.read();
        assert_eq!(settings.model_id, "smolvlm2-2.2b-instruct");
        assert_eq!(settings.preferred_backend, "cpu-gpu");
        assert!(!settings.auto_init_engine);
    }

    #[test]
    fn corrupt_config_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, b"not json at all").unwrap();

        let manager = SettingsManager::at(path);
        assert_eq!(manager.read().model_id, "omnineural-4b");
    }
}
