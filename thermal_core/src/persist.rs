//! File-backed settings store for the thermal model.

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use thermal_config::PersistedModel;

use crate::atomic::write_atomic;
use crate::error::Result;
use crate::model::ModelSettings;
use crate::ports::SettingsStore;

/// Keeps model settings in a TOML file, rewritten atomically on save.
#[derive(Debug, Clone)]
pub struct TomlFileStore {
    path: PathBuf,
}

impl TomlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlFileStore {
    fn load(&mut self) -> Result<Option<ModelSettings>> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no stored model settings");
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .wrap_err_with(|| format!("read {}", self.path.display()))?;
        let persisted = PersistedModel::from_toml_str(&text)
            .wrap_err_with(|| format!("parse {}", self.path.display()))?;
        Ok(Some(ModelSettings::from(&persisted)))
    }

    fn save(&mut self, settings: &ModelSettings) -> Result<()> {
        let text = PersistedModel::from(settings).to_toml_string()?;
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).wrap_err_with(|| format!("create {}", dir.display()))?;
        }
        write_atomic(&self.path, text.as_bytes())
            .wrap_err_with(|| format!("write {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), "model settings written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TomlFileStore::new(dir.path().join("absent.toml"));
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = TomlFileStore::new(dir.path().join("state").join("model.toml"));
        let mut settings = ModelSettings::default();
        settings.params.c = 12.5;
        settings.params.r = [18.0; crate::model::R_SIZE];
        settings.enabled = true;
        store.save(&settings).expect("save");

        let back = store.load().expect("load").expect("stored");
        assert!(back.enabled);
        assert!((back.params.c - 12.5).abs() < 1e-6);
        assert!(back.params.r.iter().all(|r| (*r - 18.0).abs() < 1e-6));
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.toml");
        std::fs::write(&path, "c = [").expect("write");
        let mut store = TomlFileStore::new(path);
        assert!(store.load().is_err());
    }
}
