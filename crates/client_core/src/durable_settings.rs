use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use storage::Storage;

use crate::settings::{KeyValueBackend, KeyValueSettings, SettingsError};

/// Settings persisted in the local sqlite database.
pub type DurableSettingsStore = KeyValueSettings<Storage>;

fn backend_error(err: anyhow::Error) -> SettingsError {
    SettingsError::Backend(format!("{err:#}"))
}

#[async_trait]
impl KeyValueBackend for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        self.get_setting(key).await.map_err(backend_error)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.set_setting(key, value).await.map_err(backend_error)
    }

    async fn delete(&self, key: &str) -> Result<(), SettingsError> {
        self.delete_setting(key)
            .await
            .map(|_| ())
            .map_err(backend_error)
    }
}

impl DurableSettingsStore {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize settings storage at '{database_url}'"))?;
        let settings = Self::load(store)
            .await
            .context("failed to read persisted settings")?;
        Ok(Arc::new(settings))
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!("sqlite://{}", base_dir.join("settings.db").display())
    }
}

#[cfg(test)]
#[path = "tests/durable_settings_tests.rs"]
mod tests;
