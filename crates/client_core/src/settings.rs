use std::collections::HashMap;

use async_trait::async_trait;
use shared::domain::ModelSelection;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

pub const CURRENT_SESSION_KEY: &str = "current_session_id";
pub const SELECTED_AGENT_KEY: &str = "selected_agent";
pub const SELECTED_MODEL_KEY: &str = "selected_model";
pub const FAVORITE_MODELS_KEY: &str = "favorite_models";
pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const THINKING_VARIANT_PREFIX: &str = "thinking_variant:";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings backend failed: {0}")]
    Backend(String),
    #[error("stored value for '{key}' is invalid: {message}")]
    Corrupt { key: String, message: String },
}

/// Local preferences the engine reads when sending and writes when the
/// active session or pairing changes.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn current_session_id(&self) -> Result<Option<String>, SettingsError>;
    async fn set_current_session_id(&self, session_id: Option<&str>) -> Result<(), SettingsError>;
    async fn selected_agent(&self) -> Result<Option<String>, SettingsError>;
    async fn set_selected_agent(&self, agent: Option<&str>) -> Result<(), SettingsError>;
    async fn selected_model(&self) -> Result<Option<ModelSelection>, SettingsError>;
    async fn set_selected_model(&self, model: Option<&ModelSelection>)
        -> Result<(), SettingsError>;
    async fn thinking_variant(
        &self,
        model: &ModelSelection,
    ) -> Result<Option<String>, SettingsError>;
    async fn set_thinking_variant(
        &self,
        model: &ModelSelection,
        variant: Option<&str>,
    ) -> Result<(), SettingsError>;
    async fn favorite_models(&self) -> Result<Vec<ModelSelection>, SettingsError>;
    async fn set_favorite_models(&self, models: &[ModelSelection]) -> Result<(), SettingsError>;
    async fn auth_token(&self) -> Result<Option<String>, SettingsError>;
    async fn set_auth_token(&self, token: Option<&str>) -> Result<(), SettingsError>;

    fn watch_current_session_id(&self) -> watch::Receiver<Option<String>>;
    fn watch_selected_model(&self) -> watch::Receiver<Option<ModelSelection>>;
    fn watch_favorite_models(&self) -> watch::Receiver<Vec<ModelSelection>>;
}

/// Raw string storage behind [`KeyValueSettings`].
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), SettingsError>;
    async fn delete(&self, key: &str) -> Result<(), SettingsError>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SettingsError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// Typed settings over a string key-value backend. Observable values are
/// mirrored into watch channels on every write.
pub struct KeyValueSettings<B> {
    backend: B,
    current_session_tx: watch::Sender<Option<String>>,
    selected_model_tx: watch::Sender<Option<ModelSelection>>,
    favorite_models_tx: watch::Sender<Vec<ModelSelection>>,
}

pub type InMemorySettings = KeyValueSettings<MemoryBackend>;

impl InMemorySettings {
    pub fn in_memory() -> Self {
        Self::with_initial(MemoryBackend::default(), None, None, Vec::new())
    }
}

impl<B: KeyValueBackend> KeyValueSettings<B> {
    fn with_initial(
        backend: B,
        current_session_id: Option<String>,
        selected_model: Option<ModelSelection>,
        favorite_models: Vec<ModelSelection>,
    ) -> Self {
        let (current_session_tx, _) = watch::channel(current_session_id);
        let (selected_model_tx, _) = watch::channel(selected_model);
        let (favorite_models_tx, _) = watch::channel(favorite_models);
        Self {
            backend,
            current_session_tx,
            selected_model_tx,
            favorite_models_tx,
        }
    }

    /// Wraps a backend that may already hold values, priming the watchers.
    pub async fn load(backend: B) -> Result<Self, SettingsError> {
        let current_session_id = backend.get(CURRENT_SESSION_KEY).await?;
        let selected_model = decode_json(SELECTED_MODEL_KEY, backend.get(SELECTED_MODEL_KEY).await?)?;
        let favorite_models =
            decode_json(FAVORITE_MODELS_KEY, backend.get(FAVORITE_MODELS_KEY).await?)?
                .unwrap_or_default();
        Ok(Self::with_initial(
            backend,
            current_session_id,
            selected_model,
            favorite_models,
        ))
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn put_optional(&self, key: &str, value: Option<&str>) -> Result<(), SettingsError> {
        match value {
            Some(value) => self.backend.put(key, value).await,
            None => self.backend.delete(key).await,
        }
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(
    key: &str,
    raw: Option<String>,
) -> Result<Option<T>, SettingsError> {
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|err| SettingsError::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        })
    })
    .transpose()
}

fn encode_json<T: serde::Serialize>(key: &str, value: &T) -> Result<String, SettingsError> {
    serde_json::to_string(value).map_err(|err| SettingsError::Corrupt {
        key: key.to_string(),
        message: err.to_string(),
    })
}

fn thinking_variant_key(model: &ModelSelection) -> String {
    format!("{THINKING_VARIANT_PREFIX}{}", model.settings_key())
}

fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            return false;
        }
        *current = value;
        true
    });
}

#[async_trait]
impl<B: KeyValueBackend> SettingsStore for KeyValueSettings<B> {
    async fn current_session_id(&self) -> Result<Option<String>, SettingsError> {
        self.backend.get(CURRENT_SESSION_KEY).await
    }

    async fn set_current_session_id(&self, session_id: Option<&str>) -> Result<(), SettingsError> {
        self.put_optional(CURRENT_SESSION_KEY, session_id).await?;
        publish(&self.current_session_tx, session_id.map(str::to_string));
        Ok(())
    }

    async fn selected_agent(&self) -> Result<Option<String>, SettingsError> {
        self.backend.get(SELECTED_AGENT_KEY).await
    }

    async fn set_selected_agent(&self, agent: Option<&str>) -> Result<(), SettingsError> {
        self.put_optional(SELECTED_AGENT_KEY, agent).await
    }

    async fn selected_model(&self) -> Result<Option<ModelSelection>, SettingsError> {
        decode_json(SELECTED_MODEL_KEY, self.backend.get(SELECTED_MODEL_KEY).await?)
    }

    async fn set_selected_model(
        &self,
        model: Option<&ModelSelection>,
    ) -> Result<(), SettingsError> {
        let encoded = model
            .map(|model| encode_json(SELECTED_MODEL_KEY, model))
            .transpose()?;
        self.put_optional(SELECTED_MODEL_KEY, encoded.as_deref())
            .await?;
        publish(&self.selected_model_tx, model.cloned());
        Ok(())
    }

    async fn thinking_variant(
        &self,
        model: &ModelSelection,
    ) -> Result<Option<String>, SettingsError> {
        self.backend.get(&thinking_variant_key(model)).await
    }

    async fn set_thinking_variant(
        &self,
        model: &ModelSelection,
        variant: Option<&str>,
    ) -> Result<(), SettingsError> {
        let variant = variant.filter(|variant| !variant.trim().is_empty());
        self.put_optional(&thinking_variant_key(model), variant)
            .await
    }

    async fn favorite_models(&self) -> Result<Vec<ModelSelection>, SettingsError> {
        Ok(
            decode_json(FAVORITE_MODELS_KEY, self.backend.get(FAVORITE_MODELS_KEY).await?)?
                .unwrap_or_default(),
        )
    }

    async fn set_favorite_models(&self, models: &[ModelSelection]) -> Result<(), SettingsError> {
        let encoded = encode_json(FAVORITE_MODELS_KEY, &models)?;
        self.backend.put(FAVORITE_MODELS_KEY, &encoded).await?;
        publish(&self.favorite_models_tx, models.to_vec());
        Ok(())
    }

    async fn auth_token(&self) -> Result<Option<String>, SettingsError> {
        self.backend.get(AUTH_TOKEN_KEY).await
    }

    async fn set_auth_token(&self, token: Option<&str>) -> Result<(), SettingsError> {
        self.put_optional(AUTH_TOKEN_KEY, token).await
    }

    fn watch_current_session_id(&self) -> watch::Receiver<Option<String>> {
        self.current_session_tx.subscribe()
    }

    fn watch_selected_model(&self) -> watch::Receiver<Option<ModelSelection>> {
        self.selected_model_tx.subscribe()
    }

    fn watch_favorite_models(&self) -> watch::Receiver<Vec<ModelSelection>> {
        self.favorite_models_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
