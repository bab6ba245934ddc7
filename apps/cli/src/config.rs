use std::{fs, time::Duration};

use client_core::{EngineConfig, HttpTransportConfig, ReconnectConfig};

pub const CONFIG_FILE: &str = "opencode.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    pub auth_token: Option<String>,
    pub directory: Option<String>,
    pub database_url: String,
    pub request_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub linger_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4096".into(),
            auth_token: None,
            directory: None,
            database_url: "sqlite://./data/oc-tail.db".into(),
            request_timeout_secs: 30,
            send_timeout_secs: 300,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 5_000,
            linger_ms: 5_000,
        }
    }
}

impl Settings {
    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            base_url: self.server_url.clone(),
            auth_token: self.auth_token.clone(),
            directory: self.directory.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            ..HttpTransportConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                linger: Duration::from_millis(self.linger_ms),
                ..ReconnectConfig::default()
            },
            ..EngineConfig::default()
        }
    }
}

/// Defaults, then `opencode.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(CONFIG_FILE) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Applies a flat TOML table. Unknown keys and malformed files are ignored.
pub fn apply_file(settings: &mut Settings, raw: &str) {
    let Ok(table) = toml::from_str::<toml::Table>(raw) else {
        return;
    };
    let string = |key: &str| table.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let number = |key: &str| {
        table
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u64::try_from(v).ok())
    };

    if let Some(v) = string("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = string("auth_token") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = string("directory") {
        settings.directory = Some(v);
    }
    if let Some(v) = string("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = number("request_timeout_secs") {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = number("send_timeout_secs") {
        settings.send_timeout_secs = v;
    }
    if let Some(v) = number("reconnect_initial_ms") {
        settings.reconnect_initial_ms = v;
    }
    if let Some(v) = number("reconnect_max_ms") {
        settings.reconnect_max_ms = v;
    }
    if let Some(v) = number("linger_ms") {
        settings.linger_ms = v;
    }
}

pub fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("OPENCODE_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("OPENCODE_AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = var("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }

    if let Some(v) = var("APP__DIRECTORY") {
        settings.directory = Some(v);
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    let number = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(v) = number("APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = number("APP__SEND_TIMEOUT_SECS") {
        settings.send_timeout_secs = v;
    }
    if let Some(v) = number("APP__RECONNECT_INITIAL_MS") {
        settings.reconnect_initial_ms = v;
    }
    if let Some(v) = number("APP__RECONNECT_MAX_MS") {
        settings.reconnect_max_ms = v;
    }
    if let Some(v) = number("APP__LINGER_MS") {
        settings.linger_ms = v;
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
