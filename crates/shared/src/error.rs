use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by REST calls and assistant message errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApiError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("message aborted: {message}")]
    MessageAborted { message: String },
    #[error("output length exceeded: {message}")]
    MessageOutputLength { message: String },
    #[error("provider auth error: {message}")]
    ProviderAuth {
        provider_id: Option<String>,
        message: String,
    },
    #[error("{name}: {message}")]
    Api {
        name: String,
        message: String,
        status: Option<u16>,
    },
    #[error("parse error: {message}")]
    Parse { message: String },
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Maps a server-reported error name to its variant.
    pub fn from_named(name: &str, message: Option<String>) -> Self {
        let message = message.unwrap_or_default();
        match name {
            "ProviderAuthError" => Self::ProviderAuth {
                provider_id: None,
                message,
            },
            "MessageAbortedError" => Self::MessageAborted { message },
            "MessageOutputLengthError" => Self::MessageOutputLength { message },
            "NotFoundError" => Self::NotFound { message },
            _ => Self::Api {
                name: name.to_string(),
                message,
                status: None,
            },
        }
    }

    /// Maps a non-success HTTP status plus response body to its variant.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            format!("http status {status}")
        } else {
            body.trim().to_string()
        };
        match status {
            401 => Self::Unauthorized { message },
            404 => Self::NotFound { message },
            _ => Self::Api {
                name: "HttpError".into(),
                message,
                status: Some(status),
            },
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::MessageAborted { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Network { message }
            | Self::Unauthorized { message }
            | Self::NotFound { message }
            | Self::MessageAborted { message }
            | Self::MessageOutputLength { message }
            | Self::ProviderAuth { message, .. }
            | Self::Api { message, .. }
            | Self::Parse { message } => message,
        }
    }
}
