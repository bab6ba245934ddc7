use shared::error::ApiError;
use thiserror::Error;

/// User-visible conditions surfaced by the engine. Raw transport failures are
/// translated into one of these before they reach chat state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),
    #[error("pairing is no longer valid: {0}")]
    Unauthorized(String),
    #[error("failed to load messages: {0}")]
    LoadFailed(String),
    #[error("failed to send message: {0}")]
    SendFailed(String),
    #[error("event stream disconnected")]
    StreamDisconnected,
    #[error("session corrupted after assistant error")]
    SessionCorrupted { last_good_message_id: String },
    #[error("failed to revert: {0}")]
    RevertFailed(String),
    #[error("failed to fork: {0}")]
    ForkFailed(String),
    #[error("failed to create session: {0}")]
    CreateFailed(String),
    #[error("failed to abort: {0}")]
    AbortFailed(String),
    #[error("failed to reply to permission request: {0}")]
    PermissionReplyFailed(String),
}

const TRANSIENT_NETWORK_MARKERS: &[&str] = &[
    "connection reset",
    "connection closed",
    "connection aborted",
    "broken pipe",
    "connection was lost",
    "unexpected eof",
    "incomplete message",
    "nsurlerrordomain",
    "kcferrordomaincfnetwork",
    "code=-1005",
];

/// Dropped lower-level connections where the server may still have accepted
/// the request.
pub fn is_transient_network_error(err: &ApiError) -> bool {
    let ApiError::Network { message } = err else {
        return false;
    };
    let message = message.to_ascii_lowercase();
    TRANSIENT_NETWORK_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Flattens an error and its sources into one line.
pub fn flatten_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

pub fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    if let Some(status) = err.status() {
        return ApiError::from_status(status.as_u16(), "");
    }
    if err.is_decode() {
        return ApiError::parse(flatten_error_chain(&err));
    }
    ApiError::network(flatten_error_chain(&err))
}
