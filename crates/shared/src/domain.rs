use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Prefix shared by every locally fabricated message and part id.
pub const PENDING_ID_PREFIX: &str = "pending-";

pub fn is_pending_id(id: &str) -> bool {
    id.starts_with(PENDING_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("running") => Self::Running,
            Some("completed") => Self::Completed,
            Some("error") => Self::Error,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolTime {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub compacted: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        id: Option<String>,
        text: String,
        synthetic: bool,
    },
    Reasoning {
        id: Option<String>,
        text: String,
    },
    Tool {
        id: Option<String>,
        call_id: String,
        tool: String,
        state: ToolStatus,
        input: Option<String>,
        output: Option<String>,
        error: Option<String>,
        title: Option<String>,
        metadata: Option<String>,
        time: Option<ToolTime>,
        attachments: Vec<Part>,
    },
    File {
        id: Option<String>,
        mime: String,
        filename: Option<String>,
        url: String,
    },
    StepStart {
        id: Option<String>,
        snapshot: Option<String>,
    },
    StepFinish {
        id: Option<String>,
        reason: String,
        snapshot: Option<String>,
        cost: Option<f64>,
        tokens: Option<TokenUsage>,
    },
    Snapshot {
        id: Option<String>,
        snapshot: String,
    },
    Patch {
        id: Option<String>,
        hash: String,
        files: Vec<String>,
    },
    Agent {
        id: Option<String>,
        name: String,
    },
    Retry {
        id: Option<String>,
        attempt: u32,
        error: Option<ApiError>,
    },
    Compaction {
        id: Option<String>,
        auto: bool,
    },
    Unknown {
        id: Option<String>,
        kind: String,
        raw_data: String,
    },
}

impl Part {
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Text {
            id: Some(id.into()),
            text: text.into(),
            synthetic: false,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Part::Text { id, .. }
            | Part::Reasoning { id, .. }
            | Part::Tool { id, .. }
            | Part::File { id, .. }
            | Part::StepStart { id, .. }
            | Part::StepFinish { id, .. }
            | Part::Snapshot { id, .. }
            | Part::Patch { id, .. }
            | Part::Agent { id, .. }
            | Part::Retry { id, .. }
            | Part::Compaction { id, .. }
            | Part::Unknown { id, .. } => id.as_deref(),
        }
    }

    /// Parts that can only originate from an assistant turn. Text, file and
    /// snapshot parts may belong to either role.
    pub fn is_assistant_only(&self) -> bool {
        match self {
            Part::Tool { .. }
            | Part::Reasoning { .. }
            | Part::StepStart { .. }
            | Part::StepFinish { .. }
            | Part::Patch { .. }
            | Part::Agent { .. }
            | Part::Retry { .. }
            | Part::Compaction { .. }
            | Part::Unknown { .. } => true,
            Part::Text { .. } | Part::File { .. } | Part::Snapshot { .. } => false,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, Part::Snapshot { .. })
    }

    pub fn is_pending(&self) -> bool {
        self.id().is_some_and(is_pending_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub parts: Vec<Part>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ApiError>,
    pub cost: Option<f64>,
    pub tokens: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

impl AssistantMessage {
    pub fn placeholder(
        id: impl Into<String>,
        session_id: impl Into<String>,
        created_at: DateTime<Utc>,
        parts: Vec<Part>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            created_at,
            parts,
            completed_at: None,
            error: None,
            cost: None,
            tokens: None,
            finish_reason: None,
            provider_id: None,
            model_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::User(message) => &message.id,
            Message::Assistant(message) => &message.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Message::User(message) => &message.session_id,
            Message::Assistant(message) => &message.session_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Message::User(message) => message.created_at,
            Message::Assistant(message) => message.created_at,
        }
    }

    pub fn parts(&self) -> &[Part] {
        match self {
            Message::User(message) => &message.parts,
            Message::Assistant(message) => &message.parts,
        }
    }

    pub fn parts_mut(&mut self) -> &mut Vec<Part> {
        match self {
            Message::User(message) => &mut message.parts,
            Message::Assistant(message) => &mut message.parts,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::User(_) => Role::User,
            Message::Assistant(_) => Role::Assistant,
        }
    }

    pub fn is_pending(&self) -> bool {
        is_pending_id(self.id())
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User(_))
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant(_))
    }

    pub fn error(&self) -> Option<&ApiError> {
        match self {
            Message::User(_) => None,
            Message::Assistant(message) => message.error.as_ref(),
        }
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        match self {
            Message::User(message) => message.id = id,
            Message::Assistant(message) => message.id = id,
        }
    }

    pub fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        match self {
            Message::User(message) => message.created_at = created_at,
            Message::Assistant(message) => message.created_at = created_at,
        }
    }

    /// Converts between roles while keeping identity and parts. Assistant-only
    /// metadata is dropped when converting to a user message.
    pub fn with_role(self, role: Role) -> Self {
        match (self, role) {
            (Message::User(user), Role::Assistant) => Message::Assistant(
                AssistantMessage::placeholder(user.id, user.session_id, user.created_at, user.parts),
            ),
            (Message::Assistant(assistant), Role::User) => Message::User(UserMessage {
                id: assistant.id,
                session_id: assistant.session_id,
                created_at: assistant.created_at,
                parts: assistant.parts,
            }),
            (message, _) => message,
        }
    }

    /// Plain text of the non-synthetic text parts, newline-joined.
    pub fn plain_text(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|part| match part {
                Part::Text {
                    text,
                    synthetic: false,
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRevert {
    pub message_id: String,
    pub part_id: Option<String>,
    pub snapshot: Option<String>,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: Option<String>,
    pub directory: String,
    pub title: Option<String>,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub revert: Option<SessionRevert>,
}

impl Session {
    pub fn revert_message_id(&self) -> Option<&str> {
        self.revert
            .as_ref()
            .map(|revert| revert.message_id.as_str())
            .filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Error,
}

impl SessionStatus {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "busy" | "retry" | "running" => Self::Running,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub permission: String,
    pub patterns: Vec<String>,
    pub always: Vec<String>,
    pub tool_message_id: Option<String>,
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

impl PermissionReply {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "once" => Some(Self::Once),
            "always" => Some(Self::Always),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileWatcherChange {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: Option<String>,
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelSelection {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Key used for per-model overrides such as the thinking variant.
    pub fn settings_key(&self) -> String {
        format!("{}:{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    /// Already-encoded payload (data url or remote url).
    pub url: String,
}

/// Domain view of a push event after wire decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MessagePartUpdated {
        directory: String,
        session_id: String,
        message_id: String,
        part: Part,
        delta: Option<String>,
    },
    MessageUpdated {
        directory: String,
        session_id: String,
        message_id: String,
        role: String,
        created_at: DateTime<Utc>,
    },
    MessageRemoved {
        directory: String,
        session_id: String,
        message_id: String,
    },
    SessionCreated {
        directory: String,
        session: Session,
    },
    SessionUpdated {
        directory: String,
        session: Session,
    },
    SessionDeleted {
        directory: String,
        session: Session,
    },
    SessionStatus {
        directory: String,
        session_id: String,
        status: SessionStatus,
    },
    FileWatcherUpdated {
        directory: String,
        file: String,
        change: FileWatcherChange,
    },
    PermissionAsked {
        directory: String,
        request: PermissionRequest,
    },
    PermissionReplied {
        directory: String,
        session_id: String,
        request_id: String,
        reply: String,
    },
    Unknown {
        directory: String,
        event_type: String,
        raw: String,
    },
}

impl Event {
    pub fn directory(&self) -> &str {
        match self {
            Event::MessagePartUpdated { directory, .. }
            | Event::MessageUpdated { directory, .. }
            | Event::MessageRemoved { directory, .. }
            | Event::SessionCreated { directory, .. }
            | Event::SessionUpdated { directory, .. }
            | Event::SessionDeleted { directory, .. }
            | Event::SessionStatus { directory, .. }
            | Event::FileWatcherUpdated { directory, .. }
            | Event::PermissionAsked { directory, .. }
            | Event::PermissionReplied { directory, .. }
            | Event::Unknown { directory, .. } => directory,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::MessagePartUpdated { .. } => "message.part.updated",
            Event::MessageUpdated { .. } => "message.updated",
            Event::MessageRemoved { .. } => "message.removed",
            Event::SessionCreated { .. } => "session.created",
            Event::SessionUpdated { .. } => "session.updated",
            Event::SessionDeleted { .. } => "session.deleted",
            Event::SessionStatus { .. } => "session.status",
            Event::FileWatcherUpdated { .. } => "file.watcher.updated",
            Event::PermissionAsked { .. } => "permission.asked",
            Event::PermissionReplied { .. } => "permission.replied",
            Event::Unknown { .. } => "unknown",
        }
    }
}
