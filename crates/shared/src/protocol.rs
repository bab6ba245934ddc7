use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        AssistantMessage, Attachment, CommandInfo, Event, FileWatcherChange, Message,
        ModelSelection, Part, PermissionRequest, Session, SessionRevert, SessionStatus,
        TokenUsage, ToolStatus, ToolTime, UserMessage,
    },
    error::ApiError,
};

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDto {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorDto {
    /// Named errors nest the message under `data.message`; legacy errors carry
    /// it at the top level.
    pub fn extract_message(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| data.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.message.clone())
    }

    pub fn into_domain(self) -> ApiError {
        let message = self.extract_message();
        ApiError::from_named(&self.name, message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheUsageDto {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsageDto {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheUsageDto>,
}

impl TokenUsageDto {
    pub fn into_domain(self) -> TokenUsage {
        let cache = self.cache.unwrap_or_default();
        TokenUsage {
            input: self.input,
            output: self.output,
            reasoning: self.reasoning,
            cache_read: cache.read,
            cache_write: cache.write,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolTimeDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStateDto {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<ToolTimeDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<PartDto>>,
}

/// Untagged part shape: optional fields cover every part type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    #[serde(rename = "callID", default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ToolStateDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsageDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<bool>,
}

impl PartDto {
    pub fn into_domain(self) -> Part {
        let raw_data = serde_json::to_string(&self).unwrap_or_default();
        let PartDto {
            id,
            kind,
            text,
            synthetic,
            call_id,
            tool,
            state,
            mime,
            filename,
            url,
            snapshot,
            reason,
            cost,
            tokens,
            hash,
            files,
            name,
            attempt,
            error,
            auto,
            ..
        } = self;

        match kind.as_str() {
            "text" => Part::Text {
                id,
                text: text.unwrap_or_default(),
                synthetic: synthetic.unwrap_or(false),
            },
            "reasoning" => Part::Reasoning {
                id,
                text: text.unwrap_or_default(),
            },
            "tool" => {
                let status = ToolStatus::parse(state.as_ref().map(|s| s.status.as_str()));
                let state = state.unwrap_or(ToolStateDto {
                    status: String::new(),
                    input: None,
                    output: None,
                    error: None,
                    title: None,
                    metadata: None,
                    time: None,
                    attachments: None,
                });
                Part::Tool {
                    id,
                    call_id: call_id.unwrap_or_default(),
                    tool: tool.unwrap_or_default(),
                    state: status,
                    input: state.input.map(|value| value.to_string()),
                    output: state.output,
                    error: state.error,
                    title: state.title,
                    metadata: state.metadata.map(|value| value.to_string()),
                    time: state.time.map(|time| ToolTime {
                        start: time.start,
                        end: time.end,
                        compacted: time.compacted,
                    }),
                    attachments: state
                        .attachments
                        .unwrap_or_default()
                        .into_iter()
                        .map(PartDto::into_domain)
                        .collect(),
                }
            }
            "file" => Part::File {
                id,
                mime: mime.unwrap_or_default(),
                filename,
                url: url.unwrap_or_default(),
            },
            "step-start" => Part::StepStart { id, snapshot },
            "step-finish" => Part::StepFinish {
                id,
                reason: reason.unwrap_or_default(),
                snapshot,
                cost,
                tokens: tokens.map(TokenUsageDto::into_domain),
            },
            "snapshot" => Part::Snapshot {
                id,
                snapshot: snapshot.unwrap_or_default(),
            },
            "patch" => Part::Patch {
                id,
                hash: hash.unwrap_or_default(),
                files: files.unwrap_or_default(),
            },
            "agent" => Part::Agent {
                id,
                name: name.unwrap_or_default(),
            },
            "retry" => Part::Retry {
                id,
                attempt: attempt.unwrap_or(0),
                error: error.map(ErrorDto::into_domain),
            },
            "compaction" => Part::Compaction {
                id,
                auto: auto.unwrap_or(false),
            },
            _ => Part::Unknown { id, kind, raw_data },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageTimeDto {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInfoDto {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: String,
    #[serde(default)]
    pub time: MessageTimeDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsageDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl MessageInfoDto {
    fn into_assistant(self, parts: Vec<Part>) -> AssistantMessage {
        AssistantMessage {
            id: self.id,
            session_id: self.session_id,
            created_at: millis_to_datetime(self.time.created),
            parts,
            completed_at: self.time.completed.map(millis_to_datetime),
            error: self.error.map(ErrorDto::into_domain),
            cost: self.cost,
            tokens: self.tokens.map(TokenUsageDto::into_domain),
            finish_reason: self.finish,
            provider_id: self.provider_id,
            model_id: self.model_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageWithPartsDto {
    pub info: MessageInfoDto,
    #[serde(default)]
    pub parts: Vec<PartDto>,
}

impl MessageWithPartsDto {
    pub fn into_domain(self) -> Result<Message, ApiError> {
        let parts = self.parts.into_iter().map(PartDto::into_domain).collect();
        match self.info.role.as_str() {
            "user" => Ok(Message::User(UserMessage {
                id: self.info.id,
                session_id: self.info.session_id,
                created_at: millis_to_datetime(self.info.time.created),
                parts,
            })),
            "assistant" => Ok(Message::Assistant(self.info.into_assistant(parts))),
            other => Err(ApiError::parse(format!("unknown message role: {other}"))),
        }
    }

    /// Send responses always describe the assistant reply.
    pub fn into_assistant(self) -> AssistantMessage {
        let parts = self.parts.into_iter().map(PartDto::into_domain).collect();
        self.info.into_assistant(parts)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTimeDto {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRevertDto {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "partID", default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDto {
    pub id: String,
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub time: SessionTimeDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<SessionRevertDto>,
}

impl SessionDto {
    pub fn into_domain(self) -> Session {
        Session {
            id: self.id,
            project_id: self.project_id,
            directory: self.directory,
            title: self.title,
            version: self.version,
            created_at: millis_to_datetime(self.time.created),
            updated_at: millis_to_datetime(self.time.updated),
            parent_id: self.parent_id,
            revert: self.revert.map(|revert| SessionRevert {
                message_id: revert.message_id,
                part_id: revert.part_id,
                snapshot: revert.snapshot,
                diff: revert.diff,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionToolDto {
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "callID", default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequestDto {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub always: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<PermissionToolDto>,
}

impl PermissionRequestDto {
    pub fn into_domain(self) -> PermissionRequest {
        let tool = self.tool.unwrap_or_default();
        PermissionRequest {
            request_id: self.id,
            session_id: self.session_id,
            permission: self.permission,
            patterns: self.patterns,
            always: self.always,
            tool_message_id: tool.message_id,
            tool_call_id: tool.call_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDto {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub hints: Vec<String>,
}

impl CommandDto {
    pub fn into_domain(self) -> CommandInfo {
        CommandInfo {
            name: self.name,
            description: self.description,
            hints: self.hints,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptPartDto {
    Text {
        text: String,
    },
    File {
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        url: String,
    },
}

impl PromptPartDto {
    pub fn from_attachment(attachment: &Attachment) -> Self {
        Self::File {
            mime: attachment.mime_type.clone(),
            filename: Some(attachment.filename.clone()),
            url: attachment.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRefDto {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl From<&ModelSelection> for ModelRefDto {
    fn from(value: &ModelSelection) -> Self {
        Self {
            provider_id: value.provider_id.clone(),
            model_id: value.model_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub parts: Vec<PromptPartDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendCommandRequest {
    pub command: String,
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// `provider/model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<PromptPartDto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkSessionRequest {
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertSessionRequest {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "partID", default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionReplyRequest {
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Interprets the loosely typed body of an abort response.
pub fn parse_abort_response(body: &str) -> bool {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Bool(value)) => value,
        Ok(Value::Object(map)) => ["success", "ok", "aborted"]
            .iter()
            .any(|key| map.get(*key).and_then(Value::as_bool) == Some(true)),
        _ => trimmed.eq_ignore_ascii_case("true"),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GlobalEventDto {
    #[serde(default)]
    directory: String,
    payload: EventPayloadDto,
}

#[derive(Debug, Clone, Deserialize)]
struct EventPayloadDto {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    properties: Value,
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: PartDto,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct MessageUpdatedProps {
    info: MessageInfoDto,
}

#[derive(Deserialize)]
struct MessageRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
}

#[derive(Deserialize)]
struct SessionInfoProps {
    info: SessionDto,
}

#[derive(Deserialize)]
struct StatusDto {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct SessionStatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: StatusDto,
}

#[derive(Deserialize)]
struct SessionIdProps {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct FileWatcherProps {
    file: String,
    event: FileWatcherChange,
}

#[derive(Deserialize)]
struct PermissionRepliedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID")]
    request_id: String,
    reply: String,
}

/// Decodes one SSE frame into a domain event. The `event:` field wins over
/// `payload.type` when both are present. Undecodable frames map to
/// [`Event::Unknown`] so a single bad frame never ends the stream.
pub fn decode_event(event_name: Option<&str>, data: &str) -> Event {
    let envelope = match serde_json::from_str::<GlobalEventDto>(data) {
        Ok(envelope) => envelope,
        Err(_) => {
            return Event::Unknown {
                directory: String::new(),
                event_type: event_name.unwrap_or("unknown").to_string(),
                raw: data.to_string(),
            }
        }
    };
    let event_type = event_name
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or(envelope.payload.kind.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let directory = envelope.directory;
    let properties = envelope.payload.properties;

    decode_properties(&event_type, directory.clone(), properties.clone()).unwrap_or_else(|| {
        Event::Unknown {
            directory,
            event_type,
            raw: properties.to_string(),
        }
    })
}

fn decode_properties(event_type: &str, directory: String, properties: Value) -> Option<Event> {
    let event = match event_type {
        "message.part.updated" => {
            let props: PartUpdatedProps = serde_json::from_value(properties).ok()?;
            let session_id = props.part.session_id.clone()?;
            let message_id = props.part.message_id.clone()?;
            Event::MessagePartUpdated {
                directory,
                session_id,
                message_id,
                part: props.part.into_domain(),
                delta: props.delta,
            }
        }
        "message.updated" => {
            let props: MessageUpdatedProps = serde_json::from_value(properties).ok()?;
            Event::MessageUpdated {
                directory,
                session_id: props.info.session_id,
                message_id: props.info.id,
                role: props.info.role,
                created_at: millis_to_datetime(props.info.time.created),
            }
        }
        "message.removed" => {
            let props: MessageRemovedProps = serde_json::from_value(properties).ok()?;
            Event::MessageRemoved {
                directory,
                session_id: props.session_id,
                message_id: props.message_id,
            }
        }
        "session.created" | "session.updated" | "session.deleted" => {
            let props: SessionInfoProps = serde_json::from_value(properties).ok()?;
            let session = props.info.into_domain();
            match event_type {
                "session.created" => Event::SessionCreated { directory, session },
                "session.updated" => Event::SessionUpdated { directory, session },
                _ => Event::SessionDeleted { directory, session },
            }
        }
        "session.status" => {
            let props: SessionStatusProps = serde_json::from_value(properties).ok()?;
            Event::SessionStatus {
                directory,
                session_id: props.session_id,
                status: SessionStatus::from_wire(&props.status.kind),
            }
        }
        "session.idle" | "session.error" => {
            let props: SessionIdProps = serde_json::from_value(properties).ok()?;
            let status = if event_type == "session.idle" {
                SessionStatus::Idle
            } else {
                SessionStatus::Error
            };
            Event::SessionStatus {
                directory,
                session_id: props.session_id.unwrap_or_default(),
                status,
            }
        }
        "file.watcher.updated" => {
            let props: FileWatcherProps = serde_json::from_value(properties).ok()?;
            Event::FileWatcherUpdated {
                directory,
                file: props.file,
                change: props.event,
            }
        }
        "permission.asked" | "permission.updated" => {
            let props: PermissionRequestDto = serde_json::from_value(properties).ok()?;
            Event::PermissionAsked {
                directory,
                request: props.into_domain(),
            }
        }
        "permission.replied" => {
            let props: PermissionRepliedProps = serde_json::from_value(properties).ok()?;
            Event::PermissionReplied {
                directory,
                session_id: props.session_id,
                request_id: props.request_id,
                reply: props.reply,
            }
        }
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
