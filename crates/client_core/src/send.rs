use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Attachment, Message, ModelSelection, Part, UserMessage, PENDING_ID_PREFIX},
    protocol::{ModelRefDto, PromptPartDto, SendCommandRequest, SendMessageRequest},
};

/// What the user typed, as captured at the moment of sending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Draft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Trailing whitespace is dropped; `None` when there is nothing to send.
    pub fn normalized(self) -> Option<Self> {
        let text = self.text.trim_end().to_string();
        if text.trim().is_empty() && self.attachments.is_empty() {
            return None;
        }
        Some(Self {
            text,
            attachments: self.attachments,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    pub name: String,
    pub arguments: String,
}

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let body = input.trim_end().strip_prefix('/')?;
    let (name, arguments) = match body.find(char::is_whitespace) {
        Some(index) => (&body[..index], body[index..].trim()),
        None => (body, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some(SlashCommand {
        name: name.to_string(),
        arguments: arguments.to_string(),
    })
}

/// Agent, model and thinking variant attached to an outgoing prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptSelection {
    pub agent: Option<String>,
    pub model: Option<ModelSelection>,
    pub variant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIds {
    pub message: String,
    pub text_part: String,
    stem: String,
}

impl PendingIds {
    pub fn file_part(&self, index: usize) -> String {
        format!("{PENDING_ID_PREFIX}file-{}-{index}", self.stem)
    }
}

/// Issues ids for optimistic messages. They only need to be unique and
/// ordered among themselves.
#[derive(Debug, Default)]
pub struct PendingIdGenerator {
    seq: AtomicU64,
}

impl PendingIdGenerator {
    pub fn next(&self, now_ms: i64) -> PendingIds {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let stem = format!("{now_ms}-{seq}");
        PendingIds {
            message: format!("{PENDING_ID_PREFIX}{stem}"),
            text_part: format!("{PENDING_ID_PREFIX}text-{stem}"),
            stem,
        }
    }
}

pub fn optimistic_message(
    ids: &PendingIds,
    session_id: &str,
    draft: &Draft,
    created_at: DateTime<Utc>,
) -> Message {
    let mut parts = Vec::with_capacity(draft.attachments.len() + 1);
    if !draft.text.is_empty() {
        parts.push(Part::text(ids.text_part.clone(), draft.text.clone()));
    }
    parts.extend(
        draft
            .attachments
            .iter()
            .enumerate()
            .map(|(index, attachment)| Part::File {
                id: Some(ids.file_part(index)),
                mime: attachment.mime_type.clone(),
                filename: Some(attachment.filename.clone()),
                url: attachment.url.clone(),
            }),
    );

    Message::User(UserMessage {
        id: ids.message.clone(),
        session_id: session_id.to_string(),
        created_at,
        parts,
    })
}

fn prompt_parts(text: &str, attachments: &[Attachment]) -> Vec<PromptPartDto> {
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    if !text.is_empty() {
        parts.push(PromptPartDto::Text {
            text: text.to_string(),
        });
    }
    parts.extend(attachments.iter().map(PromptPartDto::from_attachment));
    parts
}

pub fn message_request(draft: &Draft, selection: &PromptSelection) -> SendMessageRequest {
    SendMessageRequest {
        parts: prompt_parts(&draft.text, &draft.attachments),
        model: selection.model.as_ref().map(ModelRefDto::from),
        agent: selection.agent.clone(),
        variant: selection.variant.clone(),
        system: None,
    }
}

pub fn command_request(
    command: &SlashCommand,
    attachments: &[Attachment],
    selection: &PromptSelection,
) -> SendCommandRequest {
    SendCommandRequest {
        command: command.name.clone(),
        arguments: command.arguments.clone(),
        agent: selection.agent.clone(),
        model: selection
            .model
            .as_ref()
            .map(|model| format!("{}/{}", model.provider_id, model.model_id)),
        variant: selection.variant.clone(),
        parts: prompt_parts("", attachments),
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
