use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        is_pending_id, AssistantMessage, Attachment, Event, Message, Part, PermissionRequest,
        Role, Session, SessionStatus, UserMessage,
    },
    error::ApiError,
};
use tracing::debug;

use crate::{
    connection::ConnectionState, error::ChatError, merge::merge_streaming_part,
    permissions::PermissionQueue, revert::visible,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionUiStatus {
    #[default]
    Idle,
    Processing,
    Error,
}

impl From<SessionStatus> for SessionUiStatus {
    fn from(value: SessionStatus) -> Self {
        match value {
            SessionStatus::Idle => Self::Idle,
            SessionStatus::Running => Self::Processing,
            SessionStatus::Error => Self::Error,
        }
    }
}

/// Follow-up work requested by a transition. The engine runs it after the
/// state lock is released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    pub reload_messages: Option<String>,
    pub refresh_permissions: bool,
    pub logout: Option<String>,
}

impl Effects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reload(session_id: impl Into<String>) -> Self {
        Self {
            reload_messages: Some(session_id.into()),
            ..Self::default()
        }
    }
}

/// Read-only view published to observers after every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    pub current_session_id: Option<String>,
    pub messages: Vec<Message>,
    pub revert_message_id: Option<String>,
    pub streaming_message_id: Option<String>,
    pub last_good_message_id: Option<String>,
    pub session_status: SessionUiStatus,
    pub is_loading: bool,
    pub is_sending: bool,
    pub is_aborting: bool,
    pub error: Option<ChatError>,
    pub input_text: String,
    pub pending_attachments: Vec<Attachment>,
    pub pending_permission: Option<PermissionRequest>,
}

/// Single-writer chat state. Every method is one atomic transition; callers
/// hold the engine lock for its duration and never await inside it.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub current_session_id: Option<String>,
    pub messages: Vec<Message>,
    pub revert_message_id: Option<String>,
    pub streaming_message_id: Option<String>,
    pub last_good_message_id: Option<String>,
    pub session_status: SessionUiStatus,
    pub is_loading: bool,
    pub is_sending: bool,
    pub is_aborting: bool,
    pub error: Option<ChatError>,
    pub input_text: String,
    pub pending_attachments: Vec<Attachment>,
    pub permissions: PermissionQueue,
    role_by_message_id: HashMap<String, Role>,
    buffered_parts_by_message_id: HashMap<String, Vec<Part>>,
    pending_user_messages_awaiting_server_parts: HashSet<String>,
}

impl ChatState {
    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            current_session_id: self.current_session_id.clone(),
            messages: self.messages.clone(),
            revert_message_id: self.revert_message_id.clone(),
            streaming_message_id: self.streaming_message_id.clone(),
            last_good_message_id: self.last_good_message_id.clone(),
            session_status: self.session_status,
            is_loading: self.is_loading,
            is_sending: self.is_sending,
            is_aborting: self.is_aborting,
            error: self.error.clone(),
            input_text: self.input_text.clone(),
            pending_attachments: self.pending_attachments.clone(),
            pending_permission: self.pending_permission().cloned(),
        }
    }

    pub fn pending_permission(&self) -> Option<&PermissionRequest> {
        let session_id = self.current_session_id.as_deref()?;
        self.permissions.current_for_session(session_id)
    }

    pub fn buffered_parts(&self, message_id: &str) -> Option<&[Part]> {
        self.buffered_parts_by_message_id
            .get(message_id)
            .map(Vec::as_slice)
    }

    pub fn known_role(&self, message_id: &str) -> Option<Role> {
        self.role_by_message_id.get(message_id).copied()
    }

    pub fn is_awaiting_server_parts(&self, message_id: &str) -> bool {
        self.pending_user_messages_awaiting_server_parts
            .contains(message_id)
    }

    fn is_current_session(&self, session_id: &str) -> bool {
        self.current_session_id.as_deref() == Some(session_id)
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id() == message_id)
    }

    /// Switches the active session, dropping everything tied to the old one.
    pub fn switch_session(&mut self, session_id: Option<String>) -> Effects {
        self.current_session_id = session_id.clone();
        self.messages.clear();
        self.revert_message_id = None;
        self.streaming_message_id = None;
        self.last_good_message_id = None;
        self.session_status = SessionUiStatus::Idle;
        self.is_sending = false;
        self.is_aborting = false;
        self.error = None;
        self.is_loading = session_id.is_some();
        self.role_by_message_id.clear();
        self.buffered_parts_by_message_id.clear();
        self.pending_user_messages_awaiting_server_parts.clear();

        Effects {
            reload_messages: session_id,
            refresh_permissions: true,
            logout: None,
        }
    }

    pub fn apply_event(&mut self, event: &Event, now: DateTime<Utc>) -> Effects {
        match event {
            Event::MessagePartUpdated {
                session_id,
                message_id,
                part,
                delta,
                ..
            } => {
                if self.is_current_session(session_id) {
                    self.apply_part_update(message_id, part.clone(), delta.as_deref(), now);
                }
                Effects::none()
            }
            Event::MessageUpdated {
                session_id,
                message_id,
                role,
                created_at,
                ..
            } => {
                if self.is_current_session(session_id) {
                    self.apply_message_updated(message_id, role, *created_at);
                }
                Effects::none()
            }
            Event::MessageRemoved {
                session_id,
                message_id,
                ..
            } => {
                if self.is_current_session(session_id) {
                    self.apply_message_removed(message_id);
                }
                Effects::none()
            }
            Event::SessionStatus {
                session_id, status, ..
            } => {
                if self.is_current_session(session_id) {
                    self.apply_session_status(*status)
                } else {
                    Effects::none()
                }
            }
            Event::SessionUpdated { session, .. } => {
                if self.is_current_session(&session.id) {
                    self.apply_session_updated(session)
                } else {
                    Effects::none()
                }
            }
            Event::PermissionAsked { request, .. } => {
                self.permissions
                    .upsert(request.clone(), now.timestamp_millis());
                Effects::none()
            }
            Event::PermissionReplied { request_id, .. } => {
                self.permissions.remove(request_id);
                Effects::none()
            }
            Event::SessionCreated { .. }
            | Event::SessionDeleted { .. }
            | Event::FileWatcherUpdated { .. }
            | Event::Unknown { .. } => Effects::none(),
        }
    }

    /// Content event. Parts of a message whose role is still unknown are
    /// buffered unless the part or a delta proves it is an assistant turn.
    pub fn apply_part_update(
        &mut self,
        message_id: &str,
        part: Part,
        delta: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if part.is_snapshot() {
            return;
        }
        let Some(session_id) = self.current_session_id.clone() else {
            return;
        };

        let known_role = self.known_role(message_id);
        let existing_index = self.position(message_id);
        let should_render = existing_index.is_some()
            || known_role.is_some()
            || part.is_assistant_only()
            || delta.is_some();

        if !should_render {
            let buffer = self
                .buffered_parts_by_message_id
                .entry(message_id.to_string())
                .or_default();
            merge_streaming_part(buffer, part, delta);
            debug!(message_id, "sync: buffered part until role is known");
            return;
        }

        let buffered = self
            .buffered_parts_by_message_id
            .remove(message_id)
            .unwrap_or_default();

        let existing = existing_index.map(|index| self.messages[index].clone());
        let existing_is_assistant = existing.as_ref().is_some_and(Message::is_assistant);
        let role = known_role.unwrap_or(
            if part.is_assistant_only() || existing_is_assistant || delta.is_some() {
                Role::Assistant
            } else {
                Role::User
            },
        );

        let mut message = match existing {
            Some(message) => {
                let mut message = message.with_role(role);
                for buffered_part in buffered {
                    merge_streaming_part(message.parts_mut(), buffered_part, None);
                }
                message
            }
            None => new_message(role, message_id, &session_id, now, buffered),
        };

        if message.is_user()
            && !part.is_pending()
            && self
                .pending_user_messages_awaiting_server_parts
                .remove(message_id)
        {
            message.parts_mut().retain(|existing| !existing.is_pending());
        }

        merge_streaming_part(message.parts_mut(), part, delta);
        let is_assistant = message.is_assistant();
        self.upsert_message(existing_index, message);
        if is_assistant {
            self.streaming_message_id = Some(message_id.to_string());
        }
        self.after_transcript_change();
    }

    /// Metadata event: records the role, flushes buffered parts, and
    /// reconciles user turns with optimistic placeholders.
    pub fn apply_message_updated(
        &mut self,
        message_id: &str,
        role: &str,
        created_at: DateTime<Utc>,
    ) {
        let Some(role) = Role::parse(role) else {
            debug!(message_id, role, "sync: ignoring message with unknown role");
            return;
        };
        let Some(session_id) = self.current_session_id.clone() else {
            return;
        };
        self.role_by_message_id.insert(message_id.to_string(), role);
        let buffered = self
            .buffered_parts_by_message_id
            .remove(message_id)
            .unwrap_or_default();

        if let Some(index) = self.position(message_id) {
            let mut message = self.messages[index].clone().with_role(role);
            message.set_created_at(created_at);
            if !buffered.is_empty() {
                *message.parts_mut() = buffered;
            }
            self.messages[index] = message;
        } else if role == Role::User {
            let server_text = text_of(&buffered);
            match find_matching_optimistic_user_message(&self.messages, &server_text) {
                Some(index) => {
                    let optimistic = &mut self.messages[index];
                    debug!(
                        pending_id = optimistic.id(),
                        message_id, "sync: reconciled optimistic user message"
                    );
                    optimistic.set_id(message_id);
                    optimistic.set_created_at(created_at);
                    if buffered.is_empty() {
                        self.pending_user_messages_awaiting_server_parts
                            .insert(message_id.to_string());
                    } else {
                        *optimistic.parts_mut() = buffered;
                        self.pending_user_messages_awaiting_server_parts
                            .remove(message_id);
                    }
                }
                None if !buffered.is_empty() => {
                    self.pending_user_messages_awaiting_server_parts
                        .remove(message_id);
                    self.messages.push(new_message(
                        Role::User,
                        message_id,
                        &session_id,
                        created_at,
                        buffered,
                    ));
                }
                None => {}
            }
        } else if !buffered.is_empty() {
            self.messages.push(new_message(
                Role::Assistant,
                message_id,
                &session_id,
                created_at,
                buffered,
            ));
        }
        self.after_transcript_change();
    }

    pub fn apply_message_removed(&mut self, message_id: &str) {
        self.role_by_message_id.remove(message_id);
        self.buffered_parts_by_message_id.remove(message_id);
        self.pending_user_messages_awaiting_server_parts
            .remove(message_id);
        self.messages.retain(|message| message.id() != message_id);

        if self.revert_message_id.as_deref() == Some(message_id) {
            self.revert_message_id = None;
        }
        if self.streaming_message_id.as_deref() == Some(message_id) {
            self.streaming_message_id = None;
        }
        if self.last_good_message_id.as_deref() == Some(message_id) {
            self.last_good_message_id = None;
        }
        self.after_transcript_change();
    }

    /// A finished turn is reconciled against a full pull rather than trusting
    /// the pushed fragments alone.
    pub fn apply_session_status(&mut self, status: SessionStatus) -> Effects {
        self.session_status = status.into();
        match self.session_status {
            SessionUiStatus::Idle | SessionUiStatus::Error => {
                self.streaming_message_id = None;
                self.pending_user_messages_awaiting_server_parts.clear();
                self.current_session_id
                    .clone()
                    .map(Effects::reload)
                    .unwrap_or_default()
            }
            SessionUiStatus::Processing => Effects::none(),
        }
    }

    pub fn apply_session_updated(&mut self, session: &Session) -> Effects {
        let previous = self.revert_message_id.take();
        self.revert_message_id = session.revert_message_id().map(str::to_string);
        self.after_transcript_change();

        // Hidden messages are not retained, so un-reverting needs a fresh pull.
        if previous.is_some() && self.revert_message_id.is_none() {
            return Effects::reload(session.id.clone());
        }
        Effects::none()
    }

    /// Replaces the transcript with an authoritative REST snapshot.
    pub fn apply_loaded_messages(&mut self, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        let messages = visible(messages, self.revert_message_id.as_deref());

        self.last_good_message_id = messages
            .iter()
            .rev()
            .find(|message| message.is_assistant() && message.error().is_none())
            .map(|message| message.id().to_string());

        let streaming_resolved = self.streaming_message_id.as_deref().is_some_and(|id| {
            messages.iter().any(|message| {
                message.id() == id && message.is_assistant() && !message.parts().is_empty()
            })
        });
        if streaming_resolved {
            self.streaming_message_id = None;
        }

        self.messages = messages;
        self.is_loading = false;
        self.detect_corruption();
    }

    /// Unauthorized loads end the pairing instead of surfacing a load error.
    pub fn apply_load_error(&mut self, err: &ApiError) -> Effects {
        self.is_loading = false;
        if err.is_unauthorized() {
            return Effects {
                logout: Some(err.message().to_string()),
                ..Effects::none()
            };
        }
        self.error = Some(ChatError::LoadFailed(err.message().to_string()));
        Effects::none()
    }

    /// Mirrors push connection health into the error slot. A more specific
    /// condition already on screen is left alone.
    pub fn apply_connection_state(&mut self, state: ConnectionState, was_connected: bool) {
        match state {
            ConnectionState::Connected => {
                if matches!(
                    self.error,
                    Some(ChatError::StreamDisconnected | ChatError::ConnectionFailed(_))
                ) {
                    self.error = None;
                }
            }
            ConnectionState::Reconnecting => {
                if was_connected && self.error.is_none() {
                    self.error = Some(ChatError::StreamDisconnected);
                }
            }
            ConnectionState::Disconnected => {
                if self.error.is_none() || self.error == Some(ChatError::StreamDisconnected) {
                    self.error = Some(ChatError::ConnectionFailed(
                        "event stream rejected the credentials".into(),
                    ));
                }
            }
        }
    }

    /// Appends a locally fabricated user message for an outgoing send.
    pub fn begin_send(&mut self, optimistic: Message) {
        // Sending supersedes a pending revert, matching server cleanup on resume.
        self.revert_message_id = None;
        self.messages.push(optimistic);
        self.pending_attachments.clear();
        self.input_text.clear();
        self.is_sending = true;
        self.error = None;
        self.after_transcript_change();
    }

    /// Applies a send reply. A reply for a session the user has since left
    /// only clears the sending flag.
    pub fn complete_send(&mut self, issued_session_id: &str, reply: &AssistantMessage) -> Effects {
        self.is_sending = false;
        if self.current_session_id.as_deref() != Some(issued_session_id) {
            debug!(
                issued = issued_session_id,
                reply_session = %reply.session_id,
                "sync: ignoring reply for inactive session"
            );
            return Effects::none();
        }
        if reply.error.is_none() {
            self.last_good_message_id = Some(reply.id.clone());
        }
        self.current_session_id = Some(reply.session_id.clone());
        self.revert_message_id = None;
        Effects::reload(reply.session_id.clone())
    }

    /// Removes the optimistic message and hands the draft back to the user.
    pub fn rollback_send(
        &mut self,
        optimistic_id: &str,
        error_message: String,
        input_text: String,
        attachments: Vec<Attachment>,
    ) {
        self.is_sending = false;
        self.messages.retain(|message| message.id() != optimistic_id);
        self.error = Some(ChatError::SendFailed(error_message));
        self.input_text = input_text;
        self.pending_attachments = attachments;
        self.after_transcript_change();
    }

    pub fn has_send_progress(&self) -> bool {
        self.session_status == SessionUiStatus::Processing || self.streaming_message_id.is_some()
    }

    pub fn apply_revert(&mut self, revert_message_id: String, restored_prompt: Option<String>) {
        self.revert_message_id = Some(revert_message_id);
        if let Some(prompt) = restored_prompt {
            self.input_text = prompt;
        }
        self.after_transcript_change();
    }

    /// Re-applies the revert filter and corruption detection.
    fn after_transcript_change(&mut self) {
        let messages = std::mem::take(&mut self.messages);
        self.messages = visible(messages, self.revert_message_id.as_deref());
        self.detect_corruption();
    }

    /// A non-abort error on the latest assistant message marks the session
    /// corrupted when there is a last-good checkpoint to revert to. Other
    /// errors are never overwritten.
    fn detect_corruption(&mut self) {
        let latest_error = self
            .messages
            .iter()
            .rev()
            .find(|message| message.is_assistant())
            .and_then(Message::error);
        let is_corrupted_flag = matches!(self.error, Some(ChatError::SessionCorrupted { .. }));

        match latest_error {
            Some(error) if error.is_aborted() => {
                if is_corrupted_flag {
                    self.error = None;
                }
            }
            Some(_) => {
                if self.error.is_none() {
                    self.error = self.last_good_message_id.clone().map(|last_good_message_id| {
                        ChatError::SessionCorrupted {
                            last_good_message_id,
                        }
                    });
                }
            }
            None => {
                if is_corrupted_flag {
                    self.error = None;
                }
            }
        }
    }

    fn upsert_message(&mut self, index: Option<usize>, message: Message) {
        match index {
            Some(index) => self.messages[index] = message,
            None => self.messages.push(message),
        }
    }
}

fn new_message(
    role: Role,
    id: &str,
    session_id: &str,
    created_at: DateTime<Utc>,
    parts: Vec<Part>,
) -> Message {
    match role {
        Role::User => Message::User(UserMessage {
            id: id.to_string(),
            session_id: session_id.to_string(),
            created_at,
            parts,
        }),
        Role::Assistant => Message::Assistant(AssistantMessage::placeholder(
            id, session_id, created_at, parts,
        )),
    }
}

fn text_of(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Best-effort pairing of a server user message with its optimistic copy:
/// a case-insensitive substring match in either direction, else the oldest
/// pending message. Several pending messages with similar text can pair up
/// in the wrong order.
fn find_matching_optimistic_user_message(messages: &[Message], server_text: &str) -> Option<usize> {
    let pending: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, message)| message.is_user() && is_pending_id(message.id()))
        .map(|(index, _)| index)
        .collect();
    let oldest = *pending.first()?;

    let server_norm = server_text.trim().to_lowercase();
    if !server_norm.is_empty() {
        let matched = pending.iter().copied().find(|index| {
            let pending_text = text_of(messages[*index].parts()).trim().to_lowercase();
            !pending_text.is_empty()
                && (server_norm.contains(&pending_text) || pending_text.contains(&server_norm))
        });
        if matched.is_some() {
            return matched;
        }
    }
    Some(oldest)
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
