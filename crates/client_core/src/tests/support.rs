use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use shared::{
    domain::{
        AssistantMessage, CommandInfo, Event, Message, Part, PermissionReply, PermissionRequest,
        Session, SessionRevert, UserMessage,
    },
    error::ApiError,
    protocol::{SendCommandRequest, SendMessageRequest},
};
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{EventStream, SessionQuery, Transport};

pub type EventSender = mpsc::UnboundedSender<Result<Event, ApiError>>;

enum ScriptedStream {
    Open(UnboundedReceiverStream<Result<Event, ApiError>>),
    Fail(ApiError),
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub fn session(id: &str, revert: Option<&str>) -> Session {
    Session {
        id: id.into(),
        project_id: None,
        directory: "/work".into(),
        title: None,
        version: None,
        created_at: at(0),
        updated_at: at(0),
        parent_id: None,
        revert: revert.map(|message_id| SessionRevert {
            message_id: message_id.into(),
            part_id: None,
            snapshot: None,
            diff: None,
        }),
    }
}

pub fn user_message(session_id: &str, id: &str, created: i64, text: &str) -> Message {
    Message::User(UserMessage {
        id: id.into(),
        session_id: session_id.into(),
        created_at: at(created),
        parts: vec![Part::text(format!("prt_{id}"), text)],
    })
}

pub fn assistant_message(session_id: &str, id: &str, created: i64, text: &str) -> Message {
    Message::Assistant(AssistantMessage::placeholder(
        id,
        session_id,
        at(created),
        vec![Part::text(format!("prt_{id}"), text)],
    ))
}

pub fn reply(session_id: &str, id: &str) -> AssistantMessage {
    AssistantMessage::placeholder(id, session_id, at(100), Vec::new())
}

pub fn permission(id: &str, session_id: &str) -> PermissionRequest {
    PermissionRequest {
        request_id: id.into(),
        session_id: session_id.into(),
        permission: "bash".into(),
        patterns: vec!["ls".into()],
        always: Vec::new(),
        tool_message_id: None,
        tool_call_id: None,
    }
}

/// Scripted in-memory server. Each method records its call and can be made
/// to fail once via [`FakeTransport::fail_with`].
#[derive(Default)]
pub struct FakeTransport {
    pub calls: Mutex<Vec<String>>,
    pub subscribe_log: Mutex<Vec<(Instant, Option<String>)>>,
    pub sent_messages: Mutex<Vec<SendMessageRequest>>,
    pub sent_commands: Mutex<Vec<SendCommandRequest>>,
    pub permission_replies: Mutex<Vec<(String, PermissionReply)>>,
    pub auth_token: Mutex<Option<String>>,
    pub directory: Mutex<Option<String>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    sessions: Mutex<HashMap<String, Session>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    permissions: Mutex<Vec<PermissionRequest>>,
    commands: Mutex<Vec<CommandInfo>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ApiError>>>,
    send_replies: Mutex<VecDeque<AssistantMessage>>,
    load_delay: Mutex<Option<Duration>>,
    send_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a live stream for the next subscription and returns its sender.
    pub async fn push_stream(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .await
            .push_back(ScriptedStream::Open(UnboundedReceiverStream::new(rx)));
        tx
    }

    pub async fn push_stream_failure(&self, err: ApiError) {
        self.streams
            .lock()
            .await
            .push_back(ScriptedStream::Fail(err));
    }

    pub async fn fail_with(&self, method: &'static str, err: ApiError) {
        self.failures
            .lock()
            .await
            .entry(method)
            .or_default()
            .push_back(err);
    }

    pub async fn put_session(&self, session: Session, messages: Vec<Message>) {
        self.messages
            .lock()
            .await
            .insert(session.id.clone(), messages);
        self.sessions.lock().await.insert(session.id.clone(), session);
    }

    pub async fn set_permissions(&self, requests: Vec<PermissionRequest>) {
        *self.permissions.lock().await = requests;
    }

    pub async fn set_commands(&self, names: &[&str]) {
        *self.commands.lock().await = names
            .iter()
            .map(|name| CommandInfo {
                name: name.to_string(),
                description: None,
                hints: Vec::new(),
            })
            .collect();
    }

    pub async fn queue_send_reply(&self, reply: AssistantMessage) {
        self.send_replies.lock().await.push_back(reply);
    }

    pub async fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().await = Some(delay);
    }

    pub async fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().await = Some(delay);
    }

    pub async fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.as_str() == method)
            .count()
    }

    async fn enter(&self, method: &'static str) -> Result<(), ApiError> {
        self.calls.lock().await.push(method.to_string());
        let mut failures = self.failures.lock().await;
        match failures.get_mut(method).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn subscribe_events(&self, directory: Option<&str>) -> Result<EventStream, ApiError> {
        self.subscribe_log
            .lock()
            .await
            .push((Instant::now(), directory.map(str::to_string)));
        self.enter("subscribe_events").await?;
        match self.streams.lock().await.pop_front() {
            Some(ScriptedStream::Open(stream)) => Ok(stream.boxed()),
            Some(ScriptedStream::Fail(err)) => Err(err),
            None => Err(ApiError::network("connection refused")),
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, ApiError> {
        self.enter("get_session").await?;
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                message: session_id.to_string(),
            })
    }

    async fn get_sessions(&self, _query: SessionQuery) -> Result<Vec<Session>, ApiError> {
        self.enter("get_sessions").await?;
        Ok(self.sessions.lock().await.values().cloned().collect())
    }

    async fn create_session(
        &self,
        _parent_id: Option<&str>,
        _title: Option<&str>,
    ) -> Result<Session, ApiError> {
        self.enter("create_session").await?;
        let created = session("ses_new", None);
        self.put_session(created.clone(), Vec::new()).await;
        Ok(created)
    }

    async fn fork_session(
        &self,
        session_id: &str,
        _message_id: Option<&str>,
    ) -> Result<Session, ApiError> {
        self.enter("fork_session").await?;
        let mut forked = session(&format!("{session_id}_fork"), None);
        forked.parent_id = Some(session_id.to_string());
        self.put_session(forked.clone(), Vec::new()).await;
        Ok(forked)
    }

    async fn revert_session(
        &self,
        session_id: &str,
        message_id: &str,
        _part_id: Option<&str>,
    ) -> Result<Session, ApiError> {
        self.enter("revert_session").await?;
        let reverted = session(session_id, Some(message_id));
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), reverted.clone());
        Ok(reverted)
    }

    async fn abort_session(&self, _session_id: &str) -> Result<bool, ApiError> {
        self.enter("abort_session").await?;
        Ok(true)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        _limit: Option<u32>,
        _reverse: bool,
    ) -> Result<Vec<Message>, ApiError> {
        self.enter("get_messages").await?;
        let delay = *self.load_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .messages
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        session_id: &str,
        request: SendMessageRequest,
    ) -> Result<AssistantMessage, ApiError> {
        self.sent_messages.lock().await.push(request);
        self.enter("send_message").await?;
        let delay = *self.send_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .send_replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| reply(session_id, "msg_reply")))
    }

    async fn send_command(
        &self,
        session_id: &str,
        request: SendCommandRequest,
    ) -> Result<AssistantMessage, ApiError> {
        self.sent_commands.lock().await.push(request);
        self.enter("send_command").await?;
        Ok(self
            .send_replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| reply(session_id, "msg_reply")))
    }

    async fn find_files(&self, query: &str, _dirs: bool) -> Result<Vec<String>, ApiError> {
        self.enter("find_files").await?;
        Ok(vec![format!("src/{query}.rs")])
    }

    async fn pending_permissions(&self) -> Result<Vec<PermissionRequest>, ApiError> {
        self.enter("pending_permissions").await?;
        Ok(self.permissions.lock().await.clone())
    }

    async fn reply_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
        _message: Option<&str>,
    ) -> Result<(), ApiError> {
        self.enter("reply_permission").await?;
        self.permission_replies
            .lock()
            .await
            .push((request_id.to_string(), reply));
        Ok(())
    }

    async fn list_commands(&self) -> Result<Vec<CommandInfo>, ApiError> {
        self.enter("list_commands").await?;
        Ok(self.commands.lock().await.clone())
    }

    async fn set_auth_token(&self, token: Option<&str>) {
        *self.auth_token.lock().await = token.map(str::to_string);
    }

    async fn set_directory(&self, directory: Option<&str>) {
        *self.directory.lock().await = directory.map(str::to_string);
    }
}
