use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{Attachment, Event, PermissionReply, Session},
    error::ApiError,
};
use tokio::{
    sync::{broadcast, watch, Mutex, RwLock},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionState, PushConnection, ReconnectConfig},
    error::{is_transient_network_error, ChatError},
    revert::{prompt_text_for_revert, revert_target},
    send::{
        command_request, message_request, optimistic_message, parse_slash_command, Draft,
        PendingIdGenerator, PromptSelection,
    },
    settings::{SettingsError, SettingsStore},
    store::{ChatSnapshot, ChatState, Effects, SessionUiStatus},
    transport::Transport,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Page size for message loads; `None` fetches the whole session.
    pub load_limit: Option<u32>,
    pub send_grace_period: Duration,
    pub send_grace_poll: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_limit: None,
            send_grace_period: Duration::from_secs(20),
            send_grace_poll: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Notifications for collaborators outside the chat state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The pairing was rejected and the stored credential has been cleared.
    LoggedOut { reason: String },
    SessionChanged { session_id: Option<String> },
}

#[derive(Default)]
struct EngineTasks {
    pump: Option<JoinHandle<()>>,
    connection_watch: Option<JoinHandle<()>>,
    load: Option<(String, JoinHandle<()>)>,
    send_grace: Option<JoinHandle<()>>,
}

pub struct ChatEngine {
    transport: Arc<dyn Transport>,
    settings: Arc<dyn SettingsStore>,
    connection: Arc<PushConnection>,
    config: EngineConfig,
    state: Mutex<ChatState>,
    snapshots: watch::Sender<ChatSnapshot>,
    events: broadcast::Sender<EngineEvent>,
    tasks: Mutex<EngineTasks>,
    pending_ids: PendingIdGenerator,
    logged_out: AtomicBool,
    known_commands: RwLock<Option<HashSet<String>>>,
}

impl ChatEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: Arc<dyn SettingsStore>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let connection = PushConnection::new(Arc::clone(&transport), config.reconnect.clone());
        let (snapshots, _) = watch::channel(ChatSnapshot::default());
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            transport,
            settings,
            connection,
            config,
            state: Mutex::new(ChatState::default()),
            snapshots,
            events,
            tasks: Mutex::new(EngineTasks::default()),
            pending_ids: PendingIdGenerator::default(),
            logged_out: AtomicBool::new(false),
            known_commands: RwLock::new(None),
        })
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch_snapshots(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.connection_state()
    }

    /// Runs one transition against the latest state and publishes the result.
    async fn update<R>(&self, transition: impl FnOnce(&mut ChatState) -> R) -> R {
        let mut state = self.state.lock().await;
        let result = transition(&mut state);
        self.snapshots.send_replace(state.snapshot());
        result
    }

    async fn run_effects(self: &Arc<Self>, effects: Effects) {
        if let Some(session_id) = effects.reload_messages {
            self.ensure_load_messages(session_id).await;
        }
        if effects.refresh_permissions {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.refresh_pending_permissions().await });
        }
        if let Some(reason) = effects.logout {
            self.handle_unauthorized(reason).await;
        }
    }

    /// Attaches the engine to the push stream. Calling it again is a no-op
    /// while the pump is alive.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if tasks.pump.as_ref().is_some_and(|pump| !pump.is_finished()) {
            return;
        }
        if let Some(watch) = tasks.connection_watch.take() {
            watch.abort();
        }
        let mut states = self.connection.connection_state();
        let engine = Arc::clone(self);
        tasks.connection_watch = Some(tokio::spawn(async move {
            let mut was_connected = *states.borrow_and_update() == ConnectionState::Connected;
            while states.changed().await.is_ok() {
                let connection_state = *states.borrow_and_update();
                engine
                    .update(|state| state.apply_connection_state(connection_state, was_connected))
                    .await;
                was_connected = connection_state == ConnectionState::Connected;
            }
        }));

        let mut subscription = self.connection.subscribe().await;
        let engine = Arc::clone(self);
        tasks.pump = Some(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                engine.apply_event(event).await;
            }
            debug!("sync: event pump finished");
        }));
    }

    /// Scopes requests and the push stream to a project directory. The push
    /// stream reconnects when the directory changes.
    pub async fn set_directory(&self, directory: Option<String>) {
        self.transport.set_directory(directory.as_deref()).await;
        self.connection.set_context_key(directory);
    }

    pub async fn apply_event(self: &Arc<Self>, event: Event) {
        debug!(kind = event.kind(), "sync: applying push event");
        let effects = self
            .update(|state| state.apply_event(&event, Utc::now()))
            .await;
        self.run_effects(effects).await;
    }

    pub async fn restore_session(self: &Arc<Self>) {
        match self.settings.current_session_id().await {
            Ok(session_id) => self.switch_session(session_id).await,
            Err(err) => warn!(error = %err, "sync: failed to read stored session id"),
        }
    }

    pub async fn switch_session(self: &Arc<Self>, session_id: Option<String>) {
        {
            let mut tasks = self.tasks.lock().await;
            if let Some((_, load)) = tasks.load.take() {
                load.abort();
            }
            if let Some(grace) = tasks.send_grace.take() {
                grace.abort();
            }
        }

        info!(session_id = ?session_id, "sync: switching session");
        let effects = self
            .update(|state| state.switch_session(session_id.clone()))
            .await;
        if let Err(err) = self
            .settings
            .set_current_session_id(session_id.as_deref())
            .await
        {
            warn!(error = %err, "sync: failed to persist current session");
        }
        let _ = self.events.send(EngineEvent::SessionChanged { session_id });
        self.run_effects(effects).await;
    }

    /// Starts a full reload of `session_id` unless one is already in flight
    /// for it. A load for any other session is cancelled first.
    pub async fn ensure_load_messages(self: &Arc<Self>, session_id: String) {
        let mut tasks = self.tasks.lock().await;
        if let Some((loading_id, handle)) = &tasks.load {
            if *loading_id == session_id && !handle.is_finished() {
                debug!(session_id = %session_id, "sync: load already in flight");
                return;
            }
        }
        if let Some((_, handle)) = tasks.load.take() {
            handle.abort();
        }

        let engine = Arc::clone(self);
        let task_session_id = session_id.clone();
        let handle = tokio::spawn(async move { engine.load_messages(task_session_id).await });
        tasks.load = Some((session_id, handle));
    }

    async fn load_messages(self: Arc<Self>, session_id: String) {
        let result = async {
            // Session metadata only carries the revert pointer; a failed fetch
            // keeps the current one instead of failing the transcript load.
            let session = match self.transport.get_session(&session_id).await {
                Ok(session) => Some(session),
                Err(err) if err.is_unauthorized() => return Err(err),
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "sync: session fetch failed");
                    None
                }
            };
            let messages = self
                .transport
                .get_messages(&session_id, self.config.load_limit, false)
                .await?;
            Ok::<_, ApiError>((session, messages))
        }
        .await;

        let effects = self
            .update(|state| {
                if state.current_session_id.as_deref() != Some(session_id.as_str()) {
                    debug!(session_id = %session_id, "sync: dropping load for inactive session");
                    return Effects::none();
                }
                match result {
                    Ok((session, messages)) => {
                        if let Some(session) = session {
                            state.revert_message_id =
                                session.revert_message_id().map(str::to_string);
                        }
                        state.apply_loaded_messages(messages);
                        Effects::none()
                    }
                    Err(err) => {
                        warn!(session_id = %session_id, error = %err, "sync: message load failed");
                        state.apply_load_error(&err)
                    }
                }
            })
            .await;
        // Only the logout effect applies here; reloading from a load would loop.
        if let Some(reason) = effects.logout {
            self.handle_unauthorized(reason).await;
        }
    }

    async fn prompt_selection(&self) -> PromptSelection {
        let agent = self.settings.selected_agent().await.unwrap_or_else(|err| {
            warn!(error = %err, "sync: failed to read selected agent");
            None
        });
        let model = self.settings.selected_model().await.unwrap_or_else(|err| {
            warn!(error = %err, "sync: failed to read selected model");
            None
        });
        let variant = match &model {
            Some(model) => self
                .settings
                .thinking_variant(model)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "sync: failed to read thinking variant");
                    None
                }),
            None => None,
        };
        PromptSelection {
            agent: agent.filter(|agent| !agent.trim().is_empty()),
            model,
            variant,
        }
    }

    /// Whether `name` is a server-side command. An unknown name triggers one
    /// refetch so newly added commands are picked up.
    async fn is_known_command(&self, name: &str) -> bool {
        if let Some(known) = self.known_commands.read().await.as_ref() {
            if known.contains(name) {
                return true;
            }
        }
        match self.transport.list_commands().await {
            Ok(commands) => {
                let names: HashSet<String> =
                    commands.into_iter().map(|command| command.name).collect();
                let known = names.contains(name);
                *self.known_commands.write().await = Some(names);
                known
            }
            Err(err) => {
                warn!(error = %err, "sync: failed to list commands");
                false
            }
        }
    }

    /// Sends a prompt with an optimistic placeholder. Transient network
    /// failures are held back for the grace period; the returned error only
    /// reflects failures that were surfaced right away.
    pub async fn send_message(self: &Arc<Self>, draft: Draft) -> Result<(), ChatError> {
        let Some(draft) = draft.normalized() else {
            return Ok(());
        };
        let Some(session_id) = self.state.lock().await.current_session_id.clone() else {
            return Ok(());
        };

        if let Some(grace) = self.tasks.lock().await.send_grace.take() {
            grace.abort();
        }

        let now = Utc::now();
        let ids = self.pending_ids.next(now.timestamp_millis());
        let optimistic = optimistic_message(&ids, &session_id, &draft, now);
        let optimistic_id = ids.message.clone();
        self.update(|state| state.begin_send(optimistic)).await;

        let selection = self.prompt_selection().await;
        let command = match parse_slash_command(&draft.text) {
            Some(command) if self.is_known_command(&command.name).await => Some(command),
            _ => None,
        };
        let result = match &command {
            Some(command) => {
                info!(session_id = %session_id, command = %command.name, "sync: sending command");
                self.transport
                    .send_command(
                        &session_id,
                        command_request(command, &draft.attachments, &selection),
                    )
                    .await
            }
            None => {
                info!(session_id = %session_id, attachments = draft.attachments.len(), "sync: sending message");
                self.transport
                    .send_message(&session_id, message_request(&draft, &selection))
                    .await
            }
        };

        match result {
            Ok(reply) => {
                let (effects, applied) = self
                    .update(|state| {
                        let effects = state.complete_send(&session_id, &reply);
                        let applied = state.current_session_id.as_deref()
                            == Some(reply.session_id.as_str());
                        (effects, applied)
                    })
                    .await;
                if applied && reply.session_id != session_id {
                    info!(from = %session_id, to = %reply.session_id, "sync: server moved to a new session");
                    if let Err(err) = self
                        .settings
                        .set_current_session_id(Some(&reply.session_id))
                        .await
                    {
                        warn!(error = %err, "sync: failed to persist current session");
                    }
                }
                self.run_effects(effects).await;
                Ok(())
            }
            Err(err) if err.is_unauthorized() => {
                self.update(|state| {
                    state.rollback_send(
                        &optimistic_id,
                        err.message().to_string(),
                        draft.text.clone(),
                        draft.attachments.clone(),
                    )
                })
                .await;
                self.handle_unauthorized(err.message().to_string()).await;
                Err(ChatError::Unauthorized(err.message().to_string()))
            }
            Err(err) if is_transient_network_error(&err) => {
                warn!(
                    session_id = %session_id,
                    optimistic_id = %optimistic_id,
                    error = %err,
                    "sync: send dropped by network; waiting for server to reconcile"
                );
                self.update(|state| state.is_sending = false).await;
                self.spawn_send_grace_watcher(
                    session_id,
                    optimistic_id,
                    err.message().to_string(),
                    draft,
                )
                .await;
                Ok(())
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "sync: send failed");
                let message = err.message().to_string();
                self.update(|state| {
                    state.rollback_send(
                        &optimistic_id,
                        message.clone(),
                        draft.text,
                        draft.attachments,
                    )
                })
                .await;
                Err(ChatError::SendFailed(message))
            }
        }
    }

    /// Sends whatever is currently in the composer.
    pub async fn send_current_draft(self: &Arc<Self>) -> Result<(), ChatError> {
        let draft = {
            let state = self.state.lock().await;
            Draft::new(state.input_text.clone()).with_attachments(state.pending_attachments.clone())
        };
        self.send_message(draft).await
    }

    pub async fn set_input_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|state| state.input_text = text).await;
    }

    pub async fn set_pending_attachments(&self, attachments: Vec<Attachment>) {
        self.update(|state| state.pending_attachments = attachments)
            .await;
    }

    async fn spawn_send_grace_watcher(
        self: &Arc<Self>,
        session_id: String,
        optimistic_id: String,
        error_message: String,
        draft: Draft,
    ) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            loop {
                let resolved = {
                    let state = engine.state.lock().await;
                    state.current_session_id.as_deref() != Some(session_id.as_str())
                        || !state.messages.iter().any(|m| m.id() == optimistic_id)
                        || state.has_send_progress()
                };
                if resolved {
                    debug!(optimistic_id = %optimistic_id, "sync: send reconciled during grace period");
                    return;
                }
                if started.elapsed() >= engine.config.send_grace_period {
                    break;
                }
                sleep(engine.config.send_grace_poll).await;
            }

            let rolled_back = engine
                .update(|state| {
                    let still_pending = state.current_session_id.as_deref()
                        == Some(session_id.as_str())
                        && state.messages.iter().any(|m| m.id() == optimistic_id)
                        && !state.has_send_progress();
                    if still_pending {
                        state.rollback_send(
                            &optimistic_id,
                            error_message.clone(),
                            draft.text.clone(),
                            draft.attachments.clone(),
                        );
                    }
                    still_pending
                })
                .await;
            if rolled_back {
                warn!(optimistic_id = %optimistic_id, "sync: send not confirmed within grace period");
            }
        });
        self.tasks.lock().await.send_grace = Some(handle);
    }

    /// Reverts the session to the user turn at or before `message_id` and
    /// puts that prompt back in the composer.
    pub async fn revert_to_message(self: &Arc<Self>, message_id: &str) -> Result<(), ChatError> {
        let (session_id, target) = {
            let state = self.state.lock().await;
            let Some(session_id) = state.current_session_id.clone() else {
                return Err(ChatError::RevertFailed("no active session".into()));
            };
            let Some(target) = revert_target(&state.messages, message_id) else {
                return Err(ChatError::RevertFailed(format!(
                    "no user message at or before {message_id}"
                )));
            };
            (session_id, target)
        };

        info!(session_id = %session_id, target = %target, "sync: reverting session");
        match self
            .transport
            .revert_session(&session_id, &target, None)
            .await
        {
            Ok(session) => {
                let pointer = session
                    .revert_message_id()
                    .map(str::to_string)
                    .unwrap_or_else(|| target.clone());
                let applied = self
                    .update(|state| {
                        if state.current_session_id.as_deref() != Some(session_id.as_str()) {
                            return false;
                        }
                        let prompt = prompt_text_for_revert(&state.messages, &target);
                        state.apply_revert(pointer, prompt);
                        true
                    })
                    .await;
                if applied {
                    self.ensure_load_messages(session_id).await;
                }
                Ok(())
            }
            Err(err) => Err(self.fail_action(err, ChatError::RevertFailed).await),
        }
    }

    /// Forks the active session at `message_id` (or its end) and switches to
    /// the fork.
    pub async fn fork_from_message(
        self: &Arc<Self>,
        message_id: Option<&str>,
    ) -> Result<Session, ChatError> {
        let Some(session_id) = self.state.lock().await.current_session_id.clone() else {
            return Err(ChatError::ForkFailed("no active session".into()));
        };
        match self.transport.fork_session(&session_id, message_id).await {
            Ok(session) => {
                info!(from = %session_id, to = %session.id, "sync: forked session");
                self.switch_session(Some(session.id.clone())).await;
                Ok(session)
            }
            Err(err) => Err(self.fail_action(err, ChatError::ForkFailed).await),
        }
    }

    pub async fn create_session(
        self: &Arc<Self>,
        title: Option<&str>,
    ) -> Result<Session, ChatError> {
        match self.transport.create_session(None, title).await {
            Ok(session) => {
                info!(session_id = %session.id, "sync: created session");
                self.switch_session(Some(session.id.clone())).await;
                Ok(session)
            }
            Err(err) => Err(self.fail_action(err, ChatError::CreateFailed).await),
        }
    }

    pub async fn abort_session(self: &Arc<Self>) -> Result<(), ChatError> {
        let session_id = {
            let mut state = self.state.lock().await;
            let Some(session_id) = state.current_session_id.clone() else {
                return Ok(());
            };
            if state.is_aborting {
                return Ok(());
            }
            state.is_aborting = true;
            self.snapshots.send_replace(state.snapshot());
            session_id
        };

        match self.transport.abort_session(&session_id).await {
            Ok(true) => {
                self.update(|state| {
                    state.is_aborting = false;
                    if state.current_session_id.as_deref() == Some(session_id.as_str()) {
                        state.is_sending = false;
                        state.session_status = SessionUiStatus::Idle;
                        state.streaming_message_id = None;
                    }
                })
                .await;
                self.ensure_load_messages(session_id).await;
                Ok(())
            }
            Ok(false) => {
                let err = ChatError::AbortFailed("server refused to abort".into());
                self.update(|state| {
                    state.is_aborting = false;
                    state.error = Some(err.clone());
                })
                .await;
                Err(err)
            }
            Err(err) => {
                self.update(|state| state.is_aborting = false).await;
                Err(self.fail_action(err, ChatError::AbortFailed).await)
            }
        }
    }

    /// Polls pending permission requests and merges them into the queue
    /// without dropping anything pushed while the poll was in flight.
    pub async fn refresh_pending_permissions(self: &Arc<Self>) {
        let started_at = Utc::now().timestamp_millis();
        match self.transport.pending_permissions().await {
            Ok(requests) => {
                self.update(|state| {
                    state.permissions.reconcile_poll(
                        requests,
                        started_at,
                        Utc::now().timestamp_millis(),
                    )
                })
                .await;
            }
            Err(err) if err.is_unauthorized() => {
                self.handle_unauthorized(err.message().to_string()).await;
            }
            Err(err) => warn!(error = %err, "sync: permission refresh failed"),
        }
    }

    pub async fn reply_to_permission(
        self: &Arc<Self>,
        request_id: &str,
        reply: PermissionReply,
        message: Option<&str>,
    ) -> Result<(), ChatError> {
        let snapshot = self
            .update(|state| state.permissions.take_for_reply(request_id))
            .await;

        match self
            .transport
            .reply_permission(request_id, reply, message)
            .await
        {
            Ok(()) => {
                info!(request_id, reply = reply.as_str(), "sync: replied to permission request");
                Ok(())
            }
            Err(err) => {
                warn!(request_id, error = %err, "sync: permission reply failed");
                let condition = ChatError::PermissionReplyFailed(err.message().to_string());
                self.update(|state| {
                    if let Some(snapshot) = snapshot {
                        state.permissions.restore(snapshot);
                    }
                    state.error = Some(condition.clone());
                })
                .await;
                if err.is_unauthorized() {
                    self.handle_unauthorized(err.message().to_string()).await;
                } else {
                    self.refresh_pending_permissions().await;
                }
                Err(condition)
            }
        }
    }

    /// Like [`Self::reply_to_permission`] but takes the reply as typed text.
    pub async fn reply_to_permission_text(
        self: &Arc<Self>,
        request_id: &str,
        reply: &str,
        message: Option<&str>,
    ) -> Result<(), ChatError> {
        let Some(reply) = PermissionReply::parse(reply) else {
            return Err(ChatError::PermissionReplyFailed(format!(
                "unknown reply '{}'",
                reply.trim()
            )));
        };
        self.reply_to_permission(request_id, reply, message).await
    }

    pub async fn find_files(&self, query: &str, dirs: bool) -> Result<Vec<String>, ApiError> {
        self.transport.find_files(query, dirs).await
    }

    pub async fn dismiss_error(&self) {
        self.update(|state| state.error = None).await;
    }

    /// Installs a new credential after the user pairs again and re-arms the
    /// logout notification.
    pub async fn pair(&self, token: &str) -> Result<(), SettingsError> {
        self.settings.set_auth_token(Some(token)).await?;
        self.transport.set_auth_token(Some(token)).await;
        self.logged_out.store(false, Ordering::SeqCst);
        self.update(|state| {
            if matches!(state.error, Some(ChatError::Unauthorized(_))) {
                state.error = None;
            }
        })
        .await;
        info!("sync: paired with new credential");
        Ok(())
    }

    async fn fail_action(
        self: &Arc<Self>,
        err: ApiError,
        condition: impl FnOnce(String) -> ChatError,
    ) -> ChatError {
        let condition = condition(err.message().to_string());
        warn!(error = %err, "sync: session action failed");
        if err.is_unauthorized() {
            self.handle_unauthorized(err.message().to_string()).await;
        } else {
            let surfaced = condition.clone();
            self.update(|state| state.error = Some(surfaced)).await;
        }
        condition
    }

    async fn handle_unauthorized(&self, reason: String) {
        if self.logged_out.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason = %reason, "sync: pairing rejected; logging out");
        if let Err(err) = self.settings.set_auth_token(None).await {
            warn!(error = %err, "sync: failed to clear stored token");
        }
        self.transport.set_auth_token(None).await;
        let surfaced = ChatError::Unauthorized(reason.clone());
        self.update(|state| state.error = Some(surfaced)).await;
        let _ = self.events.send(EngineEvent::LoggedOut { reason });
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in [
            tasks.pump.take(),
            tasks.connection_watch.take(),
            tasks.load.take().map(|(_, handle)| handle),
            tasks.send_grace.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        drop(tasks);
        self.connection.disconnect().await;
        info!("sync: engine stopped");
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
