use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{
        AssistantMessage, CommandInfo, Event, Message, PermissionReply, PermissionRequest, Session,
    },
    error::ApiError,
    protocol::{
        parse_abort_response, CommandDto, CreateSessionRequest, ErrorDto, ForkSessionRequest,
        MessageWithPartsDto, PermissionReplyRequest, PermissionRequestDto, RevertSessionRequest,
        SendCommandRequest, SendMessageRequest, SessionDto,
    },
};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::{error::map_reqwest_error, sse::decode_event_stream};

pub const DIRECTORY_HEADER: &str = "x-opencode-directory";

pub type EventStream = BoxStream<'static, Result<Event, ApiError>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
}

/// Request/response and push surface of the OpenCode server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the global event stream. `Ok` means the server answered with a
    /// success status; items then arrive until the server closes the stream.
    async fn subscribe_events(&self, directory: Option<&str>) -> Result<EventStream, ApiError>;
    async fn get_session(&self, session_id: &str) -> Result<Session, ApiError>;
    async fn get_sessions(&self, query: SessionQuery) -> Result<Vec<Session>, ApiError>;
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<Session, ApiError>;
    async fn fork_session(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Session, ApiError>;
    async fn revert_session(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: Option<&str>,
    ) -> Result<Session, ApiError>;
    async fn abort_session(&self, session_id: &str) -> Result<bool, ApiError>;
    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
        reverse: bool,
    ) -> Result<Vec<Message>, ApiError>;
    async fn send_message(
        &self,
        session_id: &str,
        request: SendMessageRequest,
    ) -> Result<AssistantMessage, ApiError>;
    async fn send_command(
        &self,
        session_id: &str,
        request: SendCommandRequest,
    ) -> Result<AssistantMessage, ApiError>;
    async fn find_files(&self, query: &str, dirs: bool) -> Result<Vec<String>, ApiError>;
    async fn pending_permissions(&self) -> Result<Vec<PermissionRequest>, ApiError>;
    async fn reply_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
        message: Option<&str>,
    ) -> Result<(), ApiError>;
    async fn list_commands(&self) -> Result<Vec<CommandInfo>, ApiError>;

    /// Replaces the bearer credential sent with later requests.
    async fn set_auth_token(&self, _token: Option<&str>) {}

    /// Directory scope for requests that do not name one.
    async fn set_directory(&self, _directory: Option<&str>) {}
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub directory: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Prompt and command calls block until the assistant turn is accepted.
    pub send_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".into(),
            auth_token: None,
            directory: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(300),
        }
    }
}

pub struct HttpTransport {
    base_url: Url,
    http: Client,
    stream_http: Client,
    auth_token: RwLock<Option<String>>,
    directory: RwLock<Option<String>>,
    request_timeout: Duration,
    send_timeout: Duration,
}

#[derive(Serialize)]
struct MessagesQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reverse: Option<u8>,
}

#[derive(Serialize)]
struct FindFilesQuery<'a> {
    query: &'a str,
    dirs: bool,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("invalid server url '{}'", config.base_url))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("server url must start with http:// or https://"));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to build http client")?;
        let stream_http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to build event stream client")?;

        Ok(Self {
            base_url,
            http,
            stream_http,
            auth_token: RwLock::new(config.auth_token),
            directory: RwLock::new(config.directory),
            request_timeout: config.request_timeout,
            send_timeout: config.send_timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::parse(format!("invalid request path '{path}': {err}")))
    }

    async fn decorate(&self, builder: RequestBuilder, directory: Option<&str>) -> RequestBuilder {
        let mut builder = builder;
        if let Some(token) = self.auth_token.read().await.as_deref() {
            builder = builder.bearer_auth(token);
        }
        let configured = self.directory.read().await.clone();
        if let Some(directory) = directory.map(str::to_string).or(configured) {
            builder = builder.header(DIRECTORY_HEADER, directory);
        }
        builder
    }

    async fn execute(&self, builder: RequestBuilder, timeout: Duration) -> Result<Response, ApiError> {
        let response = self
            .decorate(builder.timeout(timeout), None)
            .await
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let builder = self.http.get(self.url(path)?);
        self.execute(builder, self.request_timeout)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)
    }

    async fn get_json_with_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T, ApiError> {
        let builder = self.http.get(self.url(path)?).query(query);
        self.execute(builder, self.request_timeout)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, ApiError> {
        let builder = self.http.post(self.url(path)?).json(body);
        self.execute(builder, timeout)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_response(status.as_u16(), &body))
}

fn error_from_response(status: u16, body: &str) -> ApiError {
    if status == 401 {
        return ApiError::from_status(status, body);
    }
    match serde_json::from_str::<ErrorDto>(body) {
        Ok(dto) => match dto.into_domain() {
            ApiError::Api { name, message, .. } => ApiError::Api {
                name,
                message,
                status: Some(status),
            },
            other => other,
        },
        Err(_) => ApiError::from_status(status, body),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn set_auth_token(&self, token: Option<&str>) {
        *self.auth_token.write().await = token.map(str::to_string);
    }

    async fn set_directory(&self, directory: Option<&str>) {
        *self.directory.write().await = directory.map(str::to_string);
    }

    async fn subscribe_events(&self, directory: Option<&str>) -> Result<EventStream, ApiError> {
        let builder = self
            .stream_http
            .get(self.url("global/event")?)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        let response = self
            .decorate(builder, directory)
            .await
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response).await?;
        debug!(status = response.status().as_u16(), "sse: event stream opened");

        Ok(decode_event_stream(response.bytes_stream(), map_reqwest_error).boxed())
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, ApiError> {
        let dto: SessionDto = self.get_json(&format!("session/{session_id}")).await?;
        Ok(dto.into_domain())
    }

    async fn get_sessions(&self, query: SessionQuery) -> Result<Vec<Session>, ApiError> {
        let sessions: Vec<SessionDto> = self.get_json_with_query("session", &query).await?;
        Ok(sessions.into_iter().map(SessionDto::into_domain).collect())
    }

    async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<Session, ApiError> {
        let body = CreateSessionRequest {
            parent_id: parent_id.map(str::to_string),
            title: title.map(str::to_string),
        };
        let dto: SessionDto = self
            .post_json("session", &body, self.request_timeout)
            .await?;
        Ok(dto.into_domain())
    }

    async fn fork_session(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Session, ApiError> {
        let body = ForkSessionRequest {
            message_id: message_id.map(str::to_string),
        };
        let dto: SessionDto = self
            .post_json(&format!("session/{session_id}/fork"), &body, self.request_timeout)
            .await?;
        Ok(dto.into_domain())
    }

    async fn revert_session(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: Option<&str>,
    ) -> Result<Session, ApiError> {
        let body = RevertSessionRequest {
            message_id: message_id.to_string(),
            part_id: part_id.map(str::to_string),
        };
        let dto: SessionDto = self
            .post_json(
                &format!("session/{session_id}/revert"),
                &body,
                self.request_timeout,
            )
            .await?;
        Ok(dto.into_domain())
    }

    async fn abort_session(&self, session_id: &str) -> Result<bool, ApiError> {
        let builder = self
            .http
            .post(self.url(&format!("session/{session_id}/abort"))?)
            .timeout(self.request_timeout);
        let response = self
            .decorate(builder, None)
            .await
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            debug!(
                session_id,
                status = response.status().as_u16(),
                "sync: abort rejected"
            );
            return Ok(false);
        }
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(parse_abort_response(&body))
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
        reverse: bool,
    ) -> Result<Vec<Message>, ApiError> {
        let query = MessagesQuery {
            limit,
            reverse: reverse.then_some(1),
        };
        let messages: Vec<MessageWithPartsDto> = self
            .get_json_with_query(&format!("session/{session_id}/message"), &query)
            .await?;
        messages
            .into_iter()
            .map(MessageWithPartsDto::into_domain)
            .collect()
    }

    async fn send_message(
        &self,
        session_id: &str,
        request: SendMessageRequest,
    ) -> Result<AssistantMessage, ApiError> {
        let response: MessageWithPartsDto = self
            .post_json(
                &format!("session/{session_id}/message"),
                &request,
                self.send_timeout,
            )
            .await?;
        Ok(response.into_assistant())
    }

    async fn send_command(
        &self,
        session_id: &str,
        request: SendCommandRequest,
    ) -> Result<AssistantMessage, ApiError> {
        let response: MessageWithPartsDto = self
            .post_json(
                &format!("session/{session_id}/command"),
                &request,
                self.send_timeout,
            )
            .await?;
        Ok(response.into_assistant())
    }

    async fn find_files(&self, query: &str, dirs: bool) -> Result<Vec<String>, ApiError> {
        self.get_json_with_query("find/file", &FindFilesQuery { query, dirs })
            .await
    }

    async fn pending_permissions(&self) -> Result<Vec<PermissionRequest>, ApiError> {
        let requests: Vec<PermissionRequestDto> = self.get_json("permission").await?;
        Ok(requests
            .into_iter()
            .map(PermissionRequestDto::into_domain)
            .collect())
    }

    async fn reply_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
        message: Option<&str>,
    ) -> Result<(), ApiError> {
        let body = PermissionReplyRequest {
            reply: reply.as_str().to_string(),
            message: message.map(str::to_string),
        };
        let builder = self
            .http
            .post(self.url(&format!("permission/{request_id}/reply"))?)
            .json(&body);
        self.execute(builder, self.request_timeout).await?;
        Ok(())
    }

    async fn list_commands(&self) -> Result<Vec<CommandInfo>, ApiError> {
        let commands: Vec<CommandDto> = self.get_json("command").await?;
        Ok(commands.into_iter().map(CommandDto::into_domain).collect())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
