//! Minimal Stoat REST client and event models
//!
//! Only the calls the bridge needs: own identity, channel and user lookup,
//! and posting a message with a masquerade override.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://stoat.chat/api";
pub const DEFAULT_WS_URL: &str = "wss://stoat.chat/events";
pub const DEFAULT_FILES_URL: &str = "https://cdn.stoatusercontent.com";

/// Header carrying a bot token on REST calls
const BOT_TOKEN_HEADER: &str = "x-bot-token";

/// Base URLs of a Stoat deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoatEndpoints {
    pub api_url: String,
    pub ws_url: String,
    pub files_url: String,
}

impl Default for StoatEndpoints {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            files_url: DEFAULT_FILES_URL.to_string(),
        }
    }
}

/// Uploaded file reference (avatars, attachments)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoatFile {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoatUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<StoatFile>,
}

impl StoatUser {
    /// Display name, falling back to the username
    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoatMemberId {
    pub server: String,
    pub user: String,
}

/// Server member, as embedded in message events
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoatMember {
    #[serde(rename = "_id")]
    pub id: StoatMemberId,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<StoatFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoatChannelInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
}

/// Per-message author override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Masquerade {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoatMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub channel: String,
    pub author: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub masquerade: Option<Masquerade>,
    #[serde(default)]
    pub user: Option<StoatUser>,
    #[serde(default)]
    pub member: Option<StoatMember>,
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    masquerade: Option<Masquerade>,
}

/// Events received on the Stoat event socket (JSON format)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    Authenticated,
    Ready,
    Pong {
        #[serde(default)]
        data: serde_json::Value,
    },
    Message(StoatMessage),
    Error(SocketError),
    #[serde(other)]
    Other,
}

/// Body of an `Error` frame.
///
/// Current servers nest the error as `{"data": {"type": "InvalidSession", ...}}`,
/// older ones send `{"error": "InvalidSession"}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketError {
    #[serde(default)]
    pub data: Option<SocketErrorData>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketErrorData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub location: Option<String>,
}

impl SocketError {
    pub fn kind(&self) -> &str {
        self.data
            .as_ref()
            .map(|d| d.kind.as_str())
            .or(self.error.as_deref())
            .unwrap_or("Unknown")
    }

    /// The server refused our token; reconnecting will not help
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.kind(), "InvalidSession" | "NotAuthenticated")
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.data.as_ref().and_then(|d| d.location.as_deref()) {
            Some(location) => write!(f, "{} at {}", self.kind(), location),
            None => f.write_str(self.kind()),
        }
    }
}

/// Frames we send on the event socket
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent<'a> {
    Authenticate { token: &'a str },
    Ping { data: u64 },
}

/// Non-success HTTP status returned by the Stoat API
#[derive(Debug, thiserror::Error)]
#[error("Stoat API HTTP error on {method} {path}: {status} {detail}")]
pub struct HttpStatusError {
    pub method: &'static str,
    pub path: String,
    pub status: reqwest::StatusCode,
    pub detail: String,
}

impl HttpStatusError {
    /// The token was rejected; retrying will not help
    pub fn is_unauthorized(&self) -> bool {
        self.status == reqwest::StatusCode::UNAUTHORIZED
    }
}

async fn check_status(
    response: reqwest::Response,
    method: &'static str,
    path: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(HttpStatusError {
        method,
        path: path.to_string(),
        status,
        detail,
    }
    .into())
}

/// REST client for one bot account
#[derive(Clone)]
pub struct StoatHttp {
    client: reqwest::Client,
    token: String,
    endpoints: StoatEndpoints,
}

impl StoatHttp {
    pub fn new(token: String, endpoints: StoatEndpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &StoatEndpoints {
        &self.endpoints
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.api_url.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .header(BOT_TOKEN_HEADER, &self.token)
            .send()
            .await
            .with_context(|| format!("Stoat GET {} failed", path))?;

        check_status(response, "GET", path)
            .await?
            .json()
            .await
            .with_context(|| format!("Invalid Stoat response for GET {}", path))
    }

    /// The bot account's own user
    pub async fn fetch_self(&self) -> Result<StoatUser> {
        self.get("/users/@me").await
    }

    pub async fn fetch_user(&self, user_id: &str) -> Result<StoatUser> {
        self.get(&format!("/users/{}", user_id)).await
    }

    pub async fn fetch_channel(&self, channel_id: &str) -> Result<StoatChannelInfo> {
        self.get(&format!("/channels/{}", channel_id)).await
    }

    /// Post a message and return it as created by the server
    pub async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        masquerade: Option<Masquerade>,
    ) -> Result<StoatMessage> {
        let path = format!("/channels/{}/messages", channel_id);
        let body = SendMessageBody {
            content,
            masquerade,
        };

        let response = self
            .client
            .post(self.url(&path))
            .header(BOT_TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Stoat POST {} failed", path))?;

        let message: StoatMessage = check_status(response, "POST", &path)
            .await?
            .json()
            .await
            .with_context(|| format!("Invalid Stoat response for POST {}", path))?;
        debug!("Stoat message {} created in {}", message.id, channel_id);
        Ok(message)
    }

    /// Public URL of an uploaded avatar
    pub fn file_url(&self, file: &StoatFile) -> String {
        let tag = file.tag.as_deref().unwrap_or("avatars");
        format!(
            "{}/{}/{}",
            self.endpoints.files_url.trim_end_matches('/'),
            tag,
            file.id
        )
    }

    /// Generated avatar for users without one
    pub fn default_avatar_url(&self, user_id: &str) -> String {
        self.url(&format!("/users/{}/default_avatar", user_id))
    }
}
