//! Stoat channel adapter: REST for sending, event socket for receiving

use crate::bus::PlatformClient;
use crate::stoat_api::{
    ClientEvent, HttpStatusError, Masquerade, ServerEvent, SocketError, StoatEndpoints,
    StoatHttp, StoatMessage, StoatUser,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stoatcord_core::{
    BridgeError, EchoGuard, InboundMessage, OutboundMessage, Platform, SendTarget, TargetRegistry,
};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use url::Url;

const AUTHOR_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(512).unwrap();
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const AUTHOR_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The event socket refused our token
#[derive(Debug, thiserror::Error)]
#[error("Stoat rejected the bot token: {0}")]
struct AuthRejected(String);

/// Posts into one Stoat channel with a masquerade override
pub struct StoatChannelTarget {
    http: StoatHttp,
    channel_id: String,
}

impl StoatChannelTarget {
    pub fn new(http: StoatHttp, channel_id: String) -> Self {
        Self { http, channel_id }
    }
}

#[async_trait]
impl SendTarget for StoatChannelTarget {
    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let masquerade = Masquerade {
            name: Some(msg.username.clone()),
            avatar: msg.avatar_url.clone(),
        };
        self.http
            .send_message(&self.channel_id, &msg.content, Some(masquerade))
            .await?;
        Ok(())
    }
}

/// State shared between the adapter and its background tasks
#[derive(Clone)]
struct StoatContext {
    http: StoatHttp,
    channel_ids: Arc<Vec<String>>,
    channel_set: Arc<HashSet<String>>,
    targets: TargetRegistry,
    echo: EchoGuard,
    authors: Arc<Mutex<LruCache<String, StoatUser>>>,
    setup_started: Arc<AtomicBool>,
}

/// Stoat channel adapter
pub struct StoatChannel {
    ctx: StoatContext,
}

impl StoatChannel {
    /// Create a new Stoat channel adapter
    ///
    /// # Arguments
    /// * `token` - Stoat bot token
    /// * `channel_ids` - Stoat channels to bridge, in pair order
    /// * `endpoints` - base URLs of the Stoat deployment
    pub fn new(token: String, channel_ids: Vec<String>, endpoints: StoatEndpoints) -> Self {
        let channel_set = channel_ids.iter().cloned().collect();
        Self {
            ctx: StoatContext {
                http: StoatHttp::new(token, endpoints),
                channel_ids: Arc::new(channel_ids),
                channel_set: Arc::new(channel_set),
                targets: TargetRegistry::new(Platform::Stoat),
                echo: EchoGuard::new(),
                authors: Arc::new(Mutex::new(LruCache::new(AUTHOR_CACHE_SIZE))),
                setup_started: Arc::new(AtomicBool::new(false)),
            },
        }
    }
}

#[async_trait]
impl PlatformClient for StoatChannel {
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        info!("Starting Stoat channel adapter");
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward_messages(self.ctx.clone(), raw_rx, tx));
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            event_loop(ctx, raw_tx).await;
            info!("Stoat client task exiting");
        });
        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::Stoat
    }

    fn targets(&self) -> TargetRegistry {
        self.ctx.targets.clone()
    }

    fn echo_guard(&self) -> EchoGuard {
        self.ctx.echo.clone()
    }
}

/// Check if an error means the token is bad, so reconnecting is pointless
fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AuthRejected>().is_some()
        || err
            .downcast_ref::<HttpStatusError>()
            .is_some_and(HttpStatusError::is_unauthorized)
}

/// Map an `Error` frame to the session error, fatal when the token was refused
fn socket_failure(err: SocketError) -> anyhow::Error {
    if err.is_auth_rejection() {
        AuthRejected(err.to_string()).into()
    } else {
        anyhow::anyhow!("Stoat socket error: {}", err)
    }
}

/// Resolve authors and hand messages to the relay in arrival order.
/// Runs apart from the socket task, so REST lookups never hold up heartbeats.
async fn forward_messages(
    ctx: StoatContext,
    mut raw_rx: mpsc::UnboundedReceiver<StoatMessage>,
    tx: mpsc::Sender<InboundMessage>,
) {
    while let Some(msg) = raw_rx.recv().await {
        let inbound = to_inbound(&ctx, msg).await;
        if tx.send(inbound).await.is_err() {
            debug!("Stoat event receiver dropped");
            break;
        }
    }
}

/// Reconnect loop around one socket session
async fn event_loop(ctx: StoatContext, tx: mpsc::UnboundedSender<StoatMessage>) {
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        info!("Stoat client connecting (attempt #{})", attempt);

        match run_session(&ctx, &tx).await {
            Ok(()) => {
                info!("Stoat event socket closed");
                backoff = Duration::from_secs(1);
            }
            Err(e) if is_fatal(&e) => {
                error!("Stoat fatal error (will not retry): {:#}", e);
                error!("Check your STOAT_BOT_TOKEN");
                return;
            }
            Err(e) => error!("Stoat client error: {:#}", e),
        }

        if tx.is_closed() {
            debug!("Stoat message forwarder stopped");
            return;
        }

        warn!("Reconnecting to Stoat in {:?}...", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn socket_url(ws_url: &str) -> Result<Url> {
    let mut url = Url::parse(ws_url).with_context(|| format!("Invalid Stoat ws url {}", ws_url))?;
    url.query_pairs_mut()
        .append_pair("version", "1")
        .append_pair("format", "json");
    Ok(url)
}

/// One authenticated socket session. Returns `Ok` when the server closes the
/// socket after a successful `Ready`.
async fn run_session(ctx: &StoatContext, tx: &mpsc::UnboundedSender<StoatMessage>) -> Result<()> {
    if ctx.echo.own_user_id().is_none() {
        let me = ctx.http.fetch_self().await.context("Failed to fetch Stoat bot user")?;
        info!("Stoat: connected as {} ({})", me.username, me.id);
        ctx.echo.set_own_user_id(me.id);
    }

    let url = socket_url(&ctx.http.endpoints().ws_url)?;
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .context("Failed to open Stoat event socket")?;
    let (mut write, mut read) = socket.split();

    let auth = serde_json::to_string(&ClientEvent::Authenticate {
        token: ctx.http.token(),
    })?;
    write.send(WsMessage::text(auth)).await?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut ping_seq = 0u64;
    let mut ready = false;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                ping_seq += 1;
                let ping = serde_json::to_string(&ClientEvent::Ping { data: ping_seq })?;
                write.send(WsMessage::text(ping)).await?;
            }
            frame = read.next() => {
                let text = match frame {
                    None | Some(Ok(WsMessage::Close(_))) if ready => return Ok(()),
                    None | Some(Ok(WsMessage::Close(_))) => {
                        anyhow::bail!("Stoat closed the socket before Ready")
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };

                let event = match serde_json::from_str::<ServerEvent>(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("Ignoring unparseable Stoat frame: {}", e);
                        continue;
                    }
                };

                match event {
                    ServerEvent::Authenticated => debug!("Stoat: authenticated"),
                    ServerEvent::Ready => {
                        ready = true;
                        info!("Stoat: session ready");
                        if !ctx.setup_started.swap(true, Ordering::SeqCst) {
                            tokio::spawn(setup_channels(ctx.clone()));
                        }
                    }
                    ServerEvent::Pong { .. } => {}
                    ServerEvent::Message(msg) => {
                        if tx.send(msg).is_err() {
                            return Ok(());
                        }
                    }
                    ServerEvent::Error(err) => return Err(socket_failure(err)),
                    ServerEvent::Other => {}
                }
            }
        }
    }
}

/// Resolve every configured channel once and register it as a send target.
/// Failures leave that pair inert for the process lifetime.
async fn setup_channels(ctx: StoatContext) {
    for channel_id in ctx.channel_ids.iter() {
        match ctx.http.fetch_channel(channel_id).await {
            Ok(channel) => {
                ctx.targets.insert(
                    channel_id.clone(),
                    Arc::new(StoatChannelTarget::new(ctx.http.clone(), channel_id.clone())),
                );
                info!(
                    "Stoat: listening in #{} (id={})",
                    channel.name.as_deref().unwrap_or("?"),
                    channel_id
                );
            }
            Err(e) => {
                let err = BridgeError::channel_setup(Platform::Stoat, channel_id.as_str(), e);
                error!("{}", err);
            }
        }
    }
    info!(
        "Stoat: {}/{} channel(s) ready",
        ctx.targets.len(),
        ctx.channel_ids.len()
    );
}

/// Look up the author, preferring the copy embedded in the event, then the
/// cache, then the API.
async fn resolve_author(ctx: &StoatContext, msg: &StoatMessage) -> Option<StoatUser> {
    if let Some(user) = &msg.user {
        ctx.authors.lock().await.put(user.id.clone(), user.clone());
        return Some(user.clone());
    }
    if let Some(user) = ctx.authors.lock().await.get(&msg.author) {
        return Some(user.clone());
    }
    match tokio::time::timeout(AUTHOR_LOOKUP_TIMEOUT, ctx.http.fetch_user(&msg.author)).await {
        Ok(Ok(user)) => {
            ctx.authors.lock().await.put(user.id.clone(), user.clone());
            Some(user)
        }
        Ok(Err(e)) => {
            warn!("Stoat: could not fetch user {}: {:#}", msg.author, e);
            None
        }
        Err(_) => {
            warn!(
                "Stoat: fetching user {} timed out after {:?}",
                msg.author, AUTHOR_LOOKUP_TIMEOUT
            );
            None
        }
    }
}

/// Whether the relay will drop this message before it needs author details
fn skips_author_lookup(ctx: &StoatContext, msg: &StoatMessage) -> bool {
    msg.content.as_deref().unwrap_or_default().is_empty()
        || !ctx.channel_set.contains(&msg.channel)
        || ctx.echo.own_user_id().as_deref() == Some(msg.author.as_str())
}

/// Convert a socket message event into the relay's inbound shape.
///
/// Name precedence: masquerade, server nickname, display name, username.
/// Avatar precedence: masquerade, server avatar, user avatar, default avatar.
async fn to_inbound(ctx: &StoatContext, msg: StoatMessage) -> InboundMessage {
    let user = if skips_author_lookup(ctx, &msg) {
        None
    } else {
        resolve_author(ctx, &msg).await
    };
    let masquerade = msg.masquerade.as_ref();
    let member = msg.member.as_ref();

    let author_name = masquerade
        .and_then(|m| m.name.clone())
        .or_else(|| member.and_then(|m| m.nickname.clone()))
        .filter(|n| !n.is_empty())
        .or_else(|| user.as_ref().map(|u| u.name().to_string()))
        .unwrap_or_else(|| msg.author.clone());

    let author_avatar_url = masquerade
        .and_then(|m| m.avatar.clone())
        .or_else(|| member.and_then(|m| m.avatar.as_ref()).map(|f| ctx.http.file_url(f)))
        .or_else(|| {
            user.as_ref()
                .and_then(|u| u.avatar.as_ref())
                .map(|f| ctx.http.file_url(f))
        })
        .unwrap_or_else(|| ctx.http.default_avatar_url(&msg.author));

    InboundMessage {
        platform: Platform::Stoat,
        channel_id: msg.channel,
        author_id: msg.author,
        origin_handle_id: None,
        author_name,
        author_avatar_url: Some(author_avatar_url),
        content: msg.content.unwrap_or_default(),
        received_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stoat_api::{StoatFile, StoatMember, StoatMemberId};

    fn channel_for(api_url: &str) -> StoatChannel {
        StoatChannel::new(
            "bot-token".to_string(),
            vec!["01CHAN".to_string()],
            StoatEndpoints {
                api_url: api_url.to_string(),
                ws_url: "ws://localhost:1".to_string(),
                files_url: "https://files.example".to_string(),
            },
        )
    }

    fn message(author: &str, content: Option<&str>) -> StoatMessage {
        StoatMessage {
            id: "01MSG".to_string(),
            channel: "01CHAN".to_string(),
            author: author.to_string(),
            content: content.map(str::to_string),
            masquerade: None,
            user: None,
            member: None,
        }
    }

    fn user(id: &str, display: Option<&str>, avatar: Option<&str>) -> StoatUser {
        StoatUser {
            id: id.to_string(),
            username: "bob".to_string(),
            display_name: display.map(str::to_string),
            avatar: avatar.map(|a| StoatFile {
                id: a.to_string(),
                tag: Some("avatars".to_string()),
            }),
        }
    }

    #[test]
    fn test_stoat_creation() {
        let channel = channel_for("http://localhost");
        assert_eq!(channel.platform(), Platform::Stoat);
        assert!(channel.targets().is_empty());
        assert!(channel.echo_guard().own_user_id().is_none());
    }

    #[test]
    fn test_socket_url() {
        let url = socket_url("wss://stoat.chat/events").unwrap();
        assert_eq!(url.as_str(), "wss://stoat.chat/events?version=1&format=json");
        assert!(socket_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_embedded_user_used() {
        let channel = channel_for("http://127.0.0.1:1");
        let mut msg = message("01USER", Some("hello"));
        msg.user = Some(user("01USER", Some("Bobby"), Some("AVA")));

        let inbound = to_inbound(&channel.ctx, msg).await;
        assert_eq!(inbound.author_name, "Bobby");
        assert_eq!(
            inbound.author_avatar_url.as_deref(),
            Some("https://files.example/avatars/AVA")
        );
        assert_eq!(inbound.content, "hello");
        assert_eq!(inbound.platform, Platform::Stoat);
        assert!(channel.ctx.authors.lock().await.contains("01USER"));
    }

    #[tokio::test]
    async fn test_nickname_beats_display_name() {
        let channel = channel_for("http://127.0.0.1:1");
        let mut msg = message("01USER", Some("hello"));
        msg.user = Some(user("01USER", Some("Bobby"), None));
        msg.member = Some(StoatMember {
            id: StoatMemberId {
                server: "01SRV".to_string(),
                user: "01USER".to_string(),
            },
            nickname: Some("Captain".to_string()),
            avatar: None,
        });

        let inbound = to_inbound(&channel.ctx, msg).await;
        assert_eq!(inbound.author_name, "Captain");
        assert_eq!(
            inbound.author_avatar_url.as_deref(),
            Some("http://127.0.0.1:1/users/01USER/default_avatar")
        );
    }

    #[tokio::test]
    async fn test_author_fetched_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/users/01USER")
            .with_status(200)
            .with_body(r#"{"_id":"01USER","username":"bob"}"#)
            .expect(1)
            .create_async()
            .await;
        let channel = channel_for(&server.url());

        let first = to_inbound(&channel.ctx, message("01USER", Some("one"))).await;
        let second = to_inbound(&channel.ctx, message("01USER", Some("two"))).await;
        mock.assert_async().await;
        assert_eq!(first.author_name, "bob");
        assert_eq!(second.author_name, "bob");
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_author_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/01USER")
            .with_status(500)
            .create_async()
            .await;
        let channel = channel_for(&server.url());

        let inbound = to_inbound(&channel.ctx, message("01USER", Some("hi"))).await;
        assert_eq!(inbound.author_name, "01USER");
        assert!(inbound.author_avatar_url.unwrap().ends_with("/users/01USER/default_avatar"));
    }

    #[tokio::test]
    async fn test_no_lookup_for_messages_the_relay_drops() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let channel = channel_for(&server.url());
        channel.ctx.echo.set_own_user_id("01BOT");

        // own message, empty content, unconfigured channel
        to_inbound(&channel.ctx, message("01BOT", Some("relayed"))).await;
        to_inbound(&channel.ctx, message("01USER", None)).await;
        let mut other = message("01USER", Some("hi"));
        other.channel = "01OTHER".to_string();
        let inbound = to_inbound(&channel.ctx, other).await;
        mock.assert_async().await;
        assert_eq!(inbound.channel_id, "01OTHER");
    }

    #[tokio::test]
    async fn test_masquerade_preferred() {
        let channel = channel_for("http://127.0.0.1:1");
        let mut msg = message("01OTHERBOT", Some("hi"));
        msg.user = Some(user("01OTHERBOT", Some("Some Bot"), None));
        msg.masquerade = Some(Masquerade {
            name: Some("Carol".to_string()),
            avatar: Some("https://example.com/carol.png".to_string()),
        });
        let inbound = to_inbound(&channel.ctx, msg).await;
        assert_eq!(inbound.author_name, "Carol");
        assert_eq!(
            inbound.author_avatar_url.as_deref(),
            Some("https://example.com/carol.png")
        );
    }

    #[tokio::test]
    async fn test_setup_registers_reachable_channels() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/channels/01CHAN")
            .with_status(200)
            .with_body(r#"{"_id":"01CHAN","name":"general"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/channels/01GONE")
            .with_status(404)
            .create_async()
            .await;

        let channel = StoatChannel::new(
            "bot-token".to_string(),
            vec!["01CHAN".to_string(), "01GONE".to_string()],
            StoatEndpoints {
                api_url: server.url(),
                ..StoatEndpoints::default()
            },
        );
        setup_channels(channel.ctx.clone()).await;

        let targets = channel.targets();
        assert!(targets.contains("01CHAN"));
        assert!(!targets.contains("01GONE"));
    }

    #[tokio::test]
    async fn test_target_posts_masquerade() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/channels/01CHAN/messages")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "content": "hello",
                "masquerade": {"name": "Alice", "avatar": "https://cdn.example/a.png"}
            })))
            .with_status(200)
            .with_body(r#"{"_id":"01MSG","channel":"01CHAN","author":"01BOT","content":"hello"}"#)
            .create_async()
            .await;

        let http = StoatHttp::new(
            "bot-token".to_string(),
            StoatEndpoints {
                api_url: server.url(),
                ..StoatEndpoints::default()
            },
        );
        let target = StoatChannelTarget::new(http, "01CHAN".to_string());
        target
            .send(&OutboundMessage {
                channel_id: "01CHAN".to_string(),
                content: "hello".to_string(),
                username: "Alice".to_string(),
                avatar_url: Some("https://cdn.example/a.png".to_string()),
            })
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_fatal_errors() {
        assert!(is_fatal(&AuthRejected("InvalidSession".to_string()).into()));
        assert!(!is_fatal(&anyhow::anyhow!("connection reset")));
    }

    fn error_frame(raw: &str) -> SocketError {
        match serde_json::from_str::<ServerEvent>(raw).unwrap() {
            ServerEvent::Error(err) => err,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_invalid_session_frame_stops_reconnecting() {
        let err = socket_failure(error_frame(
            r#"{"type":"Error","data":{"type":"InvalidSession","location":"x"}}"#,
        ));
        assert!(is_fatal(&err));

        let err = socket_failure(error_frame(r#"{"type":"Error","error":"InvalidSession"}"#));
        assert!(is_fatal(&err));

        let err = socket_failure(error_frame(
            r#"{"type":"Error","data":{"type":"InternalError"}}"#,
        ));
        assert!(!is_fatal(&err));
        assert!(err.to_string().contains("InternalError"));
    }

    #[tokio::test]
    async fn test_forwarder_keeps_order_and_resolves_authors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/users/01USER")
            .with_status(200)
            .with_body(r#"{"_id":"01USER","username":"bob"}"#)
            .expect(1)
            .create_async()
            .await;
        let channel = channel_for(&server.url());

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let forwarder = tokio::spawn(forward_messages(channel.ctx.clone(), raw_rx, tx));

        for content in ["one", "two", "three"] {
            raw_tx.send(message("01USER", Some(content))).unwrap();
        }
        drop(raw_tx);
        forwarder.await.unwrap();

        let mut received = Vec::new();
        while let Some(inbound) = rx.recv().await {
            assert_eq!(inbound.author_name, "bob");
            received.push(inbound.content);
        }
        assert_eq!(received, vec!["one", "two", "three"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_forwarder_stops_when_relay_gone() {
        let channel = channel_for("http://127.0.0.1:1");
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let forwarder = tokio::spawn(forward_messages(channel.ctx.clone(), raw_rx, tx));

        channel.ctx.echo.set_own_user_id("01BOT");
        raw_tx.send(message("01BOT", Some("mine"))).unwrap();
        forwarder.await.unwrap();
        assert!(raw_tx.is_closed());
    }
}
