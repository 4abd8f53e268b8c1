//! Discord channel adapter using Serenity

use crate::bus::PlatformClient;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serenity::all::{
    ChannelId, Client, Context, CreateWebhook, EventHandler, ExecuteWebhook, GatewayIntents,
    Http, Message, Ready, UserId, Webhook,
};
use serenity::gateway::GatewayError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stoatcord_core::{
    BridgeError, EchoGuard, InboundMessage, OutboundMessage, Platform, SendTarget, TargetRegistry,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WEBHOOK_NAME: &str = "Stoat Bridge";

/// Posts into one Discord channel through a webhook
pub struct WebhookTarget {
    http: Arc<Http>,
    webhook: Webhook,
}

impl WebhookTarget {
    pub fn new(http: Arc<Http>, webhook: Webhook) -> Self {
        Self { http, webhook }
    }
}

#[async_trait]
impl SendTarget for WebhookTarget {
    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let mut builder = ExecuteWebhook::new()
            .content(msg.content.clone())
            .username(msg.username.clone());
        if let Some(avatar_url) = &msg.avatar_url {
            builder = builder.avatar_url(avatar_url.clone());
        }
        let http: &Http = &self.http;
        // wait = true: Discord confirms the message was created
        self.webhook.execute(http, true, builder).await?;
        Ok(())
    }

    fn handle_id(&self) -> Option<String> {
        Some(self.webhook.id.to_string())
    }
}

/// Event handler for Discord messages
#[derive(Clone)]
struct DiscordHandler {
    tx: mpsc::Sender<InboundMessage>,
    channel_ids: Arc<Vec<ChannelId>>,
    webhook_name: String,
    targets: TargetRegistry,
    echo: EchoGuard,
    setup_started: Arc<AtomicBool>,
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn message(&self, _ctx: Context, msg: Message) {
        let inbound = to_inbound(&msg);
        if let Err(e) = self.tx.send(inbound).await {
            error!("Failed to queue Discord message for relay: {}", e);
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Discord: connected as {}", ready.user.name);
        info!("Discord: bridging {} channel pair(s)", self.channel_ids.len());
        self.echo.set_own_user_id(ready.user.id.to_string());

        // Ready fires again after every reconnect; webhooks are set up once
        if self.setup_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = self.clone();
        let own_id = ready.user.id;
        tokio::spawn(async move {
            handler.setup_webhooks(ctx.http.clone(), own_id).await;
        });
    }
}

impl DiscordHandler {
    /// Reuse a webhook owned by this bot in each channel, or create one.
    /// A channel that fails stays without a send target.
    async fn setup_webhooks(&self, http: Arc<Http>, own_id: UserId) {
        for channel_id in self.channel_ids.iter().copied() {
            match self.webhook_for(&http, channel_id, own_id).await {
                Ok(webhook) => {
                    let target = WebhookTarget::new(http.clone(), webhook);
                    if let Some(handle_id) = target.handle_id() {
                        self.echo.add_handle(handle_id);
                    }
                    self.targets.insert(channel_id.to_string(), Arc::new(target));
                }
                Err(e) => {
                    let err =
                        BridgeError::channel_setup(Platform::Discord, channel_id.to_string(), e);
                    error!("{}", err);
                }
            }
        }
        info!(
            "Discord: {}/{} webhook(s) ready, {} tracked for echo filtering",
            self.targets.len(),
            self.channel_ids.len(),
            self.echo.handle_count()
        );
    }

    async fn webhook_for(
        &self,
        http: &Http,
        channel_id: ChannelId,
        own_id: UserId,
    ) -> Result<Webhook> {
        let existing = channel_id.webhooks(http).await?;
        if let Some(webhook) = pick_own_webhook(existing, own_id) {
            info!(
                "Discord: reusing webhook '{}' for channel {}",
                webhook.name.as_deref().unwrap_or_default(),
                channel_id
            );
            return Ok(webhook);
        }

        let webhook = channel_id
            .create_webhook(http, CreateWebhook::new(self.webhook_name.as_str()))
            .await?;
        info!("Discord: created webhook for channel {}", channel_id);
        Ok(webhook)
    }
}

/// First webhook created by `own_id` that we can post through
fn pick_own_webhook(webhooks: Vec<Webhook>, own_id: UserId) -> Option<Webhook> {
    webhooks.into_iter().find(|wh| {
        wh.token.is_some() && wh.user.as_ref().is_some_and(|user| user.id == own_id)
    })
}

/// Convert a gateway message into the relay's inbound shape.
///
/// Name precedence: guild nickname, global display name, username.
/// The avatar falls back to Discord's default avatar.
fn to_inbound(msg: &Message) -> InboundMessage {
    let author_name = msg
        .member
        .as_ref()
        .and_then(|member| member.nick.clone())
        .unwrap_or_else(|| msg.author.display_name().to_string());

    InboundMessage {
        platform: Platform::Discord,
        channel_id: msg.channel_id.to_string(),
        author_id: msg.author.id.to_string(),
        origin_handle_id: msg.webhook_id.map(|id| id.to_string()),
        author_name,
        author_avatar_url: Some(msg.author.face()),
        content: msg.content.clone(),
        received_at: Utc::now(),
    }
}

/// Discord channel adapter
pub struct DiscordChannel {
    token: String,
    channel_ids: Vec<String>,
    webhook_name: String,
    targets: TargetRegistry,
    echo: EchoGuard,
    setup_started: Arc<AtomicBool>,
}

impl DiscordChannel {
    /// Create a new Discord channel adapter
    ///
    /// # Arguments
    /// * `token` - Discord bot token
    /// * `channel_ids` - Discord channel ids (as strings) to bridge, in pair order
    pub fn new(token: String, channel_ids: Vec<String>) -> Self {
        Self {
            token,
            channel_ids,
            webhook_name: DEFAULT_WEBHOOK_NAME.to_string(),
            targets: TargetRegistry::new(Platform::Discord),
            echo: EchoGuard::new(),
            setup_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name given to webhooks this bridge creates
    pub fn with_webhook_name(mut self, name: impl Into<String>) -> Self {
        self.webhook_name = name.into();
        self
    }

    /// Parse channel IDs from strings to ChannelId
    fn parse_channel_ids(&self) -> Result<Vec<ChannelId>> {
        self.channel_ids
            .iter()
            .map(|id_str| {
                id_str
                    .parse::<u64>()
                    .ok()
                    .filter(|id| *id != 0)
                    .map(ChannelId::new)
                    .ok_or_else(|| anyhow!("Invalid Discord channel ID '{}'", id_str))
            })
            .collect()
    }

    /// Required gateway intents for the bridge
    fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::GUILD_WEBHOOKS
            | GatewayIntents::MESSAGE_CONTENT
    }
}

/// Check if a serenity error represents a fatal gateway condition that should not be retried
fn is_fatal_gateway_error(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Gateway(gateway_err) => matches!(
            gateway_err,
            GatewayError::InvalidAuthentication
                | GatewayError::NoAuthentication
                | GatewayError::InvalidShardData
                | GatewayError::DisallowedGatewayIntents
                | GatewayError::InvalidGatewayIntents
        ),
        _ => false,
    }
}

#[async_trait]
impl PlatformClient for DiscordChannel {
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        info!("Starting Discord channel adapter");

        let handler = DiscordHandler {
            tx,
            channel_ids: Arc::new(self.parse_channel_ids()?),
            webhook_name: self.webhook_name.clone(),
            targets: self.targets.clone(),
            echo: self.echo.clone(),
            setup_started: self.setup_started.clone(),
        };
        let token = self.token.clone();

        // Spawn the Discord client in a background task with retry logic
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(60);
            let mut retry_count = 0;

            loop {
                retry_count += 1;
                info!("Discord client starting (attempt #{})", retry_count);

                let mut client = match Client::builder(&token, DiscordChannel::intents())
                    .event_handler(handler.clone())
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        if is_fatal_gateway_error(&e) {
                            error!("Discord fatal error (will not retry): {}", e);
                            error!(
                                "Check your DISCORD_BOT_TOKEN and bot settings at https://discord.com/developers/applications"
                            );
                            break;
                        }
                        error!("Failed to create Discord client: {}", e);
                        warn!("Retrying in {:?}...", backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(max_backoff);
                        continue;
                    }
                };

                match client.start().await {
                    Ok(_) => {
                        info!("Discord client stopped cleanly");
                        break;
                    }
                    Err(e) => {
                        if is_fatal_gateway_error(&e) {
                            error!("Discord fatal error (will not retry): {}", e);
                            error!(
                                "Check your DISCORD_BOT_TOKEN and bot settings at https://discord.com/developers/applications"
                            );
                            break;
                        }
                        error!("Discord client error: {}", e);
                        warn!("Retrying in {:?}...", backoff);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(max_backoff);
                    }
                }

                if handler.tx.is_closed() {
                    debug!("Discord event receiver dropped");
                    break;
                }
            }

            info!("Discord client task exiting");
        });

        info!("Discord channel adapter started");
        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn targets(&self) -> TargetRegistry {
        self.targets.clone()
    }

    fn echo_guard(&self) -> EchoGuard {
        self.echo.clone()
    }
}
