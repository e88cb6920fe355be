//! Discord gateway backed by serenity.
//!
//! Serenity's callbacks are turned into [`SessionEvent`]s on a channel;
//! nothing else in the crate sees serenity types.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serenity::builder::{CreateAllowedMentions, CreateMessage};
use serenity::cache::Cache;
use serenity::client::ClientBuilder;
use serenity::gateway::{ConnectionStage, ShardManager, ShardStageUpdateEvent};
use serenity::http::{Http, HttpBuilder, HttpError};
use serenity::model::channel::Message;
use serenity::model::event::ResumedEvent;
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, GuildId};
use serenity::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::webhook::{classify_status, WebhookSender};
use super::{Connection, Credentials, Gateway, GatewaySession, RateLimit, SessionEvent};
use crate::common::error::{GatewayError, SendFailure};
use crate::common::messages::{InboundMessage, MentionLookup, OutboundPayload};
use crate::common::types::{SourceSystem, UserRef};

/// Bot messages: 5 per 5 seconds per channel.
const BOT_RATE_LIMIT: RateLimit = RateLimit {
    capacity: 5,
    refill_per_sec: 1.0,
};

/// Webhook posts: 30 per minute per channel.
const WEBHOOK_RATE_LIMIT: RateLimit = RateLimit {
    capacity: 5,
    refill_per_sec: 0.5,
};

fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS | GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT
}

pub struct DiscordGateway {
    channel_id: ChannelId,
    webhook: Option<Arc<WebhookSender>>,
}

impl DiscordGateway {
    pub fn new(channel_id: u64, webhook: Option<WebhookSender>) -> anyhow::Result<Self> {
        if channel_id == 0 {
            anyhow::bail!("Discord channel id must not be zero");
        }
        Ok(Self {
            channel_id: ChannelId::new(channel_id),
            webhook: webhook.map(Arc::new),
        })
    }
}

#[async_trait]
impl Gateway for DiscordGateway {
    async fn connect(&self, credentials: &Credentials) -> Result<Connection, GatewayError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let handler = RelayEvents {
            events_tx: events_tx.clone(),
            channel_id: self.channel_id,
            webhook_id: self.webhook.as_ref().and_then(|w| w.webhook_id()),
            connected: Arc::clone(&connected),
        };

        let http = HttpBuilder::new(&credentials.token).build();
        let mut client = ClientBuilder::new_with_http(http, intents())
            .event_handler(handler)
            .await
            .map_err(classify_gateway_error)?;

        let session = DiscordSession {
            http: Arc::clone(&client.http),
            shard_manager: Arc::clone(&client.shard_manager),
            channel_id: self.channel_id,
            webhook: self.webhook.clone(),
            connected,
        };

        tokio::spawn(async move {
            let reason = match client.start().await {
                Ok(()) => {
                    info!("Discord client disconnected normally");
                    GatewayError::Closed
                }
                Err(e) => {
                    error!("Discord client error: {}", e);
                    classify_gateway_error(e)
                }
            };
            if events_tx.send(SessionEvent::Closed { reason }).is_err() {
                debug!("Session already dropped");
            }
        });

        Ok(Connection {
            session: Arc::new(session),
            events,
        })
    }
}

struct DiscordSession {
    http: Arc<Http>,
    shard_manager: Arc<ShardManager>,
    channel_id: ChannelId,
    webhook: Option<Arc<WebhookSender>>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl GatewaySession for DiscordSession {
    async fn send(&self, payload: &OutboundPayload) -> Result<(), SendFailure> {
        if let Some(webhook) = &self.webhook {
            return webhook.send(payload).await;
        }

        let message = CreateMessage::new()
            .content(&payload.content)
            .allowed_mentions(CreateAllowedMentions::new());
        self.channel_id
            .send_message(&self.http, message)
            .await
            .map(|_| ())
            .map_err(classify_send_error)
    }

    fn rate_limit(&self) -> RateLimit {
        if self.webhook.is_some() {
            WEBHOOK_RATE_LIMIT
        } else {
            BOT_RATE_LIMIT
        }
    }

    fn not_before(&self) -> Option<tokio::time::Instant> {
        // Serenity paces bot requests itself
        self.webhook.as_ref().and_then(|webhook| webhook.not_before())
    }

    async fn resume(&self) -> Result<(), GatewayError> {
        // Serenity resumes the shard on its own, this only reports progress
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::TransientNetwork {
                message: "shard not connected".to_string(),
            })
        }
    }

    async fn close(&self) {
        info!("Initiating graceful Discord shutdown...");
        self.shard_manager.shutdown_all().await;
        info!("Discord shutdown complete");
    }
}

struct RelayEvents {
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    channel_id: ChannelId,
    webhook_id: Option<u64>,
    connected: Arc<AtomicBool>,
}

impl RelayEvents {
    fn emit(&self, event: SessionEvent) {
        if let Err(error) = self.events_tx.send(event) {
            warn!("Failed to process discord event: {}", error);
        }
    }
}

#[async_trait]
impl EventHandler for RelayEvents {
    async fn ready(&self, _context: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Authenticated);

        // cache_ready never fires without guilds
        if ready.guilds.is_empty() {
            warn!("Bot is not a member of any guild");
            self.emit(SessionEvent::Ready);
        }
    }

    async fn cache_ready(&self, _context: Context, guilds: Vec<GuildId>) {
        debug!("Cache ready with {} guilds", guilds.len());
        self.emit(SessionEvent::Ready);
    }

    async fn resume(&self, _context: Context, _event: ResumedEvent) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Resumed);
    }

    async fn shard_stage_update(&self, _context: Context, event: ShardStageUpdateEvent) {
        let now_connected = matches!(event.new, ConnectionStage::Connected);
        let was_connected = self.connected.swap(now_connected, Ordering::SeqCst);

        if was_connected && !now_connected {
            self.emit(SessionEvent::ConnectivityLost);
        } else if !was_connected && now_connected {
            self.emit(SessionEvent::Resumed);
        }
    }

    async fn message(&self, context: Context, message: Message) {
        if message.channel_id != self.channel_id {
            return;
        }

        let from_self = message.author.id == context.cache.current_user().id
            || (self.webhook_id.is_some() && message.webhook_id.map(|id| id.get()) == self.webhook_id);

        let inbound = inbound_message(&context.cache, &message, from_self);
        self.emit(SessionEvent::Message(inbound));
    }
}

fn inbound_message(cache: &Cache, message: &Message, from_self: bool) -> InboundMessage {
    let display_name = message
        .member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .or_else(|| message.author.global_name.clone())
        .unwrap_or_else(|| message.author.name.clone());

    let mut content = message.content.clone();
    for attachment in &message.attachments {
        if !content.is_empty() {
            content.push(' ');
        }
        content.push_str(&attachment.url);
    }

    InboundMessage {
        id: message.id.to_string(),
        author: UserRef::new(SourceSystem::Gateway, message.author.id.to_string(), display_name),
        mentions: mention_lookup(cache, message),
        content,
        nonce: None,
        from_self,
    }
}

fn mention_lookup(cache: &Cache, message: &Message) -> MentionLookup {
    let users = message
        .mentions
        .iter()
        .map(|user| {
            let name = user.global_name.clone().unwrap_or_else(|| user.name.clone());
            UserRef::new(SourceSystem::Gateway, user.id.to_string(), name)
        })
        .collect();

    let mut roles = HashMap::new();
    let mut channels = HashMap::new();
    if let Some(guild) = message.guild_id.and_then(|id| cache.guild(id)) {
        for role_id in &message.mention_roles {
            if let Some(role) = guild.roles.get(role_id) {
                roles.insert(role_id.to_string(), role.name.clone());
            }
        }
        for id in mentioned_channel_ids(&message.content) {
            if let Some(channel) = guild.channels.get(&ChannelId::new(id)) {
                channels.insert(id.to_string(), channel.name.clone());
            }
        }
    }

    MentionLookup {
        users,
        roles,
        channels,
    }
}

/// Ids of `<#id>` channel mentions in raw content. Never returns zero.
fn mentioned_channel_ids(content: &str) -> Vec<u64> {
    let mut ids = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("<#") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find('>') else { break };
        if let Ok(id) = rest[..end].parse::<u64>() {
            if id != 0 && !ids.contains(&id) {
                ids.push(id);
            }
        }
        rest = &rest[end..];
    }
    ids
}

fn classify_gateway_error(error: serenity::Error) -> GatewayError {
    match &error {
        serenity::Error::Gateway(serenity::gateway::GatewayError::InvalidAuthentication) => {
            GatewayError::AuthenticationFailure {
                reason: error.to_string(),
            }
        }
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 401 =>
        {
            GatewayError::AuthenticationFailure {
                reason: response.error.message.clone(),
            }
        }
        _ => GatewayError::TransientNetwork {
            message: error.to_string(),
        },
    }
}

fn classify_send_error(error: serenity::Error) -> SendFailure {
    match &error {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
            classify_status(response.status_code.as_u16(), None, &response.error.message)
        }
        // Rejected locally, e.g. content over the length limit
        serenity::Error::Model(_) => SendFailure::permanent(error.to_string()),
        _ => SendFailure::transient(error.to_string()),
    }
}
