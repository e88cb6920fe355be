//! Message pipeline between the game and the gateway.
//!
//! [`Bridge`] turns game events into gateway payloads and gateway messages
//! into game display requests: filtering, format conversion, translation
//! and templating. It holds no mutable state; the coordinator task owns
//! echo suppression and the queue.

use std::sync::Arc;

use tracing::{debug, info};

use crate::common::error::{DeliveryError, InboundError};
use crate::common::messages::{ChatMessage, InboundMessage, MentionLookup, OriginId, OutboundPayload};
use crate::common::types::{RichText, SourceSystem, UserRef};
use crate::config::{AnnounceConfig, Config, RelayOptions, TextsConfig};
use crate::format::{
    emoji_to_shortcodes, escape_markdown, split_message, to_game_rich_text, to_gateway_markdown, FormatContext,
    MessageFormatter, GATEWAY_MAX_MESSAGE_LEN,
};
use crate::game::{AdvancementFrame, DisplayKind, DisplayRequest, GameEvent};
use crate::translate::TranslationAdapter;

use super::filter::{FilterDirection, MessageFilter};

/// Longest inbound message accepted, in characters.
pub const MAX_INBOUND_CHARS: usize = 4000;

/// Characters of an undelivered message quoted in the failure notice.
const NOTICE_PREVIEW_CHARS: usize = 64;

/// The main bridge that orchestrates message flow.
pub struct Bridge {
    options: RelayOptions,
    texts: TextsConfig,
    announce: AnnounceConfig,
    filter: MessageFilter,
    translator: Option<Arc<TranslationAdapter>>,
    /// Webhook delivery: the author shows as the post's username.
    webhook: bool,
    avatar_url_template: Option<String>,
}

impl Bridge {
    /// Create a new bridge from configuration.
    pub fn new(config: &Config, translator: Option<Arc<TranslationAdapter>>) -> Self {
        Self {
            options: config.relay.clone(),
            texts: config.texts.clone(),
            announce: config.announce.clone(),
            filter: MessageFilter::from_config(config.filters.as_ref()),
            translator,
            webhook: config.discord.webhook_url.is_some(),
            avatar_url_template: config.discord.avatar_url_template.clone(),
        }
    }

    /// Render a game event into the payloads to post.
    ///
    /// Returns nothing for filtered chat and for disabled announcements.
    pub async fn handle_game_event(&self, event: GameEvent) -> Vec<OutboundPayload> {
        match event {
            GameEvent::Chat { author, body } => self.handle_game_chat(&author, body).await,
            GameEvent::Joined { player } if self.announce.players => {
                self.announcement(&self.texts.join_server, FormatContext::new(escape_markdown(&player.display_name), ""))
            }
            GameEvent::Left { player } if self.announce.players => {
                self.announcement(&self.texts.left_server, FormatContext::new(escape_markdown(&player.display_name), ""))
            }
            GameEvent::Death { player, message } if self.announce.deaths => {
                let ctx = FormatContext::new(escape_markdown(&player.display_name), "")
                    .with_death_message(escape_markdown(&message));
                self.announcement(&self.texts.death_message, ctx)
            }
            GameEvent::Advancement { player, title, frame } if self.announce.advancements => {
                let template = match frame {
                    AdvancementFrame::Task => &self.texts.advancement_task,
                    AdvancementFrame::Goal => &self.texts.advancement_goal,
                    AdvancementFrame::Challenge => &self.texts.advancement_challenge,
                };
                let ctx = FormatContext::new(escape_markdown(&player.display_name), "")
                    .with_advancement(escape_markdown(&title));
                self.announcement(template, ctx)
            }
            other => {
                debug!("Announcement disabled, skipping {:?}", other);
                Vec::new()
            }
        }
    }

    async fn handle_game_chat(&self, author: &UserRef, body: RichText) -> Vec<OutboundPayload> {
        let message = ChatMessage::ingest(SourceSystem::Game, author, body);

        let plain = message.body.plain_text();
        if plain.trim().is_empty() {
            return Vec::new();
        }
        if let Some(pattern) = self.filter.matching_pattern(FilterDirection::GameToGateway, &plain) {
            debug!("FILTERED Game -> Discord by '{}': {}", pattern, plain);
            return Vec::new();
        }

        let mut body = message.body;
        let untranslated = match &self.options.target_language_gateway {
            Some(target) => {
                self.translate_segments(&mut body, target, self.options.source_language_game.as_deref())
                    .await
            }
            None => false,
        };

        let template = if self.webhook {
            &self.texts.webhook_message
        } else {
            &self.texts.player_message
        };
        let ctx = FormatContext::new(escape_markdown(&message.author_display_name), to_gateway_markdown(&body));
        let content = MessageFormatter::new(template).format(&ctx);

        info!("Game -> Discord: {}", content);

        split_message(&content, GATEWAY_MAX_MESSAGE_LEN)
            .into_iter()
            .map(|chunk| {
                let mut payload = OutboundPayload::new(chunk, message.origin_id.clone());
                if self.webhook {
                    payload.username = Some(message.author_display_name.clone());
                    payload.avatar_url = self
                        .avatar_url_template
                        .as_ref()
                        .map(|template| template.replace("%user", &message.author_display_name));
                }
                payload.untranslated = untranslated;
                payload
            })
            .collect()
    }

    fn announcement(&self, template: &str, ctx: FormatContext) -> Vec<OutboundPayload> {
        let content = MessageFormatter::new(template).format(&ctx);
        if content.trim().is_empty() {
            return Vec::new();
        }
        info!("Game -> Discord: {}", content);

        let origin_id = OriginId::new();
        split_message(&content, GATEWAY_MAX_MESSAGE_LEN)
            .into_iter()
            .map(|chunk| OutboundPayload::new(chunk, origin_id.clone()))
            .collect()
    }

    /// Convert a gateway message for display in game.
    ///
    /// `Ok(None)` means the message is deliberately not shown.
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Result<Option<DisplayRequest>, InboundError> {
        validate_inbound(&message.content)?;
        if message.content.trim().is_empty() {
            debug!("Skipping empty message {}", message.id);
            return Ok(None);
        }

        let mut body = to_game_rich_text(&message.content, &message.mentions);
        let plain = body.plain_text();
        if let Some(pattern) = self.filter.matching_pattern(FilterDirection::GatewayToGame, &plain) {
            debug!("FILTERED Discord -> Game by '{}': {}", pattern, plain);
            return Ok(None);
        }

        if self.options.render_emoji_as_text {
            for segment in body.segments_mut() {
                if !segment.style.code {
                    segment.content = emoji_to_shortcodes(&segment.content);
                }
            }
        }

        let untranslated = match &self.options.target_language_game {
            Some(target) => {
                self.translate_segments(&mut body, target, self.options.source_language_gateway.as_deref())
                    .await
            }
            None => false,
        };

        let formatter = MessageFormatter::new(&self.texts.gateway_to_game);
        let text = formatter.format_rich(&FormatContext::new(&message.author.display_name, ""), &body);

        info!("Discord -> Game: {}", text.plain_text());
        Ok(Some(DisplayRequest {
            text,
            kind: DisplayKind::Relayed,
            untranslated,
        }))
    }

    /// In-game notice for a payload that could not be delivered.
    pub fn failure_notice(&self, content: &str, error: &DeliveryError) -> DisplayRequest {
        let plain = to_game_rich_text(content, &MentionLookup::default()).plain_text();
        let mut preview: String = plain.chars().take(NOTICE_PREVIEW_CHARS).collect();
        if preview.len() < plain.len() {
            preview.push_str("...");
        }

        let ctx = FormatContext::new("", format!("{} ({})", preview, error));
        DisplayRequest {
            text: RichText::plain(MessageFormatter::new(&self.texts.delivery_failed).format(&ctx)),
            kind: DisplayKind::SystemNotice,
            untranslated: false,
        }
    }

    /// Translate the plain text segments of `body` in place.
    ///
    /// Code spans, mentions and links keep their text. Returns whether any
    /// segment stayed untranslated because the provider failed.
    async fn translate_segments(&self, body: &mut RichText, target: &str, source_hint: Option<&str>) -> bool {
        let Some(translator) = &self.translator else {
            return false;
        };

        let mut untranslated = false;
        for segment in body.segments_mut() {
            if segment.style.code || segment.style.mention_of.is_some() || segment.link.is_some() {
                continue;
            }
            let translation = translator.translate(&segment.content, target, source_hint).await;
            untranslated |= translation.is_untranslated();
            segment.content = translation.text;
        }
        untranslated
    }
}

fn validate_inbound(content: &str) -> Result<(), InboundError> {
    if content.contains('\0') {
        return Err(InboundError::MalformedInboundContent {
            reason: "contains NUL characters".to_string(),
        });
    }
    let chars = content.chars().count();
    if chars > MAX_INBOUND_CHARS {
        return Err(InboundError::MalformedInboundContent {
            reason: format!("{} characters exceeds the {} limit", chars, MAX_INBOUND_CHARS),
        });
    }
    Ok(())
}
