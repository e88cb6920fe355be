//! Configuration type definitions.

use std::time::Duration;

use serde::Deserialize;

use crate::common::reconnect::ReconnectConfig;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub discord: DiscordConfig,
    #[serde(default)]
    pub relay: RelayOptions,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub texts: TextsConfig,
    #[serde(default)]
    pub announce: AnnounceConfig,
    pub filters: Option<FiltersConfig>,
}

/// Discord connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
    /// The bridged channel.
    pub channel_id: u64,
    /// When set, outbound messages are posted through this webhook with the
    /// player's name and avatar instead of as the bot user.
    pub webhook_url: Option<String>,
    /// Avatar URL for webhook posts, `%user` is replaced by the player name.
    pub avatar_url_template: Option<String>,
}

/// Options of the relay core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    /// Language messages shown in-game are translated to.
    pub target_language_game: Option<String>,
    /// Language messages sent to the gateway are translated to.
    pub target_language_gateway: Option<String>,
    /// Language players are assumed to write in.
    pub source_language_game: Option<String>,
    /// Language gateway users are assumed to write in.
    pub source_language_gateway: Option<String>,
    pub max_queue_size: usize,
    pub max_send_attempts: u32,
    /// Reconnect backoff base.
    pub backoff_base_ms: u64,
    /// Reconnect backoff cap.
    pub backoff_max_ms: u64,
    /// Backoff base for retrying a single failed send.
    pub send_backoff_base_ms: u64,
    pub echo_suppression_window_ms: u64,
    pub echo_suppression_capacity: usize,
    pub handshake_timeout_ms: u64,
    /// Failed resume attempts tolerated in the degraded state.
    pub degraded_max_attempts: u32,
    /// Render unicode emoji as `:shortcode:` in game.
    pub render_emoji_as_text: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            target_language_game: None,
            target_language_gateway: None,
            source_language_game: None,
            source_language_gateway: None,
            max_queue_size: 100,
            max_send_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            send_backoff_base_ms: 500,
            echo_suppression_window_ms: 30_000,
            echo_suppression_capacity: 256,
            handshake_timeout_ms: 30_000,
            degraded_max_attempts: 5,
            render_emoji_as_text: true,
        }
    }
}

impl RelayOptions {
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::unlimited(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn send_backoff_base(&self) -> Duration {
        Duration::from_millis(self.send_backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn echo_suppression_window(&self) -> Duration {
        Duration::from_millis(self.echo_suppression_window_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Machine translation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    /// LibreTranslate-compatible endpoint, e.g. `https://libretranslate.com/translate`.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            timeout_ms: 5_000,
            cache_capacity: 1_024,
            cache_ttl_secs: 3_600,
        }
    }
}

impl TranslationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Message templates.
///
/// Gateway-bound templates are markdown; `%user` and the other inserted
/// values are escaped, `%message` is inserted as rendered markdown.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextsConfig {
    pub player_message: String,
    /// Used instead of `player_message` for webhook delivery, where the
    /// author is already shown as the post's username.
    pub webhook_message: String,
    pub join_server: String,
    pub left_server: String,
    pub death_message: String,
    pub advancement_task: String,
    pub advancement_goal: String,
    pub advancement_challenge: String,
    /// In-game rendering of gateway messages.
    pub gateway_to_game: String,
    /// In-game notice for messages that could not be delivered.
    pub delivery_failed: String,
}

impl Default for TextsConfig {
    fn default() -> Self {
        Self {
            player_message: "**%user**: %message".to_string(),
            webhook_message: "%message".to_string(),
            join_server: "**%user** joined the game".to_string(),
            left_server: "**%user** left the game".to_string(),
            death_message: "%deathmessage".to_string(),
            advancement_task: "**%user** has made the advancement **%advancement**".to_string(),
            advancement_goal: "**%user** has reached the goal **%advancement**".to_string(),
            advancement_challenge: "**%user** has completed the challenge **%advancement**".to_string(),
            gateway_to_game: "[Discord] %user: %message".to_string(),
            delivery_failed: "Could not deliver to Discord: %message".to_string(),
        }
    }
}

/// Which game events are announced on the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    pub players: bool,
    pub deaths: bool,
    pub advancements: bool,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            players: true,
            deaths: true,
            advancements: true,
        }
    }
}

/// Message filtering configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersConfig {
    /// Patterns to filter out from game messages.
    pub game_to_gateway: Option<Vec<String>>,
    /// Patterns to filter out from gateway messages.
    pub gateway_to_game: Option<Vec<String>>,
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        discord: DiscordConfig {
            token: "test_token".to_string(),
            channel_id: 123456789,
            webhook_url: None,
            avatar_url_template: None,
        },
        relay: RelayOptions::default(),
        translation: TranslationConfig::default(),
        texts: TextsConfig::default(),
        announce: AnnounceConfig::default(),
        filters: None,
    }
}
