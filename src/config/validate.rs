//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use fancy_regex::Regex;

use crate::common::error::ConfigError;
use crate::config::types::Config;
use crate::translate::is_language_tag;

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    // Discord
    if config.discord.token.is_empty() {
        errors.push("discord.token is required".to_string());
    }
    if config.discord.token == "YOUR_DISCORD_TOKEN_HERE" {
        errors.push("discord.token has not been configured (still using placeholder)".to_string());
    }
    if config.discord.channel_id == 0 {
        errors.push("discord.channel_id must be non-zero".to_string());
    }
    if let Some(ref url) = config.discord.webhook_url {
        if !url.starts_with("https://") || !url.contains("/webhooks/") {
            errors.push(format!("discord.webhook_url '{}' is not a Discord webhook URL", url));
        }
    }

    // Relay
    let relay = &config.relay;
    if relay.max_queue_size == 0 {
        errors.push("relay.max_queue_size must be at least 1".to_string());
    }
    if relay.max_send_attempts == 0 {
        errors.push("relay.max_send_attempts must be at least 1".to_string());
    }
    if relay.backoff_base_ms == 0 {
        errors.push("relay.backoff_base_ms must be non-zero".to_string());
    }
    if relay.backoff_max_ms < relay.backoff_base_ms {
        errors.push(format!(
            "relay.backoff_max_ms ({}) must not be below relay.backoff_base_ms ({})",
            relay.backoff_max_ms, relay.backoff_base_ms
        ));
    }
    if relay.echo_suppression_capacity == 0 {
        errors.push("relay.echo_suppression_capacity must be at least 1".to_string());
    }
    for (field, value) in [
        ("target_language_game", &relay.target_language_game),
        ("target_language_gateway", &relay.target_language_gateway),
        ("source_language_game", &relay.source_language_game),
        ("source_language_gateway", &relay.source_language_gateway),
    ] {
        if let Some(lang) = value {
            if !is_language_tag(lang) {
                errors.push(format!("relay.{} '{}' is not a language code", field, lang));
            }
        }
    }

    // Translation
    if config.translation.enabled {
        if config.translation.endpoint.as_deref().map_or(true, str::is_empty) {
            errors.push("translation.endpoint is required when translation is enabled".to_string());
        }
        if relay.target_language_game.is_none() && relay.target_language_gateway.is_none() {
            errors.push(
                "translation is enabled but neither relay.target_language_game nor relay.target_language_gateway is set"
                    .to_string(),
            );
        }
        if config.translation.cache_capacity == 0 {
            errors.push("translation.cache_capacity must be at least 1".to_string());
        }
    }

    // Filter patterns (try to compile them)
    if let Some(ref filters) = config.filters {
        for (direction, patterns) in [
            ("game_to_gateway", &filters.game_to_gateway),
            ("gateway_to_game", &filters.gateway_to_game),
        ] {
            for (i, pattern) in patterns.iter().flatten().enumerate() {
                if Regex::new(pattern).is_err() {
                    errors.push(format!(
                        "filters.{}[{}] is not a valid regex: '{}'",
                        direction, i, pattern
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
