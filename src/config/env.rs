//! Environment variable overrides for configuration.
//!
//! - `DISRELAY_DISCORD_TOKEN` - Discord bot token
//! - `DISRELAY_CHANNEL_ID` - bridged channel id
//! - `DISRELAY_WEBHOOK_URL` - webhook for outbound messages, empty disables it
//! - `DISRELAY_TRANSLATION_API_KEY` - translation provider key
//! - `DISRELAY_CONFIG` - config file path

use std::env;

use tracing::warn;

use crate::config::types::Config;

const ENV_PREFIX: &str = "DISRELAY";

const DEFAULT_CONFIG_PATH: &str = "disrelay.conf";

fn var_name(suffix: &str) -> String {
    format!("{}_{}", ENV_PREFIX, suffix)
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: Config) -> Config {
    apply_overrides(config, |name| env::var(name).ok())
}

/// Apply overrides read through `lookup`, which maps a variable name to
/// its value.
pub fn apply_overrides(mut config: Config, lookup: impl Fn(&str) -> Option<String>) -> Config {
    let get = |suffix: &str| lookup(&var_name(suffix));

    if let Some(token) = get("DISCORD_TOKEN") {
        config.discord.token = token;
    }

    if let Some(channel_id) = get("CHANNEL_ID") {
        match channel_id.trim().parse() {
            Ok(id) => config.discord.channel_id = id,
            Err(_) => warn!("Ignoring {}: '{}' is not a channel id", var_name("CHANNEL_ID"), channel_id),
        }
    }

    if let Some(url) = get("WEBHOOK_URL") {
        config.discord.webhook_url = Some(url).filter(|u| !u.trim().is_empty());
    }

    if let Some(key) = get("TRANSLATION_API_KEY") {
        config.translation.api_key = Some(key);
    }

    config
}

/// Config file path from `DISRELAY_CONFIG`, or `disrelay.conf`.
pub fn get_config_path() -> String {
    env::var(var_name("CONFIG")).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}
