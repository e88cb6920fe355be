//! Relay filters.
//!
//! A message is not relayed when its plain text matches one of the patterns
//! configured for its direction. Patterns are `fancy-regex`, so lookaround
//! and backreferences are available.

use std::fmt;

use fancy_regex::Regex;
use tracing::warn;

use crate::config::FiltersConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    GameToGateway,
    GatewayToGame,
}

impl fmt::Display for FilterDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GameToGateway => f.write_str("Game -> Discord"),
            Self::GatewayToGame => f.write_str("Discord -> Game"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PatternSet(Vec<Regex>);

impl PatternSet {
    /// Invalid patterns are logged and left out.
    fn compile(direction: FilterDirection, patterns: Option<&Vec<String>>) -> Self {
        let compiled = patterns
            .into_iter()
            .flatten()
            .filter_map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| warn!("Ignoring invalid {} filter '{}': {}", direction, pattern, e))
                    .ok()
            })
            .collect();
        Self(compiled)
    }

    fn first_match(&self, text: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|regex| match regex.is_match(text) {
                Ok(matched) => matched,
                // Backtrack limit hit: let the message through
                Err(e) => {
                    warn!("Filter '{}' failed on message: {}", regex.as_str(), e);
                    false
                }
            })
            .map(Regex::as_str)
    }
}

/// Per-direction filter patterns.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    game_to_gateway: PatternSet,
    gateway_to_game: PatternSet,
}

impl MessageFilter {
    pub fn from_config(config: Option<&FiltersConfig>) -> Self {
        let Some(filters) = config else {
            return Self::default();
        };
        Self {
            game_to_gateway: PatternSet::compile(FilterDirection::GameToGateway, filters.game_to_gateway.as_ref()),
            gateway_to_game: PatternSet::compile(FilterDirection::GatewayToGame, filters.gateway_to_game.as_ref()),
        }
    }

    /// The first pattern of `direction` that matches `text`.
    pub fn matching_pattern(&self, direction: FilterDirection, text: &str) -> Option<&str> {
        match direction {
            FilterDirection::GameToGateway => self.game_to_gateway.first_match(text),
            FilterDirection::GatewayToGame => self.gateway_to_game.first_match(text),
        }
    }

    pub fn should_filter(&self, direction: FilterDirection, text: &str) -> bool {
        self.matching_pattern(direction, text).is_some()
    }
}
