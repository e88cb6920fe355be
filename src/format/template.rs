//! Message templates.
//!
//! Handles placeholder substitution in message format strings.
//! Supports placeholders: %time, %user, %message, %target, %advancement,
//! %deathmessage

use chrono::Local;

use crate::common::types::{RichText, TextSegment};

/// Longest message the gateway accepts.
pub const GATEWAY_MAX_MESSAGE_LEN: usize = 2000;

const PLACEHOLDERS: &[&str] = &[
    "%time",
    "%user",
    "%message",
    "%target",
    "%advancement",
    "%deathmessage",
];

/// Message formatter that substitutes placeholders in format strings.
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    format: String,
}

impl MessageFormatter {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }

    /// Format a message with the given context.
    ///
    /// Substitution is a single pass, so values that themselves contain
    /// placeholder text are inserted verbatim.
    pub fn format(&self, ctx: &FormatContext) -> String {
        let mut out = String::with_capacity(self.format.len() + ctx.message.len());
        for piece in self.pieces() {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Placeholder(name) => out.push_str(&ctx.value(name)),
            }
        }
        out
    }

    /// Format around a rich text body.
    ///
    /// Template text becomes plain segments and `%message` is replaced by
    /// the body with its styling intact.
    pub fn format_rich(&self, ctx: &FormatContext, body: &RichText) -> RichText {
        let mut out = RichText::new();
        for piece in self.pieces() {
            match piece {
                Piece::Literal(text) => out.push(TextSegment::plain(text)),
                Piece::Placeholder("%message") => out.append(body.clone()),
                Piece::Placeholder(name) => out.push(TextSegment::plain(ctx.value(name))),
            }
        }
        out
    }

    pub fn format_string(&self) -> &str {
        &self.format
    }

    /// Length left for `%message` once everything else is filled in.
    pub fn max_message_length(&self, ctx: &FormatContext, max_total: usize) -> usize {
        let overhead: usize = self
            .pieces()
            .map(|piece| match piece {
                Piece::Literal(text) => text.len(),
                Piece::Placeholder("%message") => 0,
                Piece::Placeholder(name) => ctx.value(name).len(),
            })
            .sum();

        max_total.saturating_sub(overhead)
    }

    fn pieces(&self) -> impl Iterator<Item = Piece<'_>> {
        Pieces {
            rest: &self.format,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Piece<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

struct Pieces<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Pieces<'a> {
    type Item = Piece<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let placeholder = PLACEHOLDERS
            .iter()
            .copied()
            .filter(|p| self.rest.starts_with(p))
            .max_by_key(|p| p.len());
        if let Some(name) = placeholder {
            let (placeholder, rest) = self.rest.split_at(name.len());
            self.rest = rest;
            return Some(Piece::Placeholder(placeholder));
        }

        // Literal text runs up to the next '%' that is not at the start
        let end = self.rest[1..]
            .find('%')
            .map(|i| i + 1)
            .unwrap_or(self.rest.len());
        let (literal, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(Piece::Literal(literal))
    }
}

/// Values for the placeholders.
#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    pub user: String,
    pub message: String,
    pub target: String,
    /// Advancement title.
    pub advancement: String,
    /// Full death message as the game printed it.
    pub death_message: String,
}

impl FormatContext {
    pub fn new(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_advancement(mut self, advancement: impl Into<String>) -> Self {
        self.advancement = advancement.into();
        self
    }

    pub fn with_death_message(mut self, death_message: impl Into<String>) -> Self {
        self.death_message = death_message.into();
        self
    }

    fn value(&self, placeholder: &str) -> String {
        match placeholder {
            "%time" => get_time(),
            "%user" => self.user.clone(),
            "%message" => self.message.clone(),
            "%target" => self.target.clone(),
            "%advancement" => self.advancement.clone(),
            "%deathmessage" => self.death_message.clone(),
            _ => placeholder.to_string(),
        }
    }
}

/// Get the current time as HH:MM:SS string.
fn get_time() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Find the last UTF-8 char boundary at or before `byte_index` in `s`.
fn floor_char_boundary(s: &str, byte_index: usize) -> usize {
    if byte_index >= s.len() {
        return s.len();
    }
    let mut i = byte_index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split a message into chunks of at most `max_len` bytes.
///
/// Prefers line breaks, then spaces. Never splits inside a multi-byte
/// character.
pub fn split_message(message: &str, max_len: usize) -> Vec<String> {
    if message.len() <= max_len {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        remaining = remaining.trim_start_matches([' ', '\n']);
        if remaining.is_empty() {
            break;
        }

        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let split_at = floor_char_boundary(remaining, max_len);

        // max_len is smaller than the first character: take it whole
        if split_at == 0 {
            let first_char_end = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
            chunks.push(remaining[..first_char_end].to_string());
            remaining = &remaining[first_char_end..];
            continue;
        }

        let chunk = &remaining[..split_at];
        match chunk.rfind('\n').or_else(|| chunk.rfind(' ')) {
            Some(idx) if idx > 0 => {
                chunks.push(remaining[..idx].to_string());
                remaining = &remaining[idx + 1..];
            }
            _ => {
                chunks.push(chunk.to_string());
                remaining = &remaining[split_at..];
            }
        }
    }

    chunks
}
