//! Legacy section-sign formatting codes used by game chat.
//!
//! `§l` bold, `§o` italic, `§n` underline, `§m` strikethrough, `§r` reset.
//! Colour codes (`§0`-`§f`) reset styling like the game client does and are
//! otherwise dropped, as is obfuscation (`§k`).

use crate::common::types::{RichText, Style, TextSegment};

pub const SECTION_SIGN: char = '§';

/// Parse legacy formatted text into rich text.
pub fn from_legacy(text: &str) -> RichText {
    let mut out = RichText::new();
    let mut style = Style::plain();
    let mut buf = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != SECTION_SIGN {
            buf.push(c);
            continue;
        }

        let Some(code) = chars.peek().map(|c| c.to_ascii_lowercase()) else {
            buf.push(c);
            continue;
        };

        let mut next = style.clone();
        match code {
            'l' => next.bold = true,
            'o' => next.italic = true,
            'n' => next.underline = true,
            'm' => next.strikethrough = true,
            'k' => {}
            'r' | '0'..='9' | 'a'..='f' => next = Style::plain(),
            _ => {
                buf.push(c);
                continue;
            }
        }
        chars.next();

        if next != style {
            out.push(TextSegment::new(std::mem::take(&mut buf), style));
            style = next;
        }
    }

    out.push(TextSegment::new(buf, style));
    out
}

/// Render rich text with legacy codes.
///
/// Mentions and links keep their text, code spans render plain.
pub fn to_legacy(text: &RichText) -> String {
    let mut out = String::new();
    let mut current = Style::plain();

    for segment in text.segments() {
        let wanted = Style {
            bold: segment.style.bold,
            italic: segment.style.italic,
            underline: segment.style.underline,
            strikethrough: segment.style.strikethrough,
            ..Style::default()
        };

        if wanted != current {
            // Codes only add styling, so dropping one needs a reset
            let needs_reset = (current.bold && !wanted.bold)
                || (current.italic && !wanted.italic)
                || (current.underline && !wanted.underline)
                || (current.strikethrough && !wanted.strikethrough);
            let base = if needs_reset {
                out.push(SECTION_SIGN);
                out.push('r');
                Style::plain()
            } else {
                current
            };

            for (enabled, was, code) in [
                (wanted.bold, base.bold, 'l'),
                (wanted.italic, base.italic, 'o'),
                (wanted.underline, base.underline, 'n'),
                (wanted.strikethrough, base.strikethrough, 'm'),
            ] {
                if enabled && !was {
                    out.push(SECTION_SIGN);
                    out.push(code);
                }
            }
            current = wanted;
        }

        // A literal section sign would start a code on the other side
        out.push_str(&segment.content.replace(SECTION_SIGN, ""));
    }

    out
}

/// Remove all formatting codes.
pub fn strip_legacy(text: &str) -> String {
    from_legacy(text).plain_text()
}
