//! Conversion between rich text and the gateway's markdown dialect.
//!
//! Both directions are total: anything the target cannot express degrades to
//! its plain text. The plain text of a message always survives a trip
//! through [`to_gateway_markdown`] and back through [`to_game_rich_text`].

use crate::common::messages::MentionLookup;
use crate::common::types::{RichText, Style, TextSegment};

/// Characters that always need a backslash in gateway output.
const ESCAPED: &[char] = &['\\', '*', '_', '~', '`', '|', '[', ']', '<'];

/// Characters that only need a backslash at the start of a line
/// (quotes, headers, lists).
const ESCAPED_AT_LINE_START: &[char] = &['>', '#', '-'];

/// Characters that end a bare URL.
const URL_STOP: &[char] = &['<', '>', '\\', '*', '~', '|', '`', '[', ']', '"'];

/// Length in bytes of the bare URL at the start of `s`, or 0.
///
/// Shared by both directions so that a URL written out bare is read back
/// with exactly the same extent.
pub(crate) fn url_span_len(s: &str) -> usize {
    let prefix = if s.starts_with("https://") {
        "https://".len()
    } else if s.starts_with("http://") {
        "http://".len()
    } else {
        return 0;
    };

    let body = &s[prefix..];
    let mut end = body
        .find(|c: char| c.is_whitespace() || URL_STOP.contains(&c))
        .unwrap_or(body.len());
    while body[..end].ends_with('_') {
        end -= 1;
    }

    if end == 0 {
        0
    } else {
        prefix + end
    }
}

/// Escape markdown control characters of a user-supplied string.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    push_escaped(&mut out, text, true);
    out
}

fn push_escaped(out: &mut String, text: &str, line_start: bool) {
    let mut at_line_start = line_start;
    let mut i = 0;
    while i < text.len() {
        let (consumed, next_line_start) = push_escaped_step(out, &text[i..], at_line_start);
        i += consumed;
        at_line_start = next_line_start;
    }
}

/// Escape the next character of `rest`, or a whole ordered list marker at
/// the start of a line. Returns the bytes consumed and whether the output
/// is still at the start of a line.
fn push_escaped_step(out: &mut String, rest: &str, at_line_start: bool) -> (usize, bool) {
    if at_line_start {
        if let Some(digits) = ordered_marker_digits(rest) {
            out.push_str(&rest[..digits]);
            out.push_str("\\.");
            return (digits + 1, false);
        }
    }

    let Some(c) = rest.chars().next() else {
        return (rest.len().max(1), at_line_start);
    };
    if ESCAPED.contains(&c) || (at_line_start && ESCAPED_AT_LINE_START.contains(&c)) {
        out.push('\\');
    }
    out.push(c);
    (c.len_utf8(), c == '\n' || (at_line_start && c == ' '))
}

/// Digits of an ordered list marker (`1. `) at the start of `s`.
fn ordered_marker_digits(s: &str) -> Option<usize> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    let after = s.as_bytes().get(digits..digits + 2)?;
    (digits > 0 && after[0] == b'.' && (after[1] == b' ' || after[1] == b'\t')).then_some(digits)
}

/// Escape text while leaving URLs clickable.
///
/// A URL that could run into whatever follows the segment is wrapped in
/// angle brackets instead of written bare.
fn push_escaped_with_urls(out: &mut String, text: &str, line_start: bool, bare_urls: bool, open_end: bool) {
    let mut at_line_start = line_start;
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        let url_len = url_span_len(rest);
        if url_len > 0 {
            let url = &rest[..url_len];
            if bare_urls && (i + url_len < text.len() || open_end) {
                out.push_str(url);
            } else {
                out.push('<');
                out.push_str(url);
                out.push('>');
            }
            i += url_len;
            at_line_start = false;
            continue;
        }

        let (consumed, next_line_start) = push_escaped_step(out, rest, at_line_start);
        i += consumed;
        at_line_start = next_line_start;
    }
}

/// Render rich text as gateway markdown.
pub fn to_gateway_markdown(text: &RichText) -> String {
    let mut out = String::new();
    let segments = text.segments();
    for (i, segment) in segments.iter().enumerate() {
        render_segment(&mut out, segment, i + 1 == segments.len());
    }
    out
}

fn render_segment(out: &mut String, segment: &TextSegment, is_last: bool) {
    let mut style = segment.style.clone();
    if style.is_contradictory() {
        style.code = false;
        style.strikethrough = false;
    }

    let content = segment.content.as_str();
    let mut body = String::new();

    if style.code {
        if let Some(span) = code_span(content) {
            push_wrapped(out, &style, &span);
            return;
        }
        style.code = false;
    }

    // Emphasis markers must hug the text, so surrounding whitespace goes
    // outside of them.
    let core = content.trim();
    if core.is_empty() {
        out.push_str(content);
        return;
    }
    let lead = &content[..content.len() - content.trim_start().len()];
    let trail = &content[content.trim_end().len()..];

    out.push_str(lead);
    let line_start = out.is_empty() || out.ends_with('\n');
    let wrapped = has_wrappers(&style);
    let open_end = is_last || !trail.is_empty();

    match segment.link.as_deref() {
        Some(url) => render_link(&mut body, core, url, !wrapped && open_end, line_start),
        None => push_escaped_with_urls(&mut body, core, line_start, !wrapped, open_end),
    }

    push_wrapped(out, &style, &body);
    out.push_str(trail);
}

fn has_wrappers(style: &Style) -> bool {
    style.bold || style.italic || style.underline || style.strikethrough
}

fn push_wrapped(out: &mut String, style: &Style, body: &str) {
    let mut markers: Vec<&str> = Vec::with_capacity(4);
    if style.strikethrough {
        markers.push("~~");
    }
    if style.underline {
        markers.push("__");
    }
    if style.bold {
        markers.push("**");
    }
    if style.italic {
        markers.push("*");
    }

    for marker in &markers {
        out.push_str(marker);
    }
    out.push_str(body);
    for marker in markers.iter().rev() {
        out.push_str(marker);
    }
}

fn render_link(out: &mut String, label: &str, url: &str, bare_ok: bool, line_start: bool) {
    let usable = (url.starts_with("https://") || url.starts_with("http://"))
        && !url
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '(' | ')'));

    if !usable {
        push_escaped_with_urls(out, label, line_start, false, false);
    } else if label == url {
        if bare_ok && url_span_len(url) == url.len() {
            out.push_str(url);
        } else {
            out.push('<');
            out.push_str(url);
            out.push('>');
        }
    } else {
        out.push('[');
        push_escaped(out, label, false);
        out.push_str("](");
        out.push_str(url);
        out.push(')');
    }
}

/// Inline code span for `content`, or None when it needs a fence.
fn code_span(content: &str) -> Option<String> {
    let longest_run = content
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let fence_len = longest_run + 1;
    if fence_len >= 3 {
        return None;
    }

    let all_spaces = content.chars().all(|c| c == ' ');
    let pad = content.starts_with('`')
        || content.ends_with('`')
        || (!all_spaces && content.starts_with(' ') && content.ends_with(' '));

    let fence = "`".repeat(fence_len);
    let mut span = String::with_capacity(content.len() + 2 * fence_len + 2);
    span.push_str(&fence);
    if pad {
        span.push(' ');
    }
    span.push_str(content);
    if pad {
        span.push(' ');
    }
    span.push_str(&fence);
    Some(span)
}

/// Parse gateway markdown into rich text.
///
/// `mentions` resolves the ids of `<@id>`, `<@&id>` and `<#id>` markup.
/// Unknown ids render as placeholders rather than raw markup.
pub fn to_game_rich_text(markdown: &str, mentions: &MentionLookup) -> RichText {
    let mut parser = Parser {
        src: markdown,
        pos: 0,
        mentions,
        flags: Flags::default(),
        buf: String::new(),
        out: RichText::new(),
    };
    parser.run();
    parser.out
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    bold: bool,
    italic_star: bool,
    italic_underscore: bool,
    underline: bool,
    strike: bool,
    spoiler: bool,
}

impl Flags {
    fn style(&self) -> Style {
        Style {
            bold: self.bold,
            italic: self.italic_star || self.italic_underscore,
            underline: self.underline,
            strikethrough: self.strike,
            code: false,
            mention_of: None,
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    mentions: &'a MentionLookup,
    flags: Flags,
    buf: String,
    out: RichText,
}

impl Parser<'_> {
    fn run(&mut self) {
        let src = self.src;
        while self.pos < src.len() {
            let rest = &src[self.pos..];
            let Some(c) = rest.chars().next() else { break };
            match c {
                '\\' => self.escape(rest),
                '`' => self.code(rest),
                '*' => self.star_run(rest),
                '_' => self.underscore_run(rest),
                '~' => self.pair_run(rest, '~'),
                '|' => self.pair_run(rest, '|'),
                '<' => self.angle(rest),
                '[' => self.masked_link(rest),
                'h' if url_span_len(rest) > 0 => {
                    let len = url_span_len(rest);
                    let url = &rest[..len];
                    self.push_segment(TextSegment::new(url, self.flags.style()).with_link(url));
                    self.pos += len;
                }
                _ => {
                    self.buf.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        self.flush();
    }

    fn flush(&mut self) {
        if !self.buf.is_empty() {
            let content = std::mem::take(&mut self.buf);
            self.out.push(TextSegment::new(content, self.flags.style()));
        }
    }

    fn push_segment(&mut self, segment: TextSegment) {
        self.flush();
        self.out.push(segment);
    }

    fn escape(&mut self, rest: &str) {
        match rest[1..].chars().next() {
            Some(next) if next.is_ascii_punctuation() => {
                self.buf.push(next);
                self.pos += 1 + next.len_utf8();
            }
            _ => {
                self.buf.push('\\');
                self.pos += 1;
            }
        }
    }

    fn previous_char(&self) -> Option<char> {
        self.src[..self.pos].chars().next_back()
    }

    /// Runs of `*`: close what is open first, then open what has a closer.
    fn star_run(&mut self, rest: &str) {
        let run = run_len(rest, '*');
        let after = &rest[run..];
        let mut n = run;
        self.flush();

        if self.flags.bold && n >= 2 {
            self.flags.bold = false;
            n -= 2;
        }
        if self.flags.italic_star && n >= 1 {
            self.flags.italic_star = false;
            n -= 1;
        }
        if n >= 2 && after.contains("**") {
            self.flags.bold = true;
            n -= 2;
        }
        if n >= 1 && after.contains('*') {
            self.flags.italic_star = true;
            n -= 1;
        }

        self.buf.extend(std::iter::repeat('*').take(n));
        self.pos += run;
    }

    fn underscore_run(&mut self, rest: &str) {
        let run = run_len(rest, '_');
        let after = &rest[run..];
        // snake_case words are not emphasis
        let word_before = self.previous_char().is_some_and(char::is_alphanumeric);
        let mut n = run;
        self.flush();

        if self.flags.underline && n >= 2 {
            self.flags.underline = false;
            n -= 2;
        }
        if self.flags.italic_underscore && n >= 1 {
            self.flags.italic_underscore = false;
            n -= 1;
        }
        if n >= 2 && after.contains("__") {
            self.flags.underline = true;
            n -= 2;
        }
        if n >= 1 && !word_before && after.contains('_') {
            self.flags.italic_underscore = true;
            n -= 1;
        }

        self.buf.extend(std::iter::repeat('_').take(n));
        self.pos += run;
    }

    /// `~~strike~~` and `||spoiler||`.
    fn pair_run(&mut self, rest: &str, marker: char) {
        let run = run_len(rest, marker);
        let after = &rest[run..];
        let pair: String = [marker, marker].iter().collect();
        let mut n = run;
        self.flush();

        let open = match marker {
            '~' => &mut self.flags.strike,
            _ => &mut self.flags.spoiler,
        };
        if *open && n >= 2 {
            *open = false;
            n -= 2;
        }
        if !*open && n >= 2 && after.contains(pair.as_str()) {
            *open = true;
            n -= 2;
        }

        self.buf.extend(std::iter::repeat(marker).take(n));
        self.pos += run;
    }

    fn code(&mut self, rest: &str) {
        let run = run_len(rest, '`');
        let after = &rest[run..];

        if run >= 3 {
            if let Some(end) = after.find("```") {
                let block = strip_fence_language(&after[..end]);
                self.push_code(block);
                self.pos += run + end + 3;
                self.pos += run_len(&self.src[self.pos..], '`');
                return;
            }
        } else if let Some(end) = find_backtick_run(after, run) {
            let mut inner = &after[..end];
            if inner.len() >= 2
                && inner.starts_with(' ')
                && inner.ends_with(' ')
                && !inner.chars().all(|c| c == ' ')
            {
                inner = &inner[1..inner.len() - 1];
            }
            self.push_code(inner);
            self.pos += run + end + run;
            return;
        }

        self.buf.extend(std::iter::repeat('`').take(run));
        self.pos += run;
    }

    fn push_code(&mut self, content: &str) {
        let mut style = self.flags.style();
        style.code = true;
        if style.is_contradictory() {
            style.code = false;
            style.strikethrough = false;
        }
        self.push_segment(TextSegment::new(content, style));
    }

    fn angle(&mut self, rest: &str) {
        let mentions = self.mentions;
        let Some(end) = rest.find('>') else {
            return self.literal('<');
        };
        let inner = &rest[1..end];
        if inner.is_empty() || inner.chars().any(char::is_whitespace) {
            return self.literal('<');
        }

        if let Some(id) = inner.strip_prefix("@&") {
            if !is_snowflake(id) {
                return self.literal('<');
            }
            let name = mentions.roles.get(id).map_or("deleted-role", String::as_str);
            self.buf.push('@');
            self.buf.push_str(name);
        } else if let Some(id) = inner.strip_prefix('@') {
            let id = id.strip_prefix('!').unwrap_or(id);
            if !is_snowflake(id) {
                return self.literal('<');
            }
            match mentions.user(id) {
                Some(user) => {
                    let mut segment = TextSegment::mention(user.clone());
                    segment.style = Style {
                        mention_of: Some(user.clone()),
                        ..self.flags.style()
                    };
                    self.push_segment(segment);
                }
                None => self.buf.push_str("@unknown-user"),
            }
        } else if let Some(id) = inner.strip_prefix('#') {
            if !is_snowflake(id) {
                return self.literal('<');
            }
            let name = mentions.channels.get(id).map_or("deleted-channel", String::as_str);
            self.buf.push('#');
            self.buf.push_str(name);
        } else if let Some(name) = custom_emoji_name(inner) {
            self.buf.push(':');
            self.buf.push_str(name);
            self.buf.push(':');
        } else if inner.starts_with("https://") || inner.starts_with("http://") {
            self.push_segment(TextSegment::new(inner, self.flags.style()).with_link(inner));
        } else {
            return self.literal('<');
        }

        self.pos += end + 1;
    }

    fn masked_link(&mut self, rest: &str) {
        let Some(close) = find_unescaped(&rest[1..], ']').map(|i| i + 1) else {
            return self.literal('[');
        };
        let Some(target) = rest[close + 1..].strip_prefix('(') else {
            return self.literal('[');
        };
        let Some(paren) = target.find(')') else {
            return self.literal('[');
        };

        let raw_url = &target[..paren];
        let url = raw_url
            .strip_prefix('<')
            .and_then(|u| u.strip_suffix('>'))
            .unwrap_or(raw_url);
        if !(url.starts_with("https://") || url.starts_with("http://"))
            || url.chars().any(char::is_whitespace)
        {
            return self.literal('[');
        }

        let label = unescape(&rest[1..close]);
        let content = if label.is_empty() { url.to_string() } else { label };
        self.push_segment(TextSegment::new(content, self.flags.style()).with_link(url));
        self.pos += close + 2 + paren + 1;
    }

    fn literal(&mut self, c: char) {
        self.buf.push(c);
        self.pos += c.len_utf8();
    }
}

fn run_len(s: &str, c: char) -> usize {
    s.len() - s.trim_start_matches(c).len()
}

/// Byte offset of the next run of exactly `len` backticks.
fn find_backtick_run(s: &str, len: usize) -> Option<usize> {
    let mut i = 0;
    while let Some(offset) = s[i..].find('`') {
        let start = i + offset;
        let run = run_len(&s[start..], '`');
        if run == len {
            return Some(start);
        }
        i = start + run;
    }
    None
}

fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next.is_ascii_punctuation() {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Drop the language hint line of a fenced block.
fn strip_fence_language(block: &str) -> &str {
    let block = match block.split_once('\n') {
        Some((first, body))
            if !first.is_empty()
                && first
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '#' | '_')) =>
        {
            body
        }
        _ => block,
    };
    let block = block.strip_prefix('\n').unwrap_or(block);
    block.strip_suffix('\n').unwrap_or(block)
}

fn is_snowflake(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// `name` of `:name:id` or `a:name:id`.
fn custom_emoji_name(inner: &str) -> Option<&str> {
    let rest = inner.strip_prefix("a:").or_else(|| inner.strip_prefix(':'))?;
    let (name, id) = rest.split_once(':')?;
    (!name.is_empty() && is_snowflake(id)).then_some(name)
}

/// Replace unicode emoji with `:shortcode:` text.
///
/// Falls back to the emoji's name when it has no shortcode.
pub fn emoji_to_shortcodes(message: &str) -> String {
    let mut result = String::with_capacity(message.len() * 2);
    let mut chars = message.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii() {
            result.push(ch);
            continue;
        }

        // Skin tones and variation selectors make two-char sequences
        if let Some(&next) = chars.peek() {
            let pair: String = [ch, next].iter().collect();
            if let Some(emoji) = emojis::get(&pair) {
                push_shortcode(&mut result, emoji);
                chars.next();
                continue;
            }
        }

        match emojis::get(ch.encode_utf8(&mut [0; 4])) {
            Some(emoji) => push_shortcode(&mut result, emoji),
            None => result.push(ch),
        }
    }

    result
}

fn push_shortcode(out: &mut String, emoji: &emojis::Emoji) {
    out.push(':');
    out.push_str(emoji.shortcode().unwrap_or_else(|| emoji.name()));
    out.push(':');
}
