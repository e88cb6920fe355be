//! Shared types used across the application.
//!
//! The rich-text model is the game-side representation of a chat line: an
//! ordered list of styled segments whose contents concatenate to the plain
//! text of the message.

/// Which chat system a message or identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceSystem {
    /// The in-game chat.
    Game,
    /// The remote group-chat gateway (Discord).
    Gateway,
}

/// A cross-system identity hint.
///
/// Only used to render mentions. It is never treated as a credential and
/// identities of the two systems are never unified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserRef {
    pub system: SourceSystem,
    pub id: String,
    pub display_name: String,
}

impl UserRef {
    pub fn new(system: SourceSystem, id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            system,
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// A game player, identified by name.
    pub fn player(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(SourceSystem::Game, name.clone(), name)
    }
}

/// Styling flags of a text segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Style {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    /// Inline code span (monospace).
    pub code: bool,
    /// Set when the segment is a mention of another user.
    pub mention_of: Option<UserRef>,
}

impl Style {
    /// Style without any decoration.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn bold() -> Self {
        Self {
            bold: true,
            ..Self::default()
        }
    }

    pub fn italic() -> Self {
        Self {
            italic: true,
            ..Self::default()
        }
    }

    pub fn code() -> Self {
        Self {
            code: true,
            ..Self::default()
        }
    }

    /// Returns true if no emphasis flag is set.
    pub fn is_plain(&self) -> bool {
        !self.bold
            && !self.italic
            && !self.underline
            && !self.strikethrough
            && !self.code
            && self.mention_of.is_none()
    }

    /// Strikethrough code spans have no rendering in the gateway dialect.
    pub fn is_contradictory(&self) -> bool {
        self.code && self.strikethrough
    }
}

/// A run of text sharing one style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub content: String,
    pub style: Style,
    pub link: Option<String>,
}

impl TextSegment {
    pub fn new(content: impl Into<String>, style: Style) -> Self {
        Self {
            content: content.into(),
            style,
            link: None,
        }
    }

    pub fn plain(content: impl Into<String>) -> Self {
        Self::new(content, Style::plain())
    }

    pub fn mention(user: UserRef) -> Self {
        let content = format!("@{}", user.display_name);
        Self::new(
            content,
            Style {
                mention_of: Some(user),
                ..Style::default()
            },
        )
    }

    pub fn with_link(mut self, url: impl Into<String>) -> Self {
        self.link = Some(url.into());
        self
    }
}

/// Structured rich text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichText {
    segments: Vec<TextSegment>,
}

impl RichText {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single unstyled segment.
    pub fn plain(content: impl Into<String>) -> Self {
        let mut text = Self::new();
        text.push(TextSegment::plain(content));
        text
    }

    pub fn from_segments(segments: Vec<TextSegment>) -> Self {
        let mut text = Self::new();
        for segment in segments {
            text.push(segment);
        }
        text
    }

    /// Append a segment. Empty segments are dropped and a segment that
    /// shares style and link with the previous one is merged into it.
    pub fn push(&mut self, segment: TextSegment) {
        if segment.content.is_empty() {
            return;
        }
        if let Some(last) = self.segments.last_mut() {
            if last.style == segment.style && last.link == segment.link && last.style.mention_of.is_none() {
                last.content.push_str(&segment.content);
                return;
            }
        }
        self.segments.push(segment);
    }

    pub fn append(&mut self, other: RichText) {
        for segment in other.segments {
            self.push(segment);
        }
    }

    pub fn segments(&self) -> &[TextSegment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [TextSegment] {
        &mut self.segments
    }

    pub fn into_segments(self) -> Vec<TextSegment> {
        self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Concatenation of all segment contents.
    pub fn plain_text(&self) -> String {
        self.segments.iter().map(|s| s.content.as_str()).collect()
    }
}

impl From<&str> for RichText {
    fn from(value: &str) -> Self {
        RichText::plain(value)
    }
}
