//! Machine translation of message bodies.
//!
//! Translation is best effort: a failing provider never stops a message,
//! the original text goes through marked as untranslated.

pub mod adapter;
pub mod cache;
pub mod libre;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;

use crate::common::error::TranslationError;

pub use adapter::{is_language_tag, Translation, TranslationAdapter, TranslationStatus};
pub use cache::TranslationCache;
pub use libre::LibreTranslate;

/// A translation provider.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into the `target` language.
    async fn translate(&self, text: &str, target: &str) -> Result<String, TranslationError>;
}
