//! Cached, fail-safe front of a [`Translator`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use super::cache::{normalize, TranslationCache};
use super::Translator;
use crate::common::error::TranslationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStatus {
    /// Fresh result from the provider.
    Translated,
    /// Served from the cache.
    Cached,
    /// Nothing to do: blank text, or already in the target language.
    Skipped,
    /// The provider failed or timed out; the original text is returned.
    Untranslated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    pub status: TranslationStatus,
}

impl Translation {
    fn unchanged(text: &str, status: TranslationStatus) -> Self {
        Self {
            text: text.to_string(),
            status,
        }
    }

    pub fn is_untranslated(&self) -> bool {
        self.status == TranslationStatus::Untranslated
    }
}

pub struct TranslationAdapter {
    translator: Arc<dyn Translator>,
    cache: Arc<TranslationCache>,
    timeout: Duration,
}

impl TranslationAdapter {
    pub fn new(translator: Arc<dyn Translator>, cache: Arc<TranslationCache>, timeout: Duration) -> Self {
        Self {
            translator,
            cache,
            timeout,
        }
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    /// Translate `text` into `target`.
    ///
    /// Leading and trailing whitespace is kept as is, so translated pieces
    /// of a styled message still join up.
    pub async fn translate(&self, text: &str, target: &str, source_hint: Option<&str>) -> Translation {
        let normalized = normalize(text);
        if normalized.is_empty() || !normalized.chars().any(char::is_alphabetic) {
            return Translation::unchanged(text, TranslationStatus::Skipped);
        }
        if source_hint.is_some_and(|source| same_language(source, target)) {
            return Translation::unchanged(text, TranslationStatus::Skipped);
        }

        if let Some(cached) = self.cache.get(&normalized, target) {
            return Translation {
                text: keep_edges(text, &cached),
                status: TranslationStatus::Cached,
            };
        }

        let result = match timeout(self.timeout, self.translator.translate(&normalized, target)).await {
            Ok(result) => result,
            Err(_) => Err(TranslationError::Timeout),
        };

        match result {
            Ok(translated) => {
                debug!("Translated to {}: {} -> {}", target, normalized, translated);
                self.cache.insert(&normalized, target, &translated);
                Translation {
                    text: keep_edges(text, &translated),
                    status: TranslationStatus::Translated,
                }
            }
            Err(error) => {
                warn!("Translation to {} failed, relaying original text: {}", target, error);
                Translation::unchanged(text, TranslationStatus::Untranslated)
            }
        }
    }
}

/// Compare primary language subtags, so `en-US` matches `en`.
/// Subtags of a language tag. `-` and `_` both separate them.
fn subtags(tag: &str) -> impl Iterator<Item = &str> {
    tag.trim().split(['-', '_'])
}

/// Whether `tag` looks like `en`, `pt-BR` or `pt_BR`.
pub fn is_language_tag(tag: &str) -> bool {
    let mut parts = subtags(tag);
    let primary_ok = parts
        .next()
        .is_some_and(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphabetic()));
    primary_ok && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

pub fn same_language(a: &str, b: &str) -> bool {
    fn primary(tag: &str) -> String {
        subtags(tag)
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }
    let a = primary(a);
    !a.is_empty() && a == primary(b)
}

fn keep_edges(original: &str, translated: &str) -> String {
    let start = original.len() - original.trim_start().len();
    let end = original.trim_end().len();
    let (leading, trailing) = if start >= end {
        ("", "")
    } else {
        (&original[..start], &original[end..])
    };
    format!("{}{}{}", leading, translated.trim(), trailing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::mock::{MockBehavior, MockTranslator};

    fn adapter(behavior: MockBehavior) -> (TranslationAdapter, Arc<MockTranslator>) {
        let translator = Arc::new(MockTranslator::new(behavior));
        let cache = TranslationCache::with_limits(16, Duration::from_secs(60));
        let adapter = TranslationAdapter::new(translator.clone(), cache, Duration::from_secs(2));
        (adapter, translator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_translates_and_caches() {
        let (adapter, translator) = adapter(MockBehavior::Tag);

        let first = adapter.translate("hello  there", "de", None).await;
        assert_eq!(first.text, "[de] hello there");
        assert_eq!(first.status, TranslationStatus::Translated);

        let second = adapter.translate("hello there", "de", None).await;
        assert_eq!(second.status, TranslationStatus::Cached);
        assert_eq!(second.text, "[de] hello there");
        assert_eq!(translator.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_edge_whitespace() {
        let (adapter, _) = adapter(MockBehavior::Tag);
        let result = adapter.translate(" hi ", "fr", None).await;
        assert_eq!(result.text, " [fr] hi ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_language_is_skipped() {
        let (adapter, translator) = adapter(MockBehavior::Tag);
        let result = adapter.translate("hello", "en", Some("en-GB")).await;
        assert_eq!(result, Translation::unchanged("hello", TranslationStatus::Skipped));
        assert_eq!(translator.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_and_symbol_only_text_is_skipped() {
        let (adapter, translator) = adapter(MockBehavior::Tag);
        assert_eq!(adapter.translate("   ", "de", None).await.status, TranslationStatus::Skipped);
        assert_eq!(adapter.translate(" :) 123 ", "de", None).await.status, TranslationStatus::Skipped);
        assert_eq!(translator.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returns_original() {
        let (adapter, _) = adapter(MockBehavior::Fail);
        let result = adapter.translate("hello", "de", None).await;
        assert_eq!(result.text, "hello");
        assert!(result.is_untranslated());
        assert!(adapter.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_original() {
        let (adapter, _) = adapter(MockBehavior::Hang);
        let start = tokio::time::Instant::now();
        let result = adapter.translate("hello", "de", None).await;
        assert!(result.is_untranslated());
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_language_tags() {
        for tag in ["en", "pt-BR", "pt_BR", "zh-Hant", "es-419"] {
            assert!(is_language_tag(tag), "{}", tag);
        }
        for tag in ["", "-", "en-", "1en", "en us", "de.DE"] {
            assert!(!is_language_tag(tag), "{}", tag);
        }
    }

    #[test]
    fn test_same_language() {
        assert!(same_language("en", "EN"));
        assert!(same_language("pt_BR", "pt-PT"));
        assert!(!same_language("en", "de"));
        assert!(!same_language("", ""));
    }
}
