//! Scripted translator for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::Translator;
use crate::common::error::TranslationError;

#[derive(Debug, Clone)]
pub(crate) enum MockBehavior {
    /// Returns `[target] text`.
    Tag,
    Fail,
    /// Never answers within any sane timeout.
    Hang,
}

pub(crate) struct MockTranslator {
    behavior: MockBehavior,
    calls: AtomicUsize,
}

impl MockTranslator {
    pub(crate) fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(&self, text: &str, target: &str) -> Result<String, TranslationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            MockBehavior::Tag => Ok(format!("[{}] {}", target, text)),
            MockBehavior::Fail => Err(TranslationError::TranslationUnavailable {
                message: "provider down".to_string(),
            }),
            MockBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(text.to_string())
            }
        }
    }
}
