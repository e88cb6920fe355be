//! Bounded translation cache with expiry.
//!
//! Reads share a read lock and bump an atomic recency stamp. Inserts take
//! the write lock, drop expired entries and evict the least recently used
//! one when full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::TranslationConfig;

#[derive(Debug)]
pub struct CacheEntry {
    pub source_text: String,
    pub target_language: String,
    pub translated_text: String,
    pub expires_at: Instant,
    last_used: AtomicU64,
}

type Key = (String, String);

#[derive(Debug)]
pub struct TranslationCache {
    entries: RwLock<HashMap<Key, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    clock: AtomicU64,
    closed: AtomicBool,
}

impl TranslationCache {
    pub fn create(config: &TranslationConfig) -> Arc<Self> {
        Self::with_limits(config.cache_capacity, config.cache_ttl())
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
            clock: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn get(&self, text: &str, target: &str) -> Option<String> {
        if self.is_closed() {
            return None;
        }
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(&key(text, target))?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(entry.translated_text.clone())
    }

    pub fn insert(&self, text: &str, target: &str, translated: &str) {
        if self.is_closed() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        entries.retain(|_, entry| entry.expires_at > now);

        let key = key(text, target);
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                debug!("Translation cache full, evicting {:?}", oldest);
                entries.remove(&oldest);
            }
        }

        let entry = CacheEntry {
            source_text: key.0.clone(),
            target_language: key.1.clone(),
            translated_text: translated.to_string(),
            expires_at: now + self.ttl,
            last_used: AtomicU64::new(self.tick()),
        };
        entries.insert(key, entry);
    }

    /// Drop every entry. The cache stays empty afterwards.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Trimmed, inner whitespace collapsed.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn key(text: &str, target: &str) -> Key {
    (normalize(text), target.trim().to_ascii_lowercase())
}
