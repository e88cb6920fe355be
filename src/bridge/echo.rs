//! Echo and duplicate suppression for inbound gateway messages.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tokio::time::Instant;

use crate::common::messages::{InboundMessage, OutboundPayload};

/// Why an inbound message is not relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    /// The gateway delivered the same message id twice.
    Duplicate,
    /// The relay sent this message itself.
    Echo,
}

/// Bounded set of recently seen keys, each kept for `window`.
#[derive(Debug)]
pub struct RecentSet {
    window: Duration,
    capacity: usize,
    entries: VecDeque<(u64, Instant)>,
}

impl RecentSet {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, key: &str) {
        self.prune();
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((hash(key), Instant::now()));
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.prune();
        let key = hash(key);
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Remove one occurrence of `key`. Returns whether it was present.
    pub fn remove_one(&mut self, key: &str) -> bool {
        self.prune();
        let key = hash(key);
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some((_, at)) = self.entries.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            self.entries.pop_front();
        }
    }
}

fn hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Content compared against inbound messages, whitespace-insensitive.
fn fingerprint(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remembers what the relay sent so the gateway's copy is not relayed back.
#[derive(Debug)]
pub struct EchoGuard {
    seen_ids: RecentSet,
    origins: RecentSet,
    fingerprints: RecentSet,
}

impl EchoGuard {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            seen_ids: RecentSet::new(window, capacity),
            origins: RecentSet::new(window, capacity),
            fingerprints: RecentSet::new(window, capacity),
        }
    }

    pub fn record_outbound(&mut self, payload: &OutboundPayload) {
        self.origins.insert(payload.origin_id.as_str());
        self.fingerprints.insert(&fingerprint(&payload.content));
    }

    /// `None` if the message should be relayed.
    ///
    /// Content alone never marks an echo: a gateway user may well post the
    /// same text the relay just sent. The author must be the relay's own
    /// identity, or the nonce must carry one of our origin ids.
    pub fn classify(&mut self, message: &InboundMessage) -> Option<Suppressed> {
        if self.seen_ids.contains(&message.id) {
            return Some(Suppressed::Duplicate);
        }
        self.seen_ids.insert(&message.id);

        let fingerprint = fingerprint(&message.content);
        if message.from_self {
            self.fingerprints.remove_one(&fingerprint);
            return Some(Suppressed::Echo);
        }
        if let Some(nonce) = &message.nonce {
            if self.origins.contains(nonce) {
                self.fingerprints.remove_one(&fingerprint);
                return Some(Suppressed::Echo);
            }
        }
        None
    }
}
