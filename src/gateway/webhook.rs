//! Webhook delivery.
//!
//! Posting through a channel webhook lets each relayed message carry the
//! player's name and avatar. Mentions are never resolved by the gateway.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::common::error::SendFailure;
use crate::common::messages::OutboundPayload;

/// Longest username the gateway accepts for webhook posts.
const MAX_USERNAME_CHARS: usize = 80;

const USER_AGENT: &str = concat!("DiscordBot (disrelay, ", env!("CARGO_PKG_VERSION"), ")");

pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    id: Option<u64>,
    /// End of the current rate limit window once the bucket is empty.
    exhausted_until: Mutex<Option<Instant>>,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            id: parse_webhook_id(&url),
            client,
            url,
            exhausted_until: Mutex::new(None),
        })
    }

    /// Id of the webhook, used to recognise its own posts coming back.
    pub fn webhook_id(&self) -> Option<u64> {
        self.id
    }

    /// Set while the last response reported no requests left in the window.
    pub fn not_before(&self) -> Option<Instant> {
        *self.exhausted_until.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_bucket(&self, headers: &HeaderMap) {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let bucket = BucketHeaders {
            remaining: header("x-ratelimit-remaining"),
            reset_after: header("x-ratelimit-reset-after"),
            reset: header("x-ratelimit-reset"),
        };
        let Some(exhausted) = bucket.exhausted_for(chrono::Utc::now().timestamp_millis()) else {
            return;
        };
        let until = exhausted.map(|wait| Instant::now() + wait);
        if until.is_some() {
            debug!("Webhook rate limit bucket empty for {:?}", exhausted);
        }
        *self.exhausted_until.lock().unwrap_or_else(PoisonError::into_inner) = until;
    }

    pub async fn send(&self, payload: &OutboundPayload) -> Result<(), SendFailure> {
        let response = self
            .client
            .post(&self.url)
            .json(&webhook_body(payload))
            .send()
            .await
            .map_err(|e| SendFailure::transient(e.to_string()))?;

        self.record_bucket(response.headers());
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body: Option<Value> = response.json().await.ok();
        let retry_after = parse_retry_after(header.as_deref(), body.as_ref());
        let reason = body
            .as_ref()
            .and_then(|b| b.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error"));

        debug!("Webhook post failed with {}: {}", status, reason);
        Err(classify_status(status.as_u16(), retry_after, reason))
    }
}

/// Rate limit headers of one response.
struct BucketHeaders<'a> {
    remaining: Option<&'a str>,
    /// Seconds until the window resets, fractional.
    reset_after: Option<&'a str>,
    /// Epoch seconds at which the window resets, fractional.
    reset: Option<&'a str>,
}

impl BucketHeaders<'_> {
    /// `None` when the response carried no bucket information,
    /// `Some(None)` when requests are left, otherwise the wait until reset.
    fn exhausted_for(&self, now_epoch_ms: i64) -> Option<Option<Duration>> {
        let remaining: u64 = self.remaining?.trim().parse().ok()?;
        if remaining > 0 {
            return Some(None);
        }

        let parse_secs = |v: &str| v.trim().parse::<f64>().ok().filter(|s| s.is_finite());
        let wait_secs = self.reset_after.and_then(parse_secs).or_else(|| {
            self.reset
                .and_then(parse_secs)
                .map(|reset| reset - now_epoch_ms as f64 / 1000.0)
        })?;
        Some(Some(Duration::from_secs_f64(wait_secs.max(0.0))))
    }
}

fn parse_webhook_id(url: &str) -> Option<u64> {
    let (_, rest) = url.split_once("/webhooks/")?;
    rest.split('/').next()?.parse().ok().filter(|id| *id != 0)
}

fn webhook_body(payload: &OutboundPayload) -> Value {
    let mut body = json!({
        "content": payload.content,
        "allowed_mentions": { "parse": [] },
    });
    if let Some(username) = &payload.username {
        let username: String = username.chars().take(MAX_USERNAME_CHARS).collect();
        body["username"] = Value::String(username);
    }
    if let Some(avatar_url) = &payload.avatar_url {
        body["avatar_url"] = Value::String(avatar_url.clone());
    }
    body
}

/// Delay requested by a rate limited response.
///
/// The body's `retry_after` (seconds, fractional) wins over the header.
pub(crate) fn parse_retry_after(header: Option<&str>, body: Option<&Value>) -> Option<Duration> {
    let from_body = body
        .and_then(|b| b.get("retry_after"))
        .and_then(Value::as_f64);
    let from_header = header.and_then(|h| h.trim().parse::<f64>().ok());

    from_body
        .or(from_header)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Classify a failed HTTP response.
///
/// Rate limits, timeouts and server errors are transient. Everything else
/// means the gateway rejected this message.
pub(crate) fn classify_status(status: u16, retry_after: Option<Duration>, reason: &str) -> SendFailure {
    match status {
        408 | 429 | 500..=599 => SendFailure::TransientNetwork {
            message: format!("HTTP {}: {}", status, reason),
            retry_after,
        },
        _ => SendFailure::permanent(format!("HTTP {}: {}", status, reason)),
    }
}
