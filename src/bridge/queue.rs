//! Bounded outbound queue and its dispatcher.
//!
//! The coordinator enqueues rendered payloads without ever blocking. A
//! single [`Dispatcher`] task drains the queue through the current gateway
//! session, paced by a [`SendPacer`]. Every payload ends in exactly one
//! [`RelayEvent`]: `Delivered` or `DeliveryFailed`.
//!
//! Items are sent in enqueue order. A failed item that is waiting to be
//! retried steps aside, so later items may overtake it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use super::rate_limit::SendPacer;
use crate::common::error::{DeliveryError, SendFailure};
use crate::common::messages::{OutboundItem, OutboundPayload, RelayEvent};
use crate::common::shutdown::{is_shutdown, wait_for_shutdown};
use crate::config::RelayOptions;
use crate::gateway::{GatewaySession, SessionLink};

struct Entry {
    seq: u64,
    item: OutboundItem,
}

struct Retry {
    entry: Entry,
    due: Instant,
    backoff: ExponentialBackoff,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    retrying: Vec<Retry>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.pending.len() + self.retrying.len()
    }

    fn evict_oldest(&mut self) -> Option<OutboundItem> {
        let pending_seq = self.pending.front().map(|e| e.seq);
        let retry = self
            .retrying
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.entry.seq)
            .map(|(i, r)| (i, r.entry.seq));

        match (pending_seq, retry) {
            (Some(p), Some((i, r))) if r < p => Some(self.retrying.swap_remove(i).entry.item),
            (Some(_), _) => self.pending.pop_front().map(|e| e.item),
            (None, Some((i, _))) => Some(self.retrying.swap_remove(i).entry.item),
            (None, None) => None,
        }
    }

    /// Index of the oldest retry that is due.
    fn due_retry(&self, now: Instant) -> Option<usize> {
        self.retrying
            .iter()
            .enumerate()
            .filter(|(_, r)| r.due <= now)
            .min_by_key(|(_, r)| r.entry.seq)
            .map(|(i, _)| i)
    }
}

enum Due {
    Ready,
    WaitUntil(Instant),
    Empty,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    events: mpsc::UnboundedSender<RelayEvent>,
}

/// Producer handle of the outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    shared: Arc<Shared>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, events: mpsc::UnboundedSender<RelayEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                events,
            }),
        }
    }

    /// Add a payload. Never blocks.
    ///
    /// At capacity the oldest queued payload is dropped and reported as
    /// [`DeliveryError::QueueOverflow`].
    pub fn enqueue(&self, payload: OutboundPayload) {
        let item = OutboundItem::new(payload);
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                self.report_failure(item, DeliveryError::ShutDown);
                return;
            }

            let evicted = if state.len() >= self.shared.capacity {
                state.evict_oldest()
            } else {
                None
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push_back(Entry { seq, item });
            evicted
        };

        if let Some(evicted) = evicted {
            warn!("Outbound queue full, dropping oldest message");
            self.report_failure(evicted, DeliveryError::QueueOverflow);
        }
        self.shared.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn peek_due(&self, now: Instant) -> Due {
        let state = self.lock();
        if !state.pending.is_empty() || state.due_retry(now).is_some() {
            return Due::Ready;
        }
        match state.retrying.iter().map(|r| r.due).min() {
            Some(due) => Due::WaitUntil(due),
            None => Due::Empty,
        }
    }

    /// Take the oldest sendable entry, with its backoff if it is a retry.
    fn take_due(&self, now: Instant) -> Option<(Entry, Option<ExponentialBackoff>)> {
        let mut state = self.lock();
        let pending_seq = state.pending.front().map(|e| e.seq);
        let retry = state.due_retry(now);
        let retry_first = match (pending_seq, retry) {
            (Some(p), Some(i)) => state.retrying[i].entry.seq < p,
            (None, Some(_)) => true,
            _ => false,
        };

        match retry {
            Some(i) if retry_first => {
                let retry = state.retrying.swap_remove(i);
                Some((retry.entry, Some(retry.backoff)))
            }
            _ => state.pending.pop_front().map(|entry| (entry, None)),
        }
    }

    fn schedule_retry(&self, entry: Entry, due: Instant, backoff: ExponentialBackoff) {
        self.lock().retrying.push(Retry {
            entry,
            due,
            backoff,
        });
        self.shared.notify.notify_one();
    }

    /// Refuse new payloads and hand back everything still queued.
    fn close(&self) -> Vec<OutboundItem> {
        let mut state = self.lock();
        state.closed = true;
        let mut rest: Vec<Entry> = state.pending.drain(..).collect();
        rest.extend(state.retrying.drain(..).map(|r| r.entry));
        rest.sort_by_key(|e| e.seq);
        rest.into_iter().map(|e| e.item).collect()
    }

    async fn notified(&self) {
        self.shared.notify.notified().await
    }

    fn report(&self, event: RelayEvent) {
        if self.shared.events.send(event).is_err() {
            debug!("Relay event receiver dropped");
        }
    }

    fn report_failure(&self, item: OutboundItem, error: DeliveryError) {
        self.report(RelayEvent::DeliveryFailed {
            origin_id: item.payload.origin_id,
            content: item.payload.content,
            error,
        });
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Backoff between attempts of one payload.
fn send_backoff(base: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(base)
        .with_max_delay(max.max(base))
        .with_factor(2.0)
        .with_jitter()
        .without_max_times()
        .build()
}

/// Drains an [`OutboundQueue`] through the current session.
pub struct Dispatcher {
    queue: OutboundQueue,
    link_rx: watch::Receiver<SessionLink>,
    shutdown_rx: watch::Receiver<bool>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    pacer: Option<SendPacer>,
}

impl Dispatcher {
    pub fn new(
        queue: OutboundQueue,
        link_rx: watch::Receiver<SessionLink>,
        shutdown_rx: watch::Receiver<bool>,
        options: &RelayOptions,
    ) -> Self {
        Self {
            queue,
            link_rx,
            shutdown_rx,
            max_attempts: options.max_send_attempts.max(1),
            backoff_base: options.send_backoff_base(),
            backoff_max: options.backoff_max(),
            pacer: None,
        }
    }

    /// Run until shutdown, then report whatever is left.
    ///
    /// A send that has started always runs to completion.
    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        while !is_shutdown(&shutdown_rx) {
            let link = self.link_rx.borrow_and_update().clone();
            let Some(session) = link else {
                tokio::select! {
                    changed = self.link_rx.changed() => if changed.is_err() { break },
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                }
                continue;
            };

            let limit = session.rate_limit();
            let pacer = self.pacer.get_or_insert_with(|| SendPacer::new(limit));
            pacer.reconfigure(limit);

            match self.queue.peek_due(Instant::now()) {
                Due::Ready => {}
                Due::WaitUntil(due) => {
                    tokio::select! {
                        _ = sleep_until(due) => {}
                        _ = self.queue.notified() => {}
                        changed = self.link_rx.changed() => if changed.is_err() { break },
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                    continue;
                }
                Due::Empty => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        changed = self.link_rx.changed() => if changed.is_err() { break },
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                    continue;
                }
            }

            // The gateway said its bucket is empty
            if let Some(at) = session.not_before().filter(|at| *at > Instant::now()) {
                debug!("Gateway rate limit exhausted, waiting {:?}", at - Instant::now());
                tokio::select! {
                    _ = sleep_until(at) => {}
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                }
                continue;
            }

            if let Err(wait) = pacer.try_acquire() {
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                }
                continue;
            }

            // An overflow may have evicted the item since peek_due. The slot
            // is spent anyway.
            let Some((entry, backoff)) = self.queue.take_due(Instant::now()) else {
                continue;
            };
            self.deliver(session.as_ref(), entry, backoff).await;
        }

        let rest = self.queue.close();
        if !rest.is_empty() {
            warn!("Dropping {} undelivered messages on shutdown", rest.len());
        }
        for item in rest {
            self.queue.report_failure(item, DeliveryError::ShutDown);
        }
        info!("Outbound dispatcher stopped");
    }

    async fn deliver(&self, session: &dyn GatewaySession, mut entry: Entry, backoff: Option<ExponentialBackoff>) {
        entry.item.attempt += 1;
        let attempt = entry.item.attempt;

        let failure = match session.send(&entry.item.payload).await {
            Ok(()) => {
                debug!("Delivered {} on attempt {}", entry.item.payload.origin_id, attempt);
                self.queue.report(RelayEvent::Delivered {
                    origin_id: entry.item.payload.origin_id,
                    attempts: attempt,
                });
                return;
            }
            Err(failure) => failure,
        };

        match failure {
            SendFailure::PermanentDelivery { reason } => {
                warn!("Message {} rejected: {}", entry.item.payload.origin_id, reason);
                self.queue
                    .report_failure(entry.item, DeliveryError::PermanentDelivery { reason });
            }
            failure if attempt >= self.max_attempts => {
                warn!(
                    "Giving up on message {} after {} attempts: {}",
                    entry.item.payload.origin_id, attempt, failure
                );
                self.queue.report_failure(
                    entry.item,
                    DeliveryError::RetriesExhausted {
                        attempts: attempt,
                        last_error: failure.to_string(),
                    },
                );
            }
            failure => {
                let mut backoff = backoff.unwrap_or_else(|| send_backoff(self.backoff_base, self.backoff_max));
                let delay = backoff.next().unwrap_or(self.backoff_max);
                let delay = failure.retry_after().map_or(delay, |after| after.max(delay));
                debug!(
                    "Send attempt {} of {} failed: {}. Retrying in {:?}",
                    attempt, entry.item.payload.origin_id, failure, delay
                );
                self.queue.schedule_retry(entry, Instant::now() + delay, backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::OriginId;
    use crate::gateway::mock::MockSession;
    use crate::gateway::RateLimit;
    use tokio_test::assert_ok;

    const FAST: RateLimit = RateLimit {
        capacity: 100,
        refill_per_sec: 100.0,
    };

    struct Harness {
        queue: OutboundQueue,
        events: mpsc::UnboundedReceiver<RelayEvent>,
        link_tx: watch::Sender<SessionLink>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn options(capacity: usize, max_attempts: u32) -> RelayOptions {
        RelayOptions {
            max_queue_size: capacity,
            max_send_attempts: max_attempts,
            send_backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            ..RelayOptions::default()
        }
    }

    fn start(options: RelayOptions) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = OutboundQueue::new(options.max_queue_size, events_tx);
        let dispatcher = Dispatcher::new(queue.clone(), link_rx, shutdown_rx, &options);
        Harness {
            queue,
            events,
            link_tx,
            shutdown_tx,
            task: tokio::spawn(dispatcher.run()),
        }
    }

    fn connect(harness: &Harness, session: &Arc<MockSession>) {
        let link: Arc<dyn GatewaySession> = session.clone();
        harness.link_tx.send_replace(Some(link));
    }

    fn payload(content: &str) -> OutboundPayload {
        OutboundPayload::new(content, OriginId::from(content))
    }

    async fn next_event(harness: &mut Harness) -> RelayEvent {
        harness.events.recv().await.expect("event stream ended")
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_evicts_oldest_then_delivers_in_order() {
        let mut harness = start(options(3, 5));
        for content in ["m1", "m2", "m3", "m4"] {
            harness.queue.enqueue(payload(content));
        }
        assert_eq!(harness.queue.len(), 3);

        match next_event(&mut harness).await {
            RelayEvent::DeliveryFailed { origin_id, error, .. } => {
                assert_eq!(origin_id, OriginId::from("m1"));
                assert_eq!(error, DeliveryError::QueueOverflow);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let session = MockSession::standalone(FAST);
        connect(&harness, &session);
        for _ in 0..3 {
            assert!(matches!(next_event(&mut harness).await, RelayEvent::Delivered { .. }));
        }
        assert_eq!(session.sent(), vec!["m2", "m3", "m4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_without_retries() {
        let mut harness = start(options(100, 5));
        let session = MockSession::standalone(FAST);
        connect(&harness, &session);

        let contents: Vec<String> = (0..20).map(|i| format!("message {}", i)).collect();
        for content in &contents {
            harness.queue.enqueue(payload(content));
        }
        for _ in 0..contents.len() {
            next_event(&mut harness).await;
        }
        assert_eq!(session.sent(), contents);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_block_later_messages() {
        let mut harness = start(options(100, 5));
        let session = MockSession::standalone(FAST);
        session.script_sends([Err(SendFailure::transient("connection reset"))]);
        connect(&harness, &session);

        for content in ["m1", "m2", "m3"] {
            harness.queue.enqueue(payload(content));
        }

        let mut delivered = Vec::new();
        while delivered.len() < 3 {
            if let RelayEvent::Delivered { origin_id, attempts } = next_event(&mut harness).await {
                delivered.push((origin_id.to_string(), attempts));
            }
        }
        assert_eq!(
            delivered,
            vec![("m2".to_string(), 1), ("m3".to_string(), 1), ("m1".to_string(), 2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_is_reported() {
        let mut harness = start(options(100, 3));
        let session = MockSession::standalone(FAST);
        session.script_sends((0..3).map(|_| Err(SendFailure::transient("timeout"))));
        connect(&harness, &session);

        harness.queue.enqueue(payload("m1"));
        match next_event(&mut harness).await {
            RelayEvent::DeliveryFailed { error, content, .. } => {
                assert_eq!(content, "m1");
                assert!(matches!(error, DeliveryError::RetriesExhausted { attempts: 3, .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.send_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let mut harness = start(options(100, 5));
        let session = MockSession::standalone(FAST);
        session.script_sends([Err(SendFailure::permanent("Cannot send an empty message"))]);
        connect(&harness, &session);

        harness.queue.enqueue(payload("m1"));
        let event = next_event(&mut harness).await;
        assert!(matches!(
            event,
            RelayEvent::DeliveryFailed {
                error: DeliveryError::PermanentDelivery { .. },
                ..
            }
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(session.send_attempts(), 1);
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_lengthens_backoff() {
        let mut harness = start(options(100, 5));
        let session = MockSession::standalone(FAST);
        session.script_sends([Err(SendFailure::TransientNetwork {
            message: "rate limited".to_string(),
            retry_after: Some(Duration::from_secs(10)),
        })]);
        connect(&harness, &session);

        let start = Instant::now();
        harness.queue.enqueue(payload("m1"));
        assert!(matches!(next_event(&mut harness).await, RelayEvent::Delivered { attempts: 2, .. }));
        assert!(session.sent_at()[0] - start >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_paces_sends() {
        let mut harness = start(options(100, 5));
        let session = MockSession::standalone(RateLimit {
            capacity: 2,
            refill_per_sec: 1.0,
        });
        connect(&harness, &session);

        let start = Instant::now();
        for i in 0..6 {
            harness.queue.enqueue(payload(&format!("m{}", i)));
        }
        for _ in 0..6 {
            next_event(&mut harness).await;
        }

        let sent_at = session.sent_at();
        assert!(sent_at[1] - start < Duration::from_millis(10));
        assert!(sent_at[5] - start >= Duration::from_secs(4));
        for (i, first) in sent_at.iter().enumerate() {
            for (j, last) in sent_at.iter().enumerate().skip(i) {
                let window = (*last - *first).as_secs_f64();
                assert!((j - i + 1) as f64 <= 2.0 + window + 1e-6);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_sends_while_gateway_bucket_is_empty() {
        let mut harness = start(options(100, 5));
        let session = MockSession::standalone(FAST);
        let start = Instant::now();
        session.hold_until(start + Duration::from_secs(3));
        connect(&harness, &session);

        harness.queue.enqueue(payload("m1"));
        assert!(matches!(next_event(&mut harness).await, RelayEvent::Delivered { attempts: 1, .. }));
        assert!(session.sent_at()[0] - start >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_ready_session() {
        let mut harness = start(options(100, 5));
        harness.queue.enqueue(payload("m1"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(harness.events.try_recv().is_err());
        assert_eq!(harness.queue.len(), 1);

        let session = MockSession::standalone(FAST);
        connect(&harness, &session);
        assert!(matches!(next_event(&mut harness).await, RelayEvent::Delivered { .. }));
        assert!(harness.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_undelivered() {
        let mut harness = start(options(100, 5));
        harness.queue.enqueue(payload("m1"));
        harness.queue.enqueue(payload("m2"));

        assert_ok!(harness.shutdown_tx.send(true));
        assert_ok!((&mut harness.task).await);

        for expected in ["m1", "m2"] {
            match next_event(&mut harness).await {
                RelayEvent::DeliveryFailed { content, error, .. } => {
                    assert_eq!(content, expected);
                    assert_eq!(error, DeliveryError::ShutDown);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        harness.queue.enqueue(payload("late"));
        assert!(matches!(
            next_event(&mut harness).await,
            RelayEvent::DeliveryFailed {
                error: DeliveryError::ShutDown,
                ..
            }
        ));
    }
}
