//! Scripted in-memory gateway for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Connection, Credentials, Gateway, GatewaySession, RateLimit, SessionEvent};
use crate::common::error::{GatewayError, SendFailure};
use crate::common::messages::{InboundMessage, OutboundPayload};

/// How the next `connect` call behaves.
#[derive(Debug, Clone)]
pub(crate) enum ConnectScript {
    Fail(GatewayError),
    /// Connect succeeds but the handshake never finishes.
    Stall,
}

pub(crate) struct MockGateway {
    scripts: Mutex<VecDeque<ConnectScript>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    attempts: Mutex<Vec<Instant>>,
    rate_limit: RateLimit,
}

impl MockGateway {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_rate_limit(RateLimit {
            capacity: 100,
            refill_per_sec: 100.0,
        })
    }

    pub(crate) fn with_rate_limit(rate_limit: RateLimit) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            rate_limit,
        })
    }

    pub(crate) fn script(&self, script: ConnectScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub(crate) fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub(crate) fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn connect(&self, _credentials: &Credentials) -> Result<Connection, GatewayError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let script = self.scripts.lock().unwrap().pop_front();

        let (events_tx, events) = mpsc::unbounded_channel();
        let session = Arc::new(MockSession::with_events(events_tx, self.rate_limit));

        match script {
            Some(ConnectScript::Fail(error)) => return Err(error),
            Some(ConnectScript::Stall) => {}
            None => {
                session.emit(SessionEvent::Authenticated);
                session.emit(SessionEvent::Ready);
            }
        }

        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(Connection { session, events })
    }
}

pub(crate) struct MockSession {
    events: mpsc::UnboundedSender<SessionEvent>,
    sent: Mutex<Vec<OutboundPayload>>,
    send_script: Mutex<VecDeque<Result<(), SendFailure>>>,
    sent_at: Mutex<Vec<Instant>>,
    attempts: Mutex<u32>,
    rate_limit: RateLimit,
    not_before: Mutex<Option<Instant>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MockSession {
    /// A connected session that is not owned by any gateway.
    pub(crate) fn standalone(rate_limit: RateLimit) -> Arc<Self> {
        let (events, _) = mpsc::unbounded_channel();
        Arc::new(Self::with_events(events, rate_limit))
    }

    fn with_events(events: mpsc::UnboundedSender<SessionEvent>, rate_limit: RateLimit) -> Self {
        Self {
            events,
            sent: Mutex::new(Vec::new()),
            send_script: Mutex::new(VecDeque::new()),
            sent_at: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            rate_limit,
            not_before: Mutex::new(None),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn deliver(&self, message: InboundMessage) {
        self.emit(SessionEvent::Message(message));
    }

    /// Results for the next sends, in order. Later sends succeed.
    pub(crate) fn script_sends(&self, results: impl IntoIterator<Item = Result<(), SendFailure>>) {
        self.send_script.lock().unwrap().extend(results);
    }

    pub(crate) fn hold_until(&self, at: Instant) {
        *self.not_before.lock().unwrap() = Some(at);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.content.clone())
            .collect()
    }

    pub(crate) fn sent_payloads(&self) -> Vec<OutboundPayload> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_at(&self) -> Vec<Instant> {
        self.sent_at.lock().unwrap().clone()
    }

    /// Number of `send` calls, failed ones included.
    pub(crate) fn send_attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl GatewaySession for MockSession {
    async fn send(&self, payload: &OutboundPayload) -> Result<(), SendFailure> {
        *self.attempts.lock().unwrap() += 1;
        let result = self.send_script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.sent.lock().unwrap().push(payload.clone());
            self.sent_at.lock().unwrap().push(Instant::now());
        }
        result
    }

    fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    fn not_before(&self) -> Option<Instant> {
        *self.not_before.lock().unwrap()
    }

    async fn resume(&self) -> Result<(), GatewayError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::TransientNetwork {
                message: "still offline".to_string(),
            })
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
