//! Gateway session lifecycle.
//!
//! One [`SessionManager`] task owns the connection. It connects, waits for
//! the handshake, serves the session until it fails, and reconnects with
//! exponential backoff for as long as the relay runs. Other tasks observe it
//! through two watch channels: the current [`GatewaySessionState`] and the
//! [`SessionLink`] the dispatcher sends through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::{Connection, Credentials, Gateway, GatewaySession, SessionEvent};
use crate::common::error::GatewayError;
use crate::common::messages::InboundMessage;
use crate::common::reconnect::{ReconnectConfig, ReconnectState};
use crate::common::shutdown::{is_shutdown, wait_for_shutdown};
use crate::config::RelayOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewaySessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Ready,
    /// Connectivity lost on a live session, resume pending.
    Degraded,
    ShuttingDown,
}

impl fmt::Display for GatewaySessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// The session outbound traffic may use. `Some` only while `Ready`.
pub type SessionLink = Option<Arc<dyn GatewaySession>>;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub reconnect: ReconnectConfig,
    /// Deadline for connect plus authentication plus ready.
    pub handshake_timeout: Duration,
    /// Failed resumes tolerated before the session is dropped.
    pub degraded_max_attempts: u32,
}

impl SessionOptions {
    pub fn from_relay_options(options: &RelayOptions) -> Self {
        Self {
            reconnect: options.reconnect_config(),
            handshake_timeout: options.handshake_timeout(),
            degraded_max_attempts: options.degraded_max_attempts,
        }
    }
}

/// Receiving ends handed out by [`SessionManager::new`].
pub struct SessionHandles {
    pub state: watch::Receiver<GatewaySessionState>,
    pub link: watch::Receiver<SessionLink>,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

enum Handshake {
    Ready(Connection),
    Failed(GatewayError),
    Shutdown,
}

enum Served {
    Failed(GatewayError),
    Shutdown,
}

struct Degraded {
    backoff: ReconnectState,
    failures: u32,
    next_attempt: Instant,
}

pub struct SessionManager {
    gateway: Arc<dyn Gateway>,
    credentials: Credentials,
    options: SessionOptions,
    backoff: ReconnectState,
    state_tx: watch::Sender<GatewaySessionState>,
    link_tx: watch::Sender<SessionLink>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionManager {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        credentials: Credentials,
        options: SessionOptions,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, SessionHandles) {
        let (state_tx, state) = watch::channel(GatewaySessionState::Disconnected);
        let (link_tx, link) = watch::channel(None);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let manager = Self {
            gateway,
            credentials,
            backoff: ReconnectState::new(options.reconnect.clone()),
            options,
            state_tx,
            link_tx,
            inbound_tx,
            shutdown_rx,
        };
        (manager, SessionHandles { state, link, inbound })
    }

    /// Run until shutdown. Ends in `Disconnected`.
    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        while !is_shutdown(&shutdown_rx) {
            self.set_state(GatewaySessionState::Connecting);

            let error = match self.handshake(&mut shutdown_rx).await {
                Handshake::Ready(connection) => {
                    self.backoff.reset();
                    match self.serve(connection, &mut shutdown_rx).await {
                        Served::Failed(error) => error,
                        Served::Shutdown => break,
                    }
                }
                Handshake::Failed(error) => error,
                Handshake::Shutdown => break,
            };

            self.set_state(GatewaySessionState::Disconnected);
            let delay = self
                .backoff
                .next_delay()
                .unwrap_or_else(|| self.backoff.max_delay());
            match &error {
                GatewayError::AuthenticationFailure { .. } => {
                    error!("Gateway authentication failed: {}. Retrying in {:?}", error, delay)
                }
                _ => warn!("Gateway session failed: {}. Reconnecting in {:?}", error, delay),
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        self.set_state(GatewaySessionState::ShuttingDown);
        self.link_tx.send_replace(None);
        self.set_state(GatewaySessionState::Disconnected);
        info!("Gateway session manager stopped");
    }

    async fn handshake(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> Handshake {
        let deadline = Instant::now() + self.options.handshake_timeout;

        let connected = tokio::select! {
            result = timeout_at(deadline, self.gateway.connect(&self.credentials)) => result,
            _ = wait_for_shutdown(shutdown_rx) => return Handshake::Shutdown,
        };
        let mut connection = match connected {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => return Handshake::Failed(error),
            Err(_) => return Handshake::Failed(GatewayError::HandshakeTimeout),
        };

        loop {
            let event = tokio::select! {
                event = timeout_at(deadline, connection.events.recv()) => event,
                _ = wait_for_shutdown(shutdown_rx) => {
                    connection.session.close().await;
                    return Handshake::Shutdown;
                }
            };

            match event {
                Err(_) => {
                    connection.session.close().await;
                    return Handshake::Failed(GatewayError::HandshakeTimeout);
                }
                Ok(None) => return Handshake::Failed(GatewayError::Closed),
                Ok(Some(SessionEvent::Authenticated)) => {
                    self.set_state(GatewaySessionState::Authenticated);
                }
                Ok(Some(SessionEvent::Ready)) => {
                    self.set_state(GatewaySessionState::Authenticated);
                    return Handshake::Ready(connection);
                }
                Ok(Some(SessionEvent::Closed { reason })) => return Handshake::Failed(reason),
                Ok(Some(SessionEvent::Message(message))) => self.forward(message),
                Ok(Some(other)) => debug!("Ignoring {:?} during handshake", other),
            }
        }
    }

    async fn serve(&mut self, connection: Connection, shutdown_rx: &mut watch::Receiver<bool>) -> Served {
        let Connection {
            session,
            mut events,
        } = connection;
        self.go_ready(&session);

        let mut degraded: Option<Degraded> = None;

        loop {
            let resume_at = degraded.as_ref().map(|d| d.next_attempt);

            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx) => {
                    self.link_tx.send_replace(None);
                    session.close().await;
                    return Served::Shutdown;
                }
                event = events.recv() => match event {
                    Some(SessionEvent::Message(message)) => self.forward(message),
                    Some(SessionEvent::ConnectivityLost) => {
                        if degraded.is_none() {
                            degraded = Some(self.go_degraded());
                        }
                    }
                    Some(SessionEvent::Resumed) | Some(SessionEvent::Ready) => {
                        if degraded.take().is_some() {
                            self.go_ready(&session);
                        }
                    }
                    Some(SessionEvent::Authenticated) => {}
                    Some(SessionEvent::Closed { reason }) => {
                        self.link_tx.send_replace(None);
                        return Served::Failed(reason);
                    }
                    None => {
                        self.link_tx.send_replace(None);
                        return Served::Failed(GatewayError::Closed);
                    }
                },
                _ = sleep_until(resume_at.unwrap_or_else(Instant::now)), if resume_at.is_some() => {
                    let Some(state) = degraded.as_mut() else { continue };
                    match session.resume().await {
                        Ok(()) => {
                            degraded = None;
                            self.go_ready(&session);
                        }
                        Err(error) => {
                            state.failures += 1;
                            if state.failures > self.options.degraded_max_attempts {
                                warn!(
                                    "Gateway did not recover after {} resume attempts",
                                    state.failures
                                );
                                session.close().await;
                                return Served::Failed(error);
                            }
                            let delay = state
                                .backoff
                                .next_delay()
                                .unwrap_or_else(|| state.backoff.max_delay());
                            debug!("Resume attempt {} failed: {}. Next in {:?}", state.failures, error, delay);
                            state.next_attempt = Instant::now() + delay;
                        }
                    }
                }
            }
        }
    }

    fn go_ready(&self, session: &Arc<dyn GatewaySession>) {
        self.link_tx.send_replace(Some(Arc::clone(session)));
        self.set_state(GatewaySessionState::Ready);
    }

    fn go_degraded(&self) -> Degraded {
        self.link_tx.send_replace(None);
        self.set_state(GatewaySessionState::Degraded);

        let mut backoff = ReconnectState::new(self.options.reconnect.clone());
        let delay = backoff.next_delay().unwrap_or_else(|| backoff.max_delay());
        Degraded {
            backoff,
            failures: 0,
            next_attempt: Instant::now() + delay,
        }
    }

    fn forward(&self, message: InboundMessage) {
        if self.inbound_tx.send(message).is_err() {
            debug!("Inbound receiver dropped, discarding gateway message");
        }
    }

    fn set_state(&self, next: GatewaySessionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!("Gateway session: {} -> {}", previous, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{SourceSystem, UserRef};
    use crate::gateway::mock::{ConnectScript, MockGateway};

    fn options() -> SessionOptions {
        SessionOptions {
            reconnect: ReconnectConfig::unlimited(Duration::from_secs(1), Duration::from_secs(8)),
            handshake_timeout: Duration::from_secs(5),
            degraded_max_attempts: 2,
        }
    }

    fn start(gateway: Arc<MockGateway>) -> (SessionHandles, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let credentials = Credentials {
            token: "token".to_string(),
        };
        let (manager, handles) = SessionManager::new(gateway, credentials, options(), shutdown_rx);
        let task = tokio::spawn(manager.run());
        (handles, shutdown_tx, task)
    }

    async fn wait_state(handles: &mut SessionHandles, wanted: GatewaySessionState) {
        handles.state.wait_for(|s| *s == wanted).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_to_ready() {
        let gateway = MockGateway::new();
        let (mut handles, _shutdown, _task) = start(gateway.clone());

        wait_state(&mut handles, GatewaySessionState::Ready).await;
        assert!(handles.link.borrow().is_some());
        assert_eq!(gateway.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_is_monotonic_and_capped() {
        let gateway = MockGateway::new();
        for _ in 0..6 {
            gateway.script(ConnectScript::Fail(GatewayError::TransientNetwork {
                message: "refused".to_string(),
            }));
        }
        let (mut handles, _shutdown, _task) = start(gateway.clone());

        wait_state(&mut handles, GatewaySessionState::Ready).await;

        let attempts = gateway.attempts();
        assert_eq!(attempts.len(), 7);
        let delays: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "{:?} < {:?}", pair[1], pair[0]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(8)));
        assert!(delays[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_is_retried() {
        let gateway = MockGateway::new();
        gateway.script(ConnectScript::Fail(GatewayError::AuthenticationFailure {
            reason: "invalid token".to_string(),
        }));
        let (mut handles, _shutdown, _task) = start(gateway.clone());

        wait_state(&mut handles, GatewaySessionState::Ready).await;
        assert_eq!(gateway.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_reconnects() {
        let gateway = MockGateway::new();
        gateway.script(ConnectScript::Stall);
        let (mut handles, _shutdown, _task) = start(gateway.clone());

        wait_state(&mut handles, GatewaySessionState::Ready).await;

        let attempts = gateway.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(6));
        assert!(gateway.session(0).is_closed());
        assert!(!gateway.session(1).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_then_resumed() {
        let gateway = MockGateway::new();
        let (mut handles, _shutdown, _task) = start(gateway.clone());
        wait_state(&mut handles, GatewaySessionState::Ready).await;

        let session = gateway.session(0);
        session.set_connected(false);
        session.emit(SessionEvent::ConnectivityLost);
        wait_state(&mut handles, GatewaySessionState::Degraded).await;
        assert!(handles.link.borrow().is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*handles.state.borrow(), GatewaySessionState::Degraded);

        session.set_connected(true);
        wait_state(&mut handles, GatewaySessionState::Ready).await;
        assert!(handles.link.borrow().is_some());
        assert_eq!(gateway.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_event_recovers() {
        let gateway = MockGateway::new();
        let (mut handles, _shutdown, _task) = start(gateway.clone());
        wait_state(&mut handles, GatewaySessionState::Ready).await;

        let session = gateway.session(0);
        session.set_connected(false);
        session.emit(SessionEvent::ConnectivityLost);
        wait_state(&mut handles, GatewaySessionState::Degraded).await;

        session.emit(SessionEvent::Resumed);
        wait_state(&mut handles, GatewaySessionState::Ready).await;
        assert_eq!(gateway.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_too_long_reconnects() {
        let gateway = MockGateway::new();
        let (mut handles, _shutdown, _task) = start(gateway.clone());
        wait_state(&mut handles, GatewaySessionState::Ready).await;

        let session = gateway.session(0);
        session.set_connected(false);
        session.emit(SessionEvent::ConnectivityLost);

        wait_state(&mut handles, GatewaySessionState::Disconnected).await;
        assert!(session.is_closed());

        wait_state(&mut handles, GatewaySessionState::Ready).await;
        assert_eq!(gateway.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_messages_are_forwarded() {
        let gateway = MockGateway::new();
        let (mut handles, _shutdown, _task) = start(gateway.clone());
        wait_state(&mut handles, GatewaySessionState::Ready).await;

        let message = InboundMessage {
            id: "1".to_string(),
            author: UserRef::new(SourceSystem::Gateway, "42", "alice"),
            content: "hello".to_string(),
            mentions: Default::default(),
            nonce: None,
            from_self: false,
        };
        gateway.session(0).deliver(message.clone());

        assert_eq!(handles.inbound.recv().await, Some(message));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_reconnects() {
        let gateway = MockGateway::new();
        let (mut handles, _shutdown, _task) = start(gateway.clone());
        wait_state(&mut handles, GatewaySessionState::Ready).await;

        gateway.session(0).emit(SessionEvent::Closed {
            reason: GatewayError::Closed,
        });
        wait_state(&mut handles, GatewaySessionState::Disconnected).await;
        wait_state(&mut handles, GatewaySessionState::Ready).await;
        assert_eq!(gateway.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_session() {
        let gateway = MockGateway::new();
        let (mut handles, shutdown, task) = start(gateway.clone());
        wait_state(&mut handles, GatewaySessionState::Ready).await;

        shutdown.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(*handles.state.borrow(), GatewaySessionState::Disconnected);
        assert!(handles.link.borrow().is_none());
        assert!(gateway.session(0).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_reconnect_timer() {
        let gateway = MockGateway::new();
        for _ in 0..100 {
            gateway.script(ConnectScript::Fail(GatewayError::TransientNetwork {
                message: "refused".to_string(),
            }));
        }
        let (_handles, shutdown, task) = start(gateway.clone());

        tokio::time::sleep(Duration::from_secs(20)).await;
        let before = gateway.attempts().len();

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(10), task)
            .await
            .expect("manager should stop without waiting for the timer")
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.attempts().len(), before);
    }
}
