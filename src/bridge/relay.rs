//! Relay runtime: wires the session manager, dispatcher and coordinator
//! together and owns their tasks.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::channels::{ChannelBundle, RelayHandle};
use super::coordinator::Coordinator;
use super::echo::EchoGuard;
use super::orchestrator::Bridge;
use super::queue::{Dispatcher, OutboundQueue};
use crate::config::Config;
use crate::game::DisplayRequest;
use crate::gateway::{Credentials, Gateway, SessionManager, SessionOptions};
use crate::translate::{TranslationAdapter, TranslationCache, Translator};

/// A running relay.
pub struct RelayRuntime {
    handle: RelayHandle,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    cache: Option<Arc<TranslationCache>>,
}

impl RelayRuntime {
    /// Spawn the relay tasks. Must be called within a tokio runtime.
    ///
    /// Returns the runtime and the receiver of lines the game should show.
    pub fn start(
        config: &Config,
        gateway: Arc<dyn Gateway>,
        translator: Option<Arc<dyn Translator>>,
    ) -> (Self, mpsc::UnboundedReceiver<DisplayRequest>) {
        let options = &config.relay;
        let bundle = ChannelBundle::new();
        let shutdown_rx = bundle.control.shutdown_rx.clone();

        let credentials = Credentials {
            token: config.discord.token.clone(),
        };
        let (manager, session) = SessionManager::new(
            gateway,
            credentials,
            SessionOptions::from_relay_options(options),
            shutdown_rx.clone(),
        );

        let queue = OutboundQueue::new(options.max_queue_size, bundle.relay_events_tx);
        let dispatcher = Dispatcher::new(queue.clone(), session.link, shutdown_rx.clone(), options);

        let cache = translator.as_ref().map(|_| TranslationCache::create(&config.translation));
        let adapter = translator.zip(cache.clone()).map(|(translator, cache)| {
            Arc::new(TranslationAdapter::new(translator, cache, config.translation.timeout()))
        });
        if adapter.is_some() {
            info!("Translation enabled");
        }

        let enabled = bundle.coordinator.enabled.clone();
        let events_tx = bundle.coordinator.events_tx.clone();
        let coordinator = Coordinator::new(
            Bridge::new(config, adapter),
            EchoGuard::new(options.echo_suppression_window(), options.echo_suppression_capacity),
            queue,
            bundle.coordinator,
            session.inbound,
            session.state.clone(),
            shutdown_rx,
        );

        let handle = RelayHandle::new(
            bundle.game.game_tx,
            enabled,
            session.state,
            events_tx,
            bundle.control.shutdown_tx,
        );

        let tasks = vec![
            ("session manager", tokio::spawn(manager.run())),
            ("dispatcher", tokio::spawn(dispatcher.run())),
            ("coordinator", tokio::spawn(coordinator.run())),
        ];

        info!("Relay started");
        (Self { handle, tasks, cache }, bundle.game.display_rx)
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Stop every task and wait up to `grace` for them to finish.
    ///
    /// Messages still queued are reported as not delivered.
    pub async fn shutdown(self, grace: Duration) {
        info!("Shutting down relay...");
        self.handle.shutdown();

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        error!("Relay {} task failed: {}", name, e);
                    }
                }
            }
            Err(_) => warn!("Relay tasks did not stop within {:?}", grace),
        }

        if let Some(cache) = self.cache {
            cache.shutdown();
        }
        info!("Relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::{DeliveryError, SendFailure};
    use crate::common::messages::{InboundMessage, MentionLookup, RelayEvent};
    use crate::common::types::{RichText, SourceSystem, UserRef};
    use crate::config::types::test_config;
    use crate::game::DisplayKind;
    use crate::gateway::mock::{ConnectScript, MockGateway};
    use crate::gateway::{GatewaySessionState, SessionEvent};
    use crate::translate::mock::{MockBehavior, MockTranslator};
    use tokio::time::{sleep, Instant};

    fn message(id: &str, author: &str, content: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            author: UserRef::new(SourceSystem::Gateway, "7", author),
            content: content.to_string(),
            mentions: MentionLookup::default(),
            nonce: None,
            from_self: false,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    async fn wait_for_state(handle: &RelayHandle, state: GatewaySessionState) {
        handle
            .state_changes()
            .wait_for(|s| *s == state)
            .await
            .unwrap();
    }

    fn start(config: &Config, gateway: &Arc<MockGateway>) -> (RelayRuntime, mpsc::UnboundedReceiver<DisplayRequest>) {
        RelayRuntime::start(config, gateway.clone(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_game_chat_reaches_gateway() {
        let gateway = MockGateway::new();
        let (runtime, _display) = start(&test_config(), &gateway);
        let handle = runtime.handle();
        wait_for_state(&handle, GatewaySessionState::Ready).await;

        handle.game_chat("Steve", RichText::plain("hi"));
        let session = gateway.session(0);
        wait_until(|| session.sent().len() == 1).await;
        assert_eq!(session.sent(), vec!["**Steve**: hi"]);

        runtime.shutdown(Duration::from_secs(5)).await;
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_is_not_displayed() {
        let gateway = MockGateway::new();
        let (runtime, mut display) = start(&test_config(), &gateway);
        let handle = runtime.handle();
        wait_for_state(&handle, GatewaySessionState::Ready).await;

        handle.game_chat("Steve", RichText::plain("hi"));
        let session = gateway.session(0);
        wait_until(|| session.sent().len() == 1).await;

        let mut echo = message("1", "Relay", "**Steve**: hi");
        echo.from_self = true;
        session.deliver(echo);
        // Same text from a real user is relayed
        session.deliver(message("2", "Bob", "**Steve**: hi"));

        let shown = display.recv().await.unwrap();
        assert_eq!(shown.text.plain_text(), "[Discord] Bob: Steve: hi");
        assert_eq!(shown.kind, DisplayKind::Relayed);

        sleep(Duration::from_secs(1)).await;
        assert!(display.try_recv().is_err());
        runtime.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_loses_and_duplicates_nothing() {
        let gateway = MockGateway::new();
        let (runtime, mut display) = start(&test_config(), &gateway);
        let handle = runtime.handle();
        wait_for_state(&handle, GatewaySessionState::Ready).await;
        let session = gateway.session(0);

        session.deliver(message("1", "Bob", "one"));
        assert_eq!(display.recv().await.unwrap().text.plain_text(), "[Discord] Bob: one");

        session.set_connected(false);
        session.emit(SessionEvent::ConnectivityLost);
        wait_for_state(&handle, GatewaySessionState::Degraded).await;
        let outage_start = Instant::now();

        session.deliver(message("2", "Bob", "two"));
        handle.game_chat("Steve", RichText::plain("during outage"));

        sleep(Duration::from_secs(10)).await;
        assert!(session.sent().is_empty());
        assert!(display.try_recv().is_err());

        // The gateway replays the message it delivered during the outage
        session.set_connected(true);
        session.emit(SessionEvent::Resumed);
        session.deliver(message("2", "Bob", "two"));
        wait_for_state(&handle, GatewaySessionState::Ready).await;

        assert_eq!(display.recv().await.unwrap().text.plain_text(), "[Discord] Bob: two");
        wait_until(|| session.sent().len() == 1).await;
        assert_eq!(session.sent(), vec!["**Steve**: during outage"]);
        assert!(session.sent_at()[0] >= outage_start + Duration::from_secs(10));

        sleep(Duration::from_secs(1)).await;
        assert!(display.try_recv().is_err());
        assert_eq!(gateway.session_count(), 1);
        runtime.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_translation_failure_still_relays() {
        let mut config = test_config();
        config.relay.target_language_gateway = Some("de".to_string());
        let gateway = MockGateway::new();
        let translator: Arc<dyn Translator> = Arc::new(MockTranslator::new(MockBehavior::Fail));
        let (runtime, _display) = RelayRuntime::start(&config, gateway.clone(), Some(translator));
        let handle = runtime.handle();
        wait_for_state(&handle, GatewaySessionState::Ready).await;

        handle.game_chat("Steve", RichText::plain("hallo"));
        let session = gateway.session(0);
        wait_until(|| session.sent().len() == 1).await;

        let payload = &session.sent_payloads()[0];
        assert_eq!(payload.content, "**Steve**: hallo");
        assert!(payload.untranslated);
        runtime.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_message_is_reported_in_game() {
        let gateway = MockGateway::new();
        let (runtime, mut display) = start(&test_config(), &gateway);
        let handle = runtime.handle();
        let mut events = handle.subscribe();
        wait_for_state(&handle, GatewaySessionState::Ready).await;

        let session = gateway.session(0);
        session.script_sends([Err(SendFailure::permanent("too long"))]);
        handle.game_chat("Steve", RichText::plain("hi"));

        let notice = display.recv().await.unwrap();
        assert_eq!(notice.kind, DisplayKind::SystemNotice);
        assert_eq!(
            notice.text.plain_text(),
            "Could not deliver to Discord: Steve: hi (Message rejected by gateway: too long)"
        );

        match events.recv().await.unwrap() {
            RelayEvent::DeliveryFailed { error, .. } => assert_eq!(
                error,
                DeliveryError::PermanentDelivery {
                    reason: "too long".to_string()
                }
            ),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.send_attempts(), 1);
        runtime.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_relay_drops_both_directions() {
        let gateway = MockGateway::new();
        let (runtime, mut display) = start(&test_config(), &gateway);
        let handle = runtime.handle();
        wait_for_state(&handle, GatewaySessionState::Ready).await;
        let session = gateway.session(0);

        handle.set_enabled(false);
        handle.game_chat("Steve", RichText::plain("muted"));
        session.deliver(message("1", "Bob", "muted too"));
        sleep(Duration::from_secs(1)).await;
        assert!(session.sent().is_empty());
        assert!(display.try_recv().is_err());

        handle.set_enabled(true);
        handle.game_chat("Steve", RichText::plain("back"));
        wait_until(|| session.sent().len() == 1).await;
        assert_eq!(session.sent(), vec!["**Steve**: back"]);
        runtime.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_unsent_messages() {
        let gateway = MockGateway::new();
        gateway.script(ConnectScript::Stall);
        let (runtime, mut display) = start(&test_config(), &gateway);
        let handle = runtime.handle();
        let mut events = handle.subscribe();

        handle.game_chat("Steve", RichText::plain("too late"));
        sleep(Duration::from_secs(1)).await;
        assert_ne!(handle.state(), GatewaySessionState::Ready);

        runtime.shutdown(Duration::from_secs(5)).await;

        match events.recv().await.unwrap() {
            RelayEvent::DeliveryFailed { error, .. } => assert_eq!(error, DeliveryError::ShutDown),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(display.recv().await.unwrap().kind, DisplayKind::SystemNotice);
        assert_eq!(handle.state(), GatewaySessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_every_accepted_message() {
        let gateway = MockGateway::new();
        gateway.script(ConnectScript::Stall);
        let (runtime, mut display) = start(&test_config(), &gateway);
        let handle = runtime.handle();
        let mut events = handle.subscribe();

        for i in 0..5 {
            handle.game_chat("Steve", RichText::plain(format!("msg {}", i)));
        }
        runtime.shutdown(Duration::from_secs(5)).await;

        let mut reported = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                RelayEvent::DeliveryFailed { content, error, .. } => {
                    assert_eq!(error, DeliveryError::ShutDown);
                    reported.push(content);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        let expected: Vec<String> = (0..5).map(|i| format!("**Steve**: msg {}", i)).collect();
        assert_eq!(reported, expected);

        let mut notices = 0;
        while let Ok(request) = display.try_recv() {
            assert_eq!(request.kind, DisplayKind::SystemNotice);
            notices += 1;
        }
        assert_eq!(notices, 5);
    }
}
