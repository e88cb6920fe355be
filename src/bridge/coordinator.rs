//! Relay coordinator task.
//!
//! Owns the mutable half of the relay: echo suppression and the producer end
//! of the outbound queue. Game events are rendered and enqueued as they
//! arrive. Inbound gateway messages are only taken while the session is
//! `Ready`, so whatever arrives during an outage waits in its channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::channels::CoordinatorChannels;
use super::echo::EchoGuard;
use super::orchestrator::Bridge;
use super::queue::OutboundQueue;
use crate::common::messages::{InboundMessage, RelayEvent};
use crate::common::shutdown::wait_for_shutdown;
use crate::game::{DisplayRequest, GameEvent};
use crate::gateway::GatewaySessionState;

pub struct Coordinator {
    bridge: Bridge,
    echo: EchoGuard,
    queue: OutboundQueue,
    game_rx: mpsc::UnboundedReceiver<GameEvent>,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
    relay_events_rx: mpsc::UnboundedReceiver<RelayEvent>,
    state_rx: watch::Receiver<GatewaySessionState>,
    display_tx: mpsc::UnboundedSender<DisplayRequest>,
    events_tx: broadcast::Sender<RelayEvent>,
    enabled: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(
        bridge: Bridge,
        echo: EchoGuard,
        queue: OutboundQueue,
        channels: CoordinatorChannels,
        inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
        state_rx: watch::Receiver<GatewaySessionState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bridge,
            echo,
            queue,
            game_rx: channels.game_rx,
            inbound_rx,
            relay_events_rx: channels.relay_events_rx,
            state_rx,
            display_tx: channels.display_tx,
            events_tx: channels.events_tx,
            enabled: channels.enabled,
            shutdown_rx,
        }
    }

    /// Run until shutdown, then report the outcome of every queued message.
    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            let ready = *self.state_rx.borrow_and_update() == GatewaySessionState::Ready;

            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                event = self.game_rx.recv() => match event {
                    Some(event) => self.on_game_event(event).await,
                    None => {
                        info!("Game side closed, stopping relay coordinator");
                        break;
                    }
                },
                Some(message) = self.inbound_rx.recv(), if ready => {
                    self.on_inbound(message).await;
                }
                Some(event) = self.relay_events_rx.recv() => self.on_relay_event(event),
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        debug!("Session manager stopped");
                        break;
                    }
                }
            }
        }

        // Events the game handed over before the shutdown still get an
        // outcome. A closed queue reports them as not delivered.
        self.game_rx.close();
        let mut accepted = 0;
        while let Some(event) = self.game_rx.recv().await {
            self.on_game_event(event).await;
            accepted += 1;
        }
        if accepted > 0 {
            debug!("Queued {} game events received before shutdown", accepted);
        }

        // The dispatcher reports what it could not send once it sees the
        // shutdown. Our queue handle must go first or the channel never ends.
        let Self {
            bridge,
            queue,
            mut relay_events_rx,
            display_tx,
            events_tx,
            ..
        } = self;
        drop(queue);
        while let Some(event) = relay_events_rx.recv().await {
            report(&bridge, &display_tx, &events_tx, event);
        }
        info!("Relay coordinator stopped");
    }

    async fn on_game_event(&mut self, event: GameEvent) {
        if !self.enabled.load(Ordering::SeqCst) {
            debug!("Relay disabled, dropping game event");
            return;
        }

        for payload in self.bridge.handle_game_event(event).await {
            self.echo.record_outbound(&payload);
            self.queue.enqueue(payload);
        }
    }

    async fn on_inbound(&mut self, message: InboundMessage) {
        if let Some(reason) = self.echo.classify(&message) {
            debug!("Suppressed inbound message {} ({:?})", message.id, reason);
            return;
        }
        if !self.enabled.load(Ordering::SeqCst) {
            debug!("Relay disabled, dropping inbound message {}", message.id);
            return;
        }

        match self.bridge.handle_inbound(&message).await {
            Ok(Some(display)) => {
                if self.display_tx.send(display).is_err() {
                    warn!("Game display closed, dropping message {}", message.id);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Skipping inbound message {}: {}", message.id, e);
                let _ = self.events_tx.send(RelayEvent::InboundSkipped {
                    message_id: message.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_relay_event(&self, event: RelayEvent) {
        report(&self.bridge, &self.display_tx, &self.events_tx, event);
    }
}

/// Show failed deliveries in game and publish the event.
fn report(
    bridge: &Bridge,
    display_tx: &mpsc::UnboundedSender<DisplayRequest>,
    events_tx: &broadcast::Sender<RelayEvent>,
    event: RelayEvent,
) {
    if let RelayEvent::DeliveryFailed { content, error, .. } = &event {
        if display_tx.send(bridge.failure_notice(content, error)).is_err() {
            debug!("Game display closed, failure notice dropped");
        }
    }
    // No subscribers is fine
    let _ = events_tx.send(event);
}
