//! Relay channel management.
//!
//! Groups the channels between the game side, the coordinator and the
//! dispatcher, and the [`RelayHandle`] the game uses to talk to the relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::common::messages::RelayEvent;
use crate::common::types::RichText;
use crate::game::{DisplayRequest, GameEvent};
use crate::gateway::GatewaySessionState;

/// Buffered relay events per subscriber before the oldest are skipped.
const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Channels the coordinator task listens and reports on.
pub struct CoordinatorChannels {
    /// Receiver for game events.
    pub game_rx: mpsc::UnboundedReceiver<GameEvent>,
    /// Receiver for delivery outcomes reported by the queue.
    pub relay_events_rx: mpsc::UnboundedReceiver<RelayEvent>,
    /// Sender for lines the game should display.
    pub display_tx: mpsc::UnboundedSender<DisplayRequest>,
    /// Fan-out of relay events to subscribers.
    pub events_tx: broadcast::Sender<RelayEvent>,
    pub enabled: Arc<AtomicBool>,
}

/// Channels owned by the game side.
pub struct GameSideChannels {
    pub game_tx: mpsc::UnboundedSender<GameEvent>,
    pub display_rx: mpsc::UnboundedReceiver<DisplayRequest>,
}

/// Control channels for shutdown coordination.
pub struct ControlChannels {
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Bundle of all channels created for one relay.
pub struct ChannelBundle {
    pub coordinator: CoordinatorChannels,
    pub game: GameSideChannels,
    /// Sender handed to the outbound queue.
    pub relay_events_tx: mpsc::UnboundedSender<RelayEvent>,
    pub control: ControlChannels,
}

impl ChannelBundle {
    pub fn new() -> Self {
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (relay_events_tx, relay_events_rx) = mpsc::unbounded_channel();
        let (display_tx, display_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            coordinator: CoordinatorChannels {
                game_rx,
                relay_events_rx,
                display_tx,
                events_tx,
                enabled: Arc::new(AtomicBool::new(true)),
            },
            game: GameSideChannels { game_tx, display_rx },
            relay_events_tx,
            control: ControlChannels {
                shutdown_tx,
                shutdown_rx,
            },
        }
    }
}

impl Default for ChannelBundle {
    fn default() -> Self {
        Self::new()
    }
}

/// The game side's handle on a running relay. Cheap to clone.
#[derive(Clone)]
pub struct RelayHandle {
    game_tx: mpsc::UnboundedSender<GameEvent>,
    enabled: Arc<AtomicBool>,
    state_rx: watch::Receiver<GatewaySessionState>,
    events_tx: broadcast::Sender<RelayEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RelayHandle {
    pub fn new(
        game_tx: mpsc::UnboundedSender<GameEvent>,
        enabled: Arc<AtomicBool>,
        state_rx: watch::Receiver<GatewaySessionState>,
        events_tx: broadcast::Sender<RelayEvent>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            game_tx,
            enabled,
            state_rx,
            events_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Relay a chat line written by `player`. Never blocks.
    pub fn game_chat(&self, player: impl Into<String>, body: RichText) {
        self.game_event(GameEvent::chat(player, body));
    }

    pub fn game_event(&self, event: GameEvent) {
        if let Err(e) = self.game_tx.send(event) {
            warn!("Relay is not running, dropping game event: {:?}", e.0);
        }
    }

    /// Pause or resume relaying in both directions.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("Relay {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> GatewaySessionState {
        *self.state_rx.borrow()
    }

    /// Watch gateway session state transitions.
    pub fn state_changes(&self) -> watch::Receiver<GatewaySessionState> {
        self.state_rx.clone()
    }

    /// Subscribe to delivery outcomes and skipped inbound messages.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events_tx.subscribe()
    }

    /// Ask every relay task to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Receiver that flips to `true` once shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
