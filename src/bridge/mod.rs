//! Relay core between the game and the gateway.
//!
//! ## Module Structure
//!
//! - `orchestrator`: message pipeline (`Bridge`)
//! - `coordinator`: task owning echo suppression and the queue producer
//! - `queue`: bounded outbound queue and its dispatcher
//! - `relay`: spawns and stops the relay tasks
//! - `channels`: channel bundle and the game-facing `RelayHandle`

pub mod channels;
pub mod coordinator;
pub mod echo;
pub mod filter;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
pub mod relay;

pub use channels::{ChannelBundle, RelayHandle};
pub use orchestrator::Bridge;
pub use queue::{Dispatcher, OutboundQueue};
pub use relay::RelayRuntime;
