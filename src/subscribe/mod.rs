//! Long-poll subscribe engine.
//!
//! [`Client`] is the caller-facing surface. Behind it:
//!
//! - [`StateManager`] holds the subscribed channels, groups and presence state.
//! - [`SubscriptionManager`] runs the long-poll loop and advances the cursor.
//! - [`HeartbeatManager`] keeps this client present on the subscribed entities.
//! - [`ReconnectionManager`] probes the time endpoint after a failure.
//! - [`ListenerManager`] fans events out to registered [`Listener`]s.
//!
//! All background tasks hang off one cancellation token per client.

pub mod client;
pub mod heartbeat;
pub mod listener;
pub mod reconnection;
pub mod state;
pub mod subscription;
pub mod types;

pub use client::Client;
pub use heartbeat::{HeartbeatManager, HeartbeatMode};
pub use listener::{Listener, ListenerId, ListenerManager, ListenerReceivers};
pub use reconnection::ReconnectionManager;
pub use state::{StateManager, SubscriptionItem};
pub use subscription::{Phase, SubscriptionManager};
pub use types::{
    MessageKind, OperationType, PnMessage, PnPresence, PnStatus, PresenceEvent, StatusCategory,
    StreamEvent, Subscription,
};
