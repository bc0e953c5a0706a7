//! # Pulse Gateway
//!
//! The dashboard push channel: tracks per-client channel subscriptions
//! and periodically fans computed features, pattern detections, and
//! system statistics out to live WebSocket subscribers.
//!
//! The [`Broadcaster`] owns the subscription table and the tick loop;
//! [`ws`] wires an axum WebSocket route onto it. Clients receive a
//! welcome message enumerating the available channels on connect and
//! choose what they get with a `subscribe` control message. One slow or
//! dead client only ever takes itself down.

pub mod broadcaster;
pub mod protocol;
pub mod ws;

pub use broadcaster::{Broadcaster, BroadcasterConfig, BroadcasterStats};
pub use protocol::{Channel, ClientMessage, ServerMessage, SubscribeData};
pub use ws::router;
