//! JSON wire protocol for the dashboard push channel.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Subscription channels offered to dashboard clients.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Features,
    Patterns,
    Stats,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Features, Channel::Patterns, Channel::Stats];
}

/// Welcome payload sent on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeData {
    pub client_id: String,
    pub channels: Vec<Channel>,
}

/// Messages pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { data: WelcomeData, timestamp: i64 },
    FeaturesUpdate { data: Value, timestamp: i64 },
    PatternsUpdate { data: Value, timestamp: i64 },
    SystemStatsUpdate { data: Value, timestamp: i64 },
    Pong { timestamp: i64 },
}

impl ServerMessage {
    pub fn welcome(client_id: impl Into<String>) -> Self {
        Self::Welcome {
            data: WelcomeData {
                client_id: client_id.into(),
                channels: Channel::ALL.to_vec(),
            },
            timestamp: now_ms(),
        }
    }

    pub fn features_update(data: Value) -> Self {
        Self::FeaturesUpdate {
            data,
            timestamp: now_ms(),
        }
    }

    pub fn patterns_update(data: Value) -> Self {
        Self::PatternsUpdate {
            data,
            timestamp: now_ms(),
        }
    }

    pub fn system_stats_update(data: Value) -> Self {
        Self::SystemStatsUpdate {
            data,
            timestamp: now_ms(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_ms(),
        }
    }

    /// Which channel carries this message, if any. Control messages
    /// (welcome, pong) bypass subscriptions.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Self::FeaturesUpdate { .. } => Some(Channel::Features),
            Self::PatternsUpdate { .. } => Some(Channel::Patterns),
            Self::SystemStatsUpdate { .. } => Some(Channel::Stats),
            Self::Welcome { .. } | Self::Pong { .. } => None,
        }
    }
}

/// Control messages received from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { data: SubscribeData },
    Ping,
}

/// Subscription request payload. The broadcaster pushes on a fixed
/// per-channel cadence; `update_interval` is accepted from older
/// dashboard builds but does not override it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeData {
    #[serde(default)]
    pub event_types: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval: Option<u64>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
