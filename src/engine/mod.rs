//! Boundary with the external messaging-protocol engine.
//!
//! The gateway never speaks the wire protocol itself. It drives an [`Engine`]
//! handle created by an [`EngineFactory`] and reacts to the lifecycle events the
//! engine publishes on an [`EventBus`].

mod bridge;
mod events;

pub use bridge::{BridgeEngine, BridgeEngineFactory, BridgeOptions};
pub use events::{EngineEvent, EventBus, EventHandler};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Disconnect reason reported when the engine link drops without a `destroy`.
pub const BRIDGE_CLOSED_REASON: &str = "BRIDGE_CLOSED";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is disconnected")]
    Disconnected,
    #[error("failed to reach engine: {0}")]
    Connect(String),
    #[error("engine request `{0}` timed out")]
    Timeout(String),
    /// The engine ran the request and reported a failure.
    #[error("{0}")]
    Rejected(String),
    #[error("malformed engine payload: {0}")]
    Protocol(String),
}

/// Connection state names reported by the engine's `getState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Conflict,
    Connected,
    DeprecatedVersion,
    Opening,
    Pairing,
    Proxyblock,
    SmbTosBlock,
    Timeout,
    TosBlock,
    Unlaunched,
    Unpaired,
    UnpairedIdle,
    #[serde(other)]
    Unknown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Conflict => "CONFLICT",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::DeprecatedVersion => "DEPRECATED_VERSION",
            ConnectionState::Opening => "OPENING",
            ConnectionState::Pairing => "PAIRING",
            ConnectionState::Proxyblock => "PROXYBLOCK",
            ConnectionState::SmbTosBlock => "SMB_TOS_BLOCK",
            ConnectionState::Timeout => "TIMEOUT",
            ConnectionState::TosBlock => "TOS_BLOCK",
            ConnectionState::Unlaunched => "UNLAUNCHED",
            ConnectionState::Unpaired => "UNPAIRED",
            ConnectionState::UnpairedIdle => "UNPAIRED_IDLE",
            ConnectionState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery acknowledgment tier. Serialized as the engine's numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLevel {
    Error,
    Pending,
    Server,
    Device,
    Read,
    Played,
}

impl AckLevel {
    pub fn code(self) -> i8 {
        match self {
            AckLevel::Error => -1,
            AckLevel::Pending => 0,
            AckLevel::Server => 1,
            AckLevel::Device => 2,
            AckLevel::Read => 3,
            AckLevel::Played => 4,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            i64::MIN..=-1 => AckLevel::Error,
            0 => AckLevel::Pending,
            1 => AckLevel::Server,
            2 => AckLevel::Device,
            3 => AckLevel::Read,
            _ => AckLevel::Played,
        }
    }
}

impl Serialize for AckLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i8(self.code())
    }
}

impl<'de> Deserialize<'de> for AckLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(AckLevel::from_code)
    }
}

/// Identity of the logged-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub wid: String,
    #[serde(default)]
    pub pushname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_group: bool,
}

/// Result of a successful `sendMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
    pub to: String,
    pub ack: AckLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Media(MediaPayload),
}

/// A live session with the protocol engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Launches the session. Lifecycle events start flowing after this call.
    async fn initialize(&self) -> Result<(), EngineError>;

    /// Tears the session down. Persisted credentials are left untouched.
    async fn destroy(&self) -> Result<(), EngineError>;

    async fn send_message(
        &self,
        to: &str,
        content: &MessageContent,
    ) -> Result<SentMessage, EngineError>;

    async fn get_chats(&self) -> Result<Vec<ChatSummary>, EngineError>;

    async fn get_chat_by_id(&self, chat_id: &str) -> Result<Option<ChatSummary>, EngineError>;

    /// Returns the protocol address for a digits-only phone number, if registered.
    async fn get_number_id(&self, number: &str) -> Result<Option<String>, EngineError>;

    async fn get_state(&self) -> Result<Option<ConnectionState>, EngineError>;

    async fn info(&self) -> Option<ClientInfo>;
}

/// Creates engine handles wired to an event bus.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create_engine(&self, events: Arc<EventBus>) -> Result<Arc<dyn Engine>, EngineError>;
}
