use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::devices::{CapabilityWarning, DeviceStatus};
use crate::errors::CallError;

/// Events emitted by the core to the presentation layer.
#[derive(Debug, Clone)]
pub enum CallEvent {
    ConnectionStateChanged(ConnectionState),
    LoginFailed(String),
    PeerPresenceChanged(bool),
    LoadingChanged(bool),
    CallSurfaceChanged(bool),
    DeviceStatusChanged(DeviceStatus),
    DevicesUpdated,
    CapabilityWarning(CapabilityWarning),
    CallFailed(CallError),
    RemoteStreamAdvertised(String),
    RemoteStreamWithdrawn(String),
    StreamStateChanged { direction: Direction, state: StreamState },
    StreamAttached { direction: Direction, stream_id: String },
    ChatMessageReceived(ChatMessage),
    ChatMessageSendFailed { message_id: String, reason: String },
}

/// Room-level connection status. Moves only on engine notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Whether the engine may move the room from `self` to `next`.
    ///
    /// Same-state notifications are not transitions and return `false`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Disconnected) => true,
            (Connected, Disconnected) => true,
            // engine reconnect
            (Connected, Connecting) => true,
            (Disconnected, Connected) => false,
            (Disconnected, Disconnected) | (Connecting, Connecting) | (Connected, Connected) => false,
        }
    }
}

/// Lifecycle of one media direction. `Idle` is initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Requesting,
    Active,
}

impl StreamState {
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        match (self, next) {
            (Idle, Requesting) => true,
            (Requesting, Active) => true,
            (Requesting, Idle) => true,
            (Active, Idle) => true,
            (Active, Requesting) => true,
            (Idle, Active) => false,
            (Idle, Idle) | (Requesting, Requesting) | (Active, Active) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Publish,
    Play,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Publish => f.write_str("publish"),
            Direction::Play => f.write_str("play"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub sent_at_ms: u64,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn CallEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: CallEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
