//! Boundary to the external real-time engine.
//!
//! The engine provides room login, media handles, stream publish/play and
//! room messaging. The core never talks to it except through [`RtcEngine`],
//! and never holds more than one live instance (see [`EngineFactory`]).

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::EngineResult;
use crate::events::{ChatMessage, ConnectionState, StreamState};
use crate::settings::{Resolution, VideoCodec};

/// Opaque id of a media handle owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub u64);

/// Raw result of the engine's system requirements check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityReport {
    pub webrtc: bool,
    pub h264: bool,
    pub vp8: bool,
    pub camera: bool,
    pub microphone: bool,
    pub screen_sharing: bool,
}

/// A device as the engine reports it. `device_name` may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDevice {
    pub device_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct EngineDevices {
    pub microphones: Vec<EngineDevice>,
    pub cameras: Vec<EngineDevice>,
}

/// Capture configuration for an outbound handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub audio_input: String,
    pub video_input: String,
    pub audio: bool,
    pub video: bool,
    pub resolution: Resolution,
    pub video_codec: VideoCodec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayOptions {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyAction {
    Added,
    Removed,
}

/// Notifications pushed by the engine, in arrival order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionStateChanged(ConnectionState),
    PeerPresenceChanged(bool),
    RemoteStreamTopologyChanged { action: TopologyAction, stream_id: String },
    PublishStateChanged { state: StreamState, stream_id: String },
    PlayStateChanged { state: StreamState, stream_id: String },
    MessageBatchReceived(Vec<ChatMessage>),
}

/// Operations consumed from the external engine. Every call may fail.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Start pushing events into `sender`. Called once per instance.
    fn subscribe(&self, sender: mpsc::UnboundedSender<EngineEvent>);

    /// Stop pushing events. Called once, when the instance is released.
    fn unsubscribe(&self);

    async fn login(
        &self,
        room_id: &str,
        user_id: &str,
        user_name: &str,
        token: &str,
    ) -> EngineResult<()>;

    async fn logout(&self) -> EngineResult<()>;

    async fn check_capability(&self) -> EngineResult<CapabilityReport>;

    async fn enumerate_devices(&self) -> EngineResult<EngineDevices>;

    async fn create_publish_handle(&self, config: &PublishConfig) -> EngineResult<MediaHandle>;

    async fn create_play_handle(
        &self,
        stream_id: &str,
        options: &PlayOptions,
    ) -> EngineResult<MediaHandle>;

    async fn destroy_handle(&self, handle: MediaHandle) -> EngineResult<()>;

    async fn start_publish(&self, stream_id: &str, handle: MediaHandle) -> EngineResult<()>;

    async fn stop_publish(&self, stream_id: &str) -> EngineResult<()>;

    async fn stop_play(&self, stream_id: &str) -> EngineResult<()>;

    async fn send_message(&self, room_id: &str, body: &str) -> EngineResult<()>;
}

/// The live engine instance plus its single event subscription.
///
/// Reference counted through `Arc`. Dropping the last reference
/// unsubscribes from the engine.
pub struct SharedEngine {
    engine: Arc<dyn RtcEngine>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<EngineEvent>>,
}

impl SharedEngine {
    pub fn engine(&self) -> Arc<dyn RtcEngine> {
        self.engine.clone()
    }

    /// Receiver for engine events. Only one event loop may hold it at a time.
    pub fn events(&self) -> &tokio::sync::Mutex<mpsc::UnboundedReceiver<EngineEvent>> {
        &self.events
    }

    /// Discard events queued before the current session began.
    pub async fn drain_pending(&self) -> usize {
        let mut events = self.events.lock().await;
        let mut dropped = 0;
        while events.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!("dropped {dropped} engine events from a previous session");
        }
        dropped
    }
}

impl Drop for SharedEngine {
    fn drop(&mut self) {
        self.engine.unsubscribe();
        tracing::info!("engine released, event subscription closed");
    }
}

type EngineConstructor = dyn Fn() -> Arc<dyn RtcEngine> + Send + Sync;

/// Creates the process-wide engine on demand and hands out the live one
/// while any holder keeps it alive.
pub struct EngineFactory {
    construct: Box<EngineConstructor>,
    live: Mutex<Weak<SharedEngine>>,
}

impl EngineFactory {
    pub fn new<F>(construct: F) -> Self
    where
        F: Fn() -> Arc<dyn RtcEngine> + Send + Sync + 'static,
    {
        Self {
            construct: Box::new(construct),
            live: Mutex::new(Weak::new()),
        }
    }

    /// Return the live engine, creating and subscribing a new one if none
    /// is alive.
    pub fn acquire(&self) -> Arc<SharedEngine> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(shared) = live.upgrade() {
            tracing::debug!("reusing live engine instance");
            return shared;
        }

        let engine = (self.construct)();
        let (tx, rx) = mpsc::unbounded_channel();
        engine.subscribe(tx);

        let shared = Arc::new(SharedEngine {
            engine,
            events: tokio::sync::Mutex::new(rx),
        });
        *live = Arc::downgrade(&shared);
        tracing::info!("engine instance created");
        shared
    }

    pub fn is_live(&self) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .strong_count()
            > 0
    }
}
