use std::sync::Arc;
use tokio::sync::Mutex;

use crate::connection::ConnectionManager;
use crate::devices::DeviceSelection;
use crate::engine::{MediaHandle, PlayOptions, PublishConfig, RtcEngine};
use crate::errors::CallError;
use crate::events::{CallEvent, Direction, EventEmitter, StreamState};
use crate::settings::{RuntimeProfile, Settings};

/// Display target a media handle is rendered into.
pub trait MediaSink: Send + Sync {
    fn attach(&self, handle: MediaHandle);
    fn detach(&self);
}

/// A live media handle, exclusively owned by its slot.
pub struct StreamHandle {
    pub stream_id: String,
    pub direction: Direction,
    pub media: MediaHandle,
    sink: Arc<dyn MediaSink>,
}

#[derive(Default)]
struct StreamSlot {
    state: StreamState,
    /// Bumped by every attempt and by teardown; results of older attempts
    /// are released instead of installed.
    attempt: u64,
    stream_id: Option<String>,
    handle: Option<StreamHandle>,
    sink: Option<Arc<dyn MediaSink>>,
}

/// Owns the publish and play handles of one session.
///
/// Each direction is a single slot: starting a new attempt releases what the
/// slot held. Slot locks are never held across engine calls, so `teardown`
/// can run while an attempt is still waiting on the engine.
pub struct StreamSessionController {
    connection: Arc<ConnectionManager>,
    emitter: EventEmitter,
    settings: Settings,
    profile: RuntimeProfile,
    publish: Mutex<StreamSlot>,
    play: Mutex<StreamSlot>,
}

impl StreamSessionController {
    pub fn new(
        connection: Arc<ConnectionManager>,
        emitter: EventEmitter,
        settings: Settings,
        profile: RuntimeProfile,
    ) -> Self {
        Self {
            connection,
            emitter,
            settings,
            profile,
            publish: Mutex::new(StreamSlot::default()),
            play: Mutex::new(StreamSlot::default()),
        }
    }

    fn slot(&self, direction: Direction) -> &Mutex<StreamSlot> {
        match direction {
            Direction::Publish => &self.publish,
            Direction::Play => &self.play,
        }
    }

    /// Register (or clear) the display target for a direction. A live handle
    /// moves to the new sink.
    pub async fn set_sink(&self, direction: Direction, sink: Option<Arc<dyn MediaSink>>) {
        let mut slot = self.slot(direction).lock().await;
        if let Some(old) = slot.sink.take() {
            if slot.handle.is_some() {
                old.detach();
            }
        }
        if let (Some(new), Some(handle)) = (sink.as_ref(), slot.handle.as_mut()) {
            new.attach(handle.media);
            handle.sink = new.clone();
        }
        slot.sink = sink;
    }

    /// Capture from the selected devices and publish under `stream_id`.
    pub async fn publish(
        &self,
        stream_id: &str,
        selection: &DeviceSelection,
    ) -> Result<MediaHandle, CallError> {
        let direction = Direction::Publish;
        let engine = self.connection.engine().await.ok_or(CallError::NotConnected)?;
        let (token, sink) = self.begin_attempt(engine.as_ref(), direction, stream_id).await;
        let Some(sink) = sink else {
            self.abandon(direction, token).await;
            return Err(CallError::SinkUnavailable(direction));
        };

        let config = PublishConfig {
            audio_input: selection.microphone.clone(),
            video_input: selection.camera.clone(),
            audio: selection.audio && self.settings.mic_enabled_on_join,
            video: selection.video && self.settings.camera_enabled_on_join,
            resolution: self.profile.resolution(),
            video_codec: self.settings.video_codec,
        };

        let media = match engine.create_publish_handle(&config).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!("cannot create publish handle: {e}");
                self.abandon(direction, token).await;
                return Err(CallError::MediaCreationFailed {
                    direction,
                    reason: e.to_string(),
                });
            }
        };

        if !self.is_current(direction, token).await {
            destroy(engine.as_ref(), media).await;
            return Err(CallError::AttemptSuperseded(direction));
        }

        if let Err(e) = engine.start_publish(stream_id, media).await {
            tracing::warn!("cannot start publishing {stream_id}: {e}");
            destroy(engine.as_ref(), media).await;
            self.abandon(direction, token).await;
            return Err(CallError::MediaCreationFailed {
                direction,
                reason: e.to_string(),
            });
        }

        self.install(engine.as_ref(), direction, token, stream_id, media, sink)
            .await
    }

    /// Subscribe to the peer's `stream_id` and render it into the play sink.
    pub async fn play(&self, stream_id: &str, options: PlayOptions) -> Result<MediaHandle, CallError> {
        let direction = Direction::Play;
        let engine = self.connection.engine().await.ok_or(CallError::NotConnected)?;
        let (token, sink) = self.begin_attempt(engine.as_ref(), direction, stream_id).await;
        let Some(sink) = sink else {
            self.abandon(direction, token).await;
            return Err(CallError::SinkUnavailable(direction));
        };

        let media = match engine.create_play_handle(stream_id, &options).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!("cannot play {stream_id}: {e}");
                self.abandon(direction, token).await;
                return Err(CallError::MediaCreationFailed {
                    direction,
                    reason: e.to_string(),
                });
            }
        };

        self.install(engine.as_ref(), direction, token, stream_id, media, sink)
            .await
    }

    /// Detach both sinks, release both handles and return both slots to
    /// `Idle`. Safe to call any number of times, with or without a session.
    /// Attempts still waiting on the engine are superseded.
    pub async fn teardown(&self) {
        let mut released = Vec::new();
        for direction in [Direction::Publish, Direction::Play] {
            let (handle, was) = {
                let mut slot = self.slot(direction).lock().await;
                slot.attempt += 1;
                slot.stream_id = None;
                if let Some(sink) = slot.sink.as_ref() {
                    sink.detach();
                }
                let was = std::mem::take(&mut slot.state);
                (slot.handle.take(), was)
            };
            if was != StreamState::Idle {
                self.emitter.emit(CallEvent::StreamStateChanged {
                    direction,
                    state: StreamState::Idle,
                });
            }
            released.extend(handle);
        }

        if released.is_empty() {
            return;
        }

        let Some(engine) = self.connection.engine().await else {
            tracing::warn!("{} media handles dropped without an engine", released.len());
            return;
        };
        for handle in released {
            stop(engine.as_ref(), handle.direction, &handle.stream_id).await;
            destroy(engine.as_ref(), handle.media).await;
            tracing::info!("{} stream {} released", handle.direction, handle.stream_id);
        }
    }

    /// Release `media` if it is still the handle installed for `direction`.
    /// A slot that has moved on to another handle is left alone.
    pub async fn release(&self, direction: Direction, media: MediaHandle) {
        let (handle, was) = {
            let mut slot = self.slot(direction).lock().await;
            if slot.handle.as_ref().map(|h| h.media) != Some(media) {
                return;
            }
            slot.attempt += 1;
            slot.stream_id = None;
            let Some(handle) = slot.handle.take() else {
                return;
            };
            handle.sink.detach();
            (handle, std::mem::take(&mut slot.state))
        };
        if was != StreamState::Idle {
            self.emitter.emit(CallEvent::StreamStateChanged {
                direction,
                state: StreamState::Idle,
            });
        }

        let Some(engine) = self.connection.engine().await else {
            tracing::warn!("{direction} media handle {} dropped without an engine", media.0);
            return;
        };
        stop(engine.as_ref(), direction, &handle.stream_id).await;
        destroy(engine.as_ref(), media).await;
        tracing::info!("{direction} stream {} released", handle.stream_id);
    }

    /// Apply an engine publisher/player state notification.
    pub async fn apply_engine_state(&self, direction: Direction, state: StreamState, stream_id: &str) {
        {
            let mut slot = self.slot(direction).lock().await;
            if slot.stream_id.as_deref() != Some(stream_id) {
                tracing::debug!("{direction} state {state:?} for unknown stream {stream_id} ignored");
                return;
            }
            if slot.state == state {
                return;
            }
            if !slot.state.can_transition_to(state) {
                tracing::warn!("ignoring {direction} transition {:?} -> {state:?}", slot.state);
                return;
            }
            slot.state = state;
        }
        tracing::debug!("{direction} {stream_id} -> {state:?}");
        self.emitter
            .emit(CallEvent::StreamStateChanged { direction, state });
    }

    pub async fn state(&self, direction: Direction) -> StreamState {
        self.slot(direction).lock().await.state
    }

    pub async fn stream_id(&self, direction: Direction) -> Option<String> {
        self.slot(direction).lock().await.stream_id.clone()
    }

    pub async fn has_live_handle(&self, direction: Direction) -> bool {
        self.slot(direction).lock().await.handle.is_some()
    }

    /// Claim the slot for a new attempt, releasing whatever it held.
    async fn begin_attempt(
        &self,
        engine: &dyn RtcEngine,
        direction: Direction,
        stream_id: &str,
    ) -> (u64, Option<Arc<dyn MediaSink>>) {
        let (token, sink, previous) = {
            let mut slot = self.slot(direction).lock().await;
            slot.attempt += 1;
            slot.stream_id = Some(stream_id.to_string());
            let previous = slot.handle.take();
            if previous.is_some() {
                if let Some(sink) = slot.sink.as_ref() {
                    sink.detach();
                }
            }
            (slot.attempt, slot.sink.clone(), previous)
        };

        if let Some(previous) = previous {
            tracing::info!("replacing {direction} stream {}", previous.stream_id);
            stop(engine, direction, &previous.stream_id).await;
            destroy(engine, previous.media).await;
        }
        (token, sink)
    }

    async fn is_current(&self, direction: Direction, token: u64) -> bool {
        self.slot(direction).lock().await.attempt == token
    }

    /// Forget a failed attempt, unless a newer one already owns the slot.
    async fn abandon(&self, direction: Direction, token: u64) {
        let was = {
            let mut slot = self.slot(direction).lock().await;
            if slot.attempt != token {
                return;
            }
            slot.stream_id = None;
            std::mem::take(&mut slot.state)
        };
        if was != StreamState::Idle {
            self.emitter.emit(CallEvent::StreamStateChanged {
                direction,
                state: StreamState::Idle,
            });
        }
    }

    async fn install(
        &self,
        engine: &dyn RtcEngine,
        direction: Direction,
        token: u64,
        stream_id: &str,
        media: MediaHandle,
        sink: Arc<dyn MediaSink>,
    ) -> Result<MediaHandle, CallError> {
        {
            let mut slot = self.slot(direction).lock().await;
            if slot.attempt == token {
                sink.attach(media);
                slot.handle = Some(StreamHandle {
                    stream_id: stream_id.to_string(),
                    direction,
                    media,
                    sink,
                });
            } else {
                drop(slot);
                tracing::info!("{direction} stream {stream_id} resolved after teardown, releasing");
                stop(engine, direction, stream_id).await;
                destroy(engine, media).await;
                return Err(CallError::AttemptSuperseded(direction));
            }
        }

        tracing::info!("{direction} stream {stream_id} attached");
        self.emitter.emit(CallEvent::StreamAttached {
            direction,
            stream_id: stream_id.to_string(),
        });
        Ok(media)
    }
}

async fn stop(engine: &dyn RtcEngine, direction: Direction, stream_id: &str) {
    let result = match direction {
        Direction::Publish => engine.stop_publish(stream_id).await,
        Direction::Play => engine.stop_play(stream_id).await,
    };
    if let Err(e) = result {
        tracing::warn!("error stopping {direction} stream {stream_id}: {e}");
    }
}

async fn destroy(engine: &dyn RtcEngine, media: MediaHandle) {
    if let Err(e) = engine.destroy_handle(media).await {
        tracing::warn!("error destroying media handle {}: {e}", media.0);
    }
}
