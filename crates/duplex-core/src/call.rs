use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chat::MessageChannel;
use crate::connection::{ConnectionManager, Session, SessionCredentials};
use crate::devices::{CapabilityOutcome, DeviceCapabilityProbe, DeviceState};
use crate::engine::{
    EngineEvent, EngineFactory, MediaHandle, PlayOptions, SharedEngine, TopologyAction,
};
use crate::errors::CallError;
use crate::events::{
    CallEvent, CallEventListener, ChatMessage, ConnectionState, Direction, EventEmitter,
    StreamState,
};
use crate::settings::{RuntimeProfile, Settings};
use crate::streams::{MediaSink, StreamSessionController};

#[derive(Debug, Default)]
struct CallFlags {
    loading: bool,
    show_call_surface: bool,
    /// The capability probe passed for the call currently on screen.
    capability_passed: bool,
    /// Stream the peer currently advertises.
    remote_stream: Option<String>,
    /// Bumped every time the call ends. Work started under an older value
    /// is stale and must not install anything.
    call_epoch: u64,
}

/// Everything the presentation layer renders, read in one go.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub session: Session,
    pub devices: DeviceState,
    pub publish_state: StreamState,
    pub play_state: StreamState,
    pub loading: bool,
    pub show_call_surface: bool,
    pub remote_stream: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// Top-level coordinator of a one-to-one call.
///
/// Reacts to engine events in arrival order on a single task per session and
/// sequences the user intents (`start_call`, `hang_up`, `send_message`) over
/// the connection, probe, stream and chat components.
#[derive(Clone)]
pub struct CallOrchestrator {
    emitter: EventEmitter,
    connection: Arc<ConnectionManager>,
    probe: Arc<DeviceCapabilityProbe>,
    streams: Arc<StreamSessionController>,
    chat: Arc<MessageChannel>,
    flags: Arc<Mutex<CallFlags>>,
    event_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CallOrchestrator {
    pub fn new(factory: Arc<EngineFactory>, settings: Settings, profile: RuntimeProfile) -> Self {
        let emitter = EventEmitter::new();
        let connection = Arc::new(ConnectionManager::new(factory, emitter.clone()));
        Self {
            probe: Arc::new(DeviceCapabilityProbe::new(connection.clone(), emitter.clone())),
            streams: Arc::new(StreamSessionController::new(
                connection.clone(),
                emitter.clone(),
                settings,
                profile,
            )),
            chat: Arc::new(MessageChannel::new(connection.clone(), emitter.clone())),
            connection,
            emitter,
            flags: Arc::new(Mutex::new(CallFlags::default())),
            event_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a listener for call events.
    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Open a session for `credentials` and log in to its room.
    ///
    /// Returns whether the engine accepted the login. Failures are also
    /// recorded on the session.
    pub async fn connect(&self, credentials: SessionCredentials) -> bool {
        if self.connection.engine().await.is_some() {
            self.leave().await;
        }

        let Some(ticket) = self.connection.open_session(credentials).await else {
            return false;
        };
        self.spawn_event_loop(ticket.engine.clone(), ticket.epoch).await;

        let accepted = self.connection.login(&ticket).await;
        if !accepted {
            self.stop_event_loop().await;
        }
        accepted
    }

    /// Start the call: probe, publish, and play the peer's stream if one is
    /// already advertised.
    pub async fn start_call(&self) -> Result<(), CallError> {
        let session = self.connection.session().await;
        if !session.peer_online {
            tracing::info!("start_call ignored, peer is offline");
            return Err(CallError::PeerOffline);
        }
        if session.connection_status != ConnectionState::Connected {
            return Err(CallError::NotConnected);
        }

        let call_epoch = self.flags.lock().await.call_epoch;
        self.set_loading(true).await;
        self.set_call_surface(true).await;
        let outcome = self.probe.check_capability().await;
        self.set_loading(false).await;

        if !self.is_call_current(call_epoch).await {
            tracing::info!("call ended while the capability check was running");
            return Err(CallError::AttemptSuperseded(Direction::Publish));
        }

        match outcome {
            CapabilityOutcome::Ok { .. } => {}
            CapabilityOutcome::Unsupported(reason) => {
                return self.fail_call(CallError::CapabilityUnsupported(reason.to_string())).await;
            }
            CapabilityOutcome::NoPermission => {
                let status = self.probe.device_status().await;
                return self
                    .fail_call(CallError::PermissionDenied {
                        camera: status.camera,
                        microphone: status.microphone,
                    })
                    .await;
            }
        }

        let remote = {
            let mut flags = self.flags.lock().await;
            if flags.call_epoch != call_epoch {
                return Err(CallError::AttemptSuperseded(Direction::Publish));
            }
            flags.capability_passed = true;
            flags.remote_stream.clone()
        };

        let selection = self.probe.device_state().await.selection();
        let published = self.streams.publish(&session.local_user_id, &selection).await;
        let mut first_error = self
            .keep_if_current(call_epoch, Direction::Publish, published)
            .await
            .err();
        if matches!(first_error, Some(CallError::AttemptSuperseded(_))) {
            return Err(CallError::AttemptSuperseded(Direction::Publish));
        }

        if let Some(stream_id) = remote {
            if let Err(e) = self.play_remote(&stream_id, call_epoch).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// End the call locally. The room session and chat stay open.
    pub async fn hang_up(&self) {
        tracing::info!("hanging up");
        self.end_call().await;
    }

    /// Hang up, drop the chat log and leave the room.
    pub async fn leave(&self) {
        self.end_call().await;
        self.flags.lock().await.remote_stream = None;
        self.chat.clear().await;
        self.connection.logout().await;
        self.stop_event_loop().await;
    }

    pub async fn send_message(&self, body: &str) -> Result<ChatMessage, CallError> {
        self.chat.send(body).await
    }

    pub async fn set_sink(&self, direction: Direction, sink: Option<Arc<dyn MediaSink>>) {
        self.streams.set_sink(direction, sink).await;
    }

    pub async fn select_microphone(&self, device_id: &str) -> Result<(), CallError> {
        self.probe.select_microphone(device_id).await
    }

    pub async fn select_camera(&self, device_id: &str) -> Result<(), CallError> {
        self.probe.select_camera(device_id).await
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let (loading, show_call_surface, remote_stream) = {
            let flags = self.flags.lock().await;
            (flags.loading, flags.show_call_surface, flags.remote_stream.clone())
        };
        CallSnapshot {
            session: self.connection.session().await,
            devices: self.probe.device_state().await,
            publish_state: self.streams.state(Direction::Publish).await,
            play_state: self.streams.state(Direction::Play).await,
            loading,
            show_call_surface,
            remote_stream,
            messages: self.chat.messages().await,
        }
    }

    async fn spawn_event_loop(&self, engine: Arc<SharedEngine>, epoch: u64) {
        self.stop_event_loop().await;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.event_loop(engine, epoch).await;
        });
        *self.event_task.lock().await = Some(handle);
    }

    async fn stop_event_loop(&self) {
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }
    }

    /// Holds the receiver guard for its whole life, so the next session's
    /// `drain_pending` cannot run until this loop is gone.
    async fn event_loop(&self, engine: Arc<SharedEngine>, epoch: u64) {
        let mut events = engine.events().lock().await;
        while self.connection.is_current(epoch).await {
            let Some(event) = events.recv().await else {
                break;
            };
            if !self.connection.is_current(epoch).await {
                tracing::debug!("session {epoch} superseded, dropping {event:?}");
                break;
            }
            self.dispatch(epoch, event).await;
        }
        tracing::info!("engine event loop for session {epoch} ended");
    }

    async fn dispatch(&self, epoch: u64, event: EngineEvent) {
        match event {
            EngineEvent::ConnectionStateChanged(state) => {
                let previous = self.connection.apply_connection_state(epoch, state).await;
                if previous.is_some() && state == ConnectionState::Disconnected {
                    tracing::info!("room disconnected, ending call");
                    self.end_call().await;
                }
            }

            EngineEvent::PeerPresenceChanged(present) => {
                self.connection.apply_peer_presence(epoch, present).await;
            }

            EngineEvent::RemoteStreamTopologyChanged { action: TopologyAction::Added, stream_id } => {
                self.on_stream_added(stream_id).await;
            }

            EngineEvent::RemoteStreamTopologyChanged { action: TopologyAction::Removed, stream_id } => {
                self.on_stream_removed(stream_id).await;
            }

            EngineEvent::PublishStateChanged { state, stream_id } => {
                self.streams
                    .apply_engine_state(Direction::Publish, state, &stream_id)
                    .await;
            }

            EngineEvent::PlayStateChanged { state, stream_id } => {
                self.streams
                    .apply_engine_state(Direction::Play, state, &stream_id)
                    .await;
            }

            EngineEvent::MessageBatchReceived(batch) => {
                self.chat.on_receive(batch).await;
            }
        }
    }

    async fn on_stream_added(&self, stream_id: String) {
        let (capability_passed, call_epoch) = {
            let mut flags = self.flags.lock().await;
            flags.remote_stream = Some(stream_id.clone());
            (flags.capability_passed, flags.call_epoch)
        };
        tracing::info!("peer stream {stream_id} advertised");
        self.emitter.emit(CallEvent::RemoteStreamAdvertised(stream_id.clone()));

        if capability_passed {
            // already surfaced as CallFailed
            let _ = self.play_remote(&stream_id, call_epoch).await;
        }
    }

    /// The peer stopped publishing: treated as the peer hanging up.
    async fn on_stream_removed(&self, stream_id: String) {
        tracing::info!("peer stream {stream_id} removed");
        {
            let mut flags = self.flags.lock().await;
            if flags.remote_stream.as_deref() == Some(stream_id.as_str()) {
                flags.remote_stream = None;
            }
        }
        self.end_call().await;
        self.emitter.emit(CallEvent::RemoteStreamWithdrawn(stream_id));
    }

    async fn play_remote(&self, stream_id: &str, call_epoch: u64) -> Result<(), CallError> {
        if !self.is_call_current(call_epoch).await {
            return Err(CallError::AttemptSuperseded(Direction::Play));
        }
        let status = self.probe.device_status().await;
        let options = PlayOptions {
            audio: status.microphone,
            video: status.camera,
        };
        let played = self.streams.play(stream_id, options).await;
        self.keep_if_current(call_epoch, Direction::Play, played).await
    }

    /// Settle a publish/play result against the call that asked for it.
    /// A handle that resolved after the call ended is released.
    async fn keep_if_current(
        &self,
        call_epoch: u64,
        direction: Direction,
        result: Result<MediaHandle, CallError>,
    ) -> Result<(), CallError> {
        let current = self.is_call_current(call_epoch).await;
        match result {
            Ok(_) if current => Ok(()),
            Ok(media) => {
                tracing::info!("{direction} resolved after the call ended, releasing");
                self.streams.release(direction, media).await;
                Err(CallError::AttemptSuperseded(direction))
            }
            Err(_) if !current => Err(CallError::AttemptSuperseded(direction)),
            Err(e @ CallError::AttemptSuperseded(_)) => Err(e),
            Err(e) => {
                tracing::warn!("{direction} failed: {e}");
                self.emitter.emit(CallEvent::CallFailed(e.clone()));
                Err(e)
            }
        }
    }

    async fn is_call_current(&self, call_epoch: u64) -> bool {
        self.flags.lock().await.call_epoch == call_epoch
    }

    /// Release both directions and hide the call surface. Anything still in
    /// flight for the ended call is superseded.
    async fn end_call(&self) {
        {
            let mut flags = self.flags.lock().await;
            flags.call_epoch += 1;
            flags.capability_passed = false;
        }
        self.streams.teardown().await;
        self.set_call_surface(false).await;
    }

    async fn fail_call(&self, error: CallError) -> Result<(), CallError> {
        tracing::warn!("call failed: {error}");
        self.end_call().await;
        self.emitter.emit(CallEvent::CallFailed(error.clone()));
        Err(error)
    }

    async fn set_loading(&self, loading: bool) {
        {
            let mut flags = self.flags.lock().await;
            if flags.loading == loading {
                return;
            }
            flags.loading = loading;
        }
        self.emitter.emit(CallEvent::LoadingChanged(loading));
    }

    async fn set_call_surface(&self, show: bool) {
        {
            let mut flags = self.flags.lock().await;
            if flags.show_call_surface == show {
                return;
            }
            flags.show_call_surface = show;
        }
        self.emitter.emit(CallEvent::CallSurfaceChanged(show));
    }
}
