//! Scripted in-memory engine for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::engine::{
    CapabilityReport, EngineDevice, EngineDevices, EngineEvent, MediaHandle, PlayOptions,
    PublishConfig, RtcEngine,
};
use crate::errors::{EngineError, EngineResult};
use crate::events::{CallEvent, CallEventListener, ConnectionState, Direction};
use crate::streams::MediaSink;

pub fn device(id: &str, name: &str) -> EngineDevice {
    EngineDevice {
        device_id: id.to_string(),
        device_name: name.to_string(),
    }
}

pub fn full_capability() -> CapabilityReport {
    CapabilityReport {
        webrtc: true,
        h264: true,
        vp8: true,
        camera: true,
        microphone: true,
        screen_sharing: true,
    }
}

/// Pause point inside an engine call: the call signals `entered` and waits
/// for `release`.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

pub struct FakeEngine {
    sender: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    subscribe_count: AtomicUsize,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    capability: Mutex<CapabilityReport>,
    devices: Mutex<EngineDevices>,
    next_handle: AtomicU64,
    live_handles: Mutex<HashSet<u64>>,
    publish_configs: Mutex<Vec<PublishConfig>>,
    publish_gate: Mutex<Option<Arc<Gate>>>,
    play_gate: Mutex<Option<Arc<Gate>>>,
    send_gate: Mutex<Option<Arc<Gate>>>,
    capability_gate: Mutex<Option<Arc<Gate>>>,
    auto_connect: Mutex<bool>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            subscribe_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            capability: Mutex::new(full_capability()),
            devices: Mutex::new(EngineDevices {
                microphones: vec![device("mic-1", "Built-in Microphone")],
                cameras: vec![device("cam-1", "FaceTime HD")],
            }),
            next_handle: AtomicU64::new(1),
            live_handles: Mutex::new(HashSet::new()),
            publish_configs: Mutex::new(Vec::new()),
            publish_gate: Mutex::new(None),
            play_gate: Mutex::new(None),
            send_gate: Mutex::new(None),
            capability_gate: Mutex::new(None),
            auto_connect: Mutex::new(true),
        }
    }

    pub fn push_event(&self, event: EngineEvent) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn set_capability(&self, report: CapabilityReport) {
        *self.capability.lock().unwrap() = report;
    }

    pub fn set_devices(&self, devices: EngineDevices) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        *self.auto_connect.lock().unwrap() = enabled;
    }

    pub fn gate_publish(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.publish_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn gate_play(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.play_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn gate_send(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn gate_capability(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.capability_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    pub fn live_handles(&self) -> usize {
        self.live_handles.lock().unwrap().len()
    }

    pub fn publish_configs(&self) -> Vec<PublishConfig> {
        self.publish_configs.lock().unwrap().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }

    pub fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, operation: &'static str) -> EngineResult<()> {
        if self.failing.lock().unwrap().contains(operation) {
            Err(EngineError::new(operation, "scripted failure"))
        } else {
            Ok(())
        }
    }

    fn new_handle(&self) -> MediaHandle {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.live_handles.lock().unwrap().insert(id);
        MediaHandle(id)
    }

    async fn pass_gate(gate: &Mutex<Option<Arc<Gate>>>) {
        let gate = gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    fn subscribe(&self, sender: mpsc::UnboundedSender<EngineEvent>) {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        *self.sender.lock().unwrap() = Some(sender);
    }

    fn unsubscribe(&self) {
        self.sender.lock().unwrap().take();
    }

    async fn login(
        &self,
        room_id: &str,
        user_id: &str,
        _user_name: &str,
        _token: &str,
    ) -> EngineResult<()> {
        self.record(format!("login:{room_id}:{user_id}"));
        self.check("login")?;
        if *self.auto_connect.lock().unwrap() {
            self.push_event(EngineEvent::ConnectionStateChanged(ConnectionState::Connecting));
            self.push_event(EngineEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn logout(&self) -> EngineResult<()> {
        self.record("logout".to_string());
        self.check("logout")
    }

    async fn check_capability(&self) -> EngineResult<CapabilityReport> {
        self.record("check_capability".to_string());
        Self::pass_gate(&self.capability_gate).await;
        self.check("check_capability")?;
        Ok(self.capability.lock().unwrap().clone())
    }

    async fn enumerate_devices(&self) -> EngineResult<EngineDevices> {
        self.record("enumerate_devices".to_string());
        self.check("enumerate_devices")?;
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn create_publish_handle(&self, config: &PublishConfig) -> EngineResult<MediaHandle> {
        self.record("create_publish_handle".to_string());
        Self::pass_gate(&self.publish_gate).await;
        self.check("create_publish_handle")?;
        self.publish_configs.lock().unwrap().push(config.clone());
        Ok(self.new_handle())
    }

    async fn create_play_handle(
        &self,
        stream_id: &str,
        _options: &PlayOptions,
    ) -> EngineResult<MediaHandle> {
        self.record(format!("create_play_handle:{stream_id}"));
        Self::pass_gate(&self.play_gate).await;
        self.check("create_play_handle")?;
        Ok(self.new_handle())
    }

    async fn destroy_handle(&self, handle: MediaHandle) -> EngineResult<()> {
        self.record(format!("destroy_handle:{}", handle.0));
        self.live_handles.lock().unwrap().remove(&handle.0);
        self.check("destroy_handle")
    }

    async fn start_publish(&self, stream_id: &str, _handle: MediaHandle) -> EngineResult<()> {
        self.record(format!("start_publish:{stream_id}"));
        self.check("start_publish")
    }

    async fn stop_publish(&self, stream_id: &str) -> EngineResult<()> {
        self.record(format!("stop_publish:{stream_id}"));
        self.check("stop_publish")
    }

    async fn stop_play(&self, stream_id: &str) -> EngineResult<()> {
        self.record(format!("stop_play:{stream_id}"));
        self.check("stop_play")
    }

    async fn send_message(&self, room_id: &str, body: &str) -> EngineResult<()> {
        self.record(format!("send_message:{room_id}:{body}"));
        Self::pass_gate(&self.send_gate).await;
        self.check("send_message")
    }
}

/// Sink that remembers what is attached and writes attach/detach into the
/// engine's call log, so ordering against engine calls can be asserted.
pub struct RecordingSink {
    direction: Direction,
    attached: Mutex<Option<MediaHandle>>,
    journal: Arc<FakeEngine>,
}

impl RecordingSink {
    pub fn new(direction: Direction, journal: Arc<FakeEngine>) -> Self {
        Self {
            direction,
            attached: Mutex::new(None),
            journal,
        }
    }

    pub fn attached(&self) -> Option<MediaHandle> {
        *self.attached.lock().unwrap()
    }
}

impl MediaSink for RecordingSink {
    fn attach(&self, handle: MediaHandle) {
        *self.attached.lock().unwrap() = Some(handle);
        self.journal
            .record(format!("attach:{}:{}", self.direction, handle.0));
    }

    fn detach(&self) {
        *self.attached.lock().unwrap() = None;
        self.journal.record(format!("detach:{}", self.direction));
    }
}

/// Listener that forwards every event into a channel.
pub struct ChannelListener(mpsc::UnboundedSender<CallEvent>);

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self(tx)), rx)
    }
}

impl CallEventListener for ChannelListener {
    fn on_event(&self, event: CallEvent) {
        let _ = self.0.send(event);
    }
}

/// Receive events until one matches `pred`, returning everything seen.
pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<CallEvent>, pred: F) -> Vec<CallEvent>
where
    F: Fn(&CallEvent) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = rx.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    assert!(matches!(result, Ok(true)), "expected event not seen, got {seen:?}");
    seen
}
