use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::connection::ConnectionManager;
use crate::engine::{CapabilityReport, EngineDevice, RtcEngine};
use crate::errors::CallError;
use crate::events::{CallEvent, EventEmitter};

/// Id of the pseudo-device that stands for "use no device".
pub const DISABLED_DEVICE_ID: &str = "0";
pub const DISABLED_DEVICE_LABEL: &str = "Disabled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub device_id: String,
    pub label: String,
}

impl DeviceEntry {
    fn disabled() -> Self {
        Self {
            device_id: DISABLED_DEVICE_ID.to_string(),
            label: DISABLED_DEVICE_LABEL.to_string(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.device_id == DISABLED_DEVICE_ID
    }
}

/// Per-device permission as last reported by the probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub camera: bool,
    pub microphone: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub microphones: Vec<DeviceEntry>,
    pub cameras: Vec<DeviceEntry>,
    pub selected_microphone: String,
    pub selected_camera: String,
    pub permission: DeviceStatus,
}

impl DeviceState {
    /// Devices to capture from, with permission and "disabled" folded in.
    pub fn selection(&self) -> DeviceSelection {
        DeviceSelection {
            microphone: self.selected_microphone.clone(),
            camera: self.selected_camera.clone(),
            audio: self.permission.microphone
                && !self.selected_microphone.is_empty()
                && self.selected_microphone != DISABLED_DEVICE_ID,
            video: self.permission.camera
                && !self.selected_camera.is_empty()
                && self.selected_camera != DISABLED_DEVICE_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub microphone: String,
    pub camera: String,
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedReason {
    NoTransport,
    NoVideoCodec,
    ProbeFailed(String),
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedReason::NoTransport => f.write_str("real-time transport not available"),
            UnsupportedReason::NoVideoCodec => f.write_str("neither H.264 nor VP8 available"),
            UnsupportedReason::ProbeFailed(reason) => write!(f, "capability probe failed: {reason}"),
        }
    }
}

/// Non-fatal findings of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityWarning {
    ScreenSharingUnsupported,
    /// Only H.264 is available; peers on VP8 need a transcoding path.
    Vp8Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityOutcome {
    Unsupported(UnsupportedReason),
    NoPermission,
    Ok { warnings: Vec<CapabilityWarning> },
}

/// Decide the probe outcome from a raw report. First matching rule wins.
pub fn evaluate(report: &CapabilityReport) -> CapabilityOutcome {
    if !report.webrtc {
        return CapabilityOutcome::Unsupported(UnsupportedReason::NoTransport);
    }
    if !report.h264 && !report.vp8 {
        return CapabilityOutcome::Unsupported(UnsupportedReason::NoVideoCodec);
    }
    if !report.camera && !report.microphone {
        return CapabilityOutcome::NoPermission;
    }

    let mut warnings = Vec::new();
    if report.vp8 {
        if !report.screen_sharing {
            warnings.push(CapabilityWarning::ScreenSharingUnsupported);
        }
    } else {
        warnings.push(CapabilityWarning::Vp8Unavailable);
    }
    CapabilityOutcome::Ok { warnings }
}

fn build_list(devices: Vec<EngineDevice>, placeholder: &str) -> Vec<DeviceEntry> {
    let mut list: Vec<DeviceEntry> = devices
        .into_iter()
        .enumerate()
        .map(|(index, d)| DeviceEntry {
            label: if d.device_name.is_empty() {
                format!("{placeholder}{index}")
            } else {
                d.device_name
            },
            device_id: d.device_id,
        })
        .collect();
    list.push(DeviceEntry::disabled());
    list
}

fn default_selection(list: &[DeviceEntry]) -> String {
    list.iter()
        .find(|d| !d.is_disabled())
        .or_else(|| list.first())
        .map(|d| d.device_id.clone())
        .unwrap_or_default()
}

/// Checks media capability and keeps the selectable device lists.
///
/// At most one probe or enumeration runs at a time; later callers wait for
/// the running one to finish.
pub struct DeviceCapabilityProbe {
    connection: Arc<ConnectionManager>,
    emitter: EventEmitter,
    state: Arc<Mutex<DeviceState>>,
    in_flight: Mutex<()>,
}

impl DeviceCapabilityProbe {
    pub fn new(connection: Arc<ConnectionManager>, emitter: EventEmitter) -> Self {
        Self {
            connection,
            emitter,
            state: Arc::new(Mutex::new(DeviceState::default())),
            in_flight: Mutex::new(()),
        }
    }

    pub async fn check_capability(&self) -> CapabilityOutcome {
        let _probe = self.in_flight.lock().await;

        let Some(engine) = self.connection.engine().await else {
            return CapabilityOutcome::Unsupported(UnsupportedReason::ProbeFailed(
                "no engine session".into(),
            ));
        };

        let report = match engine.check_capability().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("capability check failed: {e}");
                return CapabilityOutcome::Unsupported(UnsupportedReason::ProbeFailed(e.to_string()));
            }
        };
        tracing::debug!("capability report: {report:?}");

        let outcome = evaluate(&report);
        match &outcome {
            CapabilityOutcome::Unsupported(reason) => {
                tracing::error!("call cannot proceed: {reason}");
            }
            CapabilityOutcome::NoPermission => {
                tracing::error!("camera and microphone not allowed");
                self.set_status(DeviceStatus {
                    camera: false,
                    microphone: false,
                })
                .await;
            }
            CapabilityOutcome::Ok { warnings } => {
                for warning in warnings {
                    tracing::warn!("capability warning: {warning:?}");
                    self.emitter.emit(CallEvent::CapabilityWarning(*warning));
                }
                self.set_status(DeviceStatus {
                    camera: report.camera,
                    microphone: report.microphone,
                })
                .await;
                if let Err(e) = self.enumerate_with(engine.as_ref()).await {
                    return CapabilityOutcome::Unsupported(UnsupportedReason::ProbeFailed(
                        e.to_string(),
                    ));
                }
            }
        }
        outcome
    }

    /// Re-read microphones and cameras, replacing the previous lists.
    pub async fn enumerate_devices(&self) -> Result<(), CallError> {
        let _probe = self.in_flight.lock().await;
        let engine = self.connection.engine().await.ok_or(CallError::NotConnected)?;
        self.enumerate_with(engine.as_ref()).await
    }

    async fn enumerate_with(&self, engine: &dyn RtcEngine) -> Result<(), CallError> {
        let devices = engine.enumerate_devices().await.map_err(|e| {
            tracing::error!("device enumeration failed: {e}");
            CallError::CapabilityUnsupported(e.to_string())
        })?;

        let microphones = build_list(devices.microphones, "microphone");
        let cameras = build_list(devices.cameras, "camera");
        for mic in &microphones {
            tracing::debug!("microphone: {}", mic.label);
        }
        for cam in &cameras {
            tracing::debug!("camera: {}", cam.label);
        }

        {
            let mut state = self.state.lock().await;
            state.selected_microphone = default_selection(&microphones);
            state.selected_camera = default_selection(&cameras);
            state.microphones = microphones;
            state.cameras = cameras;
        }
        self.emitter.emit(CallEvent::DevicesUpdated);
        Ok(())
    }

    pub async fn select_microphone(&self, device_id: &str) -> Result<(), CallError> {
        let mut state = self.state.lock().await;
        if !state.microphones.iter().any(|d| d.device_id == device_id) {
            return Err(CallError::UnknownDevice(device_id.to_string()));
        }
        state.selected_microphone = device_id.to_string();
        Ok(())
    }

    pub async fn select_camera(&self, device_id: &str) -> Result<(), CallError> {
        let mut state = self.state.lock().await;
        if !state.cameras.iter().any(|d| d.device_id == device_id) {
            return Err(CallError::UnknownDevice(device_id.to_string()));
        }
        state.selected_camera = device_id.to_string();
        Ok(())
    }

    pub async fn device_state(&self) -> DeviceState {
        self.state.lock().await.clone()
    }

    pub async fn device_status(&self) -> DeviceStatus {
        self.state.lock().await.permission
    }

    async fn set_status(&self, status: DeviceStatus) {
        self.state.lock().await.permission = status;
        self.emitter.emit(CallEvent::DeviceStatusChanged(status));
    }
}
