use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Codec requested when publishing. Stored as `"VP8"` / `"H.264"`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VideoCodec {
    #[default]
    #[serde(rename = "VP8")]
    Vp8,
    #[serde(rename = "H.264")]
    H264,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub video_codec: VideoCodec,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            video_codec: VideoCodec::default(),
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
        }
    }
}

/// Capture size for the outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Portrait capture on phones, landscape VGA elsewhere.
const MOBILE_RESOLUTION: Resolution = Resolution { width: 360, height: 640 };
const DESKTOP_RESOLUTION: Resolution = Resolution { width: 640, height: 480 };

/// What the host runtime looks like, as far as capture policy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeProfile {
    pub mobile: bool,
}

impl RuntimeProfile {
    pub fn from_user_agent(user_agent: &str) -> Self {
        static MOBILE_UA: OnceLock<Option<Regex>> = OnceLock::new();
        let mobile = MOBILE_UA
            .get_or_init(|| {
                Regex::new(r"(?i)Android|webOS|iPhone|iPad|iPod|BlackBerry|IEMobile|Opera Mini").ok()
            })
            .as_ref()
            .is_some_and(|re| re.is_match(user_agent));
        Self { mobile }
    }

    pub fn resolution(&self) -> Resolution {
        if self.mobile {
            MOBILE_RESOLUTION
        } else {
            DESKTOP_RESOLUTION
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_video_codec(&self, codec: VideoCodec) {
        self.lock().video_codec = codec;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create settings dir {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("cannot write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("cannot serialize settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable settings file: {e}");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
