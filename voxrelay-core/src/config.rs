//! Voice relay configuration (JSON file in the app data directory).
//!
//! Capture and playback rates are configured independently. The live voice
//! service takes 16 kHz input and answers at 24 kHz; nothing here assumes the
//! two match.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_CAPTURE_FRAME_SIZE: usize = 256;
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_VOICE: &str = "Puck";

const MIN_FRAME_SIZE: usize = 64;
const MAX_FRAME_SIZE: usize = 16_384;
const MAX_OUTPUT_GAIN: f32 = 4.0;
const MAX_OUTPUT_CHANNELS: u16 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VoiceConfig {
    /// Rate of the PCM sent to the voice service (Hz).
    pub capture_sample_rate: u32,
    /// Samples per outbound frame. Power of two; smaller means lower latency
    /// and more per-frame overhead.
    pub capture_frame_size: usize,
    /// Rate of the PCM the voice service returns (Hz).
    pub output_sample_rate: u32,
    /// Channel count of the headless playback timeline (1..=8). Model audio
    /// is mono and is copied to every channel. A real speaker uses the
    /// device's own channel count instead.
    pub output_channels: u16,
    pub output_gain: f32,
    pub model: String,
    pub voice: String,
    /// Optional context prepended to the conversation (e.g. listing details).
    pub system_instruction: Option<String>,
    pub connect_timeout_ms: u64,
    pub permission_timeout_ms: u64,
    /// Capacity of the bounded session event channel.
    pub event_channel_capacity: usize,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            capture_frame_size: DEFAULT_CAPTURE_FRAME_SIZE,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            output_channels: 1,
            output_gain: 1.0,
            model: DEFAULT_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            system_instruction: None,
            connect_timeout_ms: 15_000,
            permission_timeout_ms: 10_000,
            event_channel_capacity: 256,
            preferred_input_device: None,
            preferred_output_device: None,
        }
    }
}

impl VoiceConfig {
    pub fn normalize(&mut self) {
        let defaults = Self::default();

        if self.capture_sample_rate == 0 {
            self.capture_sample_rate = defaults.capture_sample_rate;
        }
        if self.output_sample_rate == 0 {
            self.output_sample_rate = defaults.output_sample_rate;
        }
        self.capture_frame_size = self
            .capture_frame_size
            .clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE)
            .next_power_of_two()
            .min(MAX_FRAME_SIZE);
        self.output_channels = self.output_channels.clamp(1, MAX_OUTPUT_CHANNELS);
        if !self.output_gain.is_finite() {
            self.output_gain = defaults.output_gain;
        }
        self.output_gain = self.output_gain.clamp(0.0, MAX_OUTPUT_GAIN);
        if self.model.trim().is_empty() {
            self.model = defaults.model;
        }
        if self.voice.trim().is_empty() {
            self.voice = defaults.voice;
        }
        self.system_instruction = self
            .system_instruction
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.connect_timeout_ms = self.connect_timeout_ms.max(100);
        self.permission_timeout_ms = self.permission_timeout_ms.max(100);
        self.event_channel_capacity = self.event_channel_capacity.clamp(8, 4096);
        self.preferred_input_device = normalize_device_name(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device_name(self.preferred_output_device.take());
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }
}

fn normalize_device_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("VoxRelay")
            .join("voice.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voxrelay")
            .join("voice.json")
    }
}

/// Load the config at `path`, falling back to defaults when the file is
/// missing or unreadable.
pub fn load_config(path: &Path) -> VoiceConfig {
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<VoiceConfig>(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "invalid voice config, using defaults: {e}");
            VoiceConfig::default()
        }),
        Err(_) => VoiceConfig::default(),
    };
    config.normalize();
    config
}

pub fn save_config(path: &Path, config: &VoiceConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}
