//! Configuration for the audio policy engine
//!
//! [`AudioPolicyConfig`] captures everything that is fixed per device: the
//! platform flavour, hardware capabilities, per-stream volume ranges and the
//! timings of the deferred work. Durations are (de)serialized as
//! milliseconds so a JSON file stays readable:
//!
//! ```json
//! { "platform": "voice", "has_vibrator": true, "persist_delay": 500 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AudioPolicyError, Result};
use crate::types::{AudioDevice, StreamType};

/// Product flavour, selects alias tables and active-stream rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformType {
    /// Phone with telephony
    Voice,
    /// Television, every stream follows music
    Television,
    /// Anything else (tablets)
    Default,
}

/// Default UI maximum per stream, in [`StreamType`] order
pub const DEFAULT_MAX_VOLUME: [u32; StreamType::COUNT] = [5, 7, 7, 15, 7, 7, 15, 7, 15, 15];

/// Default UI volume per stream, in [`StreamType`] order
pub const DEFAULT_STREAM_VOLUME: [u32; StreamType::COUNT] = [4, 7, 5, 11, 6, 5, 7, 7, 11, 11];

/// Safe headset volume settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeMediaVolumeConfig {
    /// Country/product requires the ceiling
    pub enabled: bool,
    /// Test override that never enforces the ceiling
    pub bypass: bool,
    /// Ceiling in UI units of the music stream
    pub safe_volume_index: u32,
    /// Accumulated loud music time after which the guard re-engages
    #[serde(with = "duration_ms")]
    pub music_active_max: Duration,
    /// Interval of the music-active poll
    #[serde(with = "duration_ms")]
    pub poll_period: Duration,
}

impl Default for SafeMediaVolumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bypass: false,
            safe_volume_index: 10,
            music_active_max: Duration::from_secs(20 * 3600),
            poll_period: Duration::from_millis(60_000),
        }
    }
}

/// Sound effect loading wait policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundEffectsConfig {
    /// Wait per attempt for the worker to report completion
    #[serde(with = "duration_ms")]
    pub load_timeout: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for SoundEffectsConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_millis(5000),
            max_attempts: 3,
        }
    }
}

/// Complete configuration of an [`crate::service::AudioService`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioPolicyConfig {
    pub platform: PlatformType,
    pub has_vibrator: bool,
    pub voice_capable: bool,
    /// Camera shutter sound cannot be silenced (regulatory)
    pub camera_sound_forced: bool,
    /// Notification volume follows the ring volume
    pub link_notification_with_ring: bool,
    /// Volume keys adjust RING when nothing else is playing
    pub volume_keys_control_ring_stream: bool,
    /// UI maximum per stream
    pub max_volume: [u32; StreamType::COUNT],
    /// UI volume per stream when nothing is persisted
    pub default_volume: [u32; StreamType::COUNT],
    pub safe_media_volume: SafeMediaVolumeConfig,
    pub sound_effects: SoundEffectsConfig,
    /// Delay before volume and ringer changes are written to settings
    #[serde(with = "duration_ms")]
    pub persist_delay: Duration,
    /// Delay of the becoming-noisy broadcast after an output is unplugged
    #[serde(with = "duration_ms")]
    pub becoming_noisy_delay: Duration,
    /// How long to wait for the headset profile proxy
    #[serde(with = "duration_ms")]
    pub profile_connect_timeout: Duration,
    /// Outputs where music always plays at full scale
    pub fixed_volume_devices: AudioDevice,
    /// Outputs driven at full hardware volume regardless of index
    pub full_volume_devices: AudioDevice,
    /// Capacity of the broadcast channel for [`crate::events::AudioEvent`]
    pub event_channel_capacity: usize,
}

impl Default for AudioPolicyConfig {
    fn default() -> Self {
        Self {
            platform: PlatformType::Voice,
            has_vibrator: true,
            voice_capable: true,
            camera_sound_forced: false,
            link_notification_with_ring: true,
            volume_keys_control_ring_stream: true,
            max_volume: DEFAULT_MAX_VOLUME,
            default_volume: DEFAULT_STREAM_VOLUME,
            safe_media_volume: SafeMediaVolumeConfig::default(),
            sound_effects: SoundEffectsConfig::default(),
            persist_delay: Duration::from_millis(500),
            becoming_noisy_delay: Duration::from_millis(1000),
            profile_connect_timeout: Duration::from_millis(3000),
            fixed_volume_devices: AudioDevice::HDMI
                | AudioDevice::DGTL_DOCK_HEADSET
                | AudioDevice::HDMI_ARC
                | AudioDevice::SPDIF
                | AudioDevice::AUX_LINE,
            full_volume_devices: AudioDevice::HDMI_ARC | AudioDevice::SPDIF | AudioDevice::AUX_LINE,
            event_channel_capacity: 256,
        }
    }
}

impl AudioPolicyConfig {
    /// Phone preset (the default)
    pub fn voice() -> Self {
        Self::default()
    }

    /// Television preset
    pub fn television() -> Self {
        Self {
            platform: PlatformType::Television,
            has_vibrator: false,
            voice_capable: false,
            link_notification_with_ring: false,
            volume_keys_control_ring_stream: false,
            ..Self::default()
        }
    }

    /// Tablet preset: no telephony, notification volume independent
    pub fn tablet() -> Self {
        Self {
            platform: PlatformType::Default,
            voice_capable: false,
            link_notification_with_ring: false,
            ..Self::default()
        }
    }

    pub fn with_vibrator(mut self, has_vibrator: bool) -> Self {
        self.has_vibrator = has_vibrator;
        self
    }

    pub fn with_voice_capable(mut self, voice_capable: bool) -> Self {
        self.voice_capable = voice_capable;
        self
    }

    pub fn with_camera_sound_forced(mut self, forced: bool) -> Self {
        self.camera_sound_forced = forced;
        self
    }

    pub fn with_max_volume(mut self, stream: StreamType, max_ui: u32) -> Self {
        self.max_volume[stream.index()] = max_ui;
        self
    }

    pub fn with_default_volume(mut self, stream: StreamType, volume_ui: u32) -> Self {
        self.default_volume[stream.index()] = volume_ui;
        self
    }

    pub fn with_safe_media_volume(mut self, safe: SafeMediaVolumeConfig) -> Self {
        self.safe_media_volume = safe;
        self
    }

    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    pub fn with_profile_connect_timeout(mut self, timeout: Duration) -> Self {
        self.profile_connect_timeout = timeout;
        self
    }

    /// Internal (×10) maximum index of a stream
    pub fn max_index(&self, stream: StreamType) -> i32 {
        self.max_volume[stream.index()] as i32 * 10
    }

    /// Internal (×10) default index of a stream
    pub fn default_index(&self, stream: StreamType) -> i32 {
        self.default_volume[stream.index()] as i32 * 10
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        for stream in StreamType::ALL {
            let max = self.max_volume[stream.index()];
            if max == 0 {
                return Err(AudioPolicyError::config(format!(
                    "max volume of {stream} must be positive"
                )));
            }
            if self.default_volume[stream.index()] > max {
                return Err(AudioPolicyError::config(format!(
                    "default volume of {stream} exceeds its maximum {max}"
                )));
            }
        }
        if self.safe_media_volume.safe_volume_index > self.max_volume[StreamType::Music.index()] {
            return Err(AudioPolicyError::config(
                "safe media volume index exceeds the music maximum",
            ));
        }
        if self.safe_media_volume.poll_period.is_zero() {
            return Err(AudioPolicyError::config("music active poll period must be non-zero"));
        }
        if self.sound_effects.max_attempts == 0 {
            return Err(AudioPolicyError::config("sound effects need at least one attempt"));
        }
        if self.event_channel_capacity == 0 {
            return Err(AudioPolicyError::config("event channel capacity must be positive"));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
