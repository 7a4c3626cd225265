//! Persisted settings boundary and its in-memory implementation

use dashmap::DashMap;
use tracing::trace;

use crate::error::Result;

/// Key of the persisted ringer mode
pub const MODE_RINGER: &str = "mode_ringer";
/// Streams silenced by the ringer mode
pub const MODE_RINGER_STREAMS_AFFECTED: &str = "mode_ringer_streams_affected";
/// Streams that honor client mute requests
pub const MUTE_STREAMS_AFFECTED: &str = "mute_streams_affected";
pub const VIBRATE_ON: &str = "vibrate_on";
pub const VOLUME_MASTER: &str = "volume_master";
pub const VOLUME_MASTER_MUTE: &str = "volume_master_mute";
pub const AUDIO_SAFE_VOLUME_STATE: &str = "audio_safe_volume_state";
pub const UNSAFE_VOLUME_MUSIC_ACTIVE_MS: &str = "unsafe_volume_music_active_ms";
pub const BLUETOOTH_SCO_CHANNEL_PREFIX: &str = "bluetooth_sco_channel_";

/// Integer key/value store for persisted state
pub trait SettingsStore: Send + Sync {
    fn get_int(&self, key: &str) -> Option<i64>;

    fn put_int(&self, key: &str, value: i64) -> Result<()>;
}

/// Settings kept in memory, shared between threads
#[derive(Debug, Default)]
pub struct InMemorySettings {
    values: DashMap<String, i64>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated settings
    pub fn with_values<K: Into<String>>(values: impl IntoIterator<Item = (K, i64)>) -> Self {
        let settings = Self::new();
        for (key, value) in values {
            settings.values.insert(key.into(), value);
        }
        settings
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SettingsStore for InMemorySettings {
    fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).map(|v| *v)
    }

    fn put_int(&self, key: &str, value: i64) -> Result<()> {
        trace!(key, value, "setting stored");
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Persisted volume key of a stream on a device
pub fn volume_setting_key(stream_setting: &str, device_suffix: Option<&str>) -> String {
    match device_suffix {
        Some(suffix) => format!("{stream_setting}_{suffix}"),
        None => stream_setting.to_string(),
    }
}
