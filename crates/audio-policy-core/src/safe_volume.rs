//! Safe headset volume guard
//!
//! ```text
//!   NOT_CONFIGURED ──configure──► DISABLED
//!         │
//!         └──────configure──────► ACTIVE ◄──20h loud music── INACTIVE
//!                                   │                            ▲
//!                                   └──── user acknowledged ─────┘
//! ```
//!
//! The guard only decides. Clamping goes through [`SafeVolumeGuard::enforce`]
//! on the volume store and every hardware push or persistence step is
//! queued by the caller.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SafeMediaVolumeConfig;
use crate::types::{AudioDevice, StreamType, VolumeFlags};
use crate::volume::VolumeIndexStore;

/// Outputs the ceiling applies to
pub const SAFE_MEDIA_VOLUME_DEVICES: AudioDevice =
    AudioDevice(AudioDevice::WIRED_HEADSET.0 | AudioDevice::WIRED_HEADPHONE.0);

/// State of the guard, persisted as its raw value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeMediaVolumeState {
    NotConfigured = 0,
    Disabled = 1,
    Inactive = 2,
    Active = 3,
}

impl SafeMediaVolumeState {
    pub fn from_raw(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::NotConfigured),
            1 => Some(Self::Disabled),
            2 => Some(Self::Inactive),
            3 => Some(Self::Active),
            _ => None,
        }
    }
}

/// Volume request held back until the user acknowledges the warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingVolumeCommand {
    pub stream: StreamType,
    /// Internal index, already rescaled to the alias range
    pub index: i32,
    pub flags: VolumeFlags,
    pub device: AudioDevice,
}

/// Result of a (re)configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureOutcome {
    pub state: SafeMediaVolumeState,
    /// Headset indices must be clamped now
    pub enforce: bool,
    /// Value to write to settings
    pub persist: SafeMediaVolumeState,
}

/// Result of toggling the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeTransition {
    /// INACTIVE → ACTIVE, headset indices must be clamped
    Activated,
    /// ACTIVE → INACTIVE, start accumulating music time
    Deactivated { music_active_ms: u64 },
    Unchanged,
}

/// Snapshot of the music stream taken before a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MusicActivity {
    pub device: AudioDevice,
    pub active: bool,
    pub index: i32,
}

/// Result of one music-active poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MusicActiveCheck {
    /// Poll again after one period
    pub reschedule: bool,
    /// Accumulator crossed the limit and the guard is ACTIVE again
    pub reactivated: bool,
    /// New accumulator value to persist
    pub persist_ms: Option<u64>,
}

#[derive(Debug)]
struct GuardState {
    state: SafeMediaVolumeState,
    safe_index: i32,
    music_active_ms: u64,
    mcc: i32,
    pending: Option<PendingVolumeCommand>,
}

/// Headset volume ceiling with time-based re-activation
pub struct SafeVolumeGuard {
    config: SafeMediaVolumeConfig,
    inner: Mutex<GuardState>,
}

impl SafeVolumeGuard {
    pub fn new(
        config: SafeMediaVolumeConfig,
        persisted: SafeMediaVolumeState,
        music_active_ms: u64,
    ) -> Self {
        let safe_index = config.safe_volume_index as i32 * 10;
        Self {
            config,
            inner: Mutex::new(GuardState {
                state: persisted,
                safe_index,
                music_active_ms,
                mcc: 0,
                pending: None,
            }),
        }
    }

    pub fn state(&self) -> SafeMediaVolumeState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SafeMediaVolumeState::Active
    }

    /// Ceiling as an internal index of the music stream
    pub fn safe_index(&self) -> i32 {
        self.inner.lock().safe_index
    }

    pub fn music_active_ms(&self) -> u64 {
        self.inner.lock().music_active_ms
    }

    pub fn poll_period_ms(&self) -> u64 {
        self.config.poll_period.as_millis() as u64
    }

    /// Decide the guard state for a country code
    ///
    /// Runs when `mcc` differs from the last one seen, or when `force` is
    /// set while no country is known (`mcc == 0`). Returns `None` when
    /// skipped.
    pub fn configure(&self, force: bool, mcc: i32) -> Option<ConfigureOutcome> {
        let mut inner = self.inner.lock();
        if inner.mcc == mcc && !(inner.mcc == 0 && force) {
            return None;
        }
        inner.mcc = mcc;
        inner.safe_index = self.config.safe_volume_index as i32 * 10;

        let outcome = if self.config.enabled && !self.config.bypass {
            let mut enforce = false;
            if inner.state != SafeMediaVolumeState::Inactive {
                if inner.music_active_ms == 0 {
                    inner.state = SafeMediaVolumeState::Active;
                    enforce = true;
                } else {
                    // listening time already confirmed by the user
                    inner.state = SafeMediaVolumeState::Inactive;
                }
            }
            ConfigureOutcome {
                state: inner.state,
                enforce,
                persist: SafeMediaVolumeState::Active,
            }
        } else {
            inner.state = SafeMediaVolumeState::Disabled;
            ConfigureOutcome {
                state: inner.state,
                enforce: false,
                persist: SafeMediaVolumeState::Disabled,
            }
        };
        info!(mcc, state = ?outcome.state, "safe media volume configured");
        Some(outcome)
    }

    /// Toggle the guard on or off
    pub fn set_enabled(&self, on: bool) -> SafeTransition {
        let mut inner = self.inner.lock();
        match inner.state {
            SafeMediaVolumeState::NotConfigured | SafeMediaVolumeState::Disabled => {
                SafeTransition::Unchanged
            }
            SafeMediaVolumeState::Inactive if on => {
                inner.state = SafeMediaVolumeState::Active;
                inner.music_active_ms = 0;
                info!("safe media volume re-activated");
                SafeTransition::Activated
            }
            SafeMediaVolumeState::Active if !on => {
                inner.state = SafeMediaVolumeState::Inactive;
                inner.music_active_ms = 1;
                info!("safe media volume deactivated by user");
                SafeTransition::Deactivated {
                    music_active_ms: inner.music_active_ms,
                }
            }
            _ => SafeTransition::Unchanged,
        }
    }

    /// False when the request must be held back with a warning
    pub fn check_safe(&self, alias: StreamType, index: i32, device: AudioDevice) -> bool {
        let inner = self.inner.lock();
        !(inner.state == SafeMediaVolumeState::Active
            && alias == StreamType::Music
            && SAFE_MEDIA_VOLUME_DEVICES.intersects(device)
            && index > inner.safe_index)
    }

    /// Clamp every headset index of the music stream to the ceiling
    ///
    /// Returns the devices whose index was lowered.
    pub fn enforce(&self, store: &VolumeIndexStore) -> Vec<AudioDevice> {
        let safe_index = self.safe_index();
        let mut lowered = Vec::new();
        for device in [AudioDevice::WIRED_HEADSET, AudioDevice::WIRED_HEADPHONE] {
            if store.get_index(StreamType::Music, device) > safe_index {
                store.set_index(StreamType::Music, safe_index, device);
                lowered.push(device);
            }
        }
        if !lowered.is_empty() {
            debug!(safe_index, ?lowered, "headset volume clamped");
        }
        lowered
    }

    pub fn set_pending(&self, command: PendingVolumeCommand) {
        self.inner.lock().pending = Some(command);
    }

    pub fn take_pending(&self) -> Option<PendingVolumeCommand> {
        self.inner.lock().pending.take()
    }

    pub fn pending(&self) -> Option<PendingVolumeCommand> {
        self.inner.lock().pending
    }

    pub fn clear_pending(&self) {
        self.inner.lock().pending = None;
    }

    /// Account one poll period of music playback
    pub fn on_check_music_active(&self, music: MusicActivity) -> MusicActiveCheck {
        let mut inner = self.inner.lock();
        let mut check = MusicActiveCheck::default();
        if inner.state != SafeMediaVolumeState::Inactive
            || !SAFE_MEDIA_VOLUME_DEVICES.intersects(music.device)
        {
            return check;
        }
        check.reschedule = true;
        if music.active && music.index > inner.safe_index {
            inner.music_active_ms += self.poll_period_ms();
            if inner.music_active_ms > self.config.music_active_max.as_millis() as u64 {
                inner.state = SafeMediaVolumeState::Active;
                inner.music_active_ms = 0;
                check.reactivated = true;
                info!("loud music limit reached, safe media volume re-activated");
            }
            check.persist_ms = Some(inner.music_active_ms);
        }
        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioPolicyConfig, PlatformType};
    use crate::volume::{AliasContext, AliasTable};
    use std::time::Duration;

    fn guard(enabled: bool) -> SafeVolumeGuard {
        let config = SafeMediaVolumeConfig {
            enabled,
            safe_volume_index: 6,
            music_active_max: Duration::from_millis(250),
            poll_period: Duration::from_millis(100),
            ..Default::default()
        };
        SafeVolumeGuard::new(config, SafeMediaVolumeState::NotConfigured, 0)
    }

    #[test]
    fn test_configure_activates_once_per_country() {
        let g = guard(true);
        let outcome = g.configure(true, 0).unwrap();
        assert_eq!(outcome.state, SafeMediaVolumeState::Active);
        assert!(outcome.enforce);
        assert!(g.configure(false, 0).is_none());
        assert!(g.configure(false, 310).is_some());
        assert!(g.configure(true, 310).is_none());
    }

    #[test]
    fn test_disabled_guard_never_activates() {
        let g = guard(false);
        assert_eq!(g.configure(true, 0).unwrap().state, SafeMediaVolumeState::Disabled);
        assert_eq!(g.set_enabled(true), SafeTransition::Unchanged);
        assert!(g.check_safe(StreamType::Music, 150, AudioDevice::WIRED_HEADSET));
    }

    #[test]
    fn test_check_safe_conditions() {
        let g = guard(true);
        g.configure(true, 0);
        assert!(!g.check_safe(StreamType::Music, 70, AudioDevice::WIRED_HEADSET));
        assert!(g.check_safe(StreamType::Music, 60, AudioDevice::WIRED_HEADSET));
        assert!(g.check_safe(StreamType::Music, 70, AudioDevice::SPEAKER));
        assert!(g.check_safe(StreamType::Ring, 70, AudioDevice::WIRED_HEADPHONE));
    }

    #[test]
    fn test_user_override_and_pending() {
        let g = guard(true);
        g.configure(true, 0);
        let command = PendingVolumeCommand {
            stream: StreamType::Music,
            index: 100,
            flags: VolumeFlags::NONE,
            device: AudioDevice::WIRED_HEADSET,
        };
        g.set_pending(command);
        assert!(matches!(g.set_enabled(false), SafeTransition::Deactivated { music_active_ms: 1 }));
        assert_eq!(g.take_pending(), Some(command));
        assert_eq!(g.take_pending(), None);
        assert!(g.check_safe(StreamType::Music, 150, AudioDevice::WIRED_HEADSET));
    }

    #[test]
    fn test_music_active_accumulates_and_reactivates() {
        let g = guard(true);
        g.configure(true, 0);
        g.set_enabled(false);
        let loud = MusicActivity {
            device: AudioDevice::WIRED_HEADSET,
            active: true,
            index: 100,
        };

        let first = g.on_check_music_active(loud);
        assert!(first.reschedule);
        assert_eq!(first.persist_ms, Some(101));
        g.on_check_music_active(loud);
        let third = g.on_check_music_active(loud);
        assert!(third.reactivated);
        assert_eq!(third.persist_ms, Some(0));
        assert!(g.is_active());

        // no accounting while ACTIVE
        assert!(!g.on_check_music_active(loud).reschedule);
    }

    #[test]
    fn test_quiet_or_speaker_music_not_counted() {
        let g = guard(true);
        g.configure(true, 0);
        g.set_enabled(false);
        let quiet = MusicActivity {
            device: AudioDevice::WIRED_HEADSET,
            active: true,
            index: 40,
        };
        assert_eq!(g.on_check_music_active(quiet).persist_ms, None);
        let speaker = MusicActivity {
            device: AudioDevice::SPEAKER,
            active: true,
            index: 150,
        };
        assert!(!g.on_check_music_active(speaker).reschedule);
        assert_eq!(g.music_active_ms(), 1);
    }

    #[test]
    fn test_enforce_clamps_headset_entries() {
        let config = AudioPolicyConfig::default();
        let aliases = AliasTable::resolve(AliasContext {
            platform: PlatformType::Voice,
            in_communication: false,
            link_notification_with_ring: true,
            voice_capable: true,
        });
        let store = VolumeIndexStore::new(&config, aliases);
        store.set_index(StreamType::Music, 40, AudioDevice::WIRED_HEADPHONE);
        let g = guard(true);
        let lowered = g.enforce(&store);
        // headset fell back to the 110 default, headphone was already safe
        assert_eq!(lowered, vec![AudioDevice::WIRED_HEADSET]);
        assert_eq!(store.get_index(StreamType::Music, AudioDevice::WIRED_HEADSET), 60);
        assert_eq!(store.get_index(StreamType::Music, AudioDevice::WIRED_HEADPHONE), 40);
    }
}
