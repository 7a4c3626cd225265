//! Ringer mode policy
//!
//! [`check_for_ringer_mode_change`] is the pure transition function used
//! by volume-key handling. [`RingerModePolicy`] owns the ringer mode, the
//! previous adjustment direction and the stream masks derived from
//! settings, all behind one lock, and applies ringer muting to the volume
//! store while holding it so concurrent mode changes cannot reorder their
//! mute and unmute steps.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::PlatformType;
use crate::types::{AdjustDirection, ClientToken, RingerMode, StreamMask, StreamType};
use crate::volume::{AliasTable, IndexUpdate, MuteChange, VolumeIndexStore};

/// Default streams silenced by SILENT and VIBRATE
pub const DEFAULT_RINGER_AFFECTED_STREAMS: StreamMask = StreamMask(
    (1 << StreamType::Ring as u32)
        | (1 << StreamType::Notification as u32)
        | (1 << StreamType::System as u32)
        | (1 << StreamType::SystemEnforced as u32),
);

/// Default streams that honor `setStreamMute`
pub const DEFAULT_MUTE_AFFECTED_STREAMS: StreamMask = StreamMask(
    (1 << StreamType::Music as u32)
        | (1 << StreamType::Ring as u32)
        | (1 << StreamType::Notification as u32)
        | (1 << StreamType::System as u32),
);

/// Inputs of one volume-key ringer check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingerAdjustInput {
    pub mode: RingerMode,
    pub direction: AdjustDirection,
    /// Index of the alias stream before the adjustment
    pub old_index: i32,
    /// Internal units of one UI step of the alias stream
    pub step: i32,
    pub prev_direction: Option<AdjustDirection>,
    pub has_vibrator: bool,
    pub voice_capable: bool,
}

/// What a volume key press does to the ringer mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingerDecision {
    pub mode: RingerMode,
    /// Whether the volume index should still move
    pub adjust_volume: bool,
}

/// Ringer transition for a volume key press
pub fn check_for_ringer_mode_change(input: RingerAdjustInput) -> RingerDecision {
    let RingerAdjustInput {
        mode,
        direction,
        old_index,
        step,
        prev_direction,
        has_vibrator,
        voice_capable,
    } = input;
    let repeated_lower = prev_direction == Some(AdjustDirection::Lower);

    match mode {
        RingerMode::Normal => {
            if direction != AdjustDirection::Lower {
                return RingerDecision { mode, adjust_volume: true };
            }
            if has_vibrator {
                // old UI index == 1, whatever rounding the alias rescale did
                if step <= old_index && old_index < 2 * step {
                    return RingerDecision {
                        mode: RingerMode::Vibrate,
                        adjust_volume: !voice_capable,
                    };
                }
            } else if old_index < step && !repeated_lower {
                return RingerDecision {
                    mode: RingerMode::Silent,
                    adjust_volume: true,
                };
            }
            RingerDecision { mode, adjust_volume: true }
        }
        RingerMode::Vibrate => {
            if !has_vibrator {
                error!("ringer mode is vibrate but no vibrator is present");
                return RingerDecision { mode, adjust_volume: false };
            }
            let next = match direction {
                AdjustDirection::Lower if !repeated_lower => RingerMode::Silent,
                AdjustDirection::Raise => RingerMode::Normal,
                _ => mode,
            };
            RingerDecision {
                mode: next,
                adjust_volume: false,
            }
        }
        RingerMode::Silent => {
            let next = match direction {
                AdjustDirection::Raise if has_vibrator => RingerMode::Vibrate,
                AdjustDirection::Raise => RingerMode::Normal,
                _ => mode,
            };
            RingerDecision {
                mode: next,
                adjust_volume: false,
            }
        }
    }
}

/// Ringer-affected streams from the persisted base mask
pub fn ringer_affected_streams(
    base: StreamMask,
    platform: PlatformType,
    camera_sound_forced: bool,
    dtmf_alias: StreamType,
) -> StreamMask {
    if platform == PlatformType::Television {
        return StreamMask::EMPTY;
    }
    base.with(StreamType::SystemEnforced, !camera_sound_forced)
        .with(StreamType::Dtmf, dtmf_alias == StreamType::Ring)
}

/// Vibrate type in the deprecated vibrate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VibrateType {
    Ringer = 0,
    Notification = 1,
}

/// Value stored per vibrate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VibrateSetting {
    Off = 0,
    On = 1,
    OnlySilent = 2,
}

impl VibrateSetting {
    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            1 => VibrateSetting::On,
            2 => VibrateSetting::OnlySilent,
            _ => VibrateSetting::Off,
        }
    }
}

/// Replace the two bits of `vibrate_type` in `existing`
pub fn value_for_vibrate_setting(existing: u32, vibrate_type: VibrateType, value: VibrateSetting) -> u32 {
    let shift = vibrate_type as u32 * 2;
    (existing & !(3 << shift)) | ((value as u32 & 3) << shift)
}

/// Read the two bits of `vibrate_type`
pub fn vibrate_setting_of(setting: u32, vibrate_type: VibrateType) -> VibrateSetting {
    VibrateSetting::from_bits(setting >> (vibrate_type as u32 * 2))
}

/// Streams whose service mute moved while applying a ringer mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingerMuteResult {
    pub mute_changed: Vec<StreamType>,
    /// Zero RING indices lifted to one step on unmute
    pub raised: IndexUpdate,
}

/// Fixed capabilities of the ringer policy
#[derive(Debug, Clone, Copy)]
pub struct RingerCapabilities {
    pub platform: PlatformType,
    pub has_vibrator: bool,
    pub voice_capable: bool,
}

#[derive(Debug)]
struct RingerState {
    mode: RingerMode,
    prev_direction: Option<AdjustDirection>,
    base_affected: StreamMask,
    affected: StreamMask,
    muted_by_ringer: StreamMask,
    mute_affected: StreamMask,
    vibrate_setting: u32,
}

/// Ringer mode state machine and its stream masks
pub struct RingerModePolicy {
    caps: RingerCapabilities,
    state: Mutex<RingerState>,
}

impl RingerModePolicy {
    pub fn new(caps: RingerCapabilities, initial: RingerMode) -> Self {
        let mode = Self::sanitize_with(caps, initial);
        Self {
            caps,
            state: Mutex::new(RingerState {
                mode,
                prev_direction: None,
                base_affected: DEFAULT_RINGER_AFFECTED_STREAMS,
                affected: DEFAULT_RINGER_AFFECTED_STREAMS,
                muted_by_ringer: StreamMask::EMPTY,
                mute_affected: DEFAULT_MUTE_AFFECTED_STREAMS,
                vibrate_setting: 0,
            }),
        }
    }

    fn sanitize_with(caps: RingerCapabilities, mode: RingerMode) -> RingerMode {
        if mode == RingerMode::Vibrate && !caps.has_vibrator {
            RingerMode::Silent
        } else {
            mode
        }
    }

    /// Coerce VIBRATE to SILENT on devices without a vibrator
    pub fn sanitize(&self, mode: RingerMode) -> RingerMode {
        Self::sanitize_with(self.caps, mode)
    }

    pub fn capabilities(&self) -> RingerCapabilities {
        self.caps
    }

    pub fn mode(&self) -> RingerMode {
        self.state.lock().mode
    }

    pub fn prev_direction(&self) -> Option<AdjustDirection> {
        self.state.lock().prev_direction
    }

    /// Store a new mode; returns the previous one if it changed
    pub fn set_mode(&self, mode: RingerMode) -> Option<RingerMode> {
        let mode = self.sanitize(mode);
        let mut state = self.state.lock();
        if state.mode == mode {
            return None;
        }
        info!(from = ?state.mode, to = ?mode, "ringer mode changed");
        Some(std::mem::replace(&mut state.mode, mode))
    }

    /// Run the volume-key transition and remember the direction
    ///
    /// Returns the decision and the previous mode when the mode changed.
    pub fn check_adjust(
        &self,
        direction: AdjustDirection,
        old_index: i32,
        step: i32,
    ) -> (RingerDecision, Option<RingerMode>) {
        let mut state = self.state.lock();
        let decision = check_for_ringer_mode_change(RingerAdjustInput {
            mode: state.mode,
            direction,
            old_index,
            step,
            prev_direction: state.prev_direction,
            has_vibrator: self.caps.has_vibrator,
            voice_capable: self.caps.voice_capable,
        });
        state.prev_direction = Some(direction);
        let decided = Self::sanitize_with(self.caps, decision.mode);
        let previous = (decided != state.mode).then(|| std::mem::replace(&mut state.mode, decided));
        debug!(?direction, old_index, step, mode = ?decided, adjust = decision.adjust_volume, "ringer check");
        (
            RingerDecision {
                mode: decided,
                adjust_volume: decision.adjust_volume,
            },
            previous,
        )
    }

    /// Ringer mode implied by an absolute volume on the ring stream
    pub fn mode_for_index(&self, index: i32) -> RingerMode {
        if index != 0 {
            RingerMode::Normal
        } else if self.caps.has_vibrator {
            RingerMode::Vibrate
        } else {
            RingerMode::Silent
        }
    }

    pub fn is_affected(&self, stream: StreamType) -> bool {
        self.state.lock().affected.contains(stream)
    }

    pub fn affected_streams(&self) -> StreamMask {
        self.state.lock().affected
    }

    pub fn is_muted_by_ringer(&self, stream: StreamType) -> bool {
        self.state.lock().muted_by_ringer.contains(stream)
    }

    /// Recompute the affected mask; returns true if it changed
    pub fn update_affected_streams(
        &self,
        base: Option<StreamMask>,
        camera_sound_forced: bool,
        dtmf_alias: StreamType,
    ) -> bool {
        let mut state = self.state.lock();
        if let Some(base) = base {
            state.base_affected = base;
        }
        let affected = ringer_affected_streams(
            state.base_affected,
            self.caps.platform,
            camera_sound_forced,
            dtmf_alias,
        );
        if affected == state.affected {
            return false;
        }
        debug!(from = state.affected.0, to = affected.0, "ringer affected streams changed");
        state.affected = affected;
        true
    }

    pub fn is_affected_by_mute(&self, stream: StreamType) -> bool {
        self.state.lock().mute_affected.contains(stream)
    }

    pub fn set_mute_affected_streams(&self, mask: StreamMask) {
        self.state.lock().mute_affected = mask;
    }

    /// Apply ringer muting for the current mode to `store`
    pub fn apply_muting(&self, store: &VolumeIndexStore, aliases: &AliasTable) -> RingerMuteResult {
        let mut state = self.state.lock();
        let mut result = RingerMuteResult::default();
        let service = ClientToken::service();

        for stream in StreamType::ALL.into_iter().rev() {
            let is_muted = state.muted_by_ringer.contains(stream);
            let should_mute = state.mode != RingerMode::Normal && state.affected.contains(stream);
            if is_muted == should_mute {
                continue;
            }
            let change = if should_mute {
                state.muted_by_ringer.insert(stream);
                store.mute(stream, service)
            } else {
                // unmuting the ring volume must not leave it silent
                if self.caps.voice_capable && aliases.alias(stream) == StreamType::Ring {
                    result.raised.merge(store.raise_silent_entries(stream, 10));
                }
                state.muted_by_ringer.remove(stream);
                store.unmute(stream, service)
            };
            if change != MuteChange::Unchanged {
                result.mute_changed.push(stream);
            }
        }
        result
    }

    pub fn vibrate_setting(&self) -> u32 {
        self.state.lock().vibrate_setting
    }

    pub fn set_vibrate_setting_bits(&self, bits: u32) {
        self.state.lock().vibrate_setting = bits;
    }

    /// Update one vibrate type; returns the new packed setting
    pub fn set_vibrate_setting(&self, vibrate_type: VibrateType, value: VibrateSetting) -> u32 {
        let mut state = self.state.lock();
        state.vibrate_setting = value_for_vibrate_setting(state.vibrate_setting, vibrate_type, value);
        state.vibrate_setting
    }

    pub fn get_vibrate_setting(&self, vibrate_type: VibrateType) -> VibrateSetting {
        vibrate_setting_of(self.vibrate_setting(), vibrate_type)
    }

    /// Whether a notification of `vibrate_type` should vibrate now
    pub fn should_vibrate(&self, vibrate_type: VibrateType) -> bool {
        if !self.caps.has_vibrator {
            return false;
        }
        let state = self.state.lock();
        match vibrate_setting_of(state.vibrate_setting, vibrate_type) {
            VibrateSetting::On => state.mode != RingerMode::Silent,
            VibrateSetting::OnlySilent => state.mode == RingerMode::Vibrate,
            VibrateSetting::Off => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioPolicyConfig;
    use crate::types::AudioDevice;
    use crate::volume::AliasContext;

    fn input(mode: RingerMode, direction: AdjustDirection, old_index: i32) -> RingerAdjustInput {
        RingerAdjustInput {
            mode,
            direction,
            old_index,
            step: 10,
            prev_direction: None,
            has_vibrator: true,
            voice_capable: true,
        }
    }

    fn voice_caps(has_vibrator: bool) -> RingerCapabilities {
        RingerCapabilities {
            platform: PlatformType::Voice,
            has_vibrator,
            voice_capable: true,
        }
    }

    #[test]
    fn test_normal_lower_at_one_step_vibrates() {
        let decision = check_for_ringer_mode_change(input(RingerMode::Normal, AdjustDirection::Lower, 14));
        assert_eq!(decision.mode, RingerMode::Vibrate);
        assert!(!decision.adjust_volume);

        let mut tablet = input(RingerMode::Normal, AdjustDirection::Lower, 10);
        tablet.voice_capable = false;
        assert!(check_for_ringer_mode_change(tablet).adjust_volume);

        let above = check_for_ringer_mode_change(input(RingerMode::Normal, AdjustDirection::Lower, 20));
        assert_eq!(above.mode, RingerMode::Normal);
        assert!(above.adjust_volume);
    }

    #[test]
    fn test_normal_without_vibrator_goes_silent_at_zero() {
        let mut i = input(RingerMode::Normal, AdjustDirection::Lower, 0);
        i.has_vibrator = false;
        assert_eq!(check_for_ringer_mode_change(i).mode, RingerMode::Silent);

        i.prev_direction = Some(AdjustDirection::Lower);
        assert_eq!(check_for_ringer_mode_change(i).mode, RingerMode::Normal);
    }

    #[test]
    fn test_vibrate_transitions() {
        let lower = check_for_ringer_mode_change(input(RingerMode::Vibrate, AdjustDirection::Lower, 10));
        assert_eq!(lower.mode, RingerMode::Silent);
        assert!(!lower.adjust_volume);

        let mut repeated = input(RingerMode::Vibrate, AdjustDirection::Lower, 10);
        repeated.prev_direction = Some(AdjustDirection::Lower);
        assert_eq!(check_for_ringer_mode_change(repeated).mode, RingerMode::Vibrate);

        let raise = check_for_ringer_mode_change(input(RingerMode::Vibrate, AdjustDirection::Raise, 10));
        assert_eq!(raise.mode, RingerMode::Normal);
        assert!(!raise.adjust_volume);
    }

    #[test]
    fn test_silent_raise() {
        let with_vibrator = check_for_ringer_mode_change(input(RingerMode::Silent, AdjustDirection::Raise, 0));
        assert_eq!(with_vibrator.mode, RingerMode::Vibrate);

        let mut i = input(RingerMode::Silent, AdjustDirection::Raise, 0);
        i.has_vibrator = false;
        assert_eq!(check_for_ringer_mode_change(i).mode, RingerMode::Normal);

        let lower = check_for_ringer_mode_change(input(RingerMode::Silent, AdjustDirection::Lower, 0));
        assert_eq!(lower.mode, RingerMode::Silent);
        assert!(!lower.adjust_volume);
    }

    #[test]
    fn test_policy_remembers_direction() {
        let policy = RingerModePolicy::new(voice_caps(true), RingerMode::Normal);
        let (decision, previous) = policy.check_adjust(AdjustDirection::Lower, 10, 10);
        assert_eq!(decision.mode, RingerMode::Vibrate);
        assert_eq!(previous, Some(RingerMode::Normal));

        // key still held: no second transition
        let (decision, previous) = policy.check_adjust(AdjustDirection::Lower, 10, 10);
        assert_eq!(decision.mode, RingerMode::Vibrate);
        assert_eq!(previous, None);

        // released and pressed again
        policy.check_adjust(AdjustDirection::Same, 10, 10);
        let (decision, _) = policy.check_adjust(AdjustDirection::Lower, 10, 10);
        assert_eq!(decision.mode, RingerMode::Silent);
    }

    #[test]
    fn test_vibrate_without_vibrator_is_coerced() {
        let policy = RingerModePolicy::new(voice_caps(false), RingerMode::Vibrate);
        assert_eq!(policy.mode(), RingerMode::Silent);
        assert_eq!(policy.set_mode(RingerMode::Vibrate), None);
        assert_eq!(policy.mode_for_index(0), RingerMode::Silent);
    }

    #[test]
    fn test_affected_streams_derivation() {
        let mask = ringer_affected_streams(
            DEFAULT_RINGER_AFFECTED_STREAMS,
            PlatformType::Voice,
            true,
            StreamType::Ring,
        );
        assert!(!mask.contains(StreamType::SystemEnforced));
        assert!(mask.contains(StreamType::Dtmf));

        let tv = ringer_affected_streams(
            DEFAULT_RINGER_AFFECTED_STREAMS,
            PlatformType::Television,
            false,
            StreamType::Music,
        );
        assert_eq!(tv, StreamMask::EMPTY);
    }

    #[test]
    fn test_vibrate_setting_bits() {
        let bits = value_for_vibrate_setting(0, VibrateType::Notification, VibrateSetting::OnlySilent);
        assert_eq!(bits, 0b1000);
        let bits = value_for_vibrate_setting(bits, VibrateType::Ringer, VibrateSetting::On);
        assert_eq!(vibrate_setting_of(bits, VibrateType::Ringer), VibrateSetting::On);
        assert_eq!(vibrate_setting_of(bits, VibrateType::Notification), VibrateSetting::OnlySilent);
    }

    #[test]
    fn test_should_vibrate() {
        let policy = RingerModePolicy::new(voice_caps(true), RingerMode::Normal);
        policy.set_vibrate_setting(VibrateType::Ringer, VibrateSetting::On);
        policy.set_vibrate_setting(VibrateType::Notification, VibrateSetting::OnlySilent);
        assert!(policy.should_vibrate(VibrateType::Ringer));
        assert!(!policy.should_vibrate(VibrateType::Notification));

        policy.set_mode(RingerMode::Vibrate);
        assert!(policy.should_vibrate(VibrateType::Notification));
        policy.set_mode(RingerMode::Silent);
        assert!(!policy.should_vibrate(VibrateType::Ringer));
    }

    #[test]
    fn test_apply_muting_mutes_and_restores() {
        let config = AudioPolicyConfig::default();
        let aliases = AliasTable::resolve(AliasContext {
            platform: PlatformType::Voice,
            in_communication: false,
            link_notification_with_ring: true,
            voice_capable: true,
        });
        let store = VolumeIndexStore::new(&config, aliases);
        let policy = RingerModePolicy::new(voice_caps(true), RingerMode::Normal);
        policy.update_affected_streams(None, false, StreamType::Ring);

        policy.set_mode(RingerMode::Silent);
        let result = policy.apply_muting(&store, &aliases);
        assert!(result.mute_changed.contains(&StreamType::Ring));
        assert!(store.is_muted(StreamType::Ring));
        assert!(store.is_muted(StreamType::Dtmf));
        assert!(!store.is_muted(StreamType::Music));

        // applying twice does not stack service mutes
        assert!(policy.apply_muting(&store, &aliases).mute_changed.is_empty());

        store.set_index(StreamType::Ring, 0, AudioDevice::SPEAKER);
        policy.set_mode(RingerMode::Normal);
        let result = policy.apply_muting(&store, &aliases);
        assert!(!store.is_muted(StreamType::Ring));
        assert!(result.raised.changed);
        assert_eq!(store.get_index(StreamType::Ring, AudioDevice::SPEAKER), 10);
    }
}
