//! Core vocabulary of the audio policy engine
//!
//! Streams, output devices, ringer and audio modes, adjustment directions,
//! caller identity and the outcomes returned by the public operations.
//! Enumerations that cross the IPC boundary as raw integers implement
//! `TryFrom<i32>` so bad values are rejected before any state is touched.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AudioPolicyError;

/// Logical audio stream with an independent volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    VoiceCall = 0,
    System = 1,
    Ring = 2,
    Music = 3,
    Alarm = 4,
    Notification = 5,
    BluetoothSco = 6,
    SystemEnforced = 7,
    Dtmf = 8,
    Tts = 9,
}

impl StreamType {
    /// Number of stream types
    pub const COUNT: usize = 10;

    /// Every stream in raw-value order
    pub const ALL: [StreamType; Self::COUNT] = [
        StreamType::VoiceCall,
        StreamType::System,
        StreamType::Ring,
        StreamType::Music,
        StreamType::Alarm,
        StreamType::Notification,
        StreamType::BluetoothSco,
        StreamType::SystemEnforced,
        StreamType::Dtmf,
        StreamType::Tts,
    ];

    /// Position in per-stream tables
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit of this stream in a [`StreamMask`]
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Prefix of the persisted per-device volume keys
    pub fn setting_name(self) -> &'static str {
        match self {
            StreamType::VoiceCall => "volume_voice",
            StreamType::System => "volume_system",
            StreamType::Ring => "volume_ring",
            StreamType::Music => "volume_music",
            StreamType::Alarm => "volume_alarm",
            StreamType::Notification => "volume_notification",
            StreamType::BluetoothSco => "volume_bluetooth_sco",
            StreamType::SystemEnforced => "volume_system_enforced",
            StreamType::Dtmf => "volume_dtmf",
            StreamType::Tts => "volume_tts",
        }
    }
}

impl TryFrom<i32> for StreamType {
    type Error = AudioPolicyError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|i| StreamType::ALL.get(i).copied())
            .ok_or(AudioPolicyError::InvalidStreamType { value })
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamType::VoiceCall => "VOICE_CALL",
            StreamType::System => "SYSTEM",
            StreamType::Ring => "RING",
            StreamType::Music => "MUSIC",
            StreamType::Alarm => "ALARM",
            StreamType::Notification => "NOTIFICATION",
            StreamType::BluetoothSco => "BLUETOOTH_SCO",
            StreamType::SystemEnforced => "SYSTEM_ENFORCED",
            StreamType::Dtmf => "DTMF",
            StreamType::Tts => "TTS",
        };
        f.write_str(name)
    }
}

/// Set of streams, one bit per [`StreamType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamMask(pub u32);

impl StreamMask {
    pub const EMPTY: StreamMask = StreamMask(0);

    pub fn of(streams: &[StreamType]) -> Self {
        StreamMask(streams.iter().fold(0, |acc, s| acc | s.bit()))
    }

    pub fn contains(self, stream: StreamType) -> bool {
        self.0 & stream.bit() != 0
    }

    pub fn insert(&mut self, stream: StreamType) {
        self.0 |= stream.bit();
    }

    pub fn remove(&mut self, stream: StreamType) {
        self.0 &= !stream.bit();
    }

    pub fn with(mut self, stream: StreamType, present: bool) -> Self {
        if present {
            self.insert(stream);
        } else {
            self.remove(stream);
        }
        self
    }
}

/// Output (and a few input) devices as a closed bitmask enumeration
///
/// Values match the native audio system so a mask returned by
/// `getDevicesForStream` can be used directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioDevice(pub u32);

impl AudioDevice {
    pub const NONE: AudioDevice = AudioDevice(0);
    pub const EARPIECE: AudioDevice = AudioDevice(0x1);
    pub const SPEAKER: AudioDevice = AudioDevice(0x2);
    pub const WIRED_HEADSET: AudioDevice = AudioDevice(0x4);
    pub const WIRED_HEADPHONE: AudioDevice = AudioDevice(0x8);
    pub const BLUETOOTH_SCO: AudioDevice = AudioDevice(0x10);
    pub const BLUETOOTH_SCO_HEADSET: AudioDevice = AudioDevice(0x20);
    pub const BLUETOOTH_SCO_CARKIT: AudioDevice = AudioDevice(0x40);
    pub const BLUETOOTH_A2DP: AudioDevice = AudioDevice(0x80);
    pub const BLUETOOTH_A2DP_HEADPHONES: AudioDevice = AudioDevice(0x100);
    pub const BLUETOOTH_A2DP_SPEAKER: AudioDevice = AudioDevice(0x200);
    pub const HDMI: AudioDevice = AudioDevice(0x400);
    pub const ANLG_DOCK_HEADSET: AudioDevice = AudioDevice(0x800);
    pub const DGTL_DOCK_HEADSET: AudioDevice = AudioDevice(0x1000);
    pub const USB_ACCESSORY: AudioDevice = AudioDevice(0x2000);
    pub const USB_DEVICE: AudioDevice = AudioDevice(0x4000);
    pub const REMOTE_SUBMIX: AudioDevice = AudioDevice(0x8000);
    pub const TELEPHONY_TX: AudioDevice = AudioDevice(0x10000);
    pub const LINE: AudioDevice = AudioDevice(0x20000);
    pub const HDMI_ARC: AudioDevice = AudioDevice(0x40000);
    pub const SPDIF: AudioDevice = AudioDevice(0x80000);
    pub const FM: AudioDevice = AudioDevice(0x100000);
    pub const AUX_LINE: AudioDevice = AudioDevice(0x200000);
    /// Pseudo device holding the fallback volume of every stream
    pub const DEFAULT: AudioDevice = AudioDevice(0x4000_0000);

    /// Marks an input device
    pub const BIT_IN: u32 = 0x8000_0000;
    pub const IN_BLUETOOTH_SCO_HEADSET: AudioDevice = AudioDevice(Self::BIT_IN | 0x8);

    pub const ALL_A2DP: AudioDevice = AudioDevice(0x80 | 0x100 | 0x200);
    pub const ALL_SCO: AudioDevice = AudioDevice(0x10 | 0x20 | 0x40);
    pub const ALL_USB: AudioDevice = AudioDevice(0x2000 | 0x4000);

    /// Output devices and the suffix used in their persisted volume keys
    pub const OUTPUTS: [(AudioDevice, &'static str); 22] = [
        (Self::EARPIECE, "earpiece"),
        (Self::SPEAKER, "speaker"),
        (Self::WIRED_HEADSET, "headset"),
        (Self::WIRED_HEADPHONE, "headphone"),
        (Self::BLUETOOTH_SCO, "bt_sco"),
        (Self::BLUETOOTH_SCO_HEADSET, "bt_sco_hs"),
        (Self::BLUETOOTH_SCO_CARKIT, "bt_sco_carkit"),
        (Self::BLUETOOTH_A2DP, "bt_a2dp"),
        (Self::BLUETOOTH_A2DP_HEADPHONES, "bt_a2dp_hp"),
        (Self::BLUETOOTH_A2DP_SPEAKER, "bt_a2dp_spk"),
        (Self::HDMI, "hdmi"),
        (Self::ANLG_DOCK_HEADSET, "analog_dock"),
        (Self::DGTL_DOCK_HEADSET, "digital_dock"),
        (Self::USB_ACCESSORY, "usb_accessory"),
        (Self::USB_DEVICE, "usb_device"),
        (Self::REMOTE_SUBMIX, "remote_submix"),
        (Self::TELEPHONY_TX, "telephony_tx"),
        (Self::LINE, "line"),
        (Self::HDMI_ARC, "hmdi_arc"),
        (Self::SPDIF, "spdif"),
        (Self::FM, "fm_transmitter"),
        (Self::AUX_LINE, "aux_line"),
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set here
    pub fn contains(self, other: AudioDevice) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set here
    pub fn intersects(self, other: AudioDevice) -> bool {
        self.0 & other.0 != 0
    }

    /// Number of devices in the mask
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_input(self) -> bool {
        self.0 & Self::BIT_IN != 0
    }

    /// Suffix of the persisted volume key, `None` for the default device
    pub fn setting_suffix(self) -> Option<&'static str> {
        Self::OUTPUTS
            .iter()
            .find(|(device, _)| *device == self)
            .map(|(_, suffix)| *suffix)
    }
}

impl BitOr for AudioDevice {
    type Output = AudioDevice;

    fn bitor(self, rhs: Self) -> Self::Output {
        AudioDevice(self.0 | rhs.0)
    }
}

impl BitOrAssign for AudioDevice {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AudioDevice {
    type Output = AudioDevice;

    fn bitand(self, rhs: Self) -> Self::Output {
        AudioDevice(self.0 & rhs.0)
    }
}

impl fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.setting_suffix() {
            Some(suffix) => write!(f, "AudioDevice({suffix})"),
            None if *self == Self::DEFAULT => f.write_str("AudioDevice(default)"),
            None => write!(f, "AudioDevice({:#x})", self.0),
        }
    }
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Ringer mode of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingerMode {
    Silent = 0,
    Vibrate = 1,
    Normal = 2,
}

impl TryFrom<i32> for RingerMode {
    type Error = AudioPolicyError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RingerMode::Silent),
            1 => Ok(RingerMode::Vibrate),
            2 => Ok(RingerMode::Normal),
            _ => Err(AudioPolicyError::InvalidRingerMode { value }),
        }
    }
}

/// Device-wide audio (telephony) mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    /// Placeholder meaning "whatever mode is active now"
    Current = -1,
    Normal = 0,
    Ringtone = 1,
    InCall = 2,
    InCommunication = 3,
}

impl AudioMode {
    pub fn is_in_communication(self) -> bool {
        matches!(self, AudioMode::InCall | AudioMode::InCommunication)
    }
}

impl TryFrom<i32> for AudioMode {
    type Error = AudioPolicyError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(AudioMode::Current),
            0 => Ok(AudioMode::Normal),
            1 => Ok(AudioMode::Ringtone),
            2 => Ok(AudioMode::InCall),
            3 => Ok(AudioMode::InCommunication),
            _ => Err(AudioPolicyError::InvalidMode { value }),
        }
    }
}

/// Direction of a volume key press
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustDirection {
    Lower = -1,
    Same = 0,
    Raise = 1,
}

impl AdjustDirection {
    pub fn sign(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for AdjustDirection {
    type Error = AudioPolicyError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(AdjustDirection::Lower),
            0 => Ok(AdjustDirection::Same),
            1 => Ok(AdjustDirection::Raise),
            _ => Err(AudioPolicyError::InvalidDirection { value }),
        }
    }
}

/// Flags accompanying a volume request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeFlags(pub u32);

impl VolumeFlags {
    pub const NONE: VolumeFlags = VolumeFlags(0);
    pub const SHOW_UI: VolumeFlags = VolumeFlags(1 << 0);
    pub const ALLOW_RINGER_MODES: VolumeFlags = VolumeFlags(1 << 1);
    pub const PLAY_SOUND: VolumeFlags = VolumeFlags(1 << 2);
    pub const REMOVE_SOUND_AND_VIBRATE: VolumeFlags = VolumeFlags(1 << 3);
    pub const VIBRATE: VolumeFlags = VolumeFlags(1 << 4);
    pub const FIXED_VOLUME: VolumeFlags = VolumeFlags(1 << 5);

    pub fn contains(self, other: VolumeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: VolumeFlags) -> VolumeFlags {
        VolumeFlags(self.0 & !other.0)
    }
}

impl BitOr for VolumeFlags {
    type Output = VolumeFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        VolumeFlags(self.0 | rhs.0)
    }
}

/// Opaque identity of a remote client
///
/// Mute holders, SCO clients and mode owners are keyed by this token. The
/// host maps its own peer handles onto tokens and reports their death
/// through [`crate::service::AudioService::on_peer_died`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientToken(Uuid);

impl ClientToken {
    /// Generate a fresh token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Token used by the service itself, for ringer-mode muting
    pub fn service() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_service(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ClientToken {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientToken({})", self.0)
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the process calling into the service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub pid: u32,
    pub uid: u32,
    pub package: String,
}

impl Caller {
    pub fn new(pid: u32, uid: u32, package: impl Into<String>) -> Self {
        Self {
            pid,
            uid,
            package: package.into(),
        }
    }
}

/// Per-package operation gating a stream's volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppOp {
    AudioVoiceVolume,
    AudioRingVolume,
    AudioMediaVolume,
    AudioAlarmVolume,
    AudioNotificationVolume,
    AudioBluetoothVolume,
}

/// Permissions checked at the API boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ModifyAudioSettings,
    ModifyPhoneState,
    Bluetooth,
}

/// Result of a volume, mute, ringer or SCO request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOutcome {
    /// State changed and the change was queued for the hardware
    Applied,
    /// Request was valid but left the state as it was
    Unchanged,
    /// Caller lacks the app op or permission; nothing was touched
    PermissionDenied,
    /// Index exceeds the safe headset ceiling; the request is pending
    SafeVolumeWarning,
    /// Stream is not subject to this operation
    Ignored,
}

impl VolumeOutcome {
    pub fn is_applied(self) -> bool {
        self == VolumeOutcome::Applied
    }
}

/// Result of a mode change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeOutcome {
    /// Mode resolved; `owner_pid` is the non-normal owner or 0
    Applied { mode: AudioMode, owner_pid: u32 },
    /// The audio system refused the requested mode; `mode` is the one the
    /// fallback settled on
    Refused { mode: AudioMode, owner_pid: u32 },
    /// Caller lacks the required permission
    PermissionDenied,
}

/// Connection state reported for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected = 0,
    Connected = 1,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Forced-use usage selector of the native policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceUsage {
    Communication = 0,
    Media = 1,
    Record = 2,
}

/// Forced-use configuration value of the native policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceConfig {
    None = 0,
    Speaker = 1,
    Headphones = 2,
    BtSco = 3,
    NoBtA2dp = 10,
}

/// Audio session id validation
///
/// `0` asks the native layer to allocate a session and is only accepted when
/// `allow_allocate` is set; negative ids are always rejected.
pub fn validate_session_id(session_id: i32, allow_allocate: bool) -> crate::Result<i32> {
    match session_id {
        id if id > 0 => Ok(id),
        0 if allow_allocate => Ok(0),
        value => Err(AudioPolicyError::InvalidSessionId { value }),
    }
}
