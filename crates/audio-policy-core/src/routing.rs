//! Routing decisions and the connected-device table
//!
//! [`select_device_for_stream`] and [`active_stream_type`] are pure: the
//! caller gathers the inputs from the audio system first.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PlatformType;
use crate::types::{AudioDevice, StreamType};

/// Window in which a recently active stream still steers the volume keys
pub const STREAM_OVERRIDE_DELAY: Duration = Duration::from_millis(5000);

/// Devices whose removal makes audio "noisy"
pub const BECOMING_NOISY_DEVICES: AudioDevice = AudioDevice(
    AudioDevice::WIRED_HEADSET.0
        | AudioDevice::WIRED_HEADPHONE.0
        | AudioDevice::ALL_A2DP.0
        | AudioDevice::HDMI.0
        | AudioDevice::ANLG_DOCK_HEADSET.0
        | AudioDevice::DGTL_DOCK_HEADSET.0
        | AudioDevice::ALL_USB.0
        | AudioDevice::LINE.0,
);

/// Wired outputs that pull media away from A2DP while connected
pub const WIRED_MEDIA_DEVICES: AudioDevice =
    AudioDevice(AudioDevice::WIRED_HEADSET.0 | AudioDevice::WIRED_HEADPHONE.0 | AudioDevice::LINE.0);

/// Reduce the devices of a stream to the one whose volume is shown
///
/// Several bits mean duplicated output. Speaker wins, then HDMI ARC,
/// SPDIF and AUX line, and otherwise the A2DP bits.
pub fn select_device_for_stream(devices: AudioDevice) -> AudioDevice {
    if devices.count() <= 1 {
        return devices;
    }
    [
        AudioDevice::SPEAKER,
        AudioDevice::HDMI_ARC,
        AudioDevice::SPDIF,
        AudioDevice::AUX_LINE,
    ]
    .into_iter()
    .find(|preferred| devices.contains(*preferred))
    .unwrap_or(devices & AudioDevice::ALL_A2DP)
}

/// Everything [`active_stream_type`] looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveStreamInputs {
    pub platform: PlatformType,
    /// Mode is IN_CALL or IN_COMMUNICATION
    pub in_communication: bool,
    /// Communication is forced to Bluetooth SCO
    pub sco_forced: bool,
    /// Music played within [`STREAM_OVERRIDE_DELAY`]
    pub music_active_recently: bool,
    /// Music is playing right now
    pub music_active_now: bool,
    /// Ring or notification played within [`STREAM_OVERRIDE_DELAY`]
    pub ring_or_notification_active: bool,
    pub volume_keys_control_ring: bool,
    /// Stream suggested by the caller, `None` for "use default"
    pub suggested: Option<StreamType>,
}

/// Stream that volume keys should act on
pub fn active_stream_type(inputs: ActiveStreamInputs) -> StreamType {
    let communication = if inputs.sco_forced {
        StreamType::BluetoothSco
    } else {
        StreamType::VoiceCall
    };
    let default_stream = |ring: StreamType| {
        if inputs.music_active_recently {
            StreamType::Music
        } else if inputs.volume_keys_control_ring {
            ring
        } else {
            StreamType::Music
        }
    };

    match inputs.platform {
        PlatformType::Voice => {
            if inputs.in_communication {
                return communication;
            }
            match inputs.suggested {
                None => default_stream(StreamType::Ring),
                Some(_) if inputs.music_active_now => StreamType::Music,
                Some(suggested) => suggested,
            }
        }
        PlatformType::Television => inputs.suggested.unwrap_or(StreamType::Music),
        PlatformType::Default => {
            if inputs.in_communication {
                return communication;
            }
            if inputs.ring_or_notification_active {
                return StreamType::Notification;
            }
            match inputs.suggested {
                None => default_stream(StreamType::Notification),
                Some(suggested) => suggested,
            }
        }
    }
}

/// A device known to the native layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedDevice {
    pub device: AudioDevice,
    pub address: String,
    pub name: String,
}

/// Table key of a device, `0x<hex>:<address>`
pub fn device_key(device: AudioDevice, address: &str) -> String {
    format!("{:#x}:{}", device.bits(), address)
}

/// Devices currently connected, keyed by [`device_key`]
#[derive(Debug, Default)]
pub struct ConnectedDevices {
    devices: DashMap<String, ConnectedDevice>,
}

impl ConnectedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, device: AudioDevice, address: &str) -> bool {
        self.devices.contains_key(&device_key(device, address))
    }

    pub fn insert(&self, device: AudioDevice, address: &str, name: &str) {
        debug!(%device, address, "device connected");
        self.devices.insert(
            device_key(device, address),
            ConnectedDevice {
                device,
                address: address.to_string(),
                name: name.to_string(),
            },
        );
    }

    pub fn remove(&self, device: AudioDevice, address: &str) -> Option<ConnectedDevice> {
        debug!(%device, address, "device disconnected");
        self.devices.remove(&device_key(device, address)).map(|(_, d)| d)
    }

    /// Union of connected outputs intersecting `mask`
    pub fn outputs_in(&self, mask: AudioDevice) -> AudioDevice {
        self.devices
            .iter()
            .map(|entry| entry.device)
            .filter(|d| !d.is_input() && d.intersects(mask))
            .fold(AudioDevice::NONE, |acc, d| acc | d)
    }

    /// True if removing `device` leaves no noisy-capable output behind
    pub fn is_last_noisy_device(&self, device: AudioDevice) -> bool {
        device.intersects(BECOMING_NOISY_DEVICES) && self.outputs_in(BECOMING_NOISY_DEVICES) == device
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnectedDevice> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(platform: PlatformType) -> ActiveStreamInputs {
        ActiveStreamInputs {
            platform,
            in_communication: false,
            sco_forced: false,
            music_active_recently: false,
            music_active_now: false,
            ring_or_notification_active: false,
            volume_keys_control_ring: true,
            suggested: None,
        }
    }

    #[test]
    fn test_device_tie_break() {
        let d = AudioDevice::SPEAKER | AudioDevice::WIRED_HEADSET;
        assert_eq!(select_device_for_stream(d), AudioDevice::SPEAKER);
        let d = AudioDevice::HDMI_ARC | AudioDevice::SPDIF;
        assert_eq!(select_device_for_stream(d), AudioDevice::HDMI_ARC);
        let d = AudioDevice::SPDIF | AudioDevice::AUX_LINE;
        assert_eq!(select_device_for_stream(d), AudioDevice::SPDIF);
        let d = AudioDevice::BLUETOOTH_A2DP | AudioDevice::WIRED_HEADSET;
        assert_eq!(select_device_for_stream(d), AudioDevice::BLUETOOTH_A2DP);
        assert_eq!(select_device_for_stream(AudioDevice::EARPIECE), AudioDevice::EARPIECE);
    }

    #[test]
    fn test_voice_platform_defaults() {
        let base = inputs(PlatformType::Voice);
        assert_eq!(active_stream_type(base), StreamType::Ring);

        let music = ActiveStreamInputs {
            music_active_recently: true,
            ..base
        };
        assert_eq!(active_stream_type(music), StreamType::Music);

        let keys_music = ActiveStreamInputs {
            volume_keys_control_ring: false,
            ..base
        };
        assert_eq!(active_stream_type(keys_music), StreamType::Music);
    }

    #[test]
    fn test_communication_wins() {
        for platform in [PlatformType::Voice, PlatformType::Default] {
            let call = ActiveStreamInputs {
                in_communication: true,
                suggested: Some(StreamType::Alarm),
                ..inputs(platform)
            };
            assert_eq!(active_stream_type(call), StreamType::VoiceCall);
            let sco = ActiveStreamInputs { sco_forced: true, ..call };
            assert_eq!(active_stream_type(sco), StreamType::BluetoothSco);
        }
    }

    #[test]
    fn test_suggestion_handling() {
        let voice = ActiveStreamInputs {
            suggested: Some(StreamType::Alarm),
            ..inputs(PlatformType::Voice)
        };
        assert_eq!(active_stream_type(voice), StreamType::Alarm);
        let playing = ActiveStreamInputs {
            music_active_now: true,
            ..voice
        };
        assert_eq!(active_stream_type(playing), StreamType::Music);

        let tv = inputs(PlatformType::Television);
        assert_eq!(active_stream_type(tv), StreamType::Music);
        let tv_suggested = ActiveStreamInputs {
            suggested: Some(StreamType::Alarm),
            ..tv
        };
        assert_eq!(active_stream_type(tv_suggested), StreamType::Alarm);
    }

    #[test]
    fn test_default_platform() {
        let base = inputs(PlatformType::Default);
        assert_eq!(active_stream_type(base), StreamType::Notification);
        let ringing = ActiveStreamInputs {
            ring_or_notification_active: true,
            suggested: Some(StreamType::Music),
            ..base
        };
        assert_eq!(active_stream_type(ringing), StreamType::Notification);
    }

    #[test]
    fn test_becoming_noisy_only_for_last_device() {
        let devices = ConnectedDevices::new();
        devices.insert(AudioDevice::WIRED_HEADSET, "", "hs");
        devices.insert(AudioDevice::IN_BLUETOOTH_SCO_HEADSET, "AA", "sco in");
        assert!(devices.is_last_noisy_device(AudioDevice::WIRED_HEADSET));

        devices.insert(AudioDevice::BLUETOOTH_A2DP, "AA", "bt");
        assert!(!devices.is_last_noisy_device(AudioDevice::WIRED_HEADSET));
        assert!(!devices.is_last_noisy_device(AudioDevice::EARPIECE));
    }

    #[test]
    fn test_device_key_format() {
        assert_eq!(device_key(AudioDevice::WIRED_HEADSET, ""), "0x4:");
        assert_eq!(device_key(AudioDevice::BLUETOOTH_A2DP, "AA"), "0x80:AA");
    }
}
