//! Bluetooth headset profile boundary

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Major audio/video class of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadsetKind {
    WearableHeadset,
    Handsfree,
    CarAudio,
    Other,
}

/// Class of device reported by the remote headset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BluetoothClass {
    pub kind: HeadsetKind,
    /// Object transfer service bit
    pub object_transfer: bool,
}

impl BluetoothClass {
    pub fn new(kind: HeadsetKind) -> Self {
        Self {
            kind,
            object_transfer: false,
        }
    }

    pub fn with_object_transfer(mut self) -> Self {
        self.object_transfer = true;
        self
    }

    /// Handsfree units that also advertise object transfer only work with
    /// virtual-call SCO
    pub fn needs_virtual_call(&self) -> bool {
        self.kind == HeadsetKind::Handsfree && self.object_transfer
    }
}

/// A remote Bluetooth headset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: String,
    pub class: Option<BluetoothClass>,
}

impl BluetoothDevice {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            class: None,
        }
    }

    pub fn with_class(mut self, class: BluetoothClass) -> Self {
        self.class = Some(class);
        self
    }

    /// `XX:XX:XX:XX:XX:XX` with upper-case hex digits
    pub fn has_valid_address(&self) -> bool {
        let parts: Vec<&str> = self.address.split(':').collect();
        parts.len() == 6
            && parts.iter().all(|p| {
                p.len() == 2 && p.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
            })
    }
}

/// Audio link state reported by the headset profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadsetAudioState {
    Disconnected,
    Connecting,
    Connected,
}

/// Headset profile proxy
///
/// Each call returns whether the request was accepted; the outcome arrives
/// later as a headset audio state notification.
#[async_trait]
pub trait BluetoothHeadset: Send + Sync {
    async fn connected_devices(&self) -> Vec<BluetoothDevice>;

    async fn audio_state(&self, device: &BluetoothDevice) -> HeadsetAudioState;

    async fn connect_audio(&self) -> bool;

    async fn disconnect_audio(&self) -> bool;

    async fn start_sco_using_virtual_voice_call(&self, device: &BluetoothDevice) -> bool;

    async fn stop_sco_using_virtual_voice_call(&self, device: &BluetoothDevice) -> bool;

    async fn start_voice_recognition(&self, device: &BluetoothDevice) -> bool;

    async fn stop_voice_recognition(&self, device: &BluetoothDevice) -> bool;
}

/// Source of the headset profile proxy
///
/// A successful request is completed later through
/// [`crate::service::AudioService::on_headset_service_connected`].
#[async_trait]
pub trait BluetoothProfileConnector: Send + Sync {
    async fn request_headset_proxy(&self) -> bool;
}
