//! Shared setup for the service integration tests

#![allow(dead_code)]

use audio_policy_core::events::AudioEvent;
use audio_policy_core::prelude::*;
use audio_policy_core::system::{BluetoothClass, HeadsetKind, MockCollaborators};
use tokio::sync::broadcast;

pub struct Harness {
    pub mocks: MockCollaborators,
    pub service: AudioService,
}

impl Harness {
    pub async fn start(config: AudioPolicyConfig) -> Self {
        Self::with_mocks(config, MockCollaborators::new()).await
    }

    pub async fn with_mocks(config: AudioPolicyConfig, mocks: MockCollaborators) -> Self {
        let service = AudioService::start(config, mocks.collaborators())
            .await
            .expect("service starts");
        service.settle().await.expect("initial commands run");
        Self { mocks, service }
    }

    pub async fn voice() -> Self {
        Self::start(AudioPolicyConfig::voice()).await
    }

    pub async fn settle(&self) {
        self.service.settle().await.expect("worker running");
    }

    /// Connect a wired headset and wait until routing follows it
    pub async fn plug_headset(&self) {
        self.service
            .set_wired_device_connection_state(AudioDevice::WIRED_HEADSET, ConnectionState::Connected, "Headset")
            .expect("wired connect accepted");
        self.settle().await;
    }

    /// Make the headset profile available with one connected headset
    pub async fn connect_headset_profile(&self) -> BluetoothDevice {
        let device = headset_device();
        self.mocks.headset.set_devices(vec![device.clone()]);
        self.service
            .on_headset_service_connected()
            .await
            .expect("proxy connected");
        self.settle().await;
        device
    }
}

pub fn caller(pid: u32) -> Caller {
    Caller::new(pid, 10_000 + pid, format!("com.example.app{pid}"))
}

pub fn headset_device() -> BluetoothDevice {
    BluetoothDevice::new("00:11:22:AA:BB:CC", "Car Kit").with_class(BluetoothClass::new(HeadsetKind::WearableHeadset))
}

/// Everything currently buffered on an event subscription
pub fn drain(rx: &mut broadcast::Receiver<AudioEvent>) -> Vec<AudioEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
