//! Outward notifications of the audio service
//!
//! Observers subscribe through [`crate::service::AudioService::subscribe`]
//! and receive every [`AudioEvent`] in the order the worker produced it.
//! Events are fire-and-forget: a slow or missing observer never blocks the
//! service.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ringer::{VibrateSetting, VibrateType};
use crate::sco::ScoAudioState;
use crate::types::{AudioDevice, AudioMode, ConnectionState, RingerMode, StreamType};

/// Notification emitted by the audio service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioEvent {
    /// User-visible volume of a stream moved
    VolumeChanged {
        stream: StreamType,
        alias: StreamType,
        device: AudioDevice,
        previous_volume: u32,
        volume: u32,
    },
    StreamMuteChanged {
        stream: StreamType,
        muted: bool,
    },
    RingerModeChanged {
        mode: RingerMode,
    },
    MasterVolumeChanged {
        previous: u32,
        volume: u32,
    },
    MasterMuteChanged {
        muted: bool,
    },
    ScoAudioStateUpdated {
        state: ScoAudioState,
        previous: ScoAudioState,
    },
    /// Last noisy-capable output went away; players should pause
    AudioBecomingNoisy,
    A2dpRouteChanged {
        device: AudioDevice,
        state: ConnectionState,
    },
    DeviceConnectionChanged {
        device: AudioDevice,
        state: ConnectionState,
        address: String,
        name: String,
    },
    /// A music volume request is held back until acknowledged
    SafeVolumeWarning {
        stream: StreamType,
        volume: u32,
    },
    ModeChanged {
        mode: AudioMode,
        owner_pid: u32,
    },
    /// The audio system refused `requested`; the mode fell back to `mode`
    ModeRefused {
        requested: AudioMode,
        mode: AudioMode,
    },
    VibrateSettingChanged {
        vibrate_type: VibrateType,
        setting: VibrateSetting,
    },
}

/// Broadcast channel of [`AudioEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AudioEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.sender.subscribe()
    }

    /// Deliver to current subscribers, if any
    pub fn emit(&self, event: AudioEvent) {
        trace!(?event, "audio event");
        // no subscriber is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
