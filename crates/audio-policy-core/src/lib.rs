//! # Audio Policy Core
//!
//! Policy engine of an audio service: per-stream volume indices with
//! stream aliasing, ringer mode, client-counted mutes, a safe headset
//! volume ceiling, audio mode ownership, Bluetooth SCO link management and
//! device connection bookkeeping.
//!
//! The engine decides; it does not play audio. Everything it needs from
//! the platform (native audio system, Bluetooth headset profile, settings,
//! permissions, sound effects) sits behind the traits in [`system`], with
//! in-memory implementations for tests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use audio_policy_core::prelude::*;
//! use audio_policy_core::system::MockCollaborators;
//!
//! #[tokio::main]
//! async fn main() -> audio_policy_core::Result<()> {
//!     let mocks = MockCollaborators::new();
//!     let service = AudioService::start(AudioPolicyConfig::voice(), mocks.collaborators()).await?;
//!
//!     let caller = Caller::new(1234, 10050, "com.example.dialer");
//!     service
//!         .adjust_stream_volume(StreamType::Ring, AdjustDirection::Lower, VolumeFlags::ALLOW_RINGER_MODES, &caller)
//!         .await?;
//!     println!("ringer mode: {:?}", service.ringer_mode());
//!
//!     service.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`volume`], [`ringer`], [`safe_volume`], [`mode`], [`sco`]: state
//!   machines behind their own locks, returning the side effects to run
//! - [`worker`]: the serial queue those side effects go through
//! - [`service`]: the facade tying models, worker and collaborators together
//! - [`events`]: broadcast notifications for observers

pub mod config;
pub mod error;
pub mod events;
pub mod lifetime;
pub mod logging;
pub mod mode;
pub mod ringer;
pub mod routing;
pub mod safe_volume;
pub mod sco;
pub mod service;
pub mod system;
pub mod types;
pub mod volume;
pub mod worker;

// Re-export main types
pub use config::{AudioPolicyConfig, PlatformType, SafeMediaVolumeConfig, SoundEffectsConfig};
pub use error::{AudioPolicyError, Result};
pub use events::AudioEvent;
pub use service::AudioService;
pub use types::{
    AdjustDirection, AudioDevice, AudioMode, Caller, ClientToken, ConnectionState, ForceConfig, ForceUsage,
    ModeOutcome, RingerMode, StreamType, VolumeFlags, VolumeOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports for hosts of the service
pub mod prelude {
    pub use crate::config::{AudioPolicyConfig, PlatformType};
    pub use crate::error::{AudioPolicyError, Result};
    pub use crate::events::AudioEvent;
    pub use crate::ringer::{VibrateSetting, VibrateType};
    pub use crate::safe_volume::SafeMediaVolumeState;
    pub use crate::sco::{ScoAudioState, ScoState};
    pub use crate::service::AudioService;
    pub use crate::system::{BluetoothDevice, Collaborators, HeadsetAudioState};
    pub use crate::types::{
        AdjustDirection, AudioDevice, AudioMode, Caller, ClientToken, ConnectionState, ModeOutcome, RingerMode,
        StreamType, VolumeFlags, VolumeOutcome,
    };
}
