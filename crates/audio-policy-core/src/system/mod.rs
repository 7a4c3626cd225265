//! External collaborators of the audio service
//!
//! The native mixer, the Bluetooth headset profile, persisted settings,
//! permission checks and sound effect assets all sit behind traits so the
//! service can run against real platform bindings or the in-memory
//! implementations in [`mock`].

pub mod audio_system;
pub mod bluetooth;
pub mod effects;
pub mod mock;
pub mod permissions;
pub mod settings;

use std::sync::Arc;

pub use audio_system::{AudioSystem, NativeError, NativeResult};
pub use bluetooth::{
    BluetoothClass, BluetoothDevice, BluetoothHeadset, BluetoothProfileConnector, HeadsetAudioState, HeadsetKind,
};
pub use effects::{MockSoundEffects, SoundEffectsLoader};
pub use mock::{HeadsetCall, MockAudioSystem, MockBluetoothHeadset, MockProfileConnector, NativeCall};
pub use permissions::{PermissionChecker, StaticPermissions};
pub use settings::{InMemorySettings, SettingsStore};

/// Every collaborator the service talks to
#[derive(Clone)]
pub struct Collaborators {
    pub audio_system: Arc<dyn AudioSystem>,
    pub headset: Arc<dyn BluetoothHeadset>,
    pub profile_connector: Arc<dyn BluetoothProfileConnector>,
    pub settings: Arc<dyn SettingsStore>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub sound_effects: Arc<dyn SoundEffectsLoader>,
}

/// Collaborators backed by the in-memory implementations, with typed
/// handles kept for inspection
#[derive(Clone)]
pub struct MockCollaborators {
    pub audio_system: Arc<MockAudioSystem>,
    pub headset: Arc<MockBluetoothHeadset>,
    pub profile_connector: Arc<MockProfileConnector>,
    pub settings: Arc<InMemorySettings>,
    pub permissions: Arc<StaticPermissions>,
    pub sound_effects: Arc<MockSoundEffects>,
}

impl MockCollaborators {
    pub fn new() -> Self {
        Self::with_settings(InMemorySettings::new())
    }

    pub fn with_settings(settings: InMemorySettings) -> Self {
        Self {
            audio_system: Arc::new(MockAudioSystem::new()),
            headset: Arc::new(MockBluetoothHeadset::new()),
            profile_connector: Arc::new(MockProfileConnector::new()),
            settings: Arc::new(settings),
            permissions: Arc::new(StaticPermissions::allow_all()),
            sound_effects: Arc::new(MockSoundEffects::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            audio_system: self.audio_system.clone(),
            headset: self.headset.clone(),
            profile_connector: self.profile_connector.clone(),
            settings: self.settings.clone(),
            permissions: self.permissions.clone(),
            sound_effects: self.sound_effects.clone(),
        }
    }
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self::new()
    }
}
