//! Bluetooth SCO connection state machine
//!
//! ```text
//!                 start (proxy ready)          headset reports
//!   INACTIVE ─────────────────────────► ACTIVE_INTERNAL ──disconnected──► INACTIVE
//!     │  ▲  start (no proxy)                 ▲    │ stop (no proxy)
//!     │  │                                   │    ▼
//!     │  └──timeout── ACTIVATE_REQ ──proxy───┘  DEACTIVATE_REQ
//!     │
//!     └── headset audio up ──► ACTIVE_EXTERNAL ──stop VR (no proxy)──► DEACTIVATE_EXT_REQ
//! ```
//!
//! Clients are reference counted per [`ClientToken`]. Only the first start
//! and the last stop across all clients reach the headset. Every method
//! runs under one lock and returns the [`ScoAction`]s the caller must carry
//! out once the lock is released; results of those calls come back through
//! [`ScoConnectionManager::on_request_failed`] and the headset
//! notifications.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mode::ModeOwnerRegistry;
use crate::system::settings::BLUETOOTH_SCO_CHANNEL_PREFIX;
use crate::system::{BluetoothDevice, HeadsetAudioState, SettingsStore};
use crate::types::ClientToken;

/// First SDK level that may use raw SCO
pub const JELLY_BEAN_MR2_SDK: u32 = 18;

/// Internal connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoState {
    Inactive,
    /// Start requested, waiting for the headset proxy
    ActivateReq,
    /// Started by a client of this service
    ActiveInternal,
    /// Started by the headset itself
    ActiveExternal,
    /// Stop requested, waiting for the headset proxy
    DeactivateReq,
    /// Stop of an external link requested, waiting for the headset proxy
    DeactivateExtReq,
}

/// How the SCO link is brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoAudioMode {
    Undefined = -1,
    VirtualCall = 0,
    Raw = 1,
    Vr = 2,
}

impl ScoAudioMode {
    pub fn from_raw(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::VirtualCall),
            1 => Some(Self::Raw),
            2 => Some(Self::Vr),
            _ => None,
        }
    }

    /// Mode requested by a plain start from an app targeting `sdk`
    pub fn for_target_sdk(sdk: u32) -> Self {
        if sdk < JELLY_BEAN_MR2_SDK {
            Self::VirtualCall
        } else {
            Self::Undefined
        }
    }
}

/// SCO state as broadcast to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoAudioState {
    Error = -1,
    Disconnected = 0,
    Connected = 1,
    Connecting = 2,
}

/// What to do when a headset request is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoFailure {
    /// Back to INACTIVE and broadcast DISCONNECTED
    Revert,
    /// Full reset through the connect-failed path
    Reset,
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoAction {
    Broadcast(ScoAudioState),
    Start {
        mode: ScoAudioMode,
        device: BluetoothDevice,
        on_failure: ScoFailure,
    },
    Stop {
        mode: ScoAudioMode,
        device: BluetoothDevice,
        on_failure: ScoFailure,
    },
    /// Tear down a headset-initiated link; a refusal resets SCO
    StopVoiceRecognition {
        device: BluetoothDevice,
    },
    /// Ask for the headset proxy and arm the connect timeout
    AcquireProxy,
    /// Run the connect-failed reset without delay
    ConnectFailed,
}

/// Collaborators consulted while deciding
#[derive(Clone, Copy)]
pub struct ScoEnv<'a> {
    pub modes: &'a ModeOwnerRegistry,
    pub settings: &'a dyn SettingsStore,
}

/// A client holding SCO starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoClient {
    pub token: ClientToken,
    pub pid: u32,
    pub start_count: u32,
}

/// Actions plus the clients that no longer hold any start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoUpdate {
    pub actions: Vec<ScoAction>,
    pub released: Vec<ClientToken>,
}

impl ScoUpdate {
    fn from_actions(actions: Vec<ScoAction>) -> Self {
        Self {
            actions,
            released: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct ScoInner {
    clients: Vec<ScoClient>,
    state: ScoState,
    mode: ScoAudioMode,
    headset_device: Option<BluetoothDevice>,
    proxy_available: bool,
    headset_audio: HeadsetAudioState,
}

impl ScoInner {
    fn total_count(&self) -> u32 {
        self.clients.iter().map(|c| c.start_count).sum()
    }

    /// Promote to ACTIVE_EXTERNAL when the headset has audio we did not start
    fn check_audio_state(&mut self) {
        if self.proxy_available
            && self.headset_device.is_some()
            && self.state == ScoState::Inactive
            && self.headset_audio != HeadsetAudioState::Disconnected
        {
            debug!("external SCO audio detected");
            self.state = ScoState::ActiveExternal;
        }
    }

    fn resolve_mode(&self, requested: ScoAudioMode, settings: &dyn SettingsStore) -> ScoAudioMode {
        let mut mode = requested;
        if mode == ScoAudioMode::Undefined {
            mode = match &self.headset_device {
                Some(device) => settings
                    .get_int(&format!("{BLUETOOTH_SCO_CHANNEL_PREFIX}{}", device.address))
                    .map(|raw| ScoAudioMode::from_raw(raw).unwrap_or(ScoAudioMode::VirtualCall))
                    .unwrap_or(ScoAudioMode::VirtualCall),
                None => ScoAudioMode::Raw,
            };
        }
        let needs_virtual_call = self
            .headset_device
            .as_ref()
            .and_then(|d| d.class)
            .is_some_and(|c| c.needs_virtual_call());
        if needs_virtual_call {
            mode = ScoAudioMode::VirtualCall;
        }
        mode
    }

    /// Turn a count crossing into a hardware request
    fn request_state(&mut self, connect: bool, pid: u32, mode: ScoAudioMode, env: ScoEnv<'_>) -> Vec<ScoAction> {
        self.check_audio_state();
        let mut actions = Vec::new();
        if self.total_count() != 0 {
            return actions;
        }
        if connect {
            actions.push(ScoAction::Broadcast(ScoAudioState::Connecting));
            let owner_allows = env.modes.head_pid().is_none_or(|owner| owner == pid);
            match self.state {
                ScoState::Inactive if owner_allows => {
                    self.mode = self.resolve_mode(mode, env.settings);
                    match (&self.headset_device, self.proxy_available) {
                        (Some(device), true) => {
                            self.state = ScoState::ActiveInternal;
                            actions.push(ScoAction::Start {
                                mode: self.mode,
                                device: device.clone(),
                                on_failure: ScoFailure::Revert,
                            });
                        }
                        _ => {
                            self.state = ScoState::ActivateReq;
                            actions.push(ScoAction::AcquireProxy);
                        }
                    }
                }
                ScoState::DeactivateReq if owner_allows => {
                    self.state = ScoState::ActiveInternal;
                    actions.push(ScoAction::Broadcast(ScoAudioState::Connected));
                }
                _ => {
                    debug!(state = ?self.state, pid, "SCO start refused");
                    actions.push(ScoAction::Broadcast(ScoAudioState::Disconnected));
                }
            }
        } else {
            match self.state {
                ScoState::ActiveInternal => match (&self.headset_device, self.proxy_available) {
                    (Some(device), true) => actions.push(ScoAction::Stop {
                        mode: self.mode,
                        device: device.clone(),
                        on_failure: ScoFailure::Revert,
                    }),
                    _ => {
                        self.state = ScoState::DeactivateReq;
                        actions.push(ScoAction::AcquireProxy);
                    }
                },
                ScoState::ActivateReq => {
                    self.state = ScoState::Inactive;
                    actions.push(ScoAction::Broadcast(ScoAudioState::Disconnected));
                }
                _ => {}
            }
        }
        actions
    }

    /// Zero every client except those of `except_pid`
    fn clear_all(&mut self, except_pid: Option<u32>, stop: bool, env: ScoEnv<'_>) -> ScoUpdate {
        let mut update = ScoUpdate::default();
        for i in 0..self.clients.len() {
            let client = self.clients[i];
            if Some(client.pid) == except_pid {
                continue;
            }
            if client.start_count > 0 {
                self.clients[i].start_count = 0;
                if stop {
                    update
                        .actions
                        .extend(self.request_state(false, client.pid, ScoAudioMode::Undefined, env));
                }
            }
            update.released.push(client.token);
        }
        self.clients.retain(|c| Some(c.pid) == except_pid);
        update
    }
}

/// SCO clients and connection state behind one lock
pub struct ScoConnectionManager {
    inner: Mutex<ScoInner>,
}

impl Default for ScoConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoConnectionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ScoInner {
                clients: Vec::new(),
                state: ScoState::Inactive,
                mode: ScoAudioMode::Undefined,
                headset_device: None,
                proxy_available: false,
                headset_audio: HeadsetAudioState::Disconnected,
            }),
        }
    }

    pub fn state(&self) -> ScoState {
        self.inner.lock().state
    }

    pub fn audio_mode(&self) -> ScoAudioMode {
        self.inner.lock().mode
    }

    pub fn total_count(&self) -> u32 {
        self.inner.lock().total_count()
    }

    pub fn clients(&self) -> Vec<ScoClient> {
        self.inner.lock().clients.clone()
    }

    pub fn has_client(&self, token: &ClientToken) -> bool {
        self.inner.lock().clients.iter().any(|c| c.token == *token)
    }

    pub fn start_count(&self, token: &ClientToken) -> u32 {
        self.inner
            .lock()
            .clients
            .iter()
            .find(|c| c.token == *token)
            .map(|c| c.start_count)
            .unwrap_or(0)
    }

    pub fn headset_device(&self) -> Option<BluetoothDevice> {
        self.inner.lock().headset_device.clone()
    }

    pub fn is_proxy_available(&self) -> bool {
        self.inner.lock().proxy_available
    }

    /// One more start from `token`
    ///
    /// The hardware is asked for a connection only when the total count
    /// across all clients goes from zero to one.
    pub fn start(&self, token: ClientToken, pid: u32, mode: ScoAudioMode, env: ScoEnv<'_>) -> Vec<ScoAction> {
        let mut inner = self.inner.lock();
        let position = match inner.clients.iter().position(|c| c.token == token) {
            Some(p) => p,
            None => {
                inner.clients.push(ScoClient {
                    token,
                    pid,
                    start_count: 0,
                });
                inner.clients.len() - 1
            }
        };
        let creator = inner.clients[position].pid;
        let actions = inner.request_state(true, creator, mode, env);
        inner.clients[position].start_count += 1;
        debug!(%token, count = inner.clients[position].start_count, state = ?inner.state, "SCO start");
        actions
    }

    /// One less start from `token`
    ///
    /// Hardware stop happens only when the last start across all clients
    /// is released.
    pub fn stop(&self, token: ClientToken, env: ScoEnv<'_>) -> ScoUpdate {
        let mut inner = self.inner.lock();
        let Some(position) = inner.clients.iter().position(|c| c.token == token) else {
            debug!(%token, "SCO stop from unknown client");
            return ScoUpdate::default();
        };
        let client = inner.clients[position];
        if client.start_count == 0 {
            warn!(%token, pid = client.pid, "SCO stop with no matching start");
            return ScoUpdate::default();
        }
        inner.clients[position].start_count -= 1;
        let mut update = ScoUpdate::default();
        if inner.clients[position].start_count == 0 {
            inner.clients.remove(position);
            update.released.push(token);
            update.actions = inner.request_state(false, client.pid, ScoAudioMode::Undefined, env);
        }
        debug!(%token, state = ?inner.state, "SCO stop");
        update
    }

    /// The peer behind `token` died: drop all its starts
    pub fn client_died(&self, token: ClientToken, env: ScoEnv<'_>) -> ScoUpdate {
        let mut inner = self.inner.lock();
        let Some(position) = inner.clients.iter().position(|c| c.token == token) else {
            return ScoUpdate::default();
        };
        let client = inner.clients.remove(position);
        warn!(%token, pid = client.pid, count = client.start_count, "SCO client died");
        let mut update = ScoUpdate::default();
        update.released.push(token);
        if client.start_count > 0 {
            update.actions = inner.request_state(false, client.pid, ScoAudioMode::Undefined, env);
        }
        update
    }

    /// Drop every client except those of `except_pid`, optionally stopping
    /// the link
    pub fn clear_all_clients(&self, except_pid: Option<u32>, stop: bool, env: ScoEnv<'_>) -> ScoUpdate {
        self.inner.lock().clear_all(except_pid, stop, env)
    }

    /// A start or stop request to the headset was refused
    pub fn on_request_failed(&self) -> Vec<ScoAction> {
        let mut inner = self.inner.lock();
        warn!(state = ?inner.state, "headset refused SCO request");
        inner.state = ScoState::Inactive;
        vec![ScoAction::Broadcast(ScoAudioState::Disconnected)]
    }

    /// Connect timeout or unrecoverable failure: back to a clean INACTIVE
    pub fn reset(&self, env: ScoEnv<'_>) -> ScoUpdate {
        let mut inner = self.inner.lock();
        let mut update = inner.clear_all(None, false, env);
        inner.state = ScoState::Inactive;
        update.actions.push(ScoAction::Broadcast(ScoAudioState::Disconnected));
        info!("SCO reset");
        update
    }

    /// Release SCO held by anyone but the new mode owner
    pub fn disconnect_for_mode_owner(&self, except_pid: u32, env: ScoEnv<'_>) -> ScoUpdate {
        let mut inner = self.inner.lock();
        inner.check_audio_state();
        match inner.state {
            ScoState::ActiveExternal | ScoState::DeactivateExtReq => {
                let mut actions = Vec::new();
                if let Some(device) = inner.headset_device.clone() {
                    if inner.proxy_available {
                        actions.push(ScoAction::StopVoiceRecognition { device });
                    } else if inner.state == ScoState::ActiveExternal {
                        inner.state = ScoState::DeactivateExtReq;
                        actions.push(ScoAction::AcquireProxy);
                    }
                }
                ScoUpdate::from_actions(actions)
            }
            _ => inner.clear_all(Some(except_pid), true, env),
        }
    }

    /// The headset proxy is available
    ///
    /// Completes a pending start or stop. A pending request with no
    /// connected headset fails through the reset path.
    pub fn on_headset_service_connected(
        &self,
        device: Option<BluetoothDevice>,
        audio_state: HeadsetAudioState,
    ) -> Vec<ScoAction> {
        let mut inner = self.inner.lock();
        inner.proxy_available = true;
        inner.headset_device = device;
        inner.headset_audio = audio_state;
        inner.check_audio_state();

        let pending = matches!(
            inner.state,
            ScoState::ActivateReq | ScoState::DeactivateReq | ScoState::DeactivateExtReq
        );
        if !pending {
            return Vec::new();
        }
        let Some(device) = inner.headset_device.clone() else {
            return vec![ScoAction::ConnectFailed];
        };
        info!(state = ?inner.state, "completing pending SCO request");
        let action = match inner.state {
            ScoState::ActivateReq => {
                inner.state = ScoState::ActiveInternal;
                ScoAction::Start {
                    mode: inner.mode,
                    device,
                    on_failure: ScoFailure::Reset,
                }
            }
            ScoState::DeactivateReq => ScoAction::Stop {
                mode: inner.mode,
                device,
                on_failure: ScoFailure::Reset,
            },
            _ => ScoAction::StopVoiceRecognition { device },
        };
        vec![action]
    }

    pub fn on_headset_service_disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.proxy_available = false;
        inner.headset_device = None;
    }

    /// Track the active SCO headset; `None` on disconnect
    pub fn set_headset_device(&self, device: Option<BluetoothDevice>) {
        self.inner.lock().headset_device = device;
    }

    /// Audio link state reported by the headset
    ///
    /// Returns the state to broadcast, if the link was requested by a
    /// client of this service.
    pub fn on_headset_audio_state(&self, audio: HeadsetAudioState, env: ScoEnv<'_>) -> ScoUpdate {
        let mut inner = self.inner.lock();
        inner.headset_audio = audio;
        let broadcast = !inner.clients.is_empty()
            && matches!(
                inner.state,
                ScoState::ActiveInternal | ScoState::ActivateReq | ScoState::DeactivateReq
            );
        let keeps_internal = matches!(
            inner.state,
            ScoState::ActiveInternal | ScoState::DeactivateReq | ScoState::DeactivateExtReq
        );
        let mut update = ScoUpdate::default();
        match audio {
            HeadsetAudioState::Connected => {
                if !keeps_internal {
                    inner.state = ScoState::ActiveExternal;
                }
                if broadcast {
                    update.actions.push(ScoAction::Broadcast(ScoAudioState::Connected));
                }
            }
            HeadsetAudioState::Disconnected => {
                inner.state = ScoState::Inactive;
                update = inner.clear_all(None, false, env);
                if broadcast {
                    update.actions.push(ScoAction::Broadcast(ScoAudioState::Disconnected));
                }
            }
            HeadsetAudioState::Connecting => {
                if !keeps_internal {
                    inner.state = ScoState::ActiveExternal;
                }
            }
        }
        debug!(?audio, state = ?inner.state, broadcast, "headset audio state");
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{BluetoothClass, HeadsetKind, InMemorySettings};

    fn headset() -> BluetoothDevice {
        BluetoothDevice::new("00:11:22:33:44:55", "headset")
    }

    fn ready_manager() -> ScoConnectionManager {
        let sco = ScoConnectionManager::new();
        sco.on_headset_service_connected(Some(headset()), HeadsetAudioState::Disconnected);
        sco
    }

    fn starts(actions: &[ScoAction]) -> usize {
        actions.iter().filter(|a| matches!(a, ScoAction::Start { .. })).count()
    }

    fn stops(actions: &[ScoAction]) -> usize {
        actions.iter().filter(|a| matches!(a, ScoAction::Stop { .. })).count()
    }

    #[test]
    fn test_only_first_start_and_last_stop_reach_hardware() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();
        let a = ClientToken::new();
        let b = ClientToken::new();

        let first = sco.start(a, 100, ScoAudioMode::Undefined, env);
        assert_eq!(starts(&first), 1);
        assert_eq!(first[0], ScoAction::Broadcast(ScoAudioState::Connecting));
        assert_eq!(sco.state(), ScoState::ActiveInternal);

        assert!(sco.start(b, 200, ScoAudioMode::Undefined, env).is_empty());
        assert!(sco.start(a, 100, ScoAudioMode::Undefined, env).is_empty());
        assert_eq!(sco.total_count(), 3);

        assert!(sco.stop(a, env).actions.is_empty());
        assert!(sco.stop(b, env).actions.is_empty());
        let last = sco.stop(a, env);
        assert_eq!(stops(&last.actions), 1);
        assert_eq!(last.released, vec![a]);
        assert_eq!(sco.total_count(), 0);
    }

    #[test]
    fn test_start_refused_for_non_owner() {
        let modes = ModeOwnerRegistry::new();
        let owner = modes.prepare(crate::types::AudioMode::InCommunication, ClientToken::new(), 42);
        modes.commit(owner.mode);
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();

        let actions = sco.start(ClientToken::new(), 7, ScoAudioMode::Undefined, env);
        assert_eq!(
            actions,
            vec![
                ScoAction::Broadcast(ScoAudioState::Connecting),
                ScoAction::Broadcast(ScoAudioState::Disconnected),
            ]
        );
        assert_eq!(sco.state(), ScoState::Inactive);

        let actions = sco.start(ClientToken::new(), 42, ScoAudioMode::Undefined, env);
        assert!(actions.is_empty(), "count already non-zero from the refused client");
    }

    #[test]
    fn test_start_without_proxy_defers() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ScoConnectionManager::new();

        let actions = sco.start(ClientToken::new(), 1, ScoAudioMode::Undefined, env);
        assert!(actions.contains(&ScoAction::AcquireProxy));
        assert_eq!(sco.state(), ScoState::ActivateReq);
        // no headset known yet
        assert_eq!(sco.audio_mode(), ScoAudioMode::Raw);

        let actions = sco.on_headset_service_connected(Some(headset()), HeadsetAudioState::Disconnected);
        assert!(matches!(
            actions.as_slice(),
            [ScoAction::Start { on_failure: ScoFailure::Reset, .. }]
        ));
        assert_eq!(sco.state(), ScoState::ActiveInternal);
    }

    #[test]
    fn test_pending_request_without_headset_fails() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ScoConnectionManager::new();
        sco.start(ClientToken::new(), 1, ScoAudioMode::Undefined, env);

        let actions = sco.on_headset_service_connected(None, HeadsetAudioState::Disconnected);
        assert_eq!(actions, vec![ScoAction::ConnectFailed]);

        let update = sco.reset(env);
        assert_eq!(update.released.len(), 1);
        assert_eq!(sco.state(), ScoState::Inactive);
        assert_eq!(sco.total_count(), 0);
    }

    #[test]
    fn test_mode_from_headset_setting_and_class() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::with_values([("bluetooth_sco_channel_00:11:22:33:44:55", 1)]);
        let env = ScoEnv { modes: &modes, settings: &settings };

        let sco = ready_manager();
        sco.start(ClientToken::new(), 1, ScoAudioMode::Undefined, env);
        assert_eq!(sco.audio_mode(), ScoAudioMode::Raw);

        let sco = ScoConnectionManager::new();
        let handsfree = headset().with_class(BluetoothClass::new(HeadsetKind::Handsfree).with_object_transfer());
        sco.on_headset_service_connected(Some(handsfree), HeadsetAudioState::Disconnected);
        sco.start(ClientToken::new(), 1, ScoAudioMode::Undefined, env);
        assert_eq!(sco.audio_mode(), ScoAudioMode::VirtualCall);
    }

    #[test]
    fn test_invalid_channel_setting_falls_back_to_virtual_call() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::with_values([("bluetooth_sco_channel_00:11:22:33:44:55", 9)]);
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();
        sco.start(ClientToken::new(), 1, ScoAudioMode::Undefined, env);
        assert_eq!(sco.audio_mode(), ScoAudioMode::VirtualCall);
    }

    #[test]
    fn test_start_failure_reverts() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();
        sco.start(ClientToken::new(), 1, ScoAudioMode::VirtualCall, env);
        assert_eq!(sco.state(), ScoState::ActiveInternal);
        assert_eq!(
            sco.on_request_failed(),
            vec![ScoAction::Broadcast(ScoAudioState::Disconnected)]
        );
        assert_eq!(sco.state(), ScoState::Inactive);
    }

    #[test]
    fn test_external_audio_and_disconnect_clears_clients() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();

        // headset-initiated link, no clients: nothing to broadcast
        let update = sco.on_headset_audio_state(HeadsetAudioState::Connected, env);
        assert!(update.actions.is_empty());
        assert_eq!(sco.state(), ScoState::ActiveExternal);

        let update = sco.disconnect_for_mode_owner(5, env);
        assert!(matches!(
            update.actions.as_slice(),
            [ScoAction::StopVoiceRecognition { .. }]
        ));

        sco.on_headset_audio_state(HeadsetAudioState::Disconnected, env);
        assert_eq!(sco.state(), ScoState::Inactive);

        let a = ClientToken::new();
        sco.start(a, 1, ScoAudioMode::Undefined, env);
        let update = sco.on_headset_audio_state(HeadsetAudioState::Connected, env);
        assert_eq!(update.actions, vec![ScoAction::Broadcast(ScoAudioState::Connected)]);
        assert_eq!(sco.state(), ScoState::ActiveInternal);

        let update = sco.on_headset_audio_state(HeadsetAudioState::Disconnected, env);
        assert_eq!(update.actions, vec![ScoAction::Broadcast(ScoAudioState::Disconnected)]);
        assert_eq!(update.released, vec![a]);
        assert_eq!(sco.total_count(), 0);
    }

    #[test]
    fn test_connecting_is_never_broadcast() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();
        sco.start(ClientToken::new(), 1, ScoAudioMode::Undefined, env);
        let update = sco.on_headset_audio_state(HeadsetAudioState::Connecting, env);
        assert!(update.actions.is_empty());
        assert_eq!(sco.state(), ScoState::ActiveInternal);
    }

    #[test]
    fn test_mode_owner_keeps_its_sco() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();
        let owner = ClientToken::new();
        let other = ClientToken::new();
        sco.start(owner, 1, ScoAudioMode::Undefined, env);
        sco.start(other, 2, ScoAudioMode::Undefined, env);

        let update = sco.disconnect_for_mode_owner(1, env);
        assert_eq!(update.released, vec![other]);
        assert!(update.actions.is_empty(), "owner still holds a start");
        assert!(sco.has_client(&owner));
        assert_eq!(sco.total_count(), 1);
    }

    #[test]
    fn test_client_death_stops_last_start() {
        let modes = ModeOwnerRegistry::new();
        let settings = InMemorySettings::new();
        let env = ScoEnv { modes: &modes, settings: &settings };
        let sco = ready_manager();
        let a = ClientToken::new();
        sco.start(a, 1, ScoAudioMode::Undefined, env);
        sco.start(a, 1, ScoAudioMode::Undefined, env);

        let update = sco.client_died(a, env);
        assert_eq!(stops(&update.actions), 1);
        assert!(!sco.has_client(&a));
        assert!(sco.client_died(a, env).actions.is_empty());
    }
}
