//! Audio service facade
//!
//! [`AudioService`] owns every state machine of the crate and is the only
//! code that talks to the collaborators. Each public operation follows the
//! same shape:
//!
//! 1. validate the caller and gather routing inputs from the audio system
//! 2. update the lock-protected models (volume store, ringer, SCO, mode)
//! 3. queue the resulting side effects on the worker
//!
//! Native calls are never made while a model lock is held. The only lock
//! held across an await is the mode gate, which serializes mode changes
//! end to end.
//!
//! # Example
//!
//! ```no_run
//! use audio_policy_core::prelude::*;
//! use audio_policy_core::system::MockCollaborators;
//!
//! # async fn demo() -> audio_policy_core::Result<()> {
//! let mocks = MockCollaborators::new();
//! let service = AudioService::start(AudioPolicyConfig::voice(), mocks.collaborators()).await?;
//! let caller = Caller::new(1000, 10001, "com.example.player");
//! service
//!     .set_stream_volume(StreamType::Music, 10, VolumeFlags::NONE, &caller)
//!     .await?;
//! assert_eq!(service.get_stream_volume(StreamType::Music).await, 10);
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AudioPolicyConfig;
use crate::error::{AudioPolicyError, Result};
use crate::events::{AudioEvent, EventBus};
use crate::lifetime::{PeerLifetimeRegistry, PeerLinks};
use crate::mode::ModeOwnerRegistry;
use crate::ringer::{
    RingerCapabilities, RingerModePolicy, VibrateSetting, VibrateType, DEFAULT_MUTE_AFFECTED_STREAMS,
};
use crate::routing::{self, ActiveStreamInputs, ConnectedDevice, ConnectedDevices, STREAM_OVERRIDE_DELAY, WIRED_MEDIA_DEVICES};
use crate::safe_volume::{
    MusicActivity, PendingVolumeCommand, SafeMediaVolumeState, SafeTransition, SafeVolumeGuard,
    SAFE_MEDIA_VOLUME_DEVICES,
};
use crate::sco::{ScoAction, ScoAudioMode, ScoAudioState, ScoConnectionManager, ScoEnv, ScoFailure, ScoState, ScoUpdate};
use crate::system::settings::{self, volume_setting_key};
use crate::system::{BluetoothDevice, Collaborators, HeadsetAudioState, HeadsetKind, SettingsStore};
use crate::types::{
    AdjustDirection, AudioDevice, AudioMode, Caller, ClientToken, ConnectionState, ForceConfig, ForceUsage,
    ModeOutcome, Permission, RingerMode, StreamMask, StreamType, VolumeFlags, VolumeOutcome,
};
use crate::volume::{app_op_for_alias, AliasContext, AliasTable, MuteChange, StreamRoutes, VolumeIndexStore};
use crate::worker::{self, AudioCommand, CommandHandler, CommandKey, CommandQueue, EnqueuePolicy};

/// Maximum of the master volume, in percent
pub const MAX_MASTER_VOLUME: u32 = 100;

const A2DP_RESUME: &str = "A2dpSuspended=false";

#[derive(Debug, Clone, Copy)]
struct ForcedUse {
    communication: ForceConfig,
    a2dp_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
struct MasterState {
    volume: u32,
    muted: bool,
}

/// Where a mode change ended up
#[derive(Debug, Clone, Copy)]
struct ModeResolution {
    /// Non-normal owner, 0 when there is none
    owner_pid: u32,
    /// At least one candidate was refused on the way
    refused: bool,
}

struct ServiceInner {
    config: AudioPolicyConfig,
    collaborators: Collaborators,
    store: VolumeIndexStore,
    ringer: RingerModePolicy,
    safe_volume: SafeVolumeGuard,
    sco: ScoConnectionManager,
    modes: ModeOwnerRegistry,
    /// Held for the whole of a mode change, native calls included
    mode_gate: tokio::sync::Mutex<()>,
    peers: PeerLifetimeRegistry,
    devices: ConnectedDevices,
    events: EventBus,
    queue: CommandQueue,
    forced: Mutex<ForcedUse>,
    master: Mutex<MasterState>,
    last_sco_broadcast: Mutex<ScoAudioState>,
    /// Connection changes queued but not yet applied
    pending_connections: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if !self.queue.is_closed() {
            let _ = self.queue.post(AudioCommand::Shutdown);
            self.queue.close();
        }
    }
}

/// Handle to a running audio service
///
/// Cheap to clone; every clone drives the same service.
#[derive(Clone)]
pub struct AudioService {
    inner: Arc<ServiceInner>,
}

struct WorkerHandler {
    service: Weak<ServiceInner>,
}

#[async_trait]
impl CommandHandler for WorkerHandler {
    async fn handle(&self, command: AudioCommand) {
        match self.service.upgrade() {
            Some(inner) => AudioService { inner }.execute(command).await,
            None => debug!(key = ?command.key(), "audio service dropped, command discarded"),
        }
    }
}

impl AudioService {
    /// Load persisted state, spawn the worker and push the initial volumes
    pub async fn start(config: AudioPolicyConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let settings = collaborators.settings.clone();
        let read_mask = |key: &str| {
            settings
                .get_int(key)
                .and_then(|bits| u32::try_from(bits).ok())
                .map(StreamMask)
        };

        let ringer = RingerModePolicy::new(
            RingerCapabilities {
                platform: config.platform,
                has_vibrator: config.has_vibrator,
                voice_capable: config.voice_capable,
            },
            read_ringer_mode(settings.as_ref()).unwrap_or(RingerMode::Normal),
        );

        let aliases = AliasTable::resolve(AliasContext {
            platform: config.platform,
            in_communication: false,
            link_notification_with_ring: config.link_notification_with_ring,
            voice_capable: config.voice_capable,
        });
        let store = VolumeIndexStore::new(&config, aliases);
        load_persisted_volumes(&store, settings.as_ref(), config.camera_sound_forced);

        ringer.update_affected_streams(
            read_mask(settings::MODE_RINGER_STREAMS_AFFECTED),
            config.camera_sound_forced,
            aliases.alias(StreamType::Dtmf),
        );
        ringer.set_mute_affected_streams(
            read_mask(settings::MUTE_STREAMS_AFFECTED).unwrap_or(DEFAULT_MUTE_AFFECTED_STREAMS),
        );
        if let Some(bits) = settings.get_int(settings::VIBRATE_ON).and_then(|v| u32::try_from(v).ok()) {
            ringer.set_vibrate_setting_bits(bits);
        }

        let safe_state = settings
            .get_int(settings::AUDIO_SAFE_VOLUME_STATE)
            .and_then(SafeMediaVolumeState::from_raw)
            .unwrap_or(SafeMediaVolumeState::NotConfigured);
        let music_active_ms = settings
            .get_int(settings::UNSAFE_VOLUME_MUSIC_ACTIVE_MS)
            .and_then(|ms| u64::try_from(ms).ok())
            .unwrap_or(0);
        let safe_volume = SafeVolumeGuard::new(config.safe_media_volume.clone(), safe_state, music_active_ms);

        let master = MasterState {
            volume: settings
                .get_int(settings::VOLUME_MASTER)
                .map(|v| v.clamp(0, i64::from(MAX_MASTER_VOLUME)) as u32)
                .unwrap_or(MAX_MASTER_VOLUME),
            muted: settings.get_int(settings::VOLUME_MASTER_MUTE).is_some_and(|v| v != 0),
        };

        let (queue, receiver) = CommandQueue::channel();
        let events = EventBus::new(config.event_channel_capacity);
        let service = Self {
            inner: Arc::new(ServiceInner {
                config,
                collaborators,
                store,
                ringer,
                safe_volume,
                sco: ScoConnectionManager::new(),
                modes: ModeOwnerRegistry::new(),
                mode_gate: tokio::sync::Mutex::new(()),
                peers: PeerLifetimeRegistry::new(),
                devices: ConnectedDevices::new(),
                events,
                queue,
                forced: Mutex::new(ForcedUse {
                    communication: ForceConfig::None,
                    a2dp_enabled: true,
                }),
                master: Mutex::new(master),
                last_sco_broadcast: Mutex::new(ScoAudioState::Error),
                pending_connections: AtomicUsize::new(0),
                worker: Mutex::new(None),
            }),
        };

        let handler = Arc::new(WorkerHandler {
            service: Arc::downgrade(&service.inner),
        });
        let handle = worker::spawn_worker(receiver, handler);
        *service.inner.worker.lock() = Some(handle);

        service.initialize_streams().await?;
        info!(
            platform = ?service.inner.config.platform,
            ringer_mode = ?service.inner.ringer.mode(),
            safe_volume = ?service.inner.safe_volume.state(),
            "audio service started"
        );
        Ok(service)
    }

    async fn initialize_streams(&self) -> Result<()> {
        let inner = &*self.inner;
        for stream in StreamType::ALL {
            let max = inner.store.ui_max(stream) as i32;
            if let Err(e) = inner.collaborators.audio_system.init_stream_volume(stream, 0, max).await {
                warn!(%stream, error = %e, "init_stream_volume failed");
            }
        }
        self.apply_ringer_muting(false)?;
        let aliases = inner.store.alias_table();
        for stream in StreamType::ALL.into_iter().filter(|s| aliases.is_target(*s)) {
            self.post(AudioCommand::ApplyAllVolumes { stream })?;
        }
        self.post(AudioCommand::ApplyMasterVolume)?;
        self.post(AudioCommand::ApplyMasterMute)?;
        self.configure_safe_media_volume(true, 0)
    }

    /// Stop the worker after the commands already queued
    ///
    /// Calling it again is a no-op. Every later state-changing call fails
    /// with [`AudioPolicyError::ServiceStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &*self.inner;
        if inner.queue.is_closed() {
            return Ok(());
        }
        inner.queue.post(AudioCommand::Shutdown)?;
        inner.queue.close();
        let handle = inner.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "audio worker failed");
            }
        }
        info!("audio service stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.inner.queue.is_closed()
    }

    /// Wait until queued side effects have run
    pub async fn settle(&self) -> Result<()> {
        worker::settle(&self.inner.queue).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &AudioPolicyConfig {
        &self.inner.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.queue.is_closed() {
            return Err(AudioPolicyError::ServiceStopped);
        }
        Ok(())
    }

    fn post(&self, command: AudioCommand) -> Result<()> {
        self.inner.queue.post(command)
    }

    fn emit(&self, event: AudioEvent) -> Result<()> {
        self.post(AudioCommand::Emit(event))
    }

    fn sco_env(&self) -> ScoEnv<'_> {
        ScoEnv {
            modes: &self.inner.modes,
            settings: self.inner.collaborators.settings.as_ref(),
        }
    }

    /// Stream that carries the ringer-mode side of the volume keys
    fn master_stream_type(&self) -> StreamType {
        self.inner.store.alias_of(StreamType::System)
    }

    // ---- routing ----

    /// Output whose volume a stream shows
    pub async fn device_for_stream(&self, stream: StreamType) -> AudioDevice {
        let devices = self.inner.collaborators.audio_system.get_devices_for_stream(stream).await;
        let device = routing::select_device_for_stream(devices);
        if device.is_empty() {
            AudioDevice::DEFAULT
        } else {
            device
        }
    }

    async fn stream_routes(&self) -> StreamRoutes {
        let mut routes = StreamRoutes::uniform(AudioDevice::DEFAULT);
        for stream in StreamType::ALL {
            routes.set(stream, self.device_for_stream(stream).await);
        }
        routes
    }

    /// Stream the volume keys act on, given the caller's suggestion
    pub async fn active_stream_type(&self, suggested: Option<StreamType>) -> StreamType {
        let inner = &*self.inner;
        let system = &inner.collaborators.audio_system;
        let ring_active = system.is_stream_active(StreamType::Ring, STREAM_OVERRIDE_DELAY).await
            || system.is_stream_active(StreamType::Notification, STREAM_OVERRIDE_DELAY).await;
        let inputs = ActiveStreamInputs {
            platform: inner.config.platform,
            in_communication: inner.modes.mode().is_in_communication(),
            sco_forced: system.get_force_use(ForceUsage::Communication).await == ForceConfig::BtSco,
            music_active_recently: system.is_stream_active(StreamType::Music, STREAM_OVERRIDE_DELAY).await,
            music_active_now: system.is_stream_active(StreamType::Music, Duration::ZERO).await,
            ring_or_notification_active: ring_active,
            volume_keys_control_ring: inner.config.volume_keys_control_ring_stream,
            suggested,
        };
        routing::active_stream_type(inputs)
    }

    // ---- volume ----

    /// Move a stream's volume one step on its current output
    pub async fn adjust_stream_volume(
        &self,
        stream: StreamType,
        direction: AdjustDirection,
        flags: VolumeFlags,
        caller: &Caller,
    ) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        let inner = &*self.inner;
        let alias = inner.store.alias_of(stream);
        let device = self.device_for_stream(alias).await;
        if !inner.collaborators.permissions.check_app_op(app_op_for_alias(alias), caller) {
            debug!(%stream, package = %caller.package, "volume adjust refused by app op");
            return Ok(VolumeOutcome::PermissionDenied);
        }
        inner.safe_volume.clear_pending();

        let mut flags = flags.without(VolumeFlags::FIXED_VOLUME);
        let mut alias_index = inner.store.get_index(alias, device);
        let step = if alias == StreamType::Music && inner.config.fixed_volume_devices.intersects(device) {
            flags = flags | VolumeFlags::FIXED_VOLUME;
            let step = self.fixed_device_index(device);
            if alias_index != 0 {
                alias_index = step;
            }
            step
        } else {
            inner.store.rescale_between(10, stream, alias)
        };

        let mut outcome = VolumeOutcome::Unchanged;
        let mut adjust_volume = true;
        if flags.contains(VolumeFlags::ALLOW_RINGER_MODES) || alias == self.master_stream_type() {
            let (decision, previous) = inner.ringer.check_adjust(direction, alias_index, step);
            adjust_volume = decision.adjust_volume;
            if let Some(previous) = previous {
                info!(from = ?previous, to = ?decision.mode, "ringer mode changed by volume key");
                self.on_ringer_mode_changed(true)?;
                outcome = VolumeOutcome::Applied;
            }
        }

        let old_index = inner.store.get_index(stream, device);
        if adjust_volume && direction != AdjustDirection::Same {
            let target = alias_index + step;
            if direction == AdjustDirection::Raise && !inner.safe_volume.check_safe(alias, target, device) {
                warn!(%stream, %device, index = target, "volume above safe media level");
                self.emit(AudioEvent::SafeVolumeWarning {
                    stream,
                    volume: ((target + 5) / 10) as u32,
                })?;
                outcome = VolumeOutcome::SafeVolumeWarning;
            } else {
                let routes = self.stream_routes().await;
                let update = inner
                    .store
                    .adjust_index_routed(alias, direction.sign() * step, device, Some(&routes));
                if update.changed {
                    self.post(AudioCommand::ApplyDeviceVolume { stream: alias, device })?;
                    outcome = VolumeOutcome::Applied;
                }
            }
        }
        let index = inner.store.get_index(stream, device);
        self.send_volume_update(stream, alias, device, old_index, index)?;
        Ok(outcome)
    }

    /// Adjust whichever stream the volume keys currently control
    pub async fn adjust_suggested_stream_volume(
        &self,
        direction: AdjustDirection,
        suggested: Option<StreamType>,
        flags: VolumeFlags,
        caller: &Caller,
    ) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        let stream = self.active_stream_type(suggested).await;
        let flags = if stream == StreamType::Ring {
            flags
        } else {
            flags.without(VolumeFlags::PLAY_SOUND)
        };
        debug!(%stream, ?direction, "suggested stream volume");
        self.adjust_stream_volume(stream, direction, flags, caller).await
    }

    /// Set a stream's volume, in UI steps, on its current output
    pub async fn set_stream_volume(
        &self,
        stream: StreamType,
        index: u32,
        flags: VolumeFlags,
        caller: &Caller,
    ) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        let inner = &*self.inner;
        let alias = inner.store.alias_of(stream);
        let device = self.device_for_stream(stream).await;
        if !inner.collaborators.permissions.check_app_op(app_op_for_alias(alias), caller) {
            debug!(%stream, package = %caller.package, "set volume refused by app op");
            return Ok(VolumeOutcome::PermissionDenied);
        }
        inner.safe_volume.clear_pending();

        let old_index = inner.store.get_index(stream, device);
        let ui = index.min(inner.store.ui_max(stream)) as i32;
        let mut index = inner.store.rescale_between(ui * 10, stream, alias);
        let mut flags = flags.without(VolumeFlags::FIXED_VOLUME);
        if alias == StreamType::Music && inner.config.fixed_volume_devices.intersects(device) {
            flags = flags | VolumeFlags::FIXED_VOLUME;
            if index != 0 {
                index = self.fixed_device_index(device);
            }
        }

        let outcome = if inner.safe_volume.check_safe(alias, index, device) {
            self.on_set_stream_volume(alias, index, flags, device).await?
        } else {
            warn!(%stream, %device, index, "volume above safe media level, holding request");
            inner.safe_volume.set_pending(PendingVolumeCommand {
                stream: alias,
                index,
                flags,
                device,
            });
            self.emit(AudioEvent::SafeVolumeWarning {
                stream,
                volume: ((index + 5) / 10) as u32,
            })?;
            VolumeOutcome::SafeVolumeWarning
        };
        let new_index = inner.store.get_index(stream, device);
        self.send_volume_update(stream, alias, device, old_index, new_index)?;
        Ok(outcome)
    }

    async fn on_set_stream_volume(
        &self,
        stream: StreamType,
        index: i32,
        flags: VolumeFlags,
        device: AudioDevice,
    ) -> Result<VolumeOutcome> {
        let inner = &*self.inner;
        let alias = inner.store.alias_of(stream);
        let routes = self.stream_routes().await;
        let update = inner.store.set_index_routed(alias, index, device, Some(&routes));
        let mut outcome = VolumeOutcome::Unchanged;
        if update.changed {
            self.post(AudioCommand::ApplyDeviceVolume { stream: alias, device })?;
            outcome = VolumeOutcome::Applied;
        }
        if flags.contains(VolumeFlags::ALLOW_RINGER_MODES) || alias == self.master_stream_type() {
            let mode = inner.ringer.mode_for_index(index);
            if self.set_ringer_mode_internal(mode)? {
                outcome = VolumeOutcome::Applied;
            }
        }
        Ok(outcome)
    }

    /// Music index on a fixed-volume output
    fn fixed_device_index(&self, device: AudioDevice) -> i32 {
        let inner = &*self.inner;
        if inner.safe_volume.is_active() && SAFE_MEDIA_VOLUME_DEVICES.intersects(device) {
            inner.safe_volume.safe_index()
        } else {
            inner.store.max_index(StreamType::Music)
        }
    }

    fn send_volume_update(
        &self,
        stream: StreamType,
        alias: StreamType,
        device: AudioDevice,
        old_index: i32,
        index: i32,
    ) -> Result<()> {
        let stream = if !self.inner.config.voice_capable && stream == StreamType::Ring {
            StreamType::Notification
        } else {
            stream
        };
        self.emit(AudioEvent::VolumeChanged {
            stream,
            alias,
            device,
            previous_volume: ((old_index + 5) / 10) as u32,
            volume: ((index + 5) / 10) as u32,
        })
    }

    /// UI volume of a stream on its current output; 0 while muted
    pub async fn get_stream_volume(&self, stream: StreamType) -> u32 {
        let device = self.device_for_stream(stream).await;
        self.inner
            .store
            .ui_volume(stream, device, self.inner.config.fixed_volume_devices)
    }

    pub fn get_stream_max_volume(&self, stream: StreamType) -> u32 {
        self.inner.store.ui_max(stream)
    }

    /// UI volume of a stream ignoring mute
    pub async fn get_last_audible_stream_volume(&self, stream: StreamType) -> u32 {
        let device = self.device_for_stream(stream).await;
        self.inner.store.last_audible_ui_volume(stream, device)
    }

    /// Internal index (UI × 10) of a stream on a device
    pub fn stream_index(&self, stream: StreamType, device: AudioDevice) -> i32 {
        self.inner.store.get_index(stream, device)
    }

    // ---- mute ----

    /// Mute or unmute a stream on behalf of a client
    ///
    /// Mutes are counted per client; the stream stays muted while any
    /// client holds one.
    pub fn set_stream_mute(&self, stream: StreamType, muted: bool, token: ClientToken) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        let inner = &*self.inner;
        if !inner.ringer.is_affected_by_mute(stream) {
            debug!(%stream, "stream not affected by mute");
            return Ok(VolumeOutcome::Ignored);
        }
        let change = if muted {
            inner.store.mute(stream, token)
        } else {
            inner.store.unmute(stream, token)
        };
        self.refresh_links(token);
        self.on_mute_change(stream, change)
    }

    /// Mute every other mute-affected stream while `solo` holds
    pub fn set_stream_solo(&self, stream: StreamType, solo: bool, token: ClientToken) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        let inner = &*self.inner;
        let mut outcome = VolumeOutcome::Unchanged;
        for other in StreamType::ALL {
            if other == stream || !inner.ringer.is_affected_by_mute(other) {
                continue;
            }
            let change = if solo {
                inner.store.mute(other, token)
            } else {
                inner.store.unmute(other, token)
            };
            if self.on_mute_change(other, change)?.is_applied() {
                outcome = VolumeOutcome::Applied;
            }
        }
        self.refresh_links(token);
        Ok(outcome)
    }

    fn on_mute_change(&self, stream: StreamType, change: MuteChange) -> Result<VolumeOutcome> {
        let muted = match change {
            MuteChange::Muted => true,
            MuteChange::Unmuted => false,
            MuteChange::Unchanged => return Ok(VolumeOutcome::Unchanged),
        };
        self.post(AudioCommand::ApplyAllVolumes { stream })?;
        self.emit(AudioEvent::StreamMuteChanged { stream, muted })?;
        Ok(VolumeOutcome::Applied)
    }

    pub fn is_stream_mute(&self, stream: StreamType) -> bool {
        self.inner.store.is_muted(stream)
    }

    pub fn is_stream_affected_by_mute(&self, stream: StreamType) -> bool {
        self.inner.ringer.is_affected_by_mute(stream)
    }

    pub fn is_stream_affected_by_ringer_mode(&self, stream: StreamType) -> bool {
        self.inner.ringer.is_affected(stream)
    }

    // ---- ringer ----

    pub fn ringer_mode(&self) -> RingerMode {
        self.inner.ringer.mode()
    }

    /// Switch the ringer mode; unsupported modes are mapped to supported ones
    ///
    /// ```rust
    /// use audio_policy_core::prelude::*;
    /// use audio_policy_core::system::MockCollaborators;
    ///
    /// # tokio_test::block_on(async {
    /// let mocks = MockCollaborators::new();
    /// let service = AudioService::start(AudioPolicyConfig::voice(), mocks.collaborators())
    ///     .await
    ///     .expect("service starts");
    ///
    /// service.set_ringer_mode(RingerMode::Silent).expect("running");
    /// assert_eq!(service.ringer_mode(), RingerMode::Silent);
    /// assert!(service.is_stream_mute(StreamType::Ring));
    /// # service.shutdown().await.expect("stops");
    /// # })
    /// ```
    pub fn set_ringer_mode(&self, mode: RingerMode) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        Ok(if self.set_ringer_mode_internal(mode)? {
            VolumeOutcome::Applied
        } else {
            VolumeOutcome::Unchanged
        })
    }

    fn set_ringer_mode_internal(&self, mode: RingerMode) -> Result<bool> {
        match self.inner.ringer.set_mode(mode) {
            Some(_) => {
                self.on_ringer_mode_changed(true)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn on_ringer_mode_changed(&self, persist: bool) -> Result<()> {
        self.apply_ringer_muting(persist)?;
        self.emit(AudioEvent::RingerModeChanged {
            mode: self.inner.ringer.mode(),
        })
    }

    fn apply_ringer_muting(&self, persist: bool) -> Result<()> {
        let inner = &*self.inner;
        let aliases = inner.store.alias_table();
        let result = inner.ringer.apply_muting(&inner.store, &aliases);
        for stream in result.mute_changed {
            self.post(AudioCommand::ApplyAllVolumes { stream })?;
            self.emit(AudioEvent::StreamMuteChanged {
                stream,
                muted: inner.store.is_muted(stream),
            })?;
        }
        if persist {
            inner
                .queue
                .send(AudioCommand::PersistRingerMode, EnqueuePolicy::Replace, inner.config.persist_delay)?;
        }
        Ok(())
    }

    // ---- vibrate ----

    pub fn vibrate_setting(&self, vibrate_type: VibrateType) -> VibrateSetting {
        self.inner.ringer.get_vibrate_setting(vibrate_type)
    }

    pub fn set_vibrate_setting(&self, vibrate_type: VibrateType, setting: VibrateSetting) -> Result<()> {
        self.ensure_running()?;
        self.inner.ringer.set_vibrate_setting(vibrate_type, setting);
        self.inner
            .queue
            .send(AudioCommand::PersistVibrateSetting, EnqueuePolicy::Replace, Duration::ZERO)?;
        self.emit(AudioEvent::VibrateSettingChanged { vibrate_type, setting })
    }

    /// Whether a vibration of `vibrate_type` should happen now
    pub fn should_vibrate(&self, vibrate_type: VibrateType) -> bool {
        self.inner.ringer.should_vibrate(vibrate_type)
    }

    // ---- master volume ----

    pub fn master_volume(&self) -> u32 {
        self.inner.master.lock().volume
    }

    pub fn master_max_volume(&self) -> u32 {
        MAX_MASTER_VOLUME
    }

    pub fn is_master_mute(&self) -> bool {
        self.inner.master.lock().muted
    }

    /// Set the master volume in percent; values above 100 are clamped
    pub fn set_master_volume(&self, volume: u32) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        let volume = volume.min(MAX_MASTER_VOLUME);
        let previous = std::mem::replace(&mut self.inner.master.lock().volume, volume);
        if previous == volume {
            return Ok(VolumeOutcome::Unchanged);
        }
        self.post(AudioCommand::ApplyMasterVolume)?;
        self.inner.queue.send(
            AudioCommand::PersistMasterVolume,
            EnqueuePolicy::Replace,
            self.inner.config.persist_delay,
        )?;
        self.emit(AudioEvent::MasterVolumeChanged { previous, volume })?;
        Ok(VolumeOutcome::Applied)
    }

    pub fn set_master_mute(&self, muted: bool) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        let previous = std::mem::replace(&mut self.inner.master.lock().muted, muted);
        if previous == muted {
            return Ok(VolumeOutcome::Unchanged);
        }
        self.post(AudioCommand::ApplyMasterMute)?;
        self.inner.queue.send(
            AudioCommand::PersistMasterMute,
            EnqueuePolicy::Replace,
            self.inner.config.persist_delay,
        )?;
        self.emit(AudioEvent::MasterMuteChanged { muted })?;
        Ok(VolumeOutcome::Applied)
    }

    // ---- mode ----

    pub fn mode(&self) -> AudioMode {
        self.inner.modes.mode()
    }

    /// Pid of the client owning the current mode, 0 when none
    pub fn mode_owner_pid(&self) -> u32 {
        self.inner.modes.owner_pid()
    }

    /// Request an audio mode on behalf of a client
    ///
    /// The most recent claimant owns the mode. If the audio system refuses
    /// it, the claim is dropped and the next claimant's mode is tried.
    pub async fn set_mode(&self, mode: AudioMode, token: ClientToken, caller: &Caller) -> Result<ModeOutcome> {
        self.ensure_running()?;
        let permissions = &self.inner.collaborators.permissions;
        if !permissions.has_permission(Permission::ModifyAudioSettings, caller) {
            warn!(pid = caller.pid, "set_mode without MODIFY_AUDIO_SETTINGS");
            return Ok(ModeOutcome::PermissionDenied);
        }
        if mode == AudioMode::InCall && !permissions.has_permission(Permission::ModifyPhoneState, caller) {
            warn!(pid = caller.pid, "set_mode(IN_CALL) without MODIFY_PHONE_STATE");
            return Ok(ModeOutcome::PermissionDenied);
        }

        let resolved = {
            let _gate = self.inner.mode_gate.lock().await;
            let mode = if mode == AudioMode::Current {
                self.inner.modes.mode()
            } else {
                mode
            };
            self.set_mode_int(mode, token, caller.pid).await?
        };
        if resolved.owner_pid != 0 {
            self.disconnect_bluetooth_sco(resolved.owner_pid).await?;
        }
        let mode = self.inner.modes.mode();
        let owner_pid = resolved.owner_pid;
        Ok(if resolved.refused {
            ModeOutcome::Refused { mode, owner_pid }
        } else {
            ModeOutcome::Applied { mode, owner_pid }
        })
    }

    /// Mode change with the gate held
    ///
    /// Refused candidates are dropped one by one down to NORMAL. If NORMAL
    /// is refused as well it is recorded anyway, so the applied mode always
    /// has an owner on the stack or is NORMAL.
    async fn set_mode_int(&self, mode: AudioMode, token: ClientToken, pid: u32) -> Result<ModeResolution> {
        let inner = &*self.inner;
        let previous = inner.modes.mode();
        let requested = mode;
        let mut refused = false;
        let mut candidate = inner.modes.prepare(mode, token, pid);
        loop {
            if inner.modes.is_current(candidate.mode) {
                break;
            }
            match inner.collaborators.audio_system.set_phone_state(candidate.mode).await {
                Ok(()) => {
                    inner.modes.commit(candidate.mode);
                    break;
                }
                Err(e) => {
                    warn!(mode = ?candidate.mode, error = %e, "audio system refused mode");
                    refused = true;
                    let holder = candidate.holder;
                    let next = inner.modes.reject(candidate);
                    if let Some(holder) = holder {
                        self.refresh_links(holder);
                    }
                    match next {
                        Some(next) => candidate = next,
                        None => {
                            error!("audio system refused NORMAL mode, recording it anyway");
                            inner.modes.force_normal();
                            break;
                        }
                    }
                }
            }
        }
        self.refresh_links(token);
        if let Some(holder) = candidate.holder {
            self.refresh_links(holder);
        }

        let owner_pid = inner.modes.owner_pid();
        let current = inner.modes.mode();
        if refused {
            self.emit(AudioEvent::ModeRefused { requested, mode: current })?;
        }
        if current != previous {
            info!(mode = ?current, owner_pid, "audio mode changed");
            self.emit(AudioEvent::ModeChanged { mode: current, owner_pid })?;
        }
        let stream = self.active_stream_type(None).await;
        let alias = inner.store.alias_of(stream);
        let device = self.device_for_stream(stream).await;
        self.post(AudioCommand::ApplyDeviceVolume { stream: alias, device })?;
        self.update_stream_volume_alias(true)?;
        Ok(ModeResolution { owner_pid, refused })
    }

    fn alias_context(&self) -> AliasContext {
        let config = &self.inner.config;
        AliasContext {
            platform: config.platform,
            in_communication: self.inner.modes.mode().is_in_communication(),
            link_notification_with_ring: config.link_notification_with_ring,
            voice_capable: config.voice_capable,
        }
    }

    fn update_stream_volume_alias(&self, update_volumes: bool) -> Result<()> {
        let inner = &*self.inner;
        let table = AliasTable::resolve(self.alias_context());
        let previous = inner.store.set_alias_table(table);
        let dtmf_alias = table.alias(StreamType::Dtmf);
        inner
            .ringer
            .update_affected_streams(None, inner.config.camera_sound_forced, dtmf_alias);
        if update_volumes && previous.alias(StreamType::Dtmf) != dtmf_alias {
            debug!(%dtmf_alias, "dtmf alias changed");
            if dtmf_alias != StreamType::Dtmf {
                inner.store.set_all_indexes(StreamType::Dtmf, dtmf_alias);
            }
            self.apply_ringer_muting(false)?;
            self.post(AudioCommand::ApplyAllVolumes { stream: StreamType::Dtmf })?;
        }
        Ok(())
    }

    // ---- bluetooth sco ----

    pub fn sco_state(&self) -> ScoState {
        self.inner.sco.state()
    }

    pub fn sco_audio_mode(&self) -> ScoAudioMode {
        self.inner.sco.audio_mode()
    }

    /// Starts a client holds on the SCO link
    pub fn sco_start_count(&self, token: &ClientToken) -> u32 {
        self.inner.sco.start_count(token)
    }

    /// Ask for the SCO link; the audio mode depends on the caller's SDK level
    pub async fn start_bluetooth_sco(
        &self,
        token: ClientToken,
        caller: &Caller,
        target_sdk: u32,
    ) -> Result<VolumeOutcome> {
        self.start_sco(token, caller, ScoAudioMode::for_target_sdk(target_sdk)).await
    }

    pub async fn start_bluetooth_sco_virtual_call(&self, token: ClientToken, caller: &Caller) -> Result<VolumeOutcome> {
        self.start_sco(token, caller, ScoAudioMode::VirtualCall).await
    }

    async fn start_sco(&self, token: ClientToken, caller: &Caller, mode: ScoAudioMode) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        if !self
            .inner
            .collaborators
            .permissions
            .has_permission(Permission::ModifyAudioSettings, caller)
        {
            warn!(pid = caller.pid, "start sco without MODIFY_AUDIO_SETTINGS");
            return Ok(VolumeOutcome::PermissionDenied);
        }
        let actions = self.inner.sco.start(token, caller.pid, mode, self.sco_env());
        self.refresh_links(token);
        self.run_sco_actions(actions).await?;
        Ok(VolumeOutcome::Applied)
    }

    pub async fn stop_bluetooth_sco(&self, token: ClientToken, caller: &Caller) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        if !self
            .inner
            .collaborators
            .permissions
            .has_permission(Permission::ModifyAudioSettings, caller)
        {
            warn!(pid = caller.pid, "stop sco without MODIFY_AUDIO_SETTINGS");
            return Ok(VolumeOutcome::PermissionDenied);
        }
        let update = self.inner.sco.stop(token, self.sco_env());
        self.apply_sco_update(update).await?;
        self.refresh_links(token);
        Ok(VolumeOutcome::Applied)
    }

    /// Headset profile proxy became available
    pub async fn on_headset_service_connected(&self) -> Result<()> {
        let inner = &*self.inner;
        let headset = &inner.collaborators.headset;
        let device = headset.connected_devices().await.into_iter().next();
        let audio = match &device {
            Some(device) => headset.audio_state(device).await,
            None => HeadsetAudioState::Disconnected,
        };
        inner.queue.cancel(CommandKey::ScoProfileTimeout);
        let actions = inner.sco.on_headset_service_connected(device, audio);
        self.run_sco_actions(actions).await
    }

    pub fn on_headset_service_disconnected(&self) {
        self.inner.sco.on_headset_service_disconnected();
    }

    /// Audio link state reported by the headset profile
    pub async fn on_bluetooth_sco_audio_state_changed(&self, audio: HeadsetAudioState) -> Result<()> {
        let update = self.inner.sco.on_headset_audio_state(audio, self.sco_env());
        self.apply_sco_update(update).await
    }

    async fn disconnect_bluetooth_sco(&self, except_pid: u32) -> Result<()> {
        let update = self.inner.sco.disconnect_for_mode_owner(except_pid, self.sco_env());
        self.apply_sco_update(update).await
    }

    async fn reset_bluetooth_sco(&self) -> Result<()> {
        let update = self.inner.sco.reset(self.sco_env());
        self.apply_sco_update(update).await?;
        self.post(AudioCommand::SetParameters {
            key_values: A2DP_RESUME.to_string(),
        })?;
        self.set_bluetooth_sco_on_int(false)
    }

    async fn apply_sco_update(&self, update: ScoUpdate) -> Result<()> {
        for token in update.released {
            self.refresh_links(token);
        }
        self.run_sco_actions(update.actions).await
    }

    async fn run_sco_actions(&self, actions: Vec<ScoAction>) -> Result<()> {
        let inner = &*self.inner;
        let headset = &inner.collaborators.headset;
        let mut pending: VecDeque<ScoAction> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                ScoAction::Broadcast(state) => self.post(AudioCommand::BroadcastScoState { state })?,
                ScoAction::Start { mode, device, on_failure } => {
                    let accepted = match mode {
                        ScoAudioMode::VirtualCall => headset.start_sco_using_virtual_voice_call(&device).await,
                        ScoAudioMode::Vr => headset.start_voice_recognition(&device).await,
                        ScoAudioMode::Raw | ScoAudioMode::Undefined => headset.connect_audio().await,
                    };
                    if !accepted {
                        warn!(?mode, device = %device.address, "headset refused sco start");
                        pending.extend(self.on_sco_request_failed(on_failure)?);
                    }
                }
                ScoAction::Stop { mode, device, on_failure } => {
                    let accepted = match mode {
                        ScoAudioMode::VirtualCall => headset.stop_sco_using_virtual_voice_call(&device).await,
                        ScoAudioMode::Vr => headset.stop_voice_recognition(&device).await,
                        ScoAudioMode::Raw | ScoAudioMode::Undefined => headset.disconnect_audio().await,
                    };
                    if !accepted {
                        warn!(?mode, device = %device.address, "headset refused sco stop");
                        pending.extend(self.on_sco_request_failed(on_failure)?);
                    }
                }
                ScoAction::StopVoiceRecognition { device } => {
                    if !headset.stop_voice_recognition(&device).await {
                        warn!(device = %device.address, "headset refused to stop voice recognition");
                        pending.extend(self.on_sco_request_failed(ScoFailure::Reset)?);
                    }
                }
                ScoAction::AcquireProxy => {
                    let requested = inner.collaborators.profile_connector.request_headset_proxy().await;
                    let timeout = if requested {
                        inner.config.profile_connect_timeout
                    } else {
                        warn!("headset proxy request failed");
                        Duration::ZERO
                    };
                    inner
                        .queue
                        .send(AudioCommand::ScoProfileTimeout, EnqueuePolicy::Replace, timeout)?;
                }
                ScoAction::ConnectFailed => {
                    inner
                        .queue
                        .send(AudioCommand::ScoProfileTimeout, EnqueuePolicy::Replace, Duration::ZERO)?;
                }
            }
        }
        Ok(())
    }

    fn on_sco_request_failed(&self, failure: ScoFailure) -> Result<Vec<ScoAction>> {
        match failure {
            ScoFailure::Revert => Ok(self.inner.sco.on_request_failed()),
            ScoFailure::Reset => {
                self.inner
                    .queue
                    .send(AudioCommand::ScoProfileTimeout, EnqueuePolicy::Replace, Duration::ZERO)?;
                Ok(Vec::new())
            }
        }
    }

    // ---- forced routing ----

    pub fn set_speakerphone_on(&self, on: bool) -> Result<()> {
        self.ensure_running()?;
        let config = {
            let mut forced = self.inner.forced.lock();
            if on {
                forced.communication = ForceConfig::Speaker;
            } else if forced.communication == ForceConfig::Speaker {
                forced.communication = ForceConfig::None;
            }
            forced.communication
        };
        self.post(AudioCommand::SetForceUse {
            usage: ForceUsage::Communication,
            config,
        })
    }

    pub fn is_speakerphone_on(&self) -> bool {
        self.inner.forced.lock().communication == ForceConfig::Speaker
    }

    pub fn set_bluetooth_sco_on(&self, on: bool) -> Result<()> {
        self.ensure_running()?;
        let config = if on { ForceConfig::BtSco } else { ForceConfig::None };
        self.inner.forced.lock().communication = config;
        self.post_sco_force_use(config)
    }

    pub fn is_bluetooth_sco_on(&self) -> bool {
        self.inner.forced.lock().communication == ForceConfig::BtSco
    }

    fn set_bluetooth_sco_on_int(&self, on: bool) -> Result<()> {
        let config = {
            let mut forced = self.inner.forced.lock();
            if on {
                forced.communication = ForceConfig::BtSco;
            } else if forced.communication == ForceConfig::BtSco {
                forced.communication = ForceConfig::None;
            }
            forced.communication
        };
        self.post_sco_force_use(config)
    }

    fn post_sco_force_use(&self, config: ForceConfig) -> Result<()> {
        self.post(AudioCommand::SetForceUse {
            usage: ForceUsage::Communication,
            config,
        })?;
        let record = if config == ForceConfig::BtSco {
            ForceConfig::BtSco
        } else {
            ForceConfig::None
        };
        self.post(AudioCommand::SetForceUse {
            usage: ForceUsage::Record,
            config: record,
        })
    }

    pub fn set_bluetooth_a2dp_on(&self, on: bool) -> Result<()> {
        self.ensure_running()?;
        self.inner.forced.lock().a2dp_enabled = on;
        self.post(AudioCommand::SetForceUse {
            usage: ForceUsage::Media,
            config: media_force_config(on),
        })
    }

    pub fn is_bluetooth_a2dp_on(&self) -> bool {
        self.inner.forced.lock().a2dp_enabled
    }

    /// Worker-side variant that talks to the audio system directly
    async fn set_bluetooth_a2dp_on_now(&self, on: bool) {
        self.inner.forced.lock().a2dp_enabled = on;
        if let Err(e) = self
            .inner
            .collaborators
            .audio_system
            .set_force_use(ForceUsage::Media, media_force_config(on))
            .await
        {
            warn!(on, error = %e, "set_force_use(media) failed");
        }
    }

    // ---- device connections ----

    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        self.inner.devices.snapshot()
    }

    pub fn is_device_connected(&self, device: AudioDevice, address: &str) -> bool {
        self.inner.devices.is_connected(device, address)
    }

    /// Report a wired output plugged or unplugged
    ///
    /// Returns the delay before the change reaches the audio system.
    pub fn set_wired_device_connection_state(
        &self,
        device: AudioDevice,
        state: ConnectionState,
        name: &str,
    ) -> Result<Duration> {
        self.ensure_running()?;
        if device.count() != 1
            || device.is_input()
            || device.intersects(AudioDevice::ALL_A2DP | AudioDevice::ALL_SCO)
        {
            return Err(AudioPolicyError::invalid_argument(format!(
                "{device} is not a wired output"
            )));
        }
        let delay = self.connection_delay(device, state)?;
        self.queue_connection(
            AudioCommand::WiredDeviceConnection {
                device,
                state,
                name: name.to_string(),
            },
            delay,
        )?;
        Ok(delay)
    }

    /// Report an A2DP sink connected or disconnected
    pub fn set_bluetooth_a2dp_device_connection_state(
        &self,
        device: BluetoothDevice,
        state: ConnectionState,
    ) -> Result<Duration> {
        self.ensure_running()?;
        let delay = self.connection_delay(AudioDevice::BLUETOOTH_A2DP, state)?;
        self.queue_connection(AudioCommand::A2dpDeviceConnection { device, state }, delay)?;
        Ok(delay)
    }

    /// Report a SCO-capable headset connected or disconnected
    pub async fn set_bt_sco_device_connection_state(
        &self,
        device: BluetoothDevice,
        state: ConnectionState,
    ) -> Result<()> {
        self.ensure_running()?;
        let output = match device.class.map(|c| c.kind) {
            Some(HeadsetKind::WearableHeadset | HeadsetKind::Handsfree) => AudioDevice::BLUETOOTH_SCO_HEADSET,
            Some(HeadsetKind::CarAudio) => AudioDevice::BLUETOOTH_SCO_CARKIT,
            _ => AudioDevice::BLUETOOTH_SCO,
        };
        let address = if device.has_valid_address() {
            device.address.clone()
        } else {
            String::new()
        };
        let connected = state.is_connected();
        if !self
            .handle_device_connection(connected, output, &address, &device.name)
            .await
        {
            return Ok(());
        }
        if connected {
            self.inner.sco.set_headset_device(Some(device));
        } else {
            self.inner.sco.set_headset_device(None);
            self.reset_bluetooth_sco().await?;
        }
        Ok(())
    }

    /// Delay for a connection change, broadcasting becoming-noisy first
    /// when the last noisy output goes away
    fn connection_delay(&self, device: AudioDevice, state: ConnectionState) -> Result<Duration> {
        let inner = &*self.inner;
        let mut delay = Duration::ZERO;
        if !state.is_connected() && inner.devices.is_last_noisy_device(device) {
            inner
                .queue
                .send(AudioCommand::BroadcastBecomingNoisy, EnqueuePolicy::Replace, Duration::ZERO)?;
            delay = inner.config.becoming_noisy_delay;
        }
        if inner.pending_connections.load(Ordering::SeqCst) > 0 {
            delay = inner.config.becoming_noisy_delay;
        }
        Ok(delay)
    }

    fn queue_connection(&self, command: AudioCommand, delay: Duration) -> Result<()> {
        let pending = &self.inner.pending_connections;
        pending.fetch_add(1, Ordering::SeqCst);
        self.inner
            .queue
            .send(command, EnqueuePolicy::Queue, delay)
            .inspect_err(|_| {
                pending.fetch_sub(1, Ordering::SeqCst);
            })
    }

    /// Update the native layer and the table; true if the table changed
    async fn handle_device_connection(&self, connect: bool, device: AudioDevice, address: &str, name: &str) -> bool {
        let inner = &*self.inner;
        let system = &inner.collaborators.audio_system;
        let is_connected = inner.devices.is_connected(device, address);
        if is_connected && !connect {
            if let Err(e) = system
                .set_device_connection_state(device, ConnectionState::Disconnected, address, name)
                .await
            {
                warn!(%device, address, error = %e, "native disconnect failed");
            }
            inner.devices.remove(device, address);
            true
        } else if !is_connected && connect {
            match system
                .set_device_connection_state(device, ConnectionState::Connected, address, name)
                .await
            {
                Ok(()) => {
                    inner.devices.insert(device, address, name);
                    true
                }
                Err(e) => {
                    warn!(%device, address, error = %e, "audio system refused device");
                    false
                }
            }
        } else {
            false
        }
    }

    async fn on_wired_device_connection(&self, device: AudioDevice, state: ConnectionState, name: &str) -> Result<()> {
        let inner = &*self.inner;
        let connected = state.is_connected();
        let wired_media = WIRED_MEDIA_DEVICES.contains(device);
        if !connected && wired_media {
            self.set_bluetooth_a2dp_on_now(true).await;
        }
        let usb = AudioDevice::ALL_USB.intersects(device);
        let address = if usb { name } else { "" };
        self.handle_device_connection(connected, device, address, name).await;
        if connected {
            if wired_media {
                self.set_bluetooth_a2dp_on_now(false).await;
            }
            if SAFE_MEDIA_VOLUME_DEVICES.intersects(device) {
                inner.queue.send(
                    AudioCommand::CheckMusicActive,
                    EnqueuePolicy::Replace,
                    self.poll_period(),
                )?;
            }
        }
        if !usb {
            inner.events.emit(AudioEvent::DeviceConnectionChanged {
                device,
                state,
                address: String::new(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn on_a2dp_device_connection(&self, device: &BluetoothDevice, state: ConnectionState) -> Result<()> {
        let inner = &*self.inner;
        let a2dp = AudioDevice::BLUETOOTH_A2DP;
        let address = if device.has_valid_address() {
            device.address.as_str()
        } else {
            ""
        };
        let is_connected = inner.devices.is_connected(a2dp, address);
        if is_connected && !state.is_connected() {
            self.handle_device_connection(false, a2dp, address, &device.name).await;
            inner.events.emit(AudioEvent::A2dpRouteChanged {
                device: a2dp,
                state: ConnectionState::Disconnected,
            });
        } else if !is_connected && state.is_connected() {
            // one sink at a time
            for stale in inner.devices.snapshot().into_iter().filter(|d| d.device == a2dp) {
                self.handle_device_connection(false, a2dp, &stale.address, &stale.name)
                    .await;
            }
            self.post(AudioCommand::ApplyDeviceVolume {
                stream: StreamType::Music,
                device: a2dp,
            })?;
            self.set_bluetooth_a2dp_on_now(true).await;
            if self.handle_device_connection(true, a2dp, address, &device.name).await {
                if let Err(e) = inner.collaborators.audio_system.set_parameters(A2DP_RESUME).await {
                    warn!(error = %e, "failed to resume a2dp");
                }
                inner.events.emit(AudioEvent::A2dpRouteChanged {
                    device: a2dp,
                    state: ConnectionState::Connected,
                });
            }
        }
        Ok(())
    }

    // ---- safe media volume ----

    pub fn safe_media_volume_state(&self) -> SafeMediaVolumeState {
        self.inner.safe_volume.state()
    }

    /// Request held back by the headset ceiling, if any
    pub fn pending_volume_command(&self) -> Option<PendingVolumeCommand> {
        self.inner.safe_volume.pending()
    }

    /// User acknowledged the warning: lift the ceiling and apply any held request
    pub async fn disable_safe_media_volume(&self) -> Result<VolumeOutcome> {
        self.ensure_running()?;
        self.set_safe_media_volume_enabled(false)?;
        match self.inner.safe_volume.take_pending() {
            Some(pending) => {
                debug!(stream = %pending.stream, index = pending.index, "applying held volume request");
                self.on_set_stream_volume(pending.stream, pending.index, pending.flags, pending.device)
                    .await
            }
            None => Ok(VolumeOutcome::Unchanged),
        }
    }

    /// Re-arm or lift the headset ceiling
    pub fn set_safe_media_volume_enabled(&self, on: bool) -> Result<()> {
        let inner = &*self.inner;
        match inner.safe_volume.set_enabled(on) {
            SafeTransition::Activated => self.enforce_safe_media_volume(),
            SafeTransition::Deactivated { music_active_ms } => {
                debug!(music_active_ms, "safe media volume lifted");
                self.post(AudioCommand::PersistMusicActiveMs)?;
                inner
                    .queue
                    .send(AudioCommand::CheckMusicActive, EnqueuePolicy::Replace, self.poll_period())
            }
            SafeTransition::Unchanged => Ok(()),
        }
    }

    /// Decide whether the ceiling applies in the current region
    pub fn configure_safe_media_volume(&self, force: bool, mcc: i32) -> Result<()> {
        let Some(outcome) = self.inner.safe_volume.configure(force, mcc) else {
            return Ok(());
        };
        if outcome.enforce {
            self.enforce_safe_media_volume()?;
        }
        self.post(AudioCommand::PersistSafeVolumeState { state: outcome.persist })
    }

    fn enforce_safe_media_volume(&self) -> Result<()> {
        for device in self.inner.safe_volume.enforce(&self.inner.store) {
            debug!(%device, "music lowered to safe volume");
            self.post(AudioCommand::ApplyDeviceVolume {
                stream: StreamType::Music,
                device,
            })?;
        }
        Ok(())
    }

    fn poll_period(&self) -> Duration {
        Duration::from_millis(self.inner.safe_volume.poll_period_ms())
    }

    async fn on_check_music_active(&self) -> Result<()> {
        let inner = &*self.inner;
        let device = self.device_for_stream(StreamType::Music).await;
        let activity = MusicActivity {
            device,
            active: inner
                .collaborators
                .audio_system
                .is_stream_active(StreamType::Music, Duration::ZERO)
                .await,
            index: inner.store.get_index(StreamType::Music, device),
        };
        let check = inner.safe_volume.on_check_music_active(activity);
        if check.reschedule {
            inner
                .queue
                .send(AudioCommand::CheckMusicActive, EnqueuePolicy::Replace, self.poll_period())?;
        }
        if check.reactivated {
            info!("music listening limit reached, safe media volume active again");
            self.enforce_safe_media_volume()?;
        }
        if check.persist_ms.is_some() {
            self.post(AudioCommand::PersistMusicActiveMs)?;
        }
        Ok(())
    }

    // ---- sound effects ----

    /// Load the UI sound effects on the worker and wait for the result
    pub async fn load_sound_effects(&self) -> Result<bool> {
        self.ensure_running()?;
        let config = &self.inner.config.sound_effects;
        let (reply, mut done) = oneshot::channel();
        self.post(AudioCommand::LoadSoundEffects { reply: Some(reply) })?;
        let attempts = config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match tokio::time::timeout(config.load_timeout, &mut done).await {
                Ok(Ok(loaded)) => return Ok(loaded),
                Ok(Err(_)) => return Err(AudioPolicyError::ServiceStopped),
                Err(_) => warn!(attempt, attempts, "sound effects still loading"),
            }
        }
        let waited = config.load_timeout.as_millis() as u64 * u64::from(attempts);
        Err(AudioPolicyError::timeout("load_sound_effects", waited))
    }

    pub fn unload_sound_effects(&self) -> Result<()> {
        self.ensure_running()?;
        self.post(AudioCommand::UnloadSoundEffects)
    }

    // ---- peers ----

    fn refresh_links(&self, token: ClientToken) {
        if token.is_service() {
            return;
        }
        let inner = &*self.inner;
        let muted = inner.store.streams_muted_by(&token);
        inner.peers.set(
            token,
            PeerLinks {
                muted: StreamMask::of(&muted),
                sco: inner.sco.has_client(&token),
                mode: inner.modes.contains(&token),
            },
        );
    }

    pub fn peer_links(&self, token: &ClientToken) -> Option<PeerLinks> {
        self.inner.peers.get(token)
    }

    pub fn is_peer_linked(&self, token: &ClientToken) -> bool {
        self.inner.peers.is_linked(token)
    }

    /// Undo everything a dead client held: mutes, SCO starts and its mode claim
    pub async fn on_peer_died(&self, token: ClientToken) -> Result<()> {
        let inner = &*self.inner;
        let Some(links) = inner.peers.take(&token) else {
            debug!(%token, "death of unlinked peer");
            return Ok(());
        };
        info!(%token, ?links, "peer died");

        for stream in StreamType::ALL.into_iter().filter(|s| links.muted.contains(*s)) {
            let change = inner.store.release_mute_on_death(stream, token);
            self.on_mute_change(stream, change)?;
        }
        if links.sco {
            let update = inner.sco.client_died(token, self.sco_env());
            self.apply_sco_update(update).await?;
        }
        if links.mode {
            if let Some(pid) = inner.modes.pid_of(&token) {
                let resolved = {
                    let _gate = inner.mode_gate.lock().await;
                    self.set_mode_int(AudioMode::Normal, token, pid).await?
                };
                if resolved.owner_pid != 0 {
                    self.disconnect_bluetooth_sco(resolved.owner_pid).await?;
                }
            }
        }
        inner.peers.take(&token);
        Ok(())
    }

    // ---- settings ----

    /// Re-read the ringer settings after an external change
    pub fn reload_settings(&self) -> Result<()> {
        self.ensure_running()?;
        let inner = &*self.inner;
        let settings = inner.collaborators.settings.as_ref();
        if let Some(mode) = read_ringer_mode(settings) {
            if inner.ringer.set_mode(mode).is_some() {
                self.emit(AudioEvent::RingerModeChanged {
                    mode: inner.ringer.mode(),
                })?;
            }
        }
        let read_mask = |key: &str| {
            settings
                .get_int(key)
                .and_then(|bits| u32::try_from(bits).ok())
                .map(StreamMask)
        };
        inner.ringer.update_affected_streams(
            read_mask(settings::MODE_RINGER_STREAMS_AFFECTED),
            inner.config.camera_sound_forced,
            inner.store.alias_of(StreamType::Dtmf),
        );
        if let Some(mask) = read_mask(settings::MUTE_STREAMS_AFFECTED) {
            inner.ringer.set_mute_affected_streams(mask);
        }
        self.apply_ringer_muting(false)
    }

    // ---- worker side ----

    async fn execute(&self, command: AudioCommand) {
        let key = command.key();
        if let Err(e) = self.execute_command(command).await {
            warn!(?key, error = %e, "audio command failed");
        }
    }

    async fn execute_command(&self, command: AudioCommand) -> Result<()> {
        let inner = &*self.inner;
        let system = &inner.collaborators.audio_system;
        let settings = inner.collaborators.settings.as_ref();
        match command {
            AudioCommand::ApplyDeviceVolume { stream, device } => {
                self.apply_device_volume(stream, device).await;
                let dependents: Vec<StreamType> = inner.store.alias_table().dependents(stream).collect();
                for dependent in dependents {
                    let device = self.device_for_stream(dependent).await;
                    self.apply_device_volume(dependent, device).await;
                }
                inner.queue.send(
                    AudioCommand::PersistVolume { stream, device },
                    EnqueuePolicy::Replace,
                    inner.config.persist_delay,
                )?;
            }
            AudioCommand::ApplyAllVolumes { stream } => {
                self.apply_all_volumes(stream).await;
                let dependents: Vec<StreamType> = inner.store.alias_table().dependents(stream).collect();
                for dependent in dependents {
                    self.apply_all_volumes(dependent).await;
                }
            }
            AudioCommand::PersistVolume { stream, device } => {
                let index = inner.store.get_index(stream, device);
                let key = volume_setting_key(stream.setting_name(), device.setting_suffix());
                settings.put_int(&key, i64::from((index + 5) / 10))?;
            }
            AudioCommand::PersistRingerMode => {
                settings.put_int(settings::MODE_RINGER, inner.ringer.mode() as i64)?;
            }
            AudioCommand::PersistSafeVolumeState { state } => {
                settings.put_int(settings::AUDIO_SAFE_VOLUME_STATE, state as i64)?;
            }
            AudioCommand::PersistMusicActiveMs => {
                let ms = i64::try_from(inner.safe_volume.music_active_ms()).unwrap_or(i64::MAX);
                settings.put_int(settings::UNSAFE_VOLUME_MUSIC_ACTIVE_MS, ms)?;
            }
            AudioCommand::PersistMasterVolume => {
                let volume = self.master_volume();
                settings.put_int(settings::VOLUME_MASTER, i64::from(volume))?;
            }
            AudioCommand::PersistMasterMute => {
                let muted = self.is_master_mute();
                settings.put_int(settings::VOLUME_MASTER_MUTE, i64::from(muted))?;
            }
            AudioCommand::PersistVibrateSetting => {
                settings.put_int(settings::VIBRATE_ON, i64::from(inner.ringer.vibrate_setting()))?;
            }
            AudioCommand::ApplyMasterVolume => {
                let volume = self.master_volume() as f32 / MAX_MASTER_VOLUME as f32;
                if let Err(e) = system.set_master_volume(volume).await {
                    warn!(volume, error = %e, "set_master_volume failed");
                }
            }
            AudioCommand::ApplyMasterMute => {
                let muted = self.is_master_mute();
                if let Err(e) = system.set_master_mute(muted).await {
                    warn!(muted, error = %e, "set_master_mute failed");
                }
            }
            AudioCommand::SetForceUse { usage, config } => {
                if let Err(e) = system.set_force_use(usage, config).await {
                    warn!(?usage, ?config, error = %e, "set_force_use failed");
                }
            }
            AudioCommand::SetParameters { key_values } => {
                if let Err(e) = system.set_parameters(&key_values).await {
                    warn!(key_values, error = %e, "set_parameters failed");
                }
            }
            AudioCommand::BroadcastScoState { state } => {
                let previous = {
                    let mut last = inner.last_sco_broadcast.lock();
                    if *last == state {
                        return Ok(());
                    }
                    std::mem::replace(&mut *last, state)
                };
                debug!(?state, ?previous, "sco audio state");
                inner.events.emit(AudioEvent::ScoAudioStateUpdated { state, previous });
            }
            AudioCommand::BroadcastBecomingNoisy => {
                info!("audio becoming noisy");
                inner.events.emit(AudioEvent::AudioBecomingNoisy);
            }
            AudioCommand::Emit(event) => inner.events.emit(event),
            AudioCommand::WiredDeviceConnection { device, state, name } => {
                inner.pending_connections.fetch_sub(1, Ordering::SeqCst);
                self.on_wired_device_connection(device, state, &name).await?;
            }
            AudioCommand::A2dpDeviceConnection { device, state } => {
                inner.pending_connections.fetch_sub(1, Ordering::SeqCst);
                self.on_a2dp_device_connection(&device, state).await?;
            }
            AudioCommand::CheckMusicActive => self.on_check_music_active().await?,
            AudioCommand::ScoProfileTimeout => {
                warn!(state = ?inner.sco.state(), "sco connection failed, resetting");
                self.reset_bluetooth_sco().await?;
            }
            AudioCommand::LoadSoundEffects { reply } => {
                let loaded = inner.collaborators.sound_effects.load().await;
                if !loaded {
                    warn!("sound effects failed to load");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(loaded);
                }
            }
            AudioCommand::UnloadSoundEffects => inner.collaborators.sound_effects.unload().await,
            AudioCommand::Flush { reply } => {
                let _ = reply.send(());
            }
            AudioCommand::Shutdown => {}
        }
        Ok(())
    }

    async fn apply_device_volume(&self, stream: StreamType, device: AudioDevice) {
        let inner = &*self.inner;
        let index = inner
            .store
            .hardware_index(stream, device, inner.config.full_volume_devices);
        if let Err(e) = inner
            .collaborators
            .audio_system
            .set_stream_volume_index(stream, index, device)
            .await
        {
            warn!(%stream, %device, index, error = %e, "set_stream_volume_index failed");
        }
    }

    async fn apply_all_volumes(&self, stream: StreamType) {
        let inner = &*self.inner;
        let volumes = inner
            .store
            .hardware_volumes(stream, inner.config.full_volume_devices);
        for (device, index) in volumes {
            if let Err(e) = inner
                .collaborators
                .audio_system
                .set_stream_volume_index(stream, index, device)
                .await
            {
                warn!(%stream, %device, index, error = %e, "set_stream_volume_index failed");
            }
        }
    }
}

fn media_force_config(a2dp_enabled: bool) -> ForceConfig {
    if a2dp_enabled {
        ForceConfig::None
    } else {
        ForceConfig::NoBtA2dp
    }
}

fn read_ringer_mode(settings: &dyn SettingsStore) -> Option<RingerMode> {
    let raw = settings.get_int(settings::MODE_RINGER)?;
    match i32::try_from(raw).ok().map(RingerMode::try_from) {
        Some(Ok(mode)) => Some(mode),
        _ => {
            warn!(raw, "invalid persisted ringer mode");
            None
        }
    }
}

/// Fill alias targets from settings, then copy them into their dependents
fn load_persisted_volumes(store: &VolumeIndexStore, settings: &dyn SettingsStore, camera_sound_forced: bool) {
    let aliases = store.alias_table();
    for stream in StreamType::ALL.into_iter().filter(|s| aliases.is_target(*s)) {
        let name = stream.setting_name();
        let slots = std::iter::once((AudioDevice::DEFAULT, None))
            .chain(AudioDevice::OUTPUTS.iter().map(|(device, suffix)| (*device, Some(*suffix))));
        for (device, suffix) in slots {
            if let Some(ui) = settings.get_int(&volume_setting_key(name, suffix)) {
                let ui = ui.clamp(0, i64::from(i32::MAX / 10)) as i32;
                store.load_index(stream, device, ui * 10);
            }
        }
    }
    for stream in StreamType::ALL {
        let alias = aliases.alias(stream);
        if alias != stream {
            store.set_all_indexes(stream, alias);
        }
    }
    if camera_sound_forced {
        let max = store.max_index(StreamType::SystemEnforced);
        for (device, _) in store.entries(StreamType::SystemEnforced) {
            store.load_index(StreamType::SystemEnforced, device, max);
        }
    }
}
