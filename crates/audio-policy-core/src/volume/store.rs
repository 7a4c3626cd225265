//! Authoritative per-stream, per-device volume indices
//!
//! Every stream has its own lock. A write to an alias target also writes
//! the streams that mirror it, taking the target lock first and the
//! dependent locks second. Dependents never have dependents of their own
//! (see [`AliasTable::is_flat`]), so the order cannot cycle.
//!
//! The store never talks to the audio system. Callers look at the returned
//! [`IndexUpdate`] and queue the hardware work themselves.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::alias::{rescale, AliasTable};
use super::stream_state::{IndexLookup, MuteChange, VolumeStreamState};
use crate::config::AudioPolicyConfig;
use crate::types::{AudioDevice, ClientToken, StreamType};

/// One stored index that moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexChange {
    pub stream: StreamType,
    pub device: AudioDevice,
    pub previous: i32,
    pub current: i32,
}

/// Outcome of an index write, including alias propagation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexUpdate {
    /// The stream that was written changed
    pub changed: bool,
    /// Every index that moved, the written stream first
    pub changes: Vec<IndexChange>,
}

impl IndexUpdate {
    fn record(&mut self, stream: StreamType, device: AudioDevice, previous: i32, current: i32) {
        self.changes.push(IndexChange {
            stream,
            device,
            previous,
            current,
        });
    }

    pub fn merge(&mut self, other: IndexUpdate) {
        self.changed |= other.changed;
        self.changes.extend(other.changes);
    }
}

/// Output device currently used by each stream
///
/// Resolved by the caller from the audio system before touching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRoutes([AudioDevice; StreamType::COUNT]);

impl StreamRoutes {
    pub fn new(devices: [AudioDevice; StreamType::COUNT]) -> Self {
        Self(devices)
    }

    /// Every stream on the same device
    pub fn uniform(device: AudioDevice) -> Self {
        Self([device; StreamType::COUNT])
    }

    pub fn device(&self, stream: StreamType) -> AudioDevice {
        self.0[stream.index()]
    }

    pub fn set(&mut self, stream: StreamType, device: AudioDevice) {
        self.0[stream.index()] = device;
    }
}

/// Volume index table for all streams
pub struct VolumeIndexStore {
    streams: Vec<Mutex<VolumeStreamState>>,
    aliases: RwLock<AliasTable>,
    camera_sound_forced: AtomicBool,
}

impl VolumeIndexStore {
    pub fn new(config: &AudioPolicyConfig, aliases: AliasTable) -> Self {
        debug_assert!(aliases.is_flat());
        let streams = StreamType::ALL
            .iter()
            .map(|s| {
                Mutex::new(VolumeStreamState::new(
                    *s,
                    config.max_index(*s),
                    config.default_index(*s),
                ))
            })
            .collect();
        Self {
            streams,
            aliases: RwLock::new(aliases),
            camera_sound_forced: AtomicBool::new(config.camera_sound_forced),
        }
    }

    fn state(&self, stream: StreamType) -> &Mutex<VolumeStreamState> {
        &self.streams[stream.index()]
    }

    pub fn max_index(&self, stream: StreamType) -> i32 {
        self.state(stream).lock().max_index()
    }

    pub fn alias_table(&self) -> AliasTable {
        *self.aliases.read()
    }

    pub fn alias_of(&self, stream: StreamType) -> StreamType {
        self.aliases.read().alias(stream)
    }

    /// Replace the alias table, returning the previous one
    pub fn set_alias_table(&self, table: AliasTable) -> AliasTable {
        debug_assert!(table.is_flat());
        std::mem::replace(&mut *self.aliases.write(), table)
    }

    pub fn set_camera_sound_forced(&self, forced: bool) {
        self.camera_sound_forced.store(forced, Ordering::SeqCst);
    }

    /// Rescale an index of `src` into the range of `dst`
    pub fn rescale_between(&self, index: i32, src: StreamType, dst: StreamType) -> i32 {
        rescale(index, self.max_index(src), self.max_index(dst))
    }

    pub fn lookup(&self, stream: StreamType, device: AudioDevice) -> IndexLookup {
        self.state(stream).lock().lookup(device)
    }

    /// Stored index, falling back to the default-device entry
    pub fn get_index(&self, stream: StreamType, device: AudioDevice) -> i32 {
        self.state(stream).lock().index(device)
    }

    pub fn entries(&self, stream: StreamType) -> Vec<(AudioDevice, i32)> {
        self.state(stream).lock().entries()
    }

    /// Copy of a stream's state, for inspection
    pub fn snapshot(&self, stream: StreamType) -> VolumeStreamState {
        self.state(stream).lock().clone()
    }

    /// Clamp, store and propagate to aliased streams on the same device
    pub fn set_index(&self, stream: StreamType, index: i32, device: AudioDevice) -> bool {
        self.set_index_routed(stream, index, device, None).changed
    }

    /// Same as [`set_index`](Self::set_index), and when `device` is the
    /// stream's current output also writes each dependent's current output
    pub fn set_index_routed(
        &self,
        stream: StreamType,
        index: i32,
        device: AudioDevice,
        routes: Option<&StreamRoutes>,
    ) -> IndexUpdate {
        self.update_index(stream, device, routes, |_| index)
    }

    pub fn adjust_index(&self, stream: StreamType, delta: i32, device: AudioDevice) -> bool {
        self.adjust_index_routed(stream, delta, device, None).changed
    }

    pub fn adjust_index_routed(
        &self,
        stream: StreamType,
        delta: i32,
        device: AudioDevice,
        routes: Option<&StreamRoutes>,
    ) -> IndexUpdate {
        self.update_index(stream, device, routes, |current| current.saturating_add(delta))
    }

    fn update_index(
        &self,
        stream: StreamType,
        device: AudioDevice,
        routes: Option<&StreamRoutes>,
        next: impl FnOnce(i32) -> i32,
    ) -> IndexUpdate {
        let aliases = self.alias_table();
        let mut update = IndexUpdate::default();

        let mut origin = self.state(stream).lock();
        let mut index = next(origin.index(device));
        if stream == StreamType::SystemEnforced && self.camera_sound_forced.load(Ordering::SeqCst) {
            index = origin.max_index();
        }
        let Some(previous) = origin.store(device, index) else {
            return update;
        };
        let current = origin.index(device);
        update.changed = true;
        update.record(stream, device, previous, current);
        trace!(%stream, ?device, previous, current, "index changed");

        let src_max = origin.max_index();
        let on_current_device = routes.is_some_and(|r| r.device(stream) == device);
        for dependent in aliases.dependents(stream) {
            let mut state = self.state(dependent).lock();
            let scaled = rescale(current, src_max, state.max_index());
            if let Some(previous) = state.store(device, scaled) {
                update.record(dependent, device, previous, state.index(device));
            }
            if let Some(routes) = routes.filter(|_| on_current_device) {
                let own_device = routes.device(dependent);
                if own_device != device {
                    if let Some(previous) = state.store(own_device, scaled) {
                        update.record(dependent, own_device, previous, state.index(own_device));
                    }
                }
            }
        }
        update
    }

    /// Re-derive every index of `dst` from `src`
    ///
    /// All existing entries first take the rescaled default of `src`, then
    /// each entry of `src` is copied over rescaled.
    pub fn set_all_indexes(&self, dst: StreamType, src: StreamType) -> IndexUpdate {
        let (src_entries, src_max) = {
            let state = self.state(src).lock();
            (state.entries(), state.max_index())
        };
        let src_default = src_entries
            .iter()
            .find(|(d, _)| *d == AudioDevice::DEFAULT)
            .map(|(_, i)| *i)
            .unwrap_or(0);

        let mut state = self.state(dst).lock();
        let dst_max = state.max_index();
        let before = state.entries();

        let default_scaled = rescale(src_default, src_max, dst_max);
        for (device, _) in &before {
            state.store(*device, default_scaled);
        }
        for (device, index) in &src_entries {
            state.store(*device, rescale(*index, src_max, dst_max));
        }

        let mut update = IndexUpdate::default();
        for (device, current) in state.entries() {
            let previous = before
                .iter()
                .find(|(d, _)| *d == device)
                .map(|(_, i)| *i)
                .unwrap_or_else(|| {
                    before
                        .first()
                        .map(|(_, i)| *i)
                        .unwrap_or_default()
                });
            if previous != current {
                update.changed = true;
                update.record(dst, device, previous, current);
            }
        }
        debug!(%dst, %src, changes = update.changes.len(), "indexes re-derived from alias");
        update
    }

    /// Load a persisted value without alias propagation
    pub fn load_index(&self, stream: StreamType, device: AudioDevice, index: i32) {
        self.state(stream).lock().store(device, index);
    }

    /// Force every zero entry of `stream` up to `floor`
    pub fn raise_silent_entries(&self, stream: StreamType, floor: i32) -> IndexUpdate {
        let silent: Vec<AudioDevice> = self
            .entries(stream)
            .into_iter()
            .filter(|(_, index)| *index == 0)
            .map(|(device, _)| device)
            .collect();
        let mut update = IndexUpdate::default();
        for device in silent {
            update.merge(self.set_index_routed(stream, floor, device, None));
        }
        update
    }

    pub fn mute(&self, stream: StreamType, token: ClientToken) -> MuteChange {
        self.state(stream).lock().mute(token)
    }

    pub fn unmute(&self, stream: StreamType, token: ClientToken) -> MuteChange {
        self.state(stream).lock().unmute(token)
    }

    pub fn release_mute_on_death(&self, stream: StreamType, token: ClientToken) -> MuteChange {
        self.state(stream).lock().release_on_death(token)
    }

    pub fn is_muted(&self, stream: StreamType) -> bool {
        self.state(stream).lock().is_muted()
    }

    pub fn mute_count(&self, stream: StreamType, token: &ClientToken) -> u32 {
        self.state(stream).lock().mute_count(token)
    }

    /// Streams where `token` holds at least one mute
    pub fn streams_muted_by(&self, token: &ClientToken) -> Vec<StreamType> {
        StreamType::ALL
            .into_iter()
            .filter(|s| self.mute_count(*s, token) > 0)
            .collect()
    }

    /// Index to send to the hardware for one device
    pub fn hardware_index(
        &self,
        stream: StreamType,
        device: AudioDevice,
        full_volume_devices: AudioDevice,
    ) -> i32 {
        let state = self.state(stream).lock();
        Self::hardware_index_of(&state, device, full_volume_devices)
    }

    /// Hardware indices of every entry, default device first
    pub fn hardware_volumes(
        &self,
        stream: StreamType,
        full_volume_devices: AudioDevice,
    ) -> Vec<(AudioDevice, i32)> {
        let state = self.state(stream).lock();
        state
            .entries()
            .into_iter()
            .map(|(device, _)| (device, Self::hardware_index_of(&state, device, full_volume_devices)))
            .collect()
    }

    fn hardware_index_of(
        state: &VolumeStreamState,
        device: AudioDevice,
        full_volume_devices: AudioDevice,
    ) -> i32 {
        if state.is_muted() {
            0
        } else if device != AudioDevice::DEFAULT && full_volume_devices.intersects(device) {
            (state.max_index() + 5) / 10
        } else {
            (state.index(device) + 5) / 10
        }
    }

    /// User-visible volume of a stream on a device
    pub fn ui_volume(
        &self,
        stream: StreamType,
        device: AudioDevice,
        fixed_volume_devices: AudioDevice,
    ) -> u32 {
        let alias = self.alias_of(stream);
        let state = self.state(stream).lock();
        if state.is_muted() {
            return 0;
        }
        let mut index = state.index(device);
        if index != 0 && alias == StreamType::Music && fixed_volume_devices.intersects(device) {
            index = state.max_index();
        }
        ((index + 5) / 10) as u32
    }

    /// User-visible volume ignoring mute
    pub fn last_audible_ui_volume(&self, stream: StreamType, device: AudioDevice) -> u32 {
        ((self.get_index(stream, device) + 5) / 10) as u32
    }

    /// User-visible maximum of a stream
    pub fn ui_max(&self, stream: StreamType) -> u32 {
        ((self.max_index(stream) + 5) / 10) as u32
    }
}
