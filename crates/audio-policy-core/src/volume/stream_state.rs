//! Per-stream volume state: device index table and mute holders

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::{AudioDevice, ClientToken, StreamType};

/// Number of slots: the default device plus every output
const SLOT_COUNT: usize = AudioDevice::OUTPUTS.len() + 1;
const DEFAULT_SLOT: usize = 0;

/// Where an index came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLookup {
    /// The device has its own entry
    Explicit(i32),
    /// No entry for the device, the default-device entry was used
    Default(i32),
}

impl IndexLookup {
    pub fn index(self) -> i32 {
        match self {
            IndexLookup::Explicit(i) | IndexLookup::Default(i) => i,
        }
    }
}

/// Fixed-size device → index map with a mandatory default entry
#[derive(Debug, Clone)]
pub struct DeviceIndexMap {
    slots: [Option<i32>; SLOT_COUNT],
}

impl DeviceIndexMap {
    pub fn new(default_index: i32) -> Self {
        let mut slots = [None; SLOT_COUNT];
        slots[DEFAULT_SLOT] = Some(default_index);
        Self { slots }
    }

    fn slot(device: AudioDevice) -> Option<usize> {
        if device == AudioDevice::DEFAULT {
            return Some(DEFAULT_SLOT);
        }
        AudioDevice::OUTPUTS
            .iter()
            .position(|(d, _)| *d == device)
            .map(|p| p + 1)
    }

    fn device_at(slot: usize) -> AudioDevice {
        if slot == DEFAULT_SLOT {
            AudioDevice::DEFAULT
        } else {
            AudioDevice::OUTPUTS[slot - 1].0
        }
    }

    pub fn default_index(&self) -> i32 {
        self.slots[DEFAULT_SLOT].unwrap_or(0)
    }

    pub fn lookup(&self, device: AudioDevice) -> IndexLookup {
        match Self::slot(device).and_then(|s| self.slots[s]) {
            Some(index) => IndexLookup::Explicit(index),
            None => IndexLookup::Default(self.default_index()),
        }
    }

    pub fn has_entry(&self, device: AudioDevice) -> bool {
        matches!(self.lookup(device), IndexLookup::Explicit(_))
    }

    /// Store an index; devices outside the enumeration land on the default slot
    pub fn insert(&mut self, device: AudioDevice, index: i32) {
        let slot = Self::slot(device).unwrap_or_else(|| {
            warn!(%device, "volume for unknown device stored as default");
            DEFAULT_SLOT
        });
        self.slots[slot] = Some(index);
    }

    /// Entries with the default device first
    pub fn entries(&self) -> impl Iterator<Item = (AudioDevice, i32)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, index)| index.map(|i| (Self::device_at(slot), i)))
    }
}

/// Transition of a stream's effective mute state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteChange {
    Muted,
    Unmuted,
    Unchanged,
}

impl MuteChange {
    pub fn is_change(self) -> bool {
        self != MuteChange::Unchanged
    }
}

/// Volume and mute state of one stream
#[derive(Debug, Clone)]
pub struct VolumeStreamState {
    stream: StreamType,
    max_index: i32,
    indexes: DeviceIndexMap,
    mute_holders: HashMap<ClientToken, u32>,
}

impl VolumeStreamState {
    pub fn new(stream: StreamType, max_index: i32, default_index: i32) -> Self {
        let mut state = Self {
            stream,
            max_index,
            indexes: DeviceIndexMap::new(0),
            mute_holders: HashMap::new(),
        };
        let default_index = state.valid_index(default_index);
        state.indexes.insert(AudioDevice::DEFAULT, default_index);
        state
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    pub fn max_index(&self) -> i32 {
        self.max_index
    }

    pub fn valid_index(&self, index: i32) -> i32 {
        index.clamp(0, self.max_index)
    }

    pub fn lookup(&self, device: AudioDevice) -> IndexLookup {
        self.indexes.lookup(device)
    }

    pub fn index(&self, device: AudioDevice) -> i32 {
        self.indexes.lookup(device).index()
    }

    /// Clamp and store; returns the previous effective index if it changed
    pub fn store(&mut self, device: AudioDevice, index: i32) -> Option<i32> {
        let index = self.valid_index(index);
        let previous = self.index(device);
        self.indexes.insert(device, index);
        (previous != index).then_some(previous)
    }

    pub fn entries(&self) -> Vec<(AudioDevice, i32)> {
        self.indexes.entries().collect()
    }

    pub fn is_muted(&self) -> bool {
        !self.mute_holders.is_empty()
    }

    pub fn mute_count(&self, token: &ClientToken) -> u32 {
        self.mute_holders.get(token).copied().unwrap_or(0)
    }

    pub fn holders(&self) -> impl Iterator<Item = &ClientToken> {
        self.mute_holders.keys()
    }

    /// Add one mute reference for `token`
    pub fn mute(&mut self, token: ClientToken) -> MuteChange {
        let was_muted = self.is_muted();
        *self.mute_holders.entry(token).or_insert(0) += 1;
        debug!(stream = %self.stream, %token, count = self.mute_count(&token), "mute");
        if was_muted {
            MuteChange::Unchanged
        } else {
            MuteChange::Muted
        }
    }

    /// Drop one mute reference for `token`
    pub fn unmute(&mut self, token: ClientToken) -> MuteChange {
        let Some(count) = self.mute_holders.get_mut(&token) else {
            warn!(stream = %self.stream, %token, "unmute from a client that does not hold a mute");
            return MuteChange::Unchanged;
        };
        *count -= 1;
        if *count == 0 {
            self.mute_holders.remove(&token);
        }
        if self.is_muted() {
            MuteChange::Unchanged
        } else {
            MuteChange::Unmuted
        }
    }

    /// Peer died while holding mutes: collapse to one reference, then release it
    pub fn release_on_death(&mut self, token: ClientToken) -> MuteChange {
        match self.mute_holders.get_mut(&token) {
            Some(count) => {
                warn!(stream = %self.stream, %token, count = *count, "muting client died");
                *count = 1;
                self.unmute(token)
            }
            None => MuteChange::Unchanged,
        }
    }
}
