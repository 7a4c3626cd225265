//! In-memory audio system and Bluetooth stack
//!
//! Used by the tests and by hosts that run the policy without hardware.
//! Every call is recorded so tests can assert on what reached the native
//! layer and in which order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::audio_system::{AudioSystem, NativeError, NativeResult};
use super::bluetooth::{BluetoothDevice, BluetoothHeadset, BluetoothProfileConnector, HeadsetAudioState};
use crate::types::{AudioDevice, AudioMode, ConnectionState, ForceConfig, ForceUsage, StreamType};

/// One call that reached [`MockAudioSystem`]
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    InitStreamVolume { stream: StreamType, min: i32, max: i32 },
    SetStreamVolumeIndex { stream: StreamType, index: i32, device: AudioDevice },
    SetDeviceConnectionState { device: AudioDevice, state: ConnectionState, address: String },
    SetForceUse { usage: ForceUsage, config: ForceConfig },
    SetParameters(String),
    SetPhoneState(AudioMode),
    SetMasterVolume(f32),
    SetMasterMute(bool),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<NativeCall>,
    connected: HashSet<(AudioDevice, String)>,
    force_use: HashMap<ForceUsage, ForceConfig>,
    active: HashSet<StreamType>,
    routes: HashMap<StreamType, AudioDevice>,
    rejected_modes: HashSet<AudioMode>,
    rejected_devices: HashSet<AudioDevice>,
    volumes: HashMap<(StreamType, AudioDevice), i32>,
    phone_state: Option<AudioMode>,
}

impl MockState {
    fn outputs(&self) -> AudioDevice {
        self.connected
            .iter()
            .filter(|(d, _)| !d.is_input())
            .fold(AudioDevice::NONE, |acc, (d, _)| acc | *d)
    }

    fn force(&self, usage: ForceUsage) -> ForceConfig {
        self.force_use.get(&usage).copied().unwrap_or(ForceConfig::None)
    }

    fn route(&self, stream: StreamType) -> AudioDevice {
        if let Some(device) = self.routes.get(&stream) {
            return *device;
        }
        let outputs = self.outputs();
        let wired = outputs & (AudioDevice::WIRED_HEADSET | AudioDevice::WIRED_HEADPHONE);
        match stream {
            StreamType::VoiceCall | StreamType::BluetoothSco => {
                let sco = outputs & AudioDevice::ALL_SCO;
                if self.force(ForceUsage::Communication) == ForceConfig::BtSco && !sco.is_empty() {
                    lowest_bit(sco)
                } else if self.force(ForceUsage::Communication) == ForceConfig::Speaker {
                    AudioDevice::SPEAKER
                } else if !wired.is_empty() {
                    lowest_bit(wired)
                } else {
                    AudioDevice::EARPIECE
                }
            }
            StreamType::Ring
            | StreamType::Alarm
            | StreamType::Notification
            | StreamType::SystemEnforced => AudioDevice::SPEAKER | lowest_bit(wired),
            _ => {
                let a2dp = outputs & AudioDevice::ALL_A2DP;
                if self.force(ForceUsage::Media) != ForceConfig::NoBtA2dp && !a2dp.is_empty() {
                    lowest_bit(a2dp)
                } else if !wired.is_empty() {
                    lowest_bit(wired)
                } else {
                    AudioDevice::SPEAKER
                }
            }
        }
    }
}

fn lowest_bit(device: AudioDevice) -> AudioDevice {
    AudioDevice(device.0 & device.0.wrapping_neg())
}

/// Recording audio system with a simple built-in routing policy
#[derive(Debug, Default)]
pub struct MockAudioSystem {
    state: Mutex<MockState>,
}

impl MockAudioSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Last UI index applied to one device of a stream
    pub fn volume_index(&self, stream: StreamType, device: AudioDevice) -> Option<i32> {
        self.state.lock().volumes.get(&(stream, device)).copied()
    }

    pub fn phone_state(&self) -> Option<AudioMode> {
        self.state.lock().phone_state
    }

    pub fn phone_state_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, NativeCall::SetPhoneState(_)))
            .count()
    }

    pub fn connected_outputs(&self) -> AudioDevice {
        self.state.lock().outputs()
    }

    pub fn set_stream_active(&self, stream: StreamType, active: bool) {
        let mut state = self.state.lock();
        if active {
            state.active.insert(stream);
        } else {
            state.active.remove(&stream);
        }
    }

    /// Pin the routing of a stream, bypassing the built-in policy
    pub fn set_route(&self, stream: StreamType, devices: AudioDevice) {
        self.state.lock().routes.insert(stream, devices);
    }

    pub fn clear_route(&self, stream: StreamType) {
        self.state.lock().routes.remove(&stream);
    }

    /// Make `set_phone_state(mode)` fail
    pub fn reject_phone_state(&self, mode: AudioMode) {
        self.state.lock().rejected_modes.insert(mode);
    }

    pub fn accept_phone_state(&self, mode: AudioMode) {
        self.state.lock().rejected_modes.remove(&mode);
    }

    /// Make connection of `device` fail
    pub fn reject_device(&self, device: AudioDevice) {
        self.state.lock().rejected_devices.insert(device);
    }
}

#[async_trait]
impl AudioSystem for MockAudioSystem {
    async fn init_stream_volume(&self, stream: StreamType, index_min: i32, index_max: i32) -> NativeResult {
        self.state.lock().calls.push(NativeCall::InitStreamVolume {
            stream,
            min: index_min,
            max: index_max,
        });
        Ok(())
    }

    async fn set_stream_volume_index(&self, stream: StreamType, index: i32, device: AudioDevice) -> NativeResult {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::SetStreamVolumeIndex { stream, index, device });
        state.volumes.insert((stream, device), index);
        Ok(())
    }

    async fn set_device_connection_state(
        &self,
        device: AudioDevice,
        connection: ConnectionState,
        address: &str,
        _name: &str,
    ) -> NativeResult {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::SetDeviceConnectionState {
            device,
            state: connection,
            address: address.to_string(),
        });
        if connection.is_connected() {
            if state.rejected_devices.contains(&device) {
                return Err(NativeError::BAD_VALUE);
            }
            state.connected.insert((device, address.to_string()));
        } else {
            state.connected.remove(&(device, address.to_string()));
        }
        Ok(())
    }

    async fn set_force_use(&self, usage: ForceUsage, config: ForceConfig) -> NativeResult {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::SetForceUse { usage, config });
        state.force_use.insert(usage, config);
        Ok(())
    }

    async fn get_force_use(&self, usage: ForceUsage) -> ForceConfig {
        self.state.lock().force(usage)
    }

    async fn set_parameters(&self, key_values: &str) -> NativeResult {
        self.state
            .lock()
            .calls
            .push(NativeCall::SetParameters(key_values.to_string()));
        Ok(())
    }

    async fn is_stream_active(&self, stream: StreamType, _in_past: Duration) -> bool {
        self.state.lock().active.contains(&stream)
    }

    async fn set_phone_state(&self, mode: AudioMode) -> NativeResult {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::SetPhoneState(mode));
        if state.rejected_modes.contains(&mode) {
            debug!(?mode, "phone state rejected");
            return Err(NativeError::ERROR);
        }
        state.phone_state = Some(mode);
        Ok(())
    }

    async fn get_devices_for_stream(&self, stream: StreamType) -> AudioDevice {
        self.state.lock().route(stream)
    }

    async fn set_master_volume(&self, value: f32) -> NativeResult {
        self.state.lock().calls.push(NativeCall::SetMasterVolume(value));
        Ok(())
    }

    async fn set_master_mute(&self, mute: bool) -> NativeResult {
        self.state.lock().calls.push(NativeCall::SetMasterMute(mute));
        Ok(())
    }
}

/// One call that reached [`MockBluetoothHeadset`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadsetCall {
    ConnectAudio,
    DisconnectAudio,
    StartVirtualCall(String),
    StopVirtualCall(String),
    StartVoiceRecognition(String),
    StopVoiceRecognition(String),
}

impl HeadsetCall {
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            HeadsetCall::ConnectAudio | HeadsetCall::StartVirtualCall(_) | HeadsetCall::StartVoiceRecognition(_)
        )
    }

    pub fn is_stop(&self) -> bool {
        !self.is_start()
    }
}

/// Headset proxy that accepts (or refuses) every request and records it
#[derive(Debug)]
pub struct MockBluetoothHeadset {
    devices: Mutex<Vec<BluetoothDevice>>,
    audio_state: Mutex<HeadsetAudioState>,
    accept: AtomicBool,
    calls: Mutex<Vec<HeadsetCall>>,
}

impl MockBluetoothHeadset {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            audio_state: Mutex::new(HeadsetAudioState::Disconnected),
            accept: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_device(device: BluetoothDevice) -> Self {
        let headset = Self::new();
        headset.devices.lock().push(device);
        headset
    }

    pub fn set_devices(&self, devices: Vec<BluetoothDevice>) {
        *self.devices.lock() = devices;
    }

    pub fn set_audio_state(&self, state: HeadsetAudioState) {
        *self.audio_state.lock() = state;
    }

    /// Make every subsequent request fail
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<HeadsetCall> {
        self.calls.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.is_start()).count()
    }

    pub fn stop_count(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.is_stop()).count()
    }

    fn record(&self, call: HeadsetCall) -> bool {
        self.calls.lock().push(call);
        self.accept.load(Ordering::SeqCst)
    }
}

impl Default for MockBluetoothHeadset {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BluetoothHeadset for MockBluetoothHeadset {
    async fn connected_devices(&self) -> Vec<BluetoothDevice> {
        self.devices.lock().clone()
    }

    async fn audio_state(&self, _device: &BluetoothDevice) -> HeadsetAudioState {
        *self.audio_state.lock()
    }

    async fn connect_audio(&self) -> bool {
        self.record(HeadsetCall::ConnectAudio)
    }

    async fn disconnect_audio(&self) -> bool {
        self.record(HeadsetCall::DisconnectAudio)
    }

    async fn start_sco_using_virtual_voice_call(&self, device: &BluetoothDevice) -> bool {
        self.record(HeadsetCall::StartVirtualCall(device.address.clone()))
    }

    async fn stop_sco_using_virtual_voice_call(&self, device: &BluetoothDevice) -> bool {
        self.record(HeadsetCall::StopVirtualCall(device.address.clone()))
    }

    async fn start_voice_recognition(&self, device: &BluetoothDevice) -> bool {
        self.record(HeadsetCall::StartVoiceRecognition(device.address.clone()))
    }

    async fn stop_voice_recognition(&self, device: &BluetoothDevice) -> bool {
        self.record(HeadsetCall::StopVoiceRecognition(device.address.clone()))
    }
}

/// Profile connector counting proxy requests
#[derive(Debug)]
pub struct MockProfileConnector {
    accept: AtomicBool,
    requests: AtomicUsize,
}

impl MockProfileConnector {
    pub fn new() -> Self {
        Self {
            accept: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Default for MockProfileConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BluetoothProfileConnector for MockProfileConnector {
    async fn request_headset_proxy(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.accept.load(Ordering::SeqCst)
    }
}
