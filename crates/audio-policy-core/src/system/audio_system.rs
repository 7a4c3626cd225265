//! Native audio system boundary
//!
//! Everything that reaches the mixer goes through [`AudioSystem`]. The
//! service never calls it while holding one of its own state locks.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AudioDevice, AudioMode, ConnectionState, ForceConfig, ForceUsage, StreamType};

/// Non-zero status returned by the native layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("native audio system returned status {status}")]
pub struct NativeError {
    pub status: i32,
}

impl NativeError {
    /// Generic failure status
    pub const ERROR: NativeError = NativeError { status: -1 };
    /// Argument rejected by the native layer
    pub const BAD_VALUE: NativeError = NativeError { status: -2 };
}

pub type NativeResult = std::result::Result<(), NativeError>;

/// Operations consumed from the native audio system
#[async_trait]
pub trait AudioSystem: Send + Sync {
    /// Declare the UI index range of a stream
    async fn init_stream_volume(&self, stream: StreamType, index_min: i32, index_max: i32) -> NativeResult;

    /// Apply a UI index to one device of a stream
    async fn set_stream_volume_index(&self, stream: StreamType, index: i32, device: AudioDevice) -> NativeResult;

    async fn set_device_connection_state(
        &self,
        device: AudioDevice,
        state: ConnectionState,
        address: &str,
        name: &str,
    ) -> NativeResult;

    async fn set_force_use(&self, usage: ForceUsage, config: ForceConfig) -> NativeResult;

    async fn get_force_use(&self, usage: ForceUsage) -> ForceConfig;

    /// Semicolon separated `key=value` pairs
    async fn set_parameters(&self, key_values: &str) -> NativeResult;

    /// True if the stream played within `in_past` (zero means right now)
    async fn is_stream_active(&self, stream: StreamType, in_past: Duration) -> bool;

    async fn set_phone_state(&self, mode: AudioMode) -> NativeResult;

    /// Devices the stream is routed to, possibly several bits
    async fn get_devices_for_stream(&self, stream: StreamType) -> AudioDevice;

    async fn set_master_volume(&self, value: f32) -> NativeResult;

    async fn set_master_mute(&self, mute: bool) -> NativeResult;
}
