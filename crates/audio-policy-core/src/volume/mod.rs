//! Volume index model
//!
//! - [`alias`]: alias tables, rescaling and app-op lookup
//! - [`stream_state`]: one stream's device index table and mute holders
//! - [`store`]: the per-stream-locked table for all streams

pub mod alias;
pub mod store;
pub mod stream_state;

pub use alias::{app_op_for_alias, rescale, AliasContext, AliasTable};
pub use store::{IndexChange, IndexUpdate, StreamRoutes, VolumeIndexStore};
pub use stream_state::{DeviceIndexMap, IndexLookup, MuteChange, VolumeStreamState};
