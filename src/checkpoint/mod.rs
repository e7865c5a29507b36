//! Checkpoint persistence: the state codec, the size-bounded snapshot store,
//! and derivative history reconstruction for cold resumes.

mod buffer;
mod codec;
mod history;
mod metadata;
mod rng;
mod store;

pub use buffer::NumericBuffer;
pub use codec::{Checkpoint, StateCodec, FORMAT_VERSION};
pub use history::{HistoryBuffer, HistoryFrame, HistoryReconstructor};
pub use metadata::{CheckpointMetadata, Settings};
pub use rng::{DeviceRngs, RngBlob, DEFAULT_DEVICE};
pub use store::{
    checkpoint_file_name, parse_checkpoint_file_name, EvictionReport, IndexEntry, SnapshotStore,
    CHECKPOINT_EXTENSION,
};
