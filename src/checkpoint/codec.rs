use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::{debug, warn};

use super::buffer::NumericBuffer;
use super::metadata::{CheckpointMetadata, Settings};
use super::rng::{DeviceRngs, RngBlob};
use crate::error::CheckpointError;

/// Container version written into every checkpoint file.
pub const FORMAT_VERSION: u32 = 1;

const TENSOR_STATE: &str = "state";
const TENSOR_DERIVATIVE: &str = "derivative";
const DTYPE_F32: &str = "F32";

/// One captured step: everything needed to continue a run from `step`.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub step: u64,
    pub state: NumericBuffer,
    pub rng_states: BTreeMap<String, RngBlob>,
    pub derivative: Option<NumericBuffer>,
    pub settings: Settings,
}

impl Checkpoint {
    /// Capture the current state together with every active RNG.
    pub fn capture(
        step: u64,
        state: &NumericBuffer,
        derivative: Option<&NumericBuffer>,
        settings: &Settings,
        rngs: &DeviceRngs,
    ) -> Result<Self, CheckpointError> {
        Ok(Checkpoint {
            step,
            state: state.clone(),
            rng_states: rngs.capture()?,
            derivative: derivative.cloned(),
            settings: settings.clone(),
        })
    }

    pub fn has_momentum(&self) -> bool {
        self.derivative.is_some()
    }

    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            step: self.step,
            settings: self.settings.clone(),
            has_momentum: self.has_momentum(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorRecord {
    dtype: String,
    shape: Vec<usize>,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl TensorRecord {
    fn from_buffer(buffer: &NumericBuffer) -> Self {
        TensorRecord {
            dtype: DTYPE_F32.to_string(),
            shape: buffer.shape().to_vec(),
            data: buffer.to_le_bytes(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    format_version: u32,
    tensors: BTreeMap<String, TensorRecord>,
    rng_states: BTreeMap<String, ByteBuf>,
    metadata: BTreeMap<String, String>,
}

/// Stateless encoder/decoder for checkpoint files.
pub struct StateCodec;

impl StateCodec {
    /// Encode a checkpoint into the bytes of a checkpoint file.
    pub fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>, CheckpointError> {
        let mut tensors = BTreeMap::new();
        tensors.insert(
            TENSOR_STATE.to_string(),
            TensorRecord::from_buffer(&checkpoint.state),
        );
        if let Some(derivative) = &checkpoint.derivative {
            tensors.insert(
                TENSOR_DERIVATIVE.to_string(),
                TensorRecord::from_buffer(derivative),
            );
        }

        let metadata = checkpoint.metadata().to_map().map_err(|e| {
            CheckpointError::corrupt(
                format!("step_{}", checkpoint.step),
                format!("settings are not serializable: {e}"),
            )
        })?;

        let file = CheckpointFile {
            format_version: FORMAT_VERSION,
            tensors,
            rng_states: checkpoint
                .rng_states
                .iter()
                .map(|(device, blob)| (device.clone(), ByteBuf::from(blob.clone())))
                .collect(),
            metadata,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&file, &mut bytes).map_err(|e| {
            CheckpointError::corrupt(
                format!("step_{}", checkpoint.step),
                format!("failed to encode checkpoint: {e}"),
            )
        })?;
        Ok(bytes)
    }

    /// Decode checkpoint bytes. `path` is used for error context only.
    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
        let mut file: CheckpointFile = ciborium::from_reader(bytes)
            .map_err(|e| CheckpointError::corrupt(path, format!("unreadable container: {e}")))?;

        if file.format_version > FORMAT_VERSION {
            return Err(CheckpointError::corrupt(
                path,
                format!("unsupported format version {}", file.format_version),
            ));
        }

        let meta = CheckpointMetadata::from_map(&file.metadata)
            .map_err(|e| CheckpointError::corrupt(path, e))?;

        let state = match file.tensors.remove(TENSOR_STATE) {
            Some(record) => tensor_to_buffer(path, TENSOR_STATE, record)?,
            None => return Err(CheckpointError::corrupt(path, "missing state tensor")),
        };
        let derivative = file
            .tensors
            .remove(TENSOR_DERIVATIVE)
            .map(|record| tensor_to_buffer(path, TENSOR_DERIVATIVE, record))
            .transpose()?;

        if file.rng_states.is_empty() {
            return Err(CheckpointError::corrupt(path, "no RNG state recorded"));
        }

        if meta.has_momentum != derivative.is_some() {
            warn!(
                path = %path.display(),
                has_momentum = meta.has_momentum,
                derivative_present = derivative.is_some(),
                "Momentum flag disagrees with stored tensors; trusting tensors"
            );
        }

        Ok(Checkpoint {
            step: meta.step,
            state,
            rng_states: file
                .rng_states
                .into_iter()
                .map(|(device, blob)| (device, blob.into_vec()))
                .collect(),
            derivative,
            settings: meta.settings,
        })
    }

    /// Write `checkpoint` to `path` atomically. Returns the file size in bytes.
    pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<u64, CheckpointError> {
        let bytes = Self::encode(checkpoint)?;
        Self::write_encoded(path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Write already-encoded bytes to `path` via a temporary file and rename,
    /// so readers never observe a partial checkpoint.
    pub fn write_encoded(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
        let tmp_path = tmp_path_for(path);
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        debug!(path = %path.display(), size_bytes = bytes.len(), "Checkpoint written");
        Ok(())
    }

    /// Decode a checkpoint file without touching any RNG.
    pub fn read(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CheckpointError::MissingCheckpoint(path.to_path_buf()),
            _ => CheckpointError::corrupt(path, format!("unreadable file: {e}")),
        })?;
        Self::decode(path, &bytes)
    }

    /// Decode a checkpoint file and restore its RNG state into `rngs`.
    ///
    /// Restoring is a global side effect on the caller's generators: call this
    /// immediately before stepping resumes, with no other draws in between.
    pub fn load(path: &Path, rngs: &mut DeviceRngs) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Self::read(path)?;
        let decoded = DeviceRngs::decode(&checkpoint.rng_states)
            .map_err(|e| CheckpointError::corrupt(path, e))?;
        let restored = rngs.restore(decoded);
        debug!(
            path = %path.display(),
            step = checkpoint.step,
            devices = ?restored,
            "Checkpoint loaded, RNG restored"
        );
        Ok(checkpoint)
    }
}

fn tensor_to_buffer(
    path: &Path,
    name: &str,
    record: TensorRecord,
) -> Result<NumericBuffer, CheckpointError> {
    if record.dtype != DTYPE_F32 {
        return Err(CheckpointError::corrupt(
            path,
            format!("tensor '{name}' has unsupported dtype {}", record.dtype),
        ));
    }
    NumericBuffer::from_le_bytes(record.shape, &record.data)
        .map_err(|e| CheckpointError::corrupt(path, format!("tensor '{name}': {e}")))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
