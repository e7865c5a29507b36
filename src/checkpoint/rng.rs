use std::collections::BTreeMap;

use rand::SeedableRng;
use rand_pcg::Pcg64;
use tracing::debug;

use crate::error::RngStateError;

/// Name of the device whose generator always exists.
pub const DEFAULT_DEVICE: &str = "cpu";

/// Serialized generator state for one device.
pub type RngBlob = Vec<u8>;

/// The worker's random-number runtime: one generator per active device.
///
/// Checkpoints capture every active generator and restore them before
/// stepping resumes, so a resumed run draws exactly the numbers the original
/// run would have drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRngs {
    generators: BTreeMap<String, Pcg64>,
}

impl DeviceRngs {
    /// Seed the default device.
    pub fn seeded(seed: u64) -> Self {
        let mut generators = BTreeMap::new();
        generators.insert(DEFAULT_DEVICE.to_string(), Pcg64::seed_from_u64(seed));
        DeviceRngs { generators }
    }

    /// Activate an extra device with its own seed. Re-activating replaces it.
    pub fn activate(&mut self, device: impl Into<String>, seed: u64) {
        self.generators
            .insert(device.into(), Pcg64::seed_from_u64(seed));
    }

    pub fn is_active(&self, device: &str) -> bool {
        self.generators.contains_key(device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.generators.keys().map(String::as_str)
    }

    pub fn device_mut(&mut self, device: &str) -> Option<&mut Pcg64> {
        self.generators.get_mut(device)
    }

    /// Generator of the default device.
    pub fn default_mut(&mut self) -> &mut Pcg64 {
        self.generators
            .entry(DEFAULT_DEVICE.to_string())
            .or_insert_with(|| Pcg64::seed_from_u64(0))
    }

    /// Serialize every active generator. Fails if any device cannot be
    /// captured, so a checkpoint never silently lacks a generator.
    pub fn capture(&self) -> Result<BTreeMap<String, RngBlob>, RngStateError> {
        self.generators
            .iter()
            .map(|(device, rng)| {
                let mut blob = Vec::new();
                ciborium::into_writer(rng, &mut blob).map_err(|e| RngStateError::Capture {
                    device: device.clone(),
                    reason: e.to_string(),
                })?;
                Ok((device.clone(), blob))
            })
            .collect()
    }

    /// Decode blobs without installing them.
    pub fn decode(
        blobs: &BTreeMap<String, RngBlob>,
    ) -> Result<BTreeMap<String, Pcg64>, RngStateError> {
        blobs
            .iter()
            .map(|(device, blob)| {
                ciborium::from_reader::<Pcg64, _>(blob.as_slice())
                    .map(|rng| (device.clone(), rng))
                    .map_err(|e| RngStateError::Decode {
                        device: device.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    /// Install decoded generators for every device that is active here.
    /// Devices that are not active are skipped. Returns the restored devices.
    pub fn restore(&mut self, decoded: BTreeMap<String, Pcg64>) -> Vec<String> {
        let mut restored = Vec::new();
        for (device, rng) in decoded {
            match self.generators.get_mut(&device) {
                Some(slot) => {
                    *slot = rng;
                    restored.push(device);
                }
                None => debug!(device = %device, "Skipping RNG state for inactive device"),
            }
        }
        restored
    }
}
