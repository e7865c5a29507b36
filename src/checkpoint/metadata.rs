use std::collections::BTreeMap;

use crate::error::MetadataError;

/// Free-form run settings recorded with every checkpoint (seed, solver name,
/// guidance scale, ...). Values are scalars or strings.
pub type Settings = BTreeMap<String, serde_json::Value>;

pub const KEY_STEP: &str = "step";
pub const KEY_SETTINGS: &str = "settings";
pub const KEY_HAS_MOMENTUM: &str = "has_momentum";

/// String-keyed sidecar metadata stored alongside the tensors of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMetadata {
    pub step: u64,
    pub settings: Settings,
    pub has_momentum: bool,
}

impl CheckpointMetadata {
    /// Flatten into the on-disk string map.
    pub fn to_map(&self) -> Result<BTreeMap<String, String>, serde_json::Error> {
        let mut map = BTreeMap::new();
        map.insert(KEY_STEP.to_string(), self.step.to_string());
        map.insert(KEY_SETTINGS.to_string(), serde_json::to_string(&self.settings)?);
        map.insert(
            KEY_HAS_MOMENTUM.to_string(),
            if self.has_momentum { "True" } else { "False" }.to_string(),
        );
        Ok(map)
    }

    /// Parse the on-disk string map. `settings` and `has_momentum` are
    /// optional; `step` is required.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, MetadataError> {
        let step = map
            .get(KEY_STEP)
            .ok_or(MetadataError::MissingField(KEY_STEP))?
            .trim()
            .parse::<u64>()?;

        let settings = match map.get(KEY_SETTINGS) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Settings::new(),
        };

        let has_momentum = match map.get(KEY_HAS_MOMENTUM).map(String::as_str) {
            None | Some("False") | Some("false") => false,
            Some("True") | Some("true") => true,
            Some(other) => return Err(MetadataError::InvalidMomentumFlag(other.to_string())),
        };

        Ok(CheckpointMetadata {
            step,
            settings,
            has_momentum,
        })
    }
}
