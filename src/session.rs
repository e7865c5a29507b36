use std::fmt;

use crate::error::ConfigError;

/// Caller-chosen identifier for one sampling run.
///
/// Used both as the run's snapshot directory name and as the key under which
/// its control channel is registered, so it must be a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.chars().any(char::is_control);
        if valid {
            Ok(RunId(id))
        } else {
            Err(ConfigError::InvalidRunId(id))
        }
    }

    /// Default run id for a seeded session.
    pub fn from_seed(seed: u64) -> Self {
        RunId(format!("run_{seed}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for RunId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RunId::new(raw).map_err(serde::de::Error::custom)
    }
}
