use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ConfigError;

/// Sampling session parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Total number of steps in the schedule.
    pub steps: u64,
    /// First step to execute after; ignored when resuming from a checkpoint.
    pub start_at_step: u64,
    /// Last step to execute (clamped to `steps`).
    pub end_at_step: u64,
    pub seed: u64,
    /// One of `euler`, `euler_ancestral`, `multistep_2m`, `multistep_3m`.
    pub solver: String,
    /// Number of values in the state buffer.
    pub state_len: usize,
    pub sigma_max: f32,
    pub sigma_min: f32,
    /// Shrink factor of the reference denoiser.
    pub denoise_strength: f32,
    /// Add initial noise on a fresh start. Always suppressed on resume.
    pub add_noise: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            steps: 20,
            start_at_step: 0,
            end_at_step: 10_000,
            seed: 0,
            solver: "multistep_2m".to_string(),
            state_len: 64,
            sigma_max: 14.6,
            sigma_min: 0.03,
            denoise_strength: 0.5,
            add_noise: true,
        }
    }
}

/// Snapshot cadence and storage budget.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub base_dir: PathBuf,
    /// Per-run storage ceiling in megabytes.
    pub storage_limit_mb: u64,
    /// Snapshot every N steps.
    pub interval: u64,
    /// Extra bytes reserved on top of the encoded size for cadence snapshots.
    pub headroom_bytes: u64,
    /// Extra bytes reserved on top of the encoded size for forced snapshots.
    pub forced_headroom_bytes: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            base_dir: PathBuf::from("snapshots"),
            storage_limit_mb: 2048,
            interval: 10,
            headroom_bytes: 0,
            forced_headroom_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// How often a paused worker re-checks its command, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sampler: SamplerConfig,
    pub snapshot: SnapshotConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sampler;
        if s.steps == 0 {
            return Err(ConfigError::Validation("sampler.steps must be > 0".into()));
        }
        if s.state_len == 0 {
            return Err(ConfigError::Validation("sampler.state_len must be > 0".into()));
        }
        if s.start_at_step >= s.steps {
            return Err(ConfigError::Validation(
                "sampler.start_at_step must be < sampler.steps".into(),
            ));
        }
        if s.end_at_step <= s.start_at_step {
            return Err(ConfigError::Validation(
                "sampler.end_at_step must be > sampler.start_at_step".into(),
            ));
        }
        if !(s.sigma_min > 0.0 && s.sigma_max > s.sigma_min) {
            return Err(ConfigError::Validation(
                "sampler.sigma_max must be > sampler.sigma_min > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&s.denoise_strength) {
            return Err(ConfigError::Validation(
                "sampler.denoise_strength must be in [0, 1]".into(),
            ));
        }
        if crate::sampler::SolverKind::parse(&s.solver).is_none() {
            return Err(ConfigError::Validation(format!(
                "sampler.solver '{}' is not a known solver",
                s.solver
            )));
        }

        if self.snapshot.interval == 0 {
            return Err(ConfigError::Validation("snapshot.interval must be > 0".into()));
        }
        if self.snapshot.storage_limit_mb == 0 {
            return Err(ConfigError::Validation(
                "snapshot.storage_limit_mb must be > 0".into(),
            ));
        }

        if self.control.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "control.poll_interval_ms must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&AppConfig::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[snapshot]
interval = 5
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.snapshot.interval, 5);
        assert_eq!(config.snapshot.storage_limit_mb, 2048);
        assert_eq!(config.sampler.steps, 20);
        assert_eq!(config.control.poll_interval_ms, 100);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        let default = AppConfig::default();
        assert_eq!(config.sampler.solver, default.sampler.solver);
        assert_eq!(config.snapshot.base_dir, default.snapshot.base_dir);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = AppConfig::default();
        config.snapshot.interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_solver() {
        let mut config = AppConfig::default();
        config.sampler.solver = "heun_9000".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heun_9000"));
    }

    #[test]
    fn test_validation_rejects_bad_step_range() {
        let mut config = AppConfig::default();
        config.sampler.start_at_step = 20;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sampler.start_at_step = 5;
        config.sampler.end_at_step = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_sigmas() {
        let mut config = AppConfig::default();
        config.sampler.sigma_min = 20.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_roundtrip() {
        let toml_str = AppConfig::default_toml();
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.snapshot.storage_limit_mb, 2048);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[sampler]\nsteps = 30\nsolver = \"euler\"").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.sampler.steps, 30);
        assert_eq!(config.sampler.solver, "euler");
    }

    #[test]
    fn test_load_invalid_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[control]\npoll_interval_ms = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load(&path).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.sampler.steps, 20);
    }
}
