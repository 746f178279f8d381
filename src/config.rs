//! Runtime settings and their JSON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IcaError, io_context};
use crate::operation::DefaultRejection;

/// Environment variable overriding [`IcaConfig::engine_path`].
pub const ENGINE_PATH_ENV: &str = "ICA_ENGINE_PATH";
/// Environment variable overriding [`IcaConfig::output_root`].
pub const OUTPUT_ROOT_ENV: &str = "ICA_OUTPUT_ROOT";

/// Longest accepted training duration in seconds.
pub const MAX_TRAINING_DURATION_SECS: f32 = 3_600.0;
/// Highest accepted target sample rate in Hz.
pub const MAX_TARGET_SAMPLE_RATE: f32 = 1_000_000.0;
/// Upper bound on cached samples per channel, whatever the stream rate.
const MAX_CACHE_SAMPLES: usize = 1 << 26;

/// Processor-wide settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcaConfig {
    /// Seconds of (downsampled) data collected before training.
    pub training_duration_secs: f32,
    /// Rate the training cache is decimated towards, in Hz.
    pub target_sample_rate: f32,
    /// Directory under which each run creates its own folder.
    pub output_root: PathBuf,
    /// Optional suffix appended to run folder names.
    pub dir_suffix: String,
    /// External engine executable. `None` means `binica` beside the current executable.
    pub engine_path: Option<PathBuf>,
    /// Sleep between polls of the cache, locks and the engine.
    pub poll_interval_ms: u64,
    /// Selection applied when a new decomposition cannot inherit one.
    pub default_rejection: DefaultRejection,
}

impl Default for IcaConfig {
    fn default() -> Self {
        Self {
            training_duration_secs: 120.0,
            target_sample_rate: 500.0,
            output_root: PathBuf::from("ica"),
            dir_suffix: String::new(),
            engine_path: None,
            poll_interval_ms: 100,
            default_rejection: DefaultRejection::FirstComponent,
        }
    }
}

impl IcaConfig {
    /// Defaults overlaid with `ICA_ENGINE_PATH` / `ICA_OUTPUT_ROOT` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(ENGINE_PATH_ENV) {
            config.engine_path = Some(PathBuf::from(path));
        }
        if let Ok(root) = std::env::var(OUTPUT_ROOT_ENV) {
            config.output_root = PathBuf::from(root);
        }
        config
    }

    /// Poll interval as a `Duration`, never shorter than 1 ms.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Resolved engine executable.
    pub fn resolved_engine_path(&self) -> PathBuf {
        if let Some(path) = &self.engine_path {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(engine_file_name())))
            .unwrap_or_else(|| PathBuf::from(engine_file_name()))
    }

    /// Every how many input samples one is cached.
    pub fn downsample_factor(&self, sample_rate: f32) -> usize {
        if self.target_sample_rate <= 0.0 || sample_rate <= 0.0 {
            return 1;
        }
        ((sample_rate / self.target_sample_rate).floor() as usize).max(1)
    }

    /// Cache capacity for a stream at `sample_rate`, capped at a fixed number of
    /// samples per channel. Non-finite inputs give an empty cache.
    pub fn cache_capacity(&self, sample_rate: f32) -> usize {
        let duration = self.training_duration_secs;
        if sample_rate.is_nan() || sample_rate <= 0.0 || duration.is_nan() || duration <= 0.0 {
            return 0;
        }
        let factor = self.downsample_factor(sample_rate) as f64;
        let samples = (duration as f64 * sample_rate as f64 / factor).ceil();
        if !samples.is_finite() {
            return 0;
        }
        samples.min(MAX_CACHE_SAMPLES as f64) as usize
    }

    /// Check the settings that size caches.
    pub fn validate(&self) -> Result<(), IcaError> {
        validate_training_duration(self.training_duration_secs)?;
        let rate = self.target_sample_rate;
        if !rate.is_finite() || !(0.0..=MAX_TARGET_SAMPLE_RATE).contains(&rate) {
            return Err(IcaError::InvalidConfig(format!(
                "target sample rate {rate} Hz is outside 0..={MAX_TARGET_SAMPLE_RATE}"
            )));
        }
        Ok(())
    }

    /// Replace settings that fail [`validate`](Self::validate) with their defaults.
    pub fn repaired(mut self) -> Self {
        let defaults = Self::default();
        if let Err(err) = validate_training_duration(self.training_duration_secs) {
            warn!(%err, "using the default training duration");
            self.training_duration_secs = defaults.training_duration_secs;
        }
        if let Err(err) = self.validate() {
            warn!(%err, "using the default target sample rate");
            self.target_sample_rate = defaults.target_sample_rate;
        }
        self
    }

    /// `dir_suffix` reduced to characters that are legal in a file name.
    pub fn sanitized_suffix(&self) -> String {
        self.dir_suffix
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// Accept a finite duration in `(0, MAX_TRAINING_DURATION_SECS]`.
pub fn validate_training_duration(seconds: f32) -> Result<f32, IcaError> {
    if seconds.is_finite() && seconds > 0.0 && seconds <= MAX_TRAINING_DURATION_SECS {
        Ok(seconds)
    } else {
        Err(IcaError::InvalidConfig(format!(
            "training duration {seconds} s is outside (0, {MAX_TRAINING_DURATION_SECS}]"
        )))
    }
}

fn engine_file_name() -> &'static str {
    if cfg!(windows) { "binica.exe" } else { "binica" }
}

/// Load a JSON settings file, falling back to defaults when it is missing or invalid.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        info!(?path, "config file missing, using defaults");
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<T>(&contents) {
            Ok(config) => config,
            Err(err) => {
                warn!(?path, %err, "failed to parse config, using defaults");
                T::default()
            }
        },
        Err(err) => {
            warn!(?path, %err, "failed to read config, using defaults");
            T::default()
        }
    }
}

/// Save settings as pretty JSON, creating parent directories.
pub fn save_config<T>(config: &T, path: &Path) -> Result<(), IcaError>
where
    T: Serialize,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_context("creating config directory", parent))?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|e| IcaError::Persist(e.to_string()))?;
    std::fs::write(path, json).map_err(io_context("writing config file", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsampling_targets_the_configured_rate() {
        let config = IcaConfig::default();
        assert_eq!(config.downsample_factor(30_000.0), 60);
        assert_eq!(config.downsample_factor(400.0), 1);
        assert_eq!(config.cache_capacity(30_000.0), 60_000);
        assert_eq!(config.cache_capacity(0.0), 0);
    }

    #[test]
    fn unbounded_durations_never_size_a_cache() {
        for seconds in [f32::INFINITY, f32::NAN, -1.0, 0.0, 1.0e30] {
            assert!(validate_training_duration(seconds).is_err(), "{seconds}");
            let config = IcaConfig {
                training_duration_secs: seconds,
                ..IcaConfig::default()
            };
            assert!(config.cache_capacity(30_000.0) <= MAX_CACHE_SAMPLES);
            let repaired = config.repaired();
            assert_eq!(repaired.training_duration_secs, 120.0);
            assert!(repaired.validate().is_ok());
        }
        assert_eq!(IcaConfig::default().cache_capacity(f32::INFINITY), 0);
        assert_eq!(IcaConfig::default().cache_capacity(f32::NAN), 0);
    }

    #[test]
    fn bad_target_rate_is_repaired() {
        let config = IcaConfig {
            target_sample_rate: f32::INFINITY,
            ..IcaConfig::default()
        };
        assert!(matches!(config.validate(), Err(IcaError::InvalidConfig(_))));
        assert_eq!(config.repaired().target_sample_rate, 500.0);
    }

    #[test]
    fn suffix_is_sanitised() {
        let config = IcaConfig {
            dir_suffix: " run 1/a:b ".to_string(),
            ..IcaConfig::default()
        };
        assert_eq!(config.sanitized_suffix(), "run_1_a_b");
    }

    #[test]
    fn load_missing_returns_default() {
        let config: IcaConfig = load_config(Path::new("/nonexistent/ica/config.json"));
        assert_eq!(config, IcaConfig::default());
    }

    #[test]
    fn roundtrip_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = IcaConfig {
            training_duration_secs: 30.0,
            dir_suffix: "pilot".to_string(),
            default_rejection: DefaultRejection::None,
            ..IcaConfig::default()
        };
        save_config(&config, &path).unwrap();
        let loaded: IcaConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "poll_interval_ms": 5 }"#).unwrap();
        let loaded: IcaConfig = load_config(&path);
        assert_eq!(loaded.poll_interval_ms, 5);
        assert_eq!(loaded.training_duration_secs, 120.0);
    }
}
