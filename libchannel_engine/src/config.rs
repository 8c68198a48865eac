use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::channel::SourceKind;
use super::constants::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL_SECS, DEFAULT_SNIFF_LINES};
use super::engine::FileResolver;
use super::error::{ConfigError, ResolveError};

/// Structure representing the engine configuration. Contains pathing, cache and format
/// information. Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_path: PathBuf,
    pub scope_file_name: String,
    pub temperature_file_name: String,
    pub acceleration_file_name: String,
    pub position_file_name: String,
    pub chunked_file_name: String,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub master_clock_offset_hours: i64,
    pub zero_offset_sources: Vec<SourceKind>,
    pub temperature_interval_ms: f64,
    pub acceleration_interval_us: f64,
    pub position_interval_us: f64,
    pub position_step_us: f64,
    pub sniff_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("None"),
            scope_file_name: String::from("scope.bin"),
            temperature_file_name: String::from("temperature.csv"),
            acceleration_file_name: String::from("acceleration.csv"),
            position_file_name: String::from("position.csv"),
            chunked_file_name: String::from("chunked.h5"),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            master_clock_offset_hours: 0,
            zero_offset_sources: Vec::new(),
            temperature_interval_ms: 1000.0,
            acceleration_interval_us: 1000.0,
            position_interval_us: 1000.0,
            position_step_us: 1000.0,
            sniff_lines: DEFAULT_SNIFF_LINES,
        }
    }
}

impl EngineConfig {
    /// Read the configuration in a YAML file
    /// Returns an EngineConfig if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn is_cache_capacity_valid(&self) -> bool {
        self.cache_capacity >= 1
    }

    /// The file name used for a given source inside an experiment directory
    pub fn get_file_name(&self, source: SourceKind) -> &str {
        match source {
            SourceKind::Scope => &self.scope_file_name,
            SourceKind::Temperature => &self.temperature_file_name,
            SourceKind::Acceleration => &self.acceleration_file_name,
            SourceKind::Position => &self.position_file_name,
            SourceKind::Chunked => &self.chunked_file_name,
        }
    }

    /// Get the directory of an experiment
    pub fn get_experiment_directory(&self, experiment_id: &str) -> Result<PathBuf, ConfigError> {
        let experiment_dir = self.data_path.join(experiment_id);
        if experiment_dir.exists() {
            Ok(experiment_dir)
        } else {
            Err(ConfigError::BadFilePath(experiment_dir))
        }
    }

    /// Get the path to a source file of an experiment
    pub fn get_source_path(
        &self,
        experiment_id: &str,
        source: SourceKind,
    ) -> Result<PathBuf, ResolveError> {
        let experiment_dir = self
            .get_experiment_directory(experiment_id)
            .map_err(|_| ResolveError::NotFound(experiment_id.to_string(), source))?;
        let path = experiment_dir.join(self.get_file_name(source));
        if path.exists() {
            Ok(path)
        } else {
            Err(ResolveError::NotFound(experiment_id.to_string(), source))
        }
    }

    pub fn is_zero_offset_source(&self, source: SourceKind) -> bool {
        self.zero_offset_sources.contains(&source)
    }
}

impl FileResolver for EngineConfig {
    fn resolve(&self, experiment_id: &str, source: SourceKind) -> Result<PathBuf, ResolveError> {
        self.get_source_path(experiment_id, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "cache_capacity: 3\nzero_offset_sources: [position]\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache_capacity, 3);
        assert_eq!(config.cache_ttl_secs, DEFAULT_CACHE_TTL_SECS);
        assert!(config.is_zero_offset_source(SourceKind::Position));
        assert!(!config.is_zero_offset_source(SourceKind::Temperature));
    }

    #[test]
    fn test_resolve_source_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("exp_01")).unwrap();
        std::fs::write(dir.path().join("exp_01").join("scope.bin"), [0u8]).unwrap();
        let config = EngineConfig {
            data_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.resolve("exp_01", SourceKind::Scope).is_ok());
        assert!(matches!(
            config.resolve("exp_01", SourceKind::Position),
            Err(ResolveError::NotFound(_, SourceKind::Position))
        ));
        assert!(config.resolve("exp_02", SourceKind::Scope).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(matches!(
            EngineConfig::read_config_file(Path::new("/definitely/not/here.yml")),
            Err(ConfigError::BadFilePath(_))
        ));
    }
}
