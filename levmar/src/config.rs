use std::path::Path;

use common::FileFormat;
use serde::{Deserialize, Serialize};

use crate::options::Options;

/// What a solve does when the instance is already busy on another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Fail with `ReentrancyNotSupported`.
    #[default]
    Reject,
    /// Wait for the running solve to finish.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub options: Options,
    pub max_iterations: usize,
    pub concurrency: ConcurrencyPolicy,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            options: Options::default(),
            max_iterations: 1000,
            concurrency: ConcurrencyPolicy::default(),
        }
    }
}

impl SolverConfig {
    /// Loads a `.yaml`, `.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let format = FileFormat::from_file_name(&path.to_string_lossy())?;
        let serialized = std::fs::read(path)?;
        common::serde::deserialize(&serialized, format)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let format = FileFormat::from_file_name(&path.to_string_lossy())?;
        std::fs::write(path, common::serde::serialize(self, format)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::test_output_path;

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let yaml = "max_iterations: 50\nconcurrency: block\noptions:\n  init_mu: 0.01\n";
        let config: SolverConfig = serde_yml::from_str(yaml).unwrap();

        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.concurrency, ConcurrencyPolicy::Block);
        assert_eq!(config.options.init_mu, 0.01);
        assert_eq!(config.options.diff_delta, Options::default().diff_delta);
    }

    #[test]
    fn save_and_load_json() {
        let path = test_output_path("solver_config.json");
        let config = SolverConfig {
            max_iterations: 20,
            concurrency: ConcurrencyPolicy::Block,
            ..SolverConfig::default()
        };

        config.save(&path).unwrap();
        assert_eq!(SolverConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_or_unsupported_file_uses_defaults() {
        assert_eq!(
            SolverConfig::load_or_default(test_output_path("does_not_exist.yaml")),
            SolverConfig::default()
        );
        assert!(SolverConfig::load("solver.toml").is_err());
    }
}
