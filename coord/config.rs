//! Engine configuration, loadable from TOML.
//!
//! Every section is optional; omitted fields take their defaults:
//!
//! ```toml
//! [solver]
//! tolerance = 1e-6
//! max_sweeps = 200
//!
//! [search]
//! candidates = [1, 2, 3, 4]
//! mode = "Bisection"
//!
//! [variance]
//! se_rule = "GeometricMean"
//! ```

use crate::als::SolverConfig;
use crate::dimension::SearchConfig;
use crate::seed::SeedConfig;
use crate::variance::VarianceConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub solver: SolverConfig,
    pub search: SearchConfig,
    pub seed: SeedConfig,
    pub variance: VarianceConfig,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.into(),
            })
        }

        if self.solver.ndim == 0 {
            return invalid("solver.ndim", "must be at least 1");
        }
        if !(self.solver.tolerance >= 0.0) {
            return invalid("solver.tolerance", "must be a non-negative number");
        }
        if self.solver.max_sweeps == 0 {
            return invalid("solver.max_sweeps", "must be at least 1");
        }
        if let Some(jolt) = &self.solver.jolt {
            if !(jolt.sd_threshold > 0.0) || !(jolt.noise_scale >= 0.0) {
                return invalid(
                    "solver.jolt",
                    "sd_threshold must be positive and noise_scale non-negative",
                );
            }
        }
        if self.search.candidates.is_empty() || self.search.candidates.contains(&0) {
            return invalid("search.candidates", "must list dimensionalities of at least 1");
        }
        for (field, fraction) in [
            ("search.pseudo_missing.fraction", Some(self.search.pseudo_missing.fraction)),
            (
                "seed.pseudo_missing.fraction",
                self.seed.pseudo_missing.as_ref().map(|pm| pm.fraction),
            ),
        ] {
            if let Some(fraction) = fraction {
                if !(0.0..1.0).contains(&fraction) {
                    return invalid(field, format!("{fraction} is outside [0, 1)"));
                }
            }
        }
        if self.seed.max_attempts == 0 {
            return invalid("seed.max_attempts", "must be at least 1");
        }
        if !(self.variance.inflation_cap >= 1.0) {
            return invalid("variance.inflation_cap", "must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::SearchMode;
    use crate::variance::SeRuleKind;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_files_fill_in_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [solver]
            tolerance = 1e-7

            [search]
            candidates = [1, 2, 3]
            mode = "Bisection"

            [variance]
            se_rule = "GeometricMean"
            "#,
        )
        .unwrap();

        assert_eq!(config.solver.tolerance, 1e-7);
        assert_eq!(config.solver.max_sweeps, 100);
        assert_eq!(config.search.candidates, vec![1, 2, 3]);
        assert_eq!(config.search.mode, SearchMode::Bisection);
        assert_eq!(config.search.pseudo_missing.fraction, 0.1);
        assert_eq!(config.seed.max_attempts, 10);
        assert_eq!(config.variance.se_rule, SeRuleKind::GeometricMean);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_toml_str("[search]\ncandidates = []\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "search.candidates",
                ..
            }
        ));
        assert!(EngineConfig::from_toml_str("[solver]\nmax_sweeps = 0\n").is_err());
        assert!(EngineConfig::from_toml_str("[solver\n").is_err());
    }

    #[test]
    fn saved_configuration_loads_back() {
        let mut config = EngineConfig::default();
        config.solver.seed = 77;
        config.search.candidates = vec![2, 4];
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        let loaded = EngineConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
