//! Root configuration for a side-tuning experiment.
//!
//! `ExperimentConfig` aggregates the model and training sections.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use doc_sidetune::ExperimentConfig;
//!
//! let config = ExperimentConfig::from_file("experiment.toml")?;
//!
//! // Or defaults with environment overrides
//! let config = ExperimentConfig::default().with_env_overrides();
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! [model]
//! variant = "fc"
//! num_classes = 10
//! alphas = [0.3, 0.3]
//! dropout = 0.5
//! side_fc = 512
//! backbone_weights = "weights/mobilenet_v2.safetensors"
//!
//! [model.text]
//! embedding_dim = 300
//! num_filters = 512
//! windows = [3, 4, 5]
//!
//! [training]
//! epochs = 100
//! seed = 42
//! class_weighting = "none"
//! train_batch_size = 16
//!
//! [training.optimizer]
//! kind = "sgd"
//! lr = 0.1
//! momentum = 0.9
//! ```
//!
//! Invalid values are errors, never silently replaced by defaults.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SideTuneError, SideTuneResult};
use crate::models::ModelConfig;
use crate::training::{ClassWeighting, OptimizerConfig, TrainingConfig};

/// Complete experiment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub training: TrainingConfig,
}

impl ExperimentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `SideTuneError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> SideTuneResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| SideTuneError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        toml::from_str(&contents).map_err(|e| SideTuneError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    pub fn from_toml_str(contents: &str) -> SideTuneResult<Self> {
        toml::from_str(contents).map_err(|e| SideTuneError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    pub fn to_toml_string(&self) -> SideTuneResult<String> {
        toml::to_string_pretty(self).map_err(|e| SideTuneError::ConfigError {
            message: format!("Failed to serialize config: {}", e),
        })
    }

    /// Validate both sections, returning the first error prefixed with its
    /// section name.
    pub fn validate(&self) -> SideTuneResult<()> {
        self.model.validate().map_err(|e| SideTuneError::ConfigError {
            message: format!("[model] {}", e),
        })?;
        self.training.validate().map_err(|e| SideTuneError::ConfigError {
            message: format!("[training] {}", e),
        })
    }

    /// Apply `SIDETUNE_*` environment overrides.
    ///
    /// Recognized: `SIDETUNE_EPOCHS`, `SIDETUNE_SEED`, `SIDETUNE_BATCH_SIZE`
    /// (training batch), `SIDETUNE_CLASS_WEIGHTING`, `SIDETUNE_OPTIMIZER`
    /// (`adam` or `sgd`, with that optimizer's default hyperparameters).
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("SIDETUNE_EPOCHS") {
            match val.parse::<u32>() {
                Ok(n) => self.training.epochs = n,
                Err(_) => tracing::warn!("Ignoring SIDETUNE_EPOCHS={}", val),
            }
        }
        if let Ok(val) = env::var("SIDETUNE_SEED") {
            match val.parse::<u64>() {
                Ok(n) => self.training.seed = n,
                Err(_) => tracing::warn!("Ignoring SIDETUNE_SEED={}", val),
            }
        }
        if let Ok(val) = env::var("SIDETUNE_BATCH_SIZE") {
            match val.parse::<usize>() {
                Ok(n) => self.training.train_batch_size = n,
                Err(_) => tracing::warn!("Ignoring SIDETUNE_BATCH_SIZE={}", val),
            }
        }
        if let Ok(val) = env::var("SIDETUNE_CLASS_WEIGHTING") {
            match val.parse::<ClassWeighting>() {
                Ok(w) => self.training.class_weighting = w,
                Err(e) => tracing::warn!("Ignoring SIDETUNE_CLASS_WEIGHTING: {}", e),
            }
        }
        if let Ok(val) = env::var("SIDETUNE_OPTIMIZER") {
            match OptimizerConfig::from_name(&val) {
                Ok(opt) => self.training.optimizer = opt,
                Err(e) => tracing::warn!("Ignoring SIDETUNE_OPTIMIZER: {}", e),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelVariant;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.model.variant, ModelVariant::Fc);
        assert_eq!(config.model.effective_alphas(), vec![0.3, 0.3]);
        assert_eq!(config.training.epochs, 100);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.optimizer, OptimizerConfig::adam());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ExperimentConfig::from_toml_str(
            r#"
            [model]
            variant = "text_side"
            num_classes = 4

            [training]
            epochs = 3
            class_weighting = "max"

            [training.optimizer]
            kind = "sgd"
            "#,
        )
        .unwrap();

        assert_eq!(config.model.variant, ModelVariant::TextSide);
        assert_eq!(config.model.effective_alphas(), vec![0.3]);
        assert_eq!(config.model.text.windows, vec![3, 4, 5]);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.class_weighting, ClassWeighting::Max);
        assert_eq!(config.training.optimizer, OptimizerConfig::sgd());
        assert_eq!(config.training.train_batch_size, 16);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_round_trip() {
        let mut config = ExperimentConfig::default();
        config.model.variant = ModelVariant::Concat;
        config.training.max_grad_norm = Some(5.0);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.model.variant, ModelVariant::Concat);
        assert_eq!(loaded.training.max_grad_norm, Some(5.0));
    }

    #[test]
    fn test_missing_file_and_bad_toml() {
        let err = ExperimentConfig::from_file("/nonexistent/experiment.toml").unwrap_err();
        assert!(err.is_configuration_error());

        let err = ExperimentConfig::from_toml_str("[model]\nvariant = 3").unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));
    }

    #[test]
    fn test_validate_prefixes_section() {
        let mut config = ExperimentConfig::default();
        config.model.alphas = Some(vec![1.2, 0.3]);
        assert!(config.validate().unwrap_err().to_string().contains("[model]"));

        let mut config = ExperimentConfig::default();
        config.training.epochs = 0;
        assert!(config.validate().unwrap_err().to_string().contains("[training]"));
    }

    // Only test that touches SIDETUNE_* variables.
    #[test]
    fn test_env_overrides() {
        env::set_var("SIDETUNE_EPOCHS", "7");
        env::set_var("SIDETUNE_SEED", "not-a-number");
        env::set_var("SIDETUNE_BATCH_SIZE", "8");
        env::set_var("SIDETUNE_CLASS_WEIGHTING", "min");
        env::set_var("SIDETUNE_OPTIMIZER", "sgd");

        let config = ExperimentConfig::default().with_env_overrides();

        for key in [
            "SIDETUNE_EPOCHS",
            "SIDETUNE_SEED",
            "SIDETUNE_BATCH_SIZE",
            "SIDETUNE_CLASS_WEIGHTING",
            "SIDETUNE_OPTIMIZER",
        ] {
            env::remove_var(key);
        }

        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.train_batch_size, 8);
        assert_eq!(config.training.class_weighting, ClassWeighting::Min);
        assert_eq!(config.training.optimizer, OptimizerConfig::sgd());
    }
}
