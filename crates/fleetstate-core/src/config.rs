//! State configuration
//!
//! Loaded from TOML or built in code. Every field has a default so an empty
//! document is valid.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StateError};

/// Deployment substrate of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Machine-based deployment
    #[default]
    Iaas,
    /// Container-orchestrated deployment
    Caas,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub model_type: ModelType,
    /// Attempts the transaction runner makes before reporting contention
    pub max_txn_attempts: u32,
    /// Space id used when neither overrides nor prior bindings name one
    pub default_space: String,
    /// Capacity of each watcher's output channel
    pub watcher_buffer: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::Iaas,
            max_txn_attempts: 5,
            default_space: "0".to_string(),
            watcher_buffer: 16,
        }
    }
}

impl StateConfig {
    pub fn caas() -> Self {
        Self {
            model_type: ModelType::Caas,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for malformed TOML and `InvalidArgument` for
    /// out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StateConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` when a field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.max_txn_attempts == 0 {
            return Err(StateError::invalid("max_txn_attempts must be at least 1"));
        }
        if self.default_space.trim().is_empty() {
            return Err(StateError::invalid("default_space cannot be empty"));
        }
        if self.watcher_buffer == 0 {
            return Err(StateError::invalid("watcher_buffer must be at least 1"));
        }
        Ok(())
    }

    pub fn is_caas(&self) -> bool {
        self.model_type == ModelType::Caas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = StateConfig::from_toml_str("").unwrap();
        assert_eq!(config, StateConfig::default());
        assert_eq!(config.max_txn_attempts, 5);
    }

    #[test]
    fn test_parse_caas_model() {
        let config = StateConfig::from_toml_str(
            "model_type = \"caas\"\nmax_txn_attempts = 3\ndefault_space = \"alpha\"",
        )
        .unwrap();
        assert!(config.is_caas());
        assert_eq!(config.max_txn_attempts, 3);
        assert_eq!(config.default_space, "alpha");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = StateConfig::from_toml_str("max_txn_attempts = 0").unwrap_err();
        assert!(matches!(err, StateError::InvalidArgument { .. }));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = StateConfig::from_toml_str("retries = 3").unwrap_err();
        assert!(matches!(err, StateError::Serialization { .. }));
    }
}
