//! Instantiator configuration
//!
//! Tunables can be given in code or loaded from a TOML document:
//!
//! ```toml
//! max_linkage_rounds = 4
//! max_flush_rounds = 5000
//! trace_expansion = true
//! max_pending_faults = 16
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use fluid_core::DEFAULT_MAX_FLUSH_ROUNDS;

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables of an [`Instantiator`](crate::Instantiator)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstantiatorConfig {
    /// How many times linkage outputs may feed back into a merge
    pub max_linkage_rounds: usize,
    /// Effect flush rounds before the reactive graph gives up on a cycle
    pub max_flush_rounds: usize,
    /// Emit a `trace!` line for every expanded key
    pub trace_expansion: bool,
    /// Faults raised outside any entry point kept for `take_faults`; the
    /// oldest are dropped first
    pub max_pending_faults: usize,
}

impl Default for InstantiatorConfig {
    fn default() -> Self {
        Self {
            max_linkage_rounds: 8,
            max_flush_rounds: DEFAULT_MAX_FLUSH_ROUNDS,
            trace_expansion: false,
            max_pending_faults: 32,
        }
    }
}

impl InstantiatorConfig {
    /// Parse from TOML; missing keys keep their defaults
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_partial() {
        let config = InstantiatorConfig::from_toml("trace_expansion = true\nmax_linkage_rounds = 2")
            .unwrap();
        assert!(config.trace_expansion);
        assert_eq!(config.max_linkage_rounds, 2);
        assert_eq!(config.max_flush_rounds, DEFAULT_MAX_FLUSH_ROUNDS);
        assert_eq!(config.max_pending_faults, 32);
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let err = InstantiatorConfig::from_toml("max_flush_rounds = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_output_parses_back() {
        let config = InstantiatorConfig {
            max_linkage_rounds: 3,
            ..Default::default()
        };
        let parsed = InstantiatorConfig::from_toml(&config.to_toml()).unwrap();
        assert_eq!(parsed, config);
    }
}
