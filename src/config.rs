//! Stream configuration.
//!
//! Options accepted at construction time. Serde-derived so a configuration
//! can live inside a larger application config file.

use serde::{Deserialize, Serialize};

use crate::types::OperationKind;

/// Options accepted by [`WriteStream::new`](crate::WriteStream::new).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Operation kind applied to items that don't carry their own.
    #[serde(default = "default_kind")]
    pub default_kind: OperationKind,
    /// Maximum number of buffered, uncommitted operations before writers
    /// are suspended until the in-flight commit settles. `None` disables
    /// the bound; zero is kept as a spelling of "unbounded" for configs
    /// that use it that way.
    #[serde(default)]
    pub max_buffer_len: Option<usize>,
}

fn default_kind() -> OperationKind {
    OperationKind::Put
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            default_kind: OperationKind::Put,
            max_buffer_len: None,
        }
    }
}

impl StreamConfig {
    /// Bounded configuration: suspend writers once `max` operations are
    /// buffered.
    pub fn bounded(max: usize) -> Self {
        StreamConfig {
            max_buffer_len: Some(max),
            ..Default::default()
        }
    }

    /// Configuration whose default operation kind is delete, for feeding a
    /// stream plain keys to remove.
    pub fn deleting() -> Self {
        StreamConfig {
            default_kind: OperationKind::Delete,
            ..Default::default()
        }
    }

    /// Load a configuration from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Effective buffer bound; zero normalizes to unbounded.
    pub(crate) fn effective_bound(&self) -> Option<usize> {
        match self.max_buffer_len {
            Some(0) | None => None,
            bound => bound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.default_kind, OperationKind::Put);
        assert_eq!(config.max_buffer_len, None);
        assert_eq!(config.effective_bound(), None);
    }

    #[test]
    fn test_bounded_config() {
        let config = StreamConfig::bounded(16);
        assert_eq!(config.effective_bound(), Some(16));
    }

    #[test]
    fn test_zero_bound_is_unbounded() {
        let config = StreamConfig::bounded(0);
        assert_eq!(config.max_buffer_len, Some(0));
        assert_eq!(config.effective_bound(), None);
    }

    #[test]
    fn test_deleting_config() {
        let config = StreamConfig::deleting();
        assert_eq!(config.default_kind, OperationKind::Delete);
    }

    #[test]
    fn test_from_toml() {
        let config = StreamConfig::from_toml_str(
            "default_kind = \"delete\"\nmax_buffer_len = 8\n",
        )
        .unwrap();
        assert_eq!(config.default_kind, OperationKind::Delete);
        assert_eq!(config.max_buffer_len, Some(8));

        // Omitted fields fall back to the defaults.
        let config = StreamConfig::from_toml_str("").unwrap();
        assert_eq!(config, StreamConfig::default());
    }

    #[test]
    fn test_config_serialization() {
        let config = StreamConfig::bounded(4);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
