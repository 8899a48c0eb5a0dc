//! API keys and their per-minute ceilings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Dimension;

/// An opaque client identifier, taken verbatim from the Bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-minute ceilings for one key. Immutable after config load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLimits {
    pub input_tpm: u64,
    pub output_tpm: u64,
    pub rpm: u64,
}

impl KeyLimits {
    pub fn ceiling(&self, dim: Dimension) -> u64 {
        match dim {
            Dimension::InputTokens => self.input_tpm,
            Dimension::OutputTokens => self.output_tpm,
            Dimension::Requests => self.rpm,
        }
    }
}

/// The key table, read once at startup. Unknown keys are rejected before any
/// counter is touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRegistry {
    keys: HashMap<String, KeyLimits>,
}

impl KeyRegistry {
    pub fn new(keys: HashMap<String, KeyLimits>) -> Self {
        Self { keys }
    }

    pub fn get(&self, key: &str) -> Option<KeyLimits> {
        self.keys.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Built-in keys for local development and the load-test client.
    pub fn development() -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            "test-key-1".to_string(),
            KeyLimits {
                input_tpm: 1_000,
                output_tpm: 1_000,
                rpm: 10_000,
            },
        );
        keys.insert(
            "test-key-2".to_string(),
            KeyLimits {
                input_tpm: 10_000,
                output_tpm: 10_000,
                rpm: 2_000,
            },
        );
        keys.insert(
            "test-key-3".to_string(),
            KeyLimits {
                input_tpm: 10_000,
                output_tpm: 10_000,
                rpm: 5_000,
            },
        );
        Self { keys }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_parses_json_table() {
        let json = r#"{"k1":{"input_tpm":100,"output_tpm":200,"rpm":3}}"#;
        let registry: KeyRegistry = serde_json::from_str(json).unwrap();

        let limits = registry.get("k1").unwrap();
        assert_eq!(limits.input_tpm, 100);
        assert_eq!(limits.output_tpm, 200);
        assert_eq!(limits.rpm, 3);
        assert!(registry.get("k2").is_none());
    }

    #[test]
    fn ceilings_by_dimension() {
        let limits = KeyLimits {
            input_tpm: 1,
            output_tpm: 2,
            rpm: 3,
        };
        assert_eq!(limits.ceiling(Dimension::InputTokens), 1);
        assert_eq!(limits.ceiling(Dimension::OutputTokens), 2);
        assert_eq!(limits.ceiling(Dimension::Requests), 3);
    }

    #[test]
    fn development_registry_is_populated() {
        let registry = KeyRegistry::development();
        assert!(!registry.is_empty());
        assert!(registry.get("test-key-1").is_some());
    }
}
