//! World construction settings.

use serde::{Deserialize, Serialize};

use crate::reference::DEFAULT_REFERENCE_CAPACITY;
use crate::EcsError;

/// Tunables for a [`World`](crate::world::World).
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides:
///
/// ```
/// use kinship_ecs::config::WorldConfig;
///
/// let config = WorldConfig::from_json(r#"{ "entity_capacity": 65536 }"#).unwrap();
/// assert_eq!(config.entity_capacity, 65536);
/// assert_eq!(config.reference_capacity, 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Entities to reserve room for up front.
    pub entity_capacity: usize,
    /// Initial capacity of the reference pool.
    pub reference_capacity: usize,
    /// Run the full storage consistency check after every replay.
    pub validate_on_unlock: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            entity_capacity: 1024,
            reference_capacity: DEFAULT_REFERENCE_CAPACITY,
            validate_on_unlock: cfg!(debug_assertions),
        }
    }
}

impl WorldConfig {
    /// Parse a JSON object, filling omitted keys with defaults.
    pub fn from_json(text: &str) -> Result<Self, EcsError> {
        serde_json::from_str(text).map_err(|e| EcsError::Config {
            details: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, EcsError> {
        serde_json::to_string_pretty(self).map_err(|e| EcsError::Config {
            details: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        assert_eq!(WorldConfig::from_json("{}").unwrap(), WorldConfig::default());
    }

    #[test]
    fn json_roundtrip() {
        let config = WorldConfig {
            entity_capacity: 10,
            reference_capacity: 20,
            validate_on_unlock: true,
        };
        let text = config.to_json().unwrap();
        assert_eq!(WorldConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = WorldConfig::from_json(r#"{ "entity_capacity": "lots" }"#).unwrap_err();
        assert!(matches!(err, EcsError::Config { .. }));
    }
}
