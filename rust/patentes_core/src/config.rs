//! Engine configuration and JSON parsing helpers.

use std::time::Duration;

use serde::Deserialize;

/// How mutations of the family graph (or of a family's grants) invalidate
/// cached effective permissions.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    /// Clear the whole cache.
    #[default]
    Full,
    /// Invalidate members of the changed family and of all its ancestors.
    Precise,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    /// Entries older than this count as misses. `None` keeps them until
    /// evicted or invalidated.
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub invalidation: InvalidationStrategy,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.max_entries == 0 {
            return Err("cache.max_entries must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Parse an engine config from a JSON string. Missing fields take defaults.
pub fn parse_engine_config(json: &str) -> Result<EngineConfig, serde_json::Error> {
    serde_json::from_str(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = parse_engine_config("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl(), None);
        assert_eq!(config.invalidation, InvalidationStrategy::Full);
    }

    #[test]
    fn parse_precise_with_ttl() {
        let json = r#"{"cache":{"max_entries":64,"ttl_secs":30},"invalidation":"precise"}"#;
        let config = parse_engine_config(json).unwrap();
        assert_eq!(config.cache.max_entries, 64);
        assert_eq!(config.cache.ttl(), Some(Duration::from_secs(30)));
        assert_eq!(config.invalidation, InvalidationStrategy::Precise);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = parse_engine_config(r#"{"cache":{"max_entries":0}}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_strategy_fails_to_parse() {
        assert!(parse_engine_config(r#"{"invalidation":"lazy"}"#).is_err());
    }
}
