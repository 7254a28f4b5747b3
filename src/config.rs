//! Configuration loading and validation.
//!
//! Configuration comes from a TOML file (path given explicitly or via the
//! `DISTCACHE_CONFIG` environment variable), with serde defaults supplying
//! every knob so an empty file is a valid configuration. Validation failures
//! are fatal at bootstrap.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CacheError;
use crate::policy::PolicyKind;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DistCacheConfig {
    #[serde(default)]
    pub group_manager: GroupManagerConfig,
    /// Service registration names, keyed by logical service id.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub singleflight: SingleFlightConfig,
    #[serde(default)]
    pub hashring: HashRingConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupManagerConfig {
    /// Eviction strategy: lru, lfu, fifo, arc, 2q or slru.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Cache byte budget per group.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Name the node registers under in the discovery registry.
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SingleFlightConfig {
    #[serde(default = "default_flight_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashRingConfig {
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_timeout_millis")]
    pub timeout_millis: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
}

fn default_strategy() -> String {
    "lru".to_string()
}

fn default_max_cache_size() -> u64 {
    8 * 1024 * 1024
}

fn default_flight_ttl_secs() -> u64 {
    10
}

fn default_replicas() -> usize {
    50
}

fn default_rpc_timeout_millis() -> u64 {
    1000
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

impl Default for GroupManagerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_cache_size: default_max_cache_size(),
        }
    }
}

impl Default for SingleFlightConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_flight_ttl_secs(),
        }
    }
}

impl Default for HashRingConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_millis: default_rpc_timeout_millis(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
        }
    }
}

impl SingleFlightConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

impl DistCacheConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| CacheError::Config(format!("read config: {err}")))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|err| CacheError::Config(format!("parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from the path in `DISTCACHE_CONFIG`, or defaults when unset.
    pub fn load_from_env() -> Result<Self, CacheError> {
        match std::env::var("DISTCACHE_CONFIG") {
            Ok(path) => Self::load_from_path(path),
            Err(_) => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        PolicyKind::from_str(&self.group_manager.strategy)
            .map_err(|err| CacheError::Config(err.to_string()))?;
        if self.group_manager.max_cache_size == 0 {
            return Err(CacheError::Config(
                "group_manager.max_cache_size must be positive".to_string(),
            ));
        }
        if self.singleflight.ttl_secs == 0 {
            return Err(CacheError::Config(
                "singleflight.ttl_secs must be positive".to_string(),
            ));
        }
        if self.hashring.replicas == 0 {
            return Err(CacheError::Config(
                "hashring.replicas must be positive".to_string(),
            ));
        }
        if self.rpc.timeout_millis == 0 {
            return Err(CacheError::Config(
                "rpc.timeout_millis must be positive".to_string(),
            ));
        }
        if self.registry.endpoints.is_empty() {
            return Err(CacheError::Config(
                "registry.endpoints must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: DistCacheConfig = toml::from_str("").unwrap();
        assert_eq!(config.group_manager.strategy, "lru");
        assert_eq!(config.group_manager.max_cache_size, 8 * 1024 * 1024);
        assert_eq!(config.singleflight.ttl(), Duration::from_secs(10));
        assert_eq!(config.hashring.replicas, 50);
        assert_eq!(config.rpc.timeout(), Duration::from_secs(1));
        assert_eq!(config.registry.endpoints, vec!["http://127.0.0.1:2379"]);
        config.validate().unwrap();
    }

    #[test]
    fn full_config_parses() {
        let config: DistCacheConfig = toml::from_str(
            r#"
            [group_manager]
            strategy = "slru"
            max_cache_size = 1048576

            [services.groupcache]
            name = "GroupCache"

            [singleflight]
            ttl_secs = 5

            [hashring]
            replicas = 100

            [rpc]
            timeout_millis = 500

            [registry]
            endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.group_manager.strategy, "slru");
        assert_eq!(config.services["groupcache"].name, "GroupCache");
        assert_eq!(config.singleflight.ttl(), Duration::from_secs(5));
        assert_eq!(config.hashring.replicas, 100);
        assert_eq!(config.rpc.timeout(), Duration::from_millis(500));
        assert_eq!(config.registry.endpoints.len(), 2);
    }

    #[test]
    fn validation_rejects_unknown_strategy() {
        let config: DistCacheConfig = toml::from_str(
            r#"
            [group_manager]
            strategy = "random"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn validation_rejects_zero_sizes() {
        let config: DistCacheConfig = toml::from_str(
            r#"
            [group_manager]
            max_cache_size = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config: DistCacheConfig = toml::from_str(
            r#"
            [hashring]
            replicas = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
