//! Sync configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the syncronizer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay between resync cycles (in milliseconds).
    pub sync_interval_ms: u64,
    /// Age after which an unanswered request is dropped (in milliseconds).
    pub in_flight_ttl_ms: u64,
    /// Request missing entries by coordinate instead of full hash.
    pub use_coordinates: bool,
    /// Capacity of the coordinate-to-hash cache.
    pub coordinate_cache_size: usize,
    /// Coordinates resolved per index query.
    pub resolve_batch_size: usize,
    /// Entries bundled per exchange-heads message.
    pub exchange_batch_size: usize,
    /// Ancestors shipped along with each requested entry.
    pub max_refs: usize,
    /// Routes tried for single-delivery messages.
    pub redundancy: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 3_000,
            in_flight_ttl_ms: 20_000,
            use_coordinates: false,
            coordinate_cache_size: 1_000,
            resolve_batch_size: 64,
            exchange_batch_size: 32,
            max_refs: 16,
            redundancy: 1,
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn sync_interval(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = ms;
        self
    }

    pub fn in_flight_ttl(mut self, ms: u64) -> Self {
        self.config.in_flight_ttl_ms = ms;
        self
    }

    pub fn use_coordinates(mut self, enabled: bool) -> Self {
        self.config.use_coordinates = enabled;
        self
    }

    pub fn coordinate_cache_size(mut self, size: usize) -> Self {
        self.config.coordinate_cache_size = size;
        self
    }

    pub fn resolve_batch_size(mut self, size: usize) -> Self {
        self.config.resolve_batch_size = size;
        self
    }

    pub fn exchange_batch_size(mut self, size: usize) -> Self {
        self.config.exchange_batch_size = size;
        self
    }

    pub fn max_refs(mut self, refs: usize) -> Self {
        self.config.max_refs = refs;
        self
    }

    pub fn redundancy(mut self, redundancy: usize) -> Self {
        self.config.redundancy = redundancy;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_builder() {
        let config = SyncConfigBuilder::new()
            .sync_interval(500)
            .in_flight_ttl(10_000)
            .use_coordinates(true)
            .max_refs(4)
            .build();

        assert_eq!(config.sync_interval_ms, 500);
        assert_eq!(config.in_flight_ttl_ms, 10_000);
        assert!(config.use_coordinates);
        assert_eq!(config.max_refs, 4);
        assert_eq!(config.exchange_batch_size, 32);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"in_flight_ttl_ms": 15000}"#).unwrap();
        assert_eq!(config.in_flight_ttl_ms, 15_000);
        assert_eq!(config.sync_interval_ms, 3_000);
    }
}
