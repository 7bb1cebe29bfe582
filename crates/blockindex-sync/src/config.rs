//! Fetcher configuration and its fluent builder.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use blockindex_sync::FetcherBuilder;
//!
//! let config = FetcherBuilder::new()
//!     .to_height(800_000)
//!     .batch_size(50)
//!     .need_save_interval(Duration::from_secs(60))
//!     .build_config();
//! assert_eq!(config.to_height, Some(800_000));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time between checkpoint saves.
pub const DEFAULT_NEED_SAVE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Configuration for a [`BlockFetcher`](crate::BlockFetcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Lowest height to replay.
    pub from_height: u32,
    /// Highest height to replay (inclusive). `None` = up to the chain tip.
    pub to_height: Option<u32>,
    /// How many block hashes to request from the source per call.
    pub batch_size: usize,
    /// Minimum time between two checkpoint saves.
    pub need_save_interval: Duration,
}

impl FetcherConfig {
    /// Upper bound as a plain height.
    pub fn to_height_or_max(&self) -> u32 {
        self.to_height.unwrap_or(u32::MAX)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            from_height: 0,
            to_height: None,
            batch_size: 100,
            need_save_interval: DEFAULT_NEED_SAVE_INTERVAL,
        }
    }
}

/// Fluent builder for [`FetcherConfig`].
#[derive(Default)]
pub struct FetcherBuilder {
    config: FetcherConfig,
}

impl FetcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_height(mut self, height: u32) -> Self {
        self.config.from_height = height;
        self
    }

    pub fn to_height(mut self, height: u32) -> Self {
        self.config.to_height = Some(height);
        self
    }

    /// Set the number of hashes per block-source request (minimum 1).
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size.max(1);
        self
    }

    pub fn need_save_interval(mut self, interval: Duration) -> Self {
        self.config.need_save_interval = interval;
        self
    }

    pub fn build_config(self) -> FetcherConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = FetcherBuilder::new().build_config();
        assert_eq!(cfg.from_height, 0);
        assert_eq!(cfg.to_height, None);
        assert_eq!(cfg.to_height_or_max(), u32::MAX);
        assert_eq!(cfg.need_save_interval, Duration::from_secs(900));
    }

    #[test]
    fn builder_custom() {
        let cfg = FetcherBuilder::new()
            .from_height(10)
            .to_height(20)
            .batch_size(0)
            .need_save_interval(Duration::ZERO)
            .build_config();
        assert_eq!(cfg.from_height, 10);
        assert_eq!(cfg.to_height, Some(20));
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.need_save_interval, Duration::ZERO);
    }
}
