//! Watch session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SubEntityLayout;

pub const DEFAULT_RESYNC: Duration = Duration::from_secs(10);
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAP: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Namespace filter; `None` watches all namespaces.
    pub resource_scope: Option<String>,
    /// Re-list interval; `None` disables periodic re-listing.
    pub resync_period: Option<Duration>,
    /// Upper bound on the startup wait for cache sync.
    pub sync_timeout: Duration,
    /// Sub-entity path and tracked fields for the change detector.
    pub layout: SubEntityLayout,
    /// Number of dispatcher workers (and cache shards).
    pub workers: usize,
    /// Capacity of each worker queue.
    pub queue_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resource_scope: None,
            resync_period: Some(DEFAULT_RESYNC),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            layout: SubEntityLayout::default(),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAP,
        }
    }
}

impl WatchConfig {
    pub fn tracked_fields(&self) -> &[String] {
        &self.layout.tracked_fields
    }

    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_track_image_across_all_namespaces() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.resource_scope, None);
        assert_eq!(cfg.tracked_fields(), ["image".to_string()]);
        assert_eq!(cfg.resync_period, Some(Duration::from_secs(10)));
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let cfg = WatchConfig { workers: 0, queue_capacity: 0, ..WatchConfig::default() };
        assert_eq!(cfg.workers(), 1);
        assert_eq!(cfg.queue_capacity(), 1);
    }
}
