//! Vault configuration.

use pebble_spatial::DEFAULT_OVERLAY_LIMIT;
use serde::{Deserialize, Serialize};

/// Tunables for a vault instance.
///
/// Hosts may load this from any serde format; missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Outstanding index writes before the spatial tree is rebuilt balanced.
    pub index_overlay_limit: usize,
    /// Cross-check spatial lookups against the records and rebuild the
    /// index when they disagree.
    pub verify_spatial_lookups: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            index_overlay_limit: DEFAULT_OVERLAY_LIMIT,
            verify_spatial_lookups: true,
        }
    }
}
