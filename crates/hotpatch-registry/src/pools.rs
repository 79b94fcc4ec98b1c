//! The fixed-purpose pools behind the module registry

use crate::module::{Compiland, Dependency};
use crate::ports::Contribution;
use hotpatch_core::Pool;
use tracing::info;

/// All registry pools, constructed once and injected into `Registries`.
pub struct PoolSet {
    pub compilands: Pool<Compiland>,
    pub dependencies: Pool<Dependency>,
    pub contributions: Pool<Contribution>,
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolSet {
    pub fn new() -> Self {
        Self {
            compilands: Pool::new("compilands"),
            dependencies: Pool::new("dependencies"),
            contributions: Pool::new("contributions"),
        }
    }

    /// Dumped after every enable/disable batch.
    pub fn log_stats(&self) {
        for (name, stats) in [
            (self.compilands.name(), self.compilands.stats()),
            (self.dependencies.name(), self.dependencies.stats()),
            (self.contributions.name(), self.contributions.stats()),
        ] {
            info!(
                pool = name,
                live = stats.live,
                capacity = stats.capacity,
                allocations = stats.allocations,
                bytes = stats.bytes,
                "pool stats"
            );
        }
    }
}
