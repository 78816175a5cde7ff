use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Rank;

const MIB: usize = 1 << 20;

/// Runtime parameters. They are fixed for the lifetime of a process group and
/// must be identical on every rank, which is why [`Context::new`] broadcasts the
/// configuration of rank 0 to everyone.
///
/// [`Context::new`]: crate::context::Context::new
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Bytes per slab of the standard pool.
    pub slab_bytes: usize,
    /// Bytes per slab of the bulk pool.
    pub bulk_slab_bytes: usize,
    /// Maximum number of bulk slabs. Zero disables the bulk pool.
    pub bulk_limit: usize,
    /// Whether superseded revisions give their payload back to the pool.
    pub squeeze: bool,
    /// The rank executing everything inside a dedicated scope.
    pub dedicated_rank: Rank,
    /// Worker threads per rank. `None` lets rayon decide.
    pub workers: Option<usize>,
    /// How long the drain loop may go without progress before it reports a
    /// deadlock.
    pub stall_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            slab_bytes: MIB,
            bulk_slab_bytes: 4 * MIB,
            bulk_limit: 40,
            squeeze: true,
            dedicated_rank: 0,
            workers: None,
            stall_timeout: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    #[inline]
    pub fn with_slab_bytes(mut self, slab_bytes: usize) -> Self {
        self.slab_bytes = slab_bytes;
        self
    }

    #[inline]
    pub fn with_bulk(mut self, bulk_slab_bytes: usize, bulk_limit: usize) -> Self {
        self.bulk_slab_bytes = bulk_slab_bytes;
        self.bulk_limit = bulk_limit;
        self
    }

    #[inline]
    pub fn with_squeeze(mut self, squeeze: bool) -> Self {
        self.squeeze = squeeze;
        self
    }

    #[inline]
    pub fn with_dedicated_rank(mut self, rank: Rank) -> Self {
        self.dedicated_rank = rank;
        self
    }

    #[inline]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    #[inline]
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Checks the configuration against a group of `size` ranks.
    pub fn validate(&self, size: Rank) -> Result<()> {
        if self.dedicated_rank < 0 || self.dedicated_rank >= size {
            return Err(Error::InvalidConfig(format!(
                "dedicated rank {} is outside of a group of {size} ranks",
                self.dedicated_rank
            )));
        }
        if self.slab_bytes == 0 {
            return Err(Error::InvalidConfig("slab size must not be zero".into()));
        }
        if self.bulk_limit > 0 && self.bulk_slab_bytes == 0 {
            return Err(Error::InvalidConfig(
                "bulk slab size must not be zero while bulk is enabled".into(),
            ));
        }
        if self.workers == Some(0) {
            return Err(Error::InvalidConfig("at least one worker is required".into()));
        }
        Ok(())
    }
}
