use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::memory::slab::{Buffer, SlabPool};
use crate::model::revision::Revision;
use crate::types::Region;

/// Outcome of [`Pool::squeeze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Squeeze {
    /// The payload went back to its pool.
    Reclaimed,
    /// The revision is still referenced, not yet synchronized, or its payload is
    /// locked by a running kernel. Try again later.
    Retained,
    /// There was no payload to reclaim.
    Empty,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub standard_slabs: usize,
    pub bulk_slabs: usize,
    pub reclaimed: usize,
}

/// The payload allocator of one rank: a bounded bulk pool that is preferred while
/// it has room, backed by an unbounded standard pool.
#[derive(Debug)]
pub struct Pool {
    standard: SlabPool,
    bulk: Option<SlabPool>,
    squeeze: bool,
    reclaimed: AtomicUsize,
}

impl Pool {
    pub fn new(config: &RuntimeConfig) -> Self {
        let bulk = (config.bulk_limit > 0).then(|| {
            SlabPool::new(
                config.bulk_slab_bytes,
                Region::Bulked,
                Some(config.bulk_limit),
            )
        });
        Self {
            standard: SlabPool::new(config.slab_bytes, Region::Standard, None),
            bulk,
            squeeze: config.squeeze,
            reclaimed: AtomicUsize::new(0),
        }
    }

    /// Draws a buffer of `len` bytes, from the bulk pool if it still has room. If
    /// `zeroed` is set, the buffer is cleared (reused blocks hold stale bytes).
    pub fn allocate(&self, len: usize, zeroed: bool) -> Result<Buffer> {
        let bulked = match &self.bulk {
            Some(bulk) => bulk.allocate(len)?,
            None => None,
        };
        let mut buffer = match bulked {
            Some(buffer) => buffer,
            None => self
                .standard
                .allocate(len)?
                .expect("standard pool is unbounded"),
        };
        if zeroed {
            buffer.as_mut_slice().fill(0);
        }
        trace!(len, region:? = buffer.region(); "Allocated buffer");
        Ok(buffer)
    }

    /// Returns a buffer to the pool it came from. Delegated buffers are dropped.
    pub fn free(&self, buffer: Buffer) {
        match buffer.region() {
            Region::Standard => self.standard.free(buffer),
            Region::Bulked => self
                .bulk
                .as_ref()
                .expect("bulked buffer without a bulk pool")
                .free(buffer),
            Region::Delegated => drop(buffer),
        }
    }

    /// Reclaims the payload of `revision` if it is unreferenced and has completed
    /// at least one synchronization pass. The payload lock is only tried, never
    /// waited for.
    pub fn squeeze(&self, revision: &Revision) -> Squeeze {
        if !self.squeeze || revision.is_referenced() || !revision.locked_once() {
            return if revision.has_payload() {
                Squeeze::Retained
            } else {
                Squeeze::Empty
            };
        }
        match revision.try_take_payload() {
            None => Squeeze::Retained,
            Some(None) => Squeeze::Empty,
            Some(Some(buffer)) => {
                debug!(key:% = revision.key(), region:? = buffer.region(); "Squeezed revision");
                self.free(buffer);
                self.reclaimed.fetch_add(1, Ordering::Relaxed);
                Squeeze::Reclaimed
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            standard_slabs: self.standard.slabs(),
            bulk_slabs: self.bulk.as_ref().map_or(0, SlabPool::slabs),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// The standard pool, for inspection.
    pub fn standard(&self) -> &SlabPool {
        &self.standard
    }
}
