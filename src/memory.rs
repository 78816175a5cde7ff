//! Payload memory. Tile payloads come from size-classed slab pools instead of
//! per-task general allocation, and are handed back by squeezing revisions that
//! are no longer needed.

pub mod pool;
pub mod slab;
