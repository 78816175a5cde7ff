use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a process in the group. Matches the MPI rank type.
pub type Rank = i32;

/// Identifier of a [`History`](crate::model::history::History). Ids are handed out
/// in creation order, so identical program traces yield identical ids on every rank.
pub type HistoryId = u64;

/// Sector value used by scopes that have no single executing rank.
pub const BROADCAST: Rank = -1;

/// Minimum payload alignment and smallest pool size class.
pub const ALIGNMENT: usize = 64;

/// Two-dimensional extent of a tile, in elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim2 {
    pub x: usize,
    pub y: usize,
}

impl Dim2 {
    #[inline]
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Number of elements covered by this extent.
    #[inline]
    pub fn square(&self) -> usize {
        self.x * self.y
    }
}

impl fmt::Display for Dim2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Byte layout of one tile version: element size times tile dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemSpec {
    pub element_size: usize,
    pub dim: Dim2,
}

impl MemSpec {
    #[inline]
    pub fn new(element_size: usize, dim: Dim2) -> Self {
        Self { element_size, dim }
    }

    /// Size of the payload in bytes.
    ///
    /// # Examples
    /// ```
    /// # use ambient::types::{Dim2, MemSpec};
    /// let spec = MemSpec::new(8, Dim2::new(4, 2));
    /// assert_eq!(spec.extent(), 64);
    /// ```
    #[inline]
    pub fn extent(&self) -> usize {
        self.element_size * self.dim.square()
    }
}

/// Where a revision (or the active scope) lives relative to the current rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locality {
    /// Owned by another rank.
    Remote,
    /// Owned by this rank.
    Local,
    /// Replicated consistently on every rank.
    Common,
}

/// Memory strategy holding a revision's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    /// Drawn from the bounded bulk pool.
    Bulked,
    /// Drawn from the standard slab pool.
    Standard,
    /// Not owned by the pool: adopted from the transport, or already reclaimed.
    Delegated,
}

/// Wire key of a transfer. Both endpoints derive it from identical scheduling, so
/// it is the only metadata a transfer carries besides the raw bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferKey {
    pub history: HistoryId,
    pub revision: u64,
}

impl TransferKey {
    #[inline]
    pub fn new(history: HistoryId, revision: usize) -> Self {
        Self {
            history,
            revision: revision as u64,
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.history, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent() {
        assert_eq!(MemSpec::new(16, Dim2::new(3, 5)).extent(), 240);
        assert_eq!(MemSpec::new(8, Dim2::default()).extent(), 0);
    }

    #[test]
    fn test_transfer_key_display() {
        assert_eq!(TransferKey::new(12, 3).to_string(), "12#3");
    }
}
