//! The process-wide registry of distributed objects and the logical clock.

use std::sync::Arc;

use log::trace;
use rustc_hash::FxHashMap;

use crate::controller::functor::Functor;
use crate::error::{Error, Result};
use crate::model::history::History;
use crate::model::revision::Revision;
use crate::types::{HistoryId, Locality, MemSpec, Rank};

pub mod history;
pub mod revision;

/// Where a newly appended revision lives and who produces it.
#[derive(Debug, Clone)]
pub enum Placement {
    /// Produced by `functor` on this rank, owned by this rank.
    Local(Arc<Functor>),
    /// Produced and owned by the given rank.
    Remote(Rank),
    /// Produced by `functor` on every rank.
    Common(Arc<Functor>),
}

/// Token identifying which revision of a history a bound argument refers to, and
/// in which epoch it was bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub clock: usize,
    pub revision: usize,
}

#[derive(Debug)]
pub struct Model {
    rank: Rank,
    clock: usize,
    next_id: HistoryId,
    histories: FxHashMap<HistoryId, History>,
}

impl Model {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            clock: 0,
            next_id: 0,
            histories: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The logical clock, advanced once per drain epoch.
    #[inline]
    pub fn clock(&self) -> usize {
        self.clock
    }

    pub fn advance_clock(&mut self) {
        self.clock += 1;
    }

    /// Registers a new history with its initial revision.
    pub fn create_history(&mut self, spec: MemSpec) -> HistoryId {
        let id = self.next_id;
        self.next_id += 1;
        self.histories.insert(id, History::new(id, spec));
        id
    }

    pub fn history(&self, id: HistoryId) -> Result<&History> {
        self.histories.get(&id).ok_or(Error::UnknownHistory(id))
    }

    pub(crate) fn history_mut(&mut self, id: HistoryId) -> Result<&mut History> {
        self.histories.get_mut(&id).ok_or(Error::UnknownHistory(id))
    }

    /// The latest revision of a history.
    pub fn back(&self, id: HistoryId) -> Result<Arc<Revision>> {
        Ok(self.history(id)?.back().clone())
    }

    /// Classifies a revision relative to this rank.
    pub fn classify(&self, revision: &Revision) -> Locality {
        match revision.owner() {
            None => Locality::Common,
            Some(owner) if owner == self.rank => Locality::Local,
            Some(_) => Locality::Remote,
        }
    }

    #[inline]
    pub fn common(&self, revision: &Revision) -> bool {
        self.classify(revision) == Locality::Common
    }

    #[inline]
    pub fn remote(&self, revision: &Revision) -> bool {
        self.classify(revision) == Locality::Remote
    }

    /// Whether this rank is the source of the revision's data.
    #[inline]
    pub fn feeds(&self, revision: &Revision) -> bool {
        revision.owner() == Some(self.rank)
    }

    /// Appends a new revision. The prior revision is left untouched.
    pub fn add_revision(&mut self, id: HistoryId, placement: Placement) -> Result<Arc<Revision>> {
        let rank = self.rank;
        let history = self.history_mut(id)?;
        let key = history.next_key();
        let spec = *history.spec();
        let (owner, generator) = match placement {
            Placement::Local(functor) => (Some(rank), Some(functor)),
            Placement::Remote(owner) => (Some(owner), None),
            Placement::Common(functor) => (None, Some(functor)),
        };
        trace!(key:% = key, owner:?; "Adding revision");
        let revision = Arc::new(Revision::new(key, spec, owner, generator));
        history.push(revision.clone());
        Ok(revision)
    }

    /// Stamps the history with the current clock.
    pub fn touch(&mut self, id: HistoryId) -> Result<()> {
        let clock = self.clock;
        self.history_mut(id)?.touch(clock);
        Ok(())
    }

    /// Makes the latest revision the current one.
    pub fn use_revision(&mut self, id: HistoryId) -> Result<()> {
        self.history_mut(id)?.use_back();
        Ok(())
    }

    /// The binding token for the latest revision of a history.
    pub fn time(&mut self, id: HistoryId) -> Result<Stamp> {
        self.touch(id)?;
        let history = self.history(id)?;
        Ok(Stamp {
            clock: self.clock,
            revision: history.len() - 1,
        })
    }

    /// Number of registered histories.
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}
