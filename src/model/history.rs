use std::sync::Arc;

use crate::model::revision::Revision;
use crate::types::{HistoryId, MemSpec, TransferKey};

/// The identity of a distributed tile across all of its versions. Revisions are
/// only ever appended.
#[derive(Debug)]
pub struct History {
    id: HistoryId,
    spec: MemSpec,
    content: Vec<Arc<Revision>>,
    /// Index of the revision current for dependency bookkeeping.
    current: usize,
    /// Clock value of the last epoch that touched this history.
    clock: usize,
}

impl History {
    /// Creates a history with its initial revision. The initial revision is
    /// replicated, clean and not produced by anyone: every rank materializes it as
    /// zeroes on first use.
    pub fn new(id: HistoryId, spec: MemSpec) -> Self {
        let initial = Revision::new(TransferKey::new(id, 0), spec, None, None);
        Self {
            id,
            spec,
            content: vec![Arc::new(initial)],
            current: 0,
            clock: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> HistoryId {
        self.id
    }

    #[inline]
    pub fn spec(&self) -> &MemSpec {
        &self.spec
    }

    /// The latest revision.
    #[inline]
    pub fn back(&self) -> &Arc<Revision> {
        self.content.last().expect("a history always has a revision")
    }

    #[inline]
    pub fn revision(&self, index: usize) -> Option<&Arc<Revision>> {
        self.content.get(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Always `false`; a history holds at least its initial revision.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn clock(&self) -> usize {
        self.clock
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Revision>> {
        self.content.iter()
    }

    /// Key under which the next appended revision will be transferred.
    #[inline]
    pub(crate) fn next_key(&self) -> TransferKey {
        TransferKey::new(self.id, self.content.len())
    }

    pub(crate) fn push(&mut self, revision: Arc<Revision>) {
        debug_assert_eq!(revision.key(), self.next_key());
        self.content.push(revision);
    }

    pub(crate) fn touch(&mut self, clock: usize) {
        self.clock = clock;
    }

    pub(crate) fn use_back(&mut self) {
        self.current = self.content.len() - 1;
    }
}
