use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::controller::functor::{Functor, FunctorId};
use crate::memory::slab::Buffer;
use crate::types::{MemSpec, Rank, Region, TransferKey};

#[derive(Default)]
struct RevisionState {
    /// The functor that will produce this revision locally. `None` once produced,
    /// or if it is produced elsewhere.
    generator: Option<Arc<Functor>>,
    region: Option<Region>,
    /// Bound functors and in-flight transfers using this revision.
    users: usize,
    locked_once: bool,
    /// A fetch was issued for this revision on this rank.
    fetched: bool,
    fetch_pending: bool,
    /// Ranks this revision was already pushed to.
    shipped: Vec<Rank>,
    superseded: bool,
}

/// One materialized version of a history's data.
///
/// The owner is fixed at creation. It is only meaningful because the scope
/// decision that created the revision ran identically on every rank.
pub struct Revision {
    key: TransferKey,
    spec: MemSpec,
    owner: Option<Rank>,
    payload: RwLock<Option<Buffer>>,
    state: Mutex<RevisionState>,
}

impl Revision {
    /// Creates a revision owned by `owner` (`None` for replicated revisions) that
    /// is produced by `generator`, if any.
    pub fn new(
        key: TransferKey,
        spec: MemSpec,
        owner: Option<Rank>,
        generator: Option<Arc<Functor>>,
    ) -> Self {
        Self {
            key,
            spec,
            owner,
            payload: RwLock::new(None),
            state: Mutex::new(RevisionState {
                generator,
                ..Default::default()
            }),
        }
    }

    #[inline]
    pub fn key(&self) -> TransferKey {
        self.key
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.key.revision as usize
    }

    #[inline]
    pub fn spec(&self) -> &MemSpec {
        &self.spec
    }

    #[inline]
    pub fn extent(&self) -> usize {
        self.spec.extent()
    }

    /// The rank holding the authoritative data, `None` if replicated everywhere.
    #[inline]
    pub fn owner(&self) -> Option<Rank> {
        self.owner
    }

    pub fn generator(&self) -> Option<Arc<Functor>> {
        self.state.lock().generator.clone()
    }

    pub(crate) fn set_generator(&self, generator: Arc<Functor>) {
        self.state.lock().generator = Some(generator);
    }

    pub(crate) fn reset_generator(&self) {
        self.state.lock().generator = None;
    }

    /// Whether `functor` may use this revision: nothing else still has to
    /// produce it.
    pub fn available_to(&self, functor: FunctorId) -> bool {
        self.state
            .lock()
            .generator
            .as_ref()
            .map_or(true, |generator| generator.id() == functor)
    }

    /// Registers a user.
    pub fn retain(&self) {
        self.state.lock().users += 1;
    }

    /// Unregisters a user. The first release marks the revision as having gone
    /// through a synchronization pass.
    pub fn release(&self) {
        let mut state = self.state.lock();
        assert!(state.users > 0, "revision {} released too often", self.key);
        state.users -= 1;
        state.locked_once = true;
    }

    pub fn is_referenced(&self) -> bool {
        self.state.lock().users > 0
    }

    pub fn locked_once(&self) -> bool {
        self.state.lock().locked_once
    }

    /// Whether no fetch is pending for this revision.
    pub fn is_clean(&self) -> bool {
        !self.state.lock().fetch_pending
    }

    /// Marks the revision as being fetched. Returns `false` if it already was
    /// fetched or is present locally, in which case no new fetch is needed.
    pub(crate) fn begin_fetch(&self) -> bool {
        let mut state = self.state.lock();
        if state.fetched || self.payload.read().is_some() {
            return false;
        }
        state.fetched = true;
        state.fetch_pending = true;
        true
    }

    /// Installs fetched bytes and clears the pending fetch.
    pub(crate) fn complete_fetch(&self, buffer: Buffer) {
        self.install(buffer);
        self.state.lock().fetch_pending = false;
    }

    /// Returns those of `destinations` this revision was not yet pushed to, and
    /// records them as pushed.
    pub(crate) fn ship_to(&self, destinations: impl IntoIterator<Item = Rank>) -> Vec<Rank> {
        let mut state = self.state.lock();
        let mut fresh = Vec::new();
        for destination in destinations {
            if !state.shipped.contains(&destination) {
                state.shipped.push(destination);
                fresh.push(destination);
            }
        }
        fresh
    }

    pub(crate) fn supersede(&self) {
        self.state.lock().superseded = true;
    }

    pub fn is_superseded(&self) -> bool {
        self.state.lock().superseded
    }

    /// The memory strategy of the payload. Revisions without a payload are
    /// delegated.
    pub fn region(&self) -> Region {
        self.state.lock().region.unwrap_or(Region::Delegated)
    }

    pub fn has_payload(&self) -> bool {
        self.payload.read().is_some()
    }

    #[inline]
    pub fn payload(&self) -> &RwLock<Option<Buffer>> {
        &self.payload
    }

    /// Sets the payload.
    ///
    /// # Panics
    /// Panics if the buffer does not match the revision's extent.
    pub(crate) fn install(&self, buffer: Buffer) {
        assert_eq!(
            buffer.len(),
            self.extent(),
            "payload of {} does not match its layout",
            self.key
        );
        let region = buffer.region();
        *self.payload.write() = Some(buffer);
        self.state.lock().region = Some(region);
    }

    /// Takes the payload without blocking. Returns `None` if the payload is locked.
    pub(crate) fn try_take_payload(&self) -> Option<Option<Buffer>> {
        let mut payload = self.payload.try_write()?;
        let buffer = payload.take();
        drop(payload);
        if buffer.is_some() {
            self.state.lock().region = Some(Region::Delegated);
        }
        Some(buffer)
    }

    /// Copies the local payload, if any.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.payload
            .read()
            .as_ref()
            .map(|buffer| buffer.as_slice().to_vec())
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Revision")
            .field("key", &self.key)
            .field("spec", &self.spec)
            .field("owner", &self.owner)
            .field("generator", &state.generator.as_ref().map(|g| g.id()))
            .field("users", &state.users)
            .field("locked_once", &state.locked_once)
            .finish_non_exhaustive()
    }
}
