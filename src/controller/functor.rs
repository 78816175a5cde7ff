use std::fmt;
use std::sync::{Arc, OnceLock};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::channel::{Channel, Completion};
use crate::controller::binding::{Binding, Invocation, Kernel};
use crate::error::Result;
use crate::memory::pool::Pool;
use crate::memory::slab::Buffer;
use crate::model::revision::Revision;
use crate::types::Rank;

/// Identifier of a functor, unique per rank.
pub type FunctorId = u64;

pub(crate) enum FunctorBody {
    /// An application kernel over bound arguments.
    Kernel {
        name: String,
        kernel: Kernel,
        bindings: OnceLock<Vec<Binding>>,
    },
    /// Receives a revision from its owner. Generator of the revision on this rank
    /// until it is retired.
    Fetch {
        revision: Arc<Revision>,
        source: Rank,
        completion: Completion,
    },
    /// Sends a revision to other ranks once it is produced.
    Push {
        revision: Arc<Revision>,
        destinations: Vec<Rank>,
    },
}

/// A scheduled unit of work.
pub struct Functor {
    id: FunctorId,
    body: FunctorBody,
    /// Functors pinned on this one. They enter the queue once this one retires.
    deps: Mutex<Vec<Arc<Functor>>>,
}

impl Functor {
    pub(crate) fn kernel(id: FunctorId, name: &str, kernel: Kernel) -> Self {
        Self::new(
            id,
            FunctorBody::Kernel {
                name: name.to_string(),
                kernel,
                bindings: OnceLock::new(),
            },
        )
    }

    pub(crate) fn fetch(
        id: FunctorId,
        revision: Arc<Revision>,
        source: Rank,
        completion: Completion,
    ) -> Self {
        Self::new(
            id,
            FunctorBody::Fetch {
                revision,
                source,
                completion,
            },
        )
    }

    pub(crate) fn push(id: FunctorId, revision: Arc<Revision>, destinations: Vec<Rank>) -> Self {
        Self::new(
            id,
            FunctorBody::Push {
                revision,
                destinations,
            },
        )
    }

    fn new(id: FunctorId, body: FunctorBody) -> Self {
        Self {
            id,
            body,
            deps: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> FunctorId {
        self.id
    }

    pub fn name(&self) -> &str {
        match &self.body {
            FunctorBody::Kernel { name, .. } => name,
            FunctorBody::Fetch { .. } => "fetch",
            FunctorBody::Push { .. } => "push",
        }
    }

    #[inline]
    pub fn is_kernel(&self) -> bool {
        matches!(self.body, FunctorBody::Kernel { .. })
    }

    /// Attaches the argument bindings of a kernel.
    ///
    /// # Panics
    /// Panics if the functor is not a kernel or was already bound.
    pub(crate) fn bind(&self, arguments: Vec<Binding>) {
        let FunctorBody::Kernel { bindings, name, .. } = &self.body else {
            panic!("only kernels take bindings")
        };
        assert!(bindings.set(arguments).is_ok(), "kernel {name} bound twice");
    }

    fn bindings(&self) -> &[Binding] {
        match &self.body {
            FunctorBody::Kernel { bindings, .. } => bindings.get().map_or(&[], Vec::as_slice),
            _ => &[],
        }
    }

    /// Pins `dependent` on this functor.
    pub(crate) fn queue(&self, dependent: Arc<Functor>) {
        self.deps.lock().push(dependent);
    }

    /// Number of functors pinned on this one.
    pub fn dependents(&self) -> usize {
        self.deps.lock().len()
    }

    /// The first producer, other than this functor, that one of the inputs still
    /// waits for.
    pub(crate) fn pending_generator(&self) -> Option<Arc<Functor>> {
        self.bindings()
            .iter()
            .find_map(|binding| binding.pending_generator(self.id))
    }

    /// Whether every input is materialized locally.
    pub fn ready(&self) -> bool {
        match &self.body {
            FunctorBody::Kernel { .. } => self.bindings().iter().all(|b| b.ready(self.id)),
            FunctorBody::Fetch { completion, .. } => completion.is_done(),
            FunctorBody::Push { revision, .. } => revision.available_to(self.id),
        }
    }

    /// Materializes the payloads a kernel touches. Runs sequentially before the
    /// kernels of a pass run in parallel.
    pub(crate) fn prepare(&self, pool: &Pool) -> Result<()> {
        for binding in self.bindings() {
            binding.prepare(pool)?;
        }
        Ok(())
    }

    /// Runs a prepared kernel.
    pub(crate) fn run(&self) {
        if let FunctorBody::Kernel { name, kernel, .. } = &self.body {
            trace!(id = self.id, name:%; "Invoking kernel");
            let mut invocation = Invocation::new(name, self.bindings());
            kernel(&mut invocation);
        }
    }

    /// Performs a ready transfer.
    pub(crate) fn transfer(&self, channel: &mut dyn Channel) -> Result<()> {
        match &self.body {
            FunctorBody::Kernel { .. } => {}
            FunctorBody::Fetch {
                revision,
                source,
                completion,
            } => {
                let bytes = completion.take().unwrap_or_default();
                debug!(key:% = revision.key(), source, bytes = bytes.len(); "Fetched revision");
                revision.complete_fetch(Buffer::adopt(bytes));
            }
            FunctorBody::Push {
                revision,
                destinations,
            } => {
                let payload = revision.payload().read();
                let bytes = payload.as_ref().map_or(&[][..], Buffer::as_slice);
                for &destination in destinations {
                    debug!(key:% = revision.key(), destination, bytes = bytes.len(); "Pushing revision");
                    channel.push(destination, revision.key(), bytes)?;
                }
            }
        }
        Ok(())
    }

    /// Releases what the functor held and returns the functors pinned on it, in
    /// the order they were pinned.
    pub(crate) fn retire(&self) -> Vec<Arc<Functor>> {
        match &self.body {
            FunctorBody::Kernel { .. } => {
                for binding in self.bindings() {
                    binding.deallocate();
                }
            }
            FunctorBody::Fetch { revision, .. } => {
                revision.reset_generator();
                revision.release();
            }
            FunctorBody::Push { revision, .. } => revision.release(),
        }
        std::mem::take(&mut *self.deps.lock())
    }
}

impl fmt::Debug for Functor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Functor")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("dependents", &self.dependents())
            .finish()
    }
}
