//! Argument bindings. Each kind of argument has one row of behaviour: how it
//! contributes to the scope's decision, what it does to the revision chain on
//! the executing rank, on the other ranks, and in shared scopes, and what the
//! kernel gets to see.

use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::controller::functor::{Functor, FunctorId};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::memory::pool::Pool;
use crate::memory::slab::Buffer;
use crate::model::revision::Revision;
use crate::model::Placement;
use crate::types::{HistoryId, MemSpec};

/// A kernel body. It runs on a worker thread with its arguments locked.
pub type Kernel = Arc<dyn Fn(&mut Invocation<'_>) + Send + Sync>;

/// Handle of a distributed tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    id: HistoryId,
    spec: MemSpec,
}

impl Tile {
    pub(crate) fn new(id: HistoryId, spec: MemSpec) -> Self {
        Self { id, spec }
    }

    #[inline]
    pub fn id(&self) -> HistoryId {
        self.id
    }

    #[inline]
    pub fn spec(&self) -> MemSpec {
        self.spec
    }
}

/// Handle of a single `f64` produced by a kernel and delivered to every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScalarFuture {
    id: HistoryId,
}

impl ScalarFuture {
    pub(crate) fn new(id: HistoryId) -> Self {
        Self { id }
    }

    #[inline]
    pub fn id(&self) -> HistoryId {
        self.id
    }
}

/// An argument of a kernel call.
#[derive(Debug, Clone, Copy)]
pub enum Arg {
    Scalar(f64),
    /// The tile is only read.
    Read(Tile),
    /// The tile is read and modified. The kernel sees a copy of the prior data.
    ReadWrite(Tile),
    /// The tile is overwritten. The prior data is neither fetched nor copied.
    Write(Tile),
    /// The kernel produces the value of the future.
    Future(ScalarFuture),
}

impl Arg {
    /// The history the argument refers to, if any.
    pub fn history(&self) -> Option<HistoryId> {
        match self {
            Arg::Scalar(_) => None,
            Arg::Read(tile) | Arg::ReadWrite(tile) | Arg::Write(tile) => Some(tile.id),
            Arg::Future(future) => Some(future.id),
        }
    }

    pub(crate) fn score(&self, controller: &mut Controller) -> Result<()> {
        match *self {
            Arg::Scalar(_) | Arg::Future(_) => Ok(()),
            Arg::Read(tile) => controller.intend_read(tile.id),
            Arg::ReadWrite(tile) => {
                controller.intend_read(tile.id)?;
                controller.intend_write(tile.id)
            }
            Arg::Write(tile) => controller.intend_write(tile.id),
        }
    }

    /// Applies the call to the revision chain of a rank that does not execute it.
    pub(crate) fn modify_remote(&self, controller: &mut Controller) -> Result<()> {
        let Some(id) = self.history() else {
            return Ok(());
        };
        let which = controller.which();
        controller.model_mut().touch(id)?;
        let back = controller.model().back(id)?;
        match self {
            Arg::Scalar(_) => {}
            Arg::Read(_) => controller.rsync(&back)?,
            Arg::ReadWrite(_) => {
                controller.rsync(&back)?;
                controller.destroy(&back);
                controller.model_mut().add_revision(id, Placement::Remote(which))?;
            }
            Arg::Write(_) => {
                controller.destroy(&back);
                controller.model_mut().add_revision(id, Placement::Remote(which))?;
            }
            Arg::Future(_) => {
                controller.destroy(&back);
                let revision = controller
                    .model_mut()
                    .add_revision(id, Placement::Remote(which))?;
                controller.fetch(&revision, which)?;
            }
        }
        Ok(())
    }

    /// Applies the call to the revision chain of the executing rank and binds the
    /// argument to `functor`.
    pub(crate) fn modify_local(
        &self,
        controller: &mut Controller,
        functor: &Arc<Functor>,
    ) -> Result<Binding> {
        Ok(match *self {
            Arg::Scalar(value) => Binding::Scalar(value),
            Arg::Read(tile) => {
                let src = bind_current(controller, tile.id)?;
                controller.lsync(&src)?;
                controller.model_mut().use_revision(tile.id)?;
                Binding::Read { src }
            }
            Arg::ReadWrite(tile) => {
                let src = bind_current(controller, tile.id)?;
                controller.lsync(&src)?;
                controller.destroy(&src);
                let dst = append(controller, tile.id, Placement::Local(functor.clone()))?;
                Binding::Update { src, dst }
            }
            Arg::Write(tile) => {
                controller.model_mut().time(tile.id)?;
                let back = controller.model().back(tile.id)?;
                controller.destroy(&back);
                let dst = append(controller, tile.id, Placement::Local(functor.clone()))?;
                Binding::Write { dst }
            }
            Arg::Future(future) => {
                controller.model_mut().touch(future.id)?;
                let back = controller.model().back(future.id)?;
                controller.destroy(&back);
                let dst = append(controller, future.id, Placement::Local(functor.clone()))?;
                let others = controller.others();
                controller.push(&dst, others)?;
                Binding::Future { dst }
            }
        })
    }

    /// Applies the call to the revision chain when every rank executes it.
    pub(crate) fn modify(
        &self,
        controller: &mut Controller,
        functor: &Arc<Functor>,
    ) -> Result<Binding> {
        Ok(match *self {
            Arg::Scalar(value) => Binding::Scalar(value),
            Arg::Read(tile) => {
                let src = bind_current(controller, tile.id)?;
                controller.sync(&src)?;
                controller.model_mut().use_revision(tile.id)?;
                Binding::Read { src }
            }
            Arg::ReadWrite(tile) => {
                let src = bind_current(controller, tile.id)?;
                controller.sync(&src)?;
                controller.destroy(&src);
                let dst = append(controller, tile.id, Placement::Common(functor.clone()))?;
                Binding::Update { src, dst }
            }
            Arg::Write(tile) => {
                controller.model_mut().time(tile.id)?;
                let back = controller.model().back(tile.id)?;
                controller.destroy(&back);
                let dst = append(controller, tile.id, Placement::Common(functor.clone()))?;
                Binding::Write { dst }
            }
            Arg::Future(future) => {
                controller.model_mut().touch(future.id)?;
                let back = controller.model().back(future.id)?;
                controller.destroy(&back);
                let dst = append(controller, future.id, Placement::Common(functor.clone()))?;
                Binding::Future { dst }
            }
        })
    }
}

/// Panics if a call binds the same history more than once.
pub(crate) fn check_distinct(name: &str, args: &[Arg]) {
    if let Some(id) = args.iter().filter_map(Arg::history).duplicates().next() {
        panic!("history {id} bound twice in a call to {name}");
    }
}

/// Stamps the history and retains its current revision. The reference is taken
/// before any superseding, so the payload cannot be squeezed underneath the call.
fn bind_current(controller: &mut Controller, id: HistoryId) -> Result<Arc<Revision>> {
    let stamp = controller.model_mut().time(id)?;
    let revision = controller
        .model()
        .history(id)?
        .revision(stamp.revision)
        .cloned()
        .ok_or(Error::UnknownHistory(id))?;
    revision.retain();
    Ok(revision)
}

/// Appends a revision, makes it current and retains it.
fn append(controller: &mut Controller, id: HistoryId, placement: Placement) -> Result<Arc<Revision>> {
    let model = controller.model_mut();
    let revision = model.add_revision(id, placement)?;
    model.use_revision(id)?;
    revision.retain();
    Ok(revision)
}

/// An argument as bound to a functor.
#[derive(Debug)]
pub(crate) enum Binding {
    Scalar(f64),
    Read {
        src: Arc<Revision>,
    },
    Update {
        src: Arc<Revision>,
        dst: Arc<Revision>,
    },
    Write {
        dst: Arc<Revision>,
    },
    Future {
        dst: Arc<Revision>,
    },
}

impl Binding {
    pub fn pending_generator(&self, functor: FunctorId) -> Option<Arc<Functor>> {
        match self {
            Binding::Read { src } | Binding::Update { src, .. } => src
                .generator()
                .filter(|generator| generator.id() != functor),
            _ => None,
        }
    }

    pub fn ready(&self, functor: FunctorId) -> bool {
        match self {
            Binding::Read { src } => src.available_to(functor) && src.is_clean(),
            Binding::Update { src, dst } => {
                src.available_to(functor) && src.is_clean() && dst.available_to(functor)
            }
            Binding::Scalar(_) | Binding::Write { .. } | Binding::Future { .. } => true,
        }
    }

    /// Allocates the payloads the kernel will see. Inputs that were never written
    /// are zeroes; an updated tile starts as a copy of its prior revision.
    pub fn prepare(&self, pool: &Pool) -> Result<()> {
        match self {
            Binding::Scalar(_) => {}
            Binding::Read { src } => {
                if !src.has_payload() {
                    src.install(pool.allocate(src.extent(), true)?);
                }
            }
            Binding::Update { src, dst } => {
                if !dst.has_payload() {
                    let mut buffer = pool.allocate(dst.extent(), false)?;
                    match src.payload().read().as_ref() {
                        Some(prior) => buffer.as_mut_slice().copy_from_slice(prior.as_slice()),
                        None => buffer.as_mut_slice().fill(0),
                    }
                    dst.install(buffer);
                }
            }
            Binding::Write { dst } | Binding::Future { dst } => {
                if !dst.has_payload() {
                    dst.install(pool.allocate(dst.extent(), true)?);
                }
            }
        }
        Ok(())
    }

    /// Drops the functor's references. Outputs count as produced from here on.
    pub fn deallocate(&self) {
        match self {
            Binding::Scalar(_) => {}
            Binding::Read { src } => src.release(),
            Binding::Update { src, dst } => {
                src.release();
                dst.reset_generator();
                dst.release();
            }
            Binding::Write { dst } | Binding::Future { dst } => {
                dst.reset_generator();
                dst.release();
            }
        }
    }
}

enum Slot<'a> {
    Scalar(f64),
    Read(RwLockReadGuard<'a, Option<Buffer>>),
    Write(RwLockWriteGuard<'a, Option<Buffer>>),
}

/// The view a kernel has of its arguments, indexed in call order. Payloads stay
/// locked for the lifetime of the invocation.
pub struct Invocation<'a> {
    name: &'a str,
    slots: Vec<Slot<'a>>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(name: &'a str, bindings: &'a [Binding]) -> Self {
        let slots = bindings
            .iter()
            .map(|binding| match binding {
                Binding::Scalar(value) => Slot::Scalar(*value),
                Binding::Read { src } => Slot::Read(src.payload().read()),
                Binding::Update { dst, .. } | Binding::Write { dst } | Binding::Future { dst } => {
                    Slot::Write(dst.payload().write())
                }
            })
            .collect();
        Self { name, slots }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn scalar(&self, index: usize) -> f64 {
        match &self.slots[index] {
            Slot::Scalar(value) => *value,
            _ => panic!("argument {index} of {} is not a scalar", self.name),
        }
    }

    /// The bytes of a tile argument.
    pub fn tile(&self, index: usize) -> &[u8] {
        let payload = match &self.slots[index] {
            Slot::Read(guard) => (**guard).as_ref(),
            Slot::Write(guard) => (**guard).as_ref(),
            Slot::Scalar(_) => panic!("argument {index} of {} is not a tile", self.name),
        };
        payload
            .map(Buffer::as_slice)
            .unwrap_or_else(|| panic!("argument {index} of {} holds no payload", self.name))
    }

    /// The bytes of a written tile or future argument.
    pub fn tile_mut(&mut self, index: usize) -> &mut [u8] {
        let name = self.name;
        match &mut self.slots[index] {
            Slot::Write(guard) => (**guard)
                .as_mut()
                .map(Buffer::as_mut_slice)
                .unwrap_or_else(|| panic!("argument {index} of {name} holds no payload")),
            _ => panic!("argument {index} of {name} is not writable"),
        }
    }

    /// A tile argument read as little-endian `f64` values.
    pub fn values(&self, index: usize) -> Vec<f64> {
        self.tile(index)
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes)
            })
            .collect()
    }

    /// Overwrites a writable argument with little-endian `f64` values.
    ///
    /// # Panics
    /// Panics if `values` does not cover the whole tile.
    pub fn set_values(&mut self, index: usize, values: &[f64]) {
        let name = self.name;
        let target = self.tile_mut(index);
        assert_eq!(
            target.len(),
            values.len() * 8,
            "argument {index} of {name} does not hold {} values",
            values.len()
        );
        for (chunk, value) in target.chunks_exact_mut(8).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Sets the value of a future argument.
    pub fn set_future(&mut self, index: usize, value: f64) {
        self.set_values(index, &[value]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::types::{Dim2, TransferKey};

    fn revision(index: usize, elements: usize) -> Arc<Revision> {
        Arc::new(Revision::new(
            TransferKey::new(9, index),
            MemSpec::new(8, Dim2::new(elements, 1)),
            Some(0),
            None,
        ))
    }

    #[test]
    fn test_update_starts_from_prior_data() {
        let pool = Pool::new(&RuntimeConfig::default().with_bulk(0, 0));
        let src = revision(1, 2);
        let mut prior = pool.allocate(16, false).unwrap();
        prior.as_mut_slice()[..8].copy_from_slice(&1.5f64.to_le_bytes());
        prior.as_mut_slice()[8..].copy_from_slice(&(-2.0f64).to_le_bytes());
        src.install(prior);
        let dst = revision(2, 2);

        let bindings = vec![
            Binding::Scalar(3.0),
            Binding::Update {
                src: src.clone(),
                dst: dst.clone(),
            },
        ];
        for binding in &bindings {
            binding.prepare(&pool).unwrap();
        }

        let mut invocation = Invocation::new("scale", &bindings);
        let factor = invocation.scalar(0);
        let scaled = invocation
            .values(1)
            .into_iter()
            .map(|v| v * factor)
            .collect::<Vec<_>>();
        invocation.set_values(1, &scaled);
        drop(invocation);

        let bytes = dst.snapshot().unwrap();
        assert_eq!(&bytes[..8], &4.5f64.to_le_bytes());
        assert_eq!(&bytes[8..], &(-6.0f64).to_le_bytes());
        // the prior revision is untouched
        assert_eq!(&src.snapshot().unwrap()[..8], &1.5f64.to_le_bytes());
    }

    #[test]
    fn test_unwritten_input_reads_as_zeroes() {
        let pool = Pool::new(&RuntimeConfig::default());
        let binding = Binding::Read { src: revision(0, 4) };
        binding.prepare(&pool).unwrap();
        let bindings = [binding];
        let invocation = Invocation::new("sum", &bindings);
        assert_eq!(invocation.values(0), vec![0.0; 4]);
    }

    #[test]
    #[should_panic(expected = "argument 0 of sum is not writable")]
    fn test_read_is_not_writable() {
        let pool = Pool::new(&RuntimeConfig::default());
        let binding = Binding::Read { src: revision(0, 1) };
        binding.prepare(&pool).unwrap();
        let bindings = [binding];
        let mut invocation = Invocation::new("sum", &bindings);
        invocation.set_future(0, 1.0);
    }

    #[test]
    #[should_panic(expected = "history 4 bound twice in a call to axpy")]
    fn test_same_tile_twice() {
        let spec = MemSpec::new(8, Dim2::new(2, 2));
        let x = Tile::new(4, spec);
        check_distinct("axpy", &[Arg::Read(x), Arg::Scalar(2.0), Arg::ReadWrite(x)]);
    }

    #[test]
    fn test_ready_waits_for_foreign_generator() {
        let producer = Arc::new(Functor::kernel(
            1,
            "produce",
            Arc::new(|_: &mut Invocation<'_>| {}),
        ));
        let src = revision(1, 1);
        src.set_generator(producer.clone());
        let binding = Binding::Read { src: src.clone() };

        assert!(!binding.ready(2));
        assert_eq!(binding.pending_generator(2).map(|g| g.id()), Some(1));
        // a functor never waits for itself
        assert!(binding.ready(1));
        assert!(binding.pending_generator(1).is_none());

        src.reset_generator();
        assert!(binding.ready(2));
    }
}
