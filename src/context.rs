//! The application-facing entry point of a rank.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::{debug, info};

use crate::channel::{broadcast_serializing, Channel, ChannelStats};
use crate::config::RuntimeConfig;
use crate::controller::binding::{Arg, Invocation, ScalarFuture, Tile};
use crate::controller::scope::{ScopeKind, SingleScope};
use crate::controller::{Controller, ControllerStats};
use crate::error::{Error, Result};
use crate::memory::pool::PoolStats;
use crate::types::{Dim2, MemSpec, Rank};

/// One rank's view of the runtime. Every rank must issue the same sequence of
/// calls on its context.
pub struct Context {
    controller: Controller,
}

impl Context {
    /// Creates the context of this rank. The configuration of rank 0 is
    /// broadcast to every rank and overrides theirs.
    pub fn new<C>(channel: C, config: RuntimeConfig) -> Result<Self>
    where
        C: Channel + 'static,
    {
        let mut channel: Box<dyn Channel> = Box::new(channel);
        let config = broadcast_serializing(config, 0, channel.as_mut())?;
        debug!(rank = channel.rank(), config:serde; "Received configuration");
        Ok(Self {
            controller: Controller::new(channel, config)?,
        })
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.controller.rank()
    }

    #[inline]
    pub fn size(&self) -> Rank {
        self.controller.size()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.controller.config()
    }

    /// Registers a new tile of `dim` elements of `element_size` bytes. Its initial
    /// content reads as zeroes.
    pub fn tile(&mut self, element_size: usize, dim: Dim2) -> Tile {
        let spec = MemSpec::new(element_size, dim);
        Tile::new(self.controller.model_mut().create_history(spec), spec)
    }

    /// Registers a new scalar produced by a kernel and delivered to every rank.
    pub fn future(&mut self) -> ScalarFuture {
        let spec = MemSpec::new(std::mem::size_of::<f64>(), Dim2::new(1, 1));
        ScalarFuture::new(self.controller.model_mut().create_history(spec))
    }

    /// Schedules a kernel call. The kernel runs during the next flush on the
    /// ranks the active scope selects.
    ///
    /// # Panics
    /// Panics if the same tile or future is passed twice.
    pub fn submit<K>(&mut self, name: &str, kernel: K, args: &[Arg]) -> Result<()>
    where
        K: Fn(&mut Invocation<'_>) + Send + Sync + 'static,
    {
        self.controller.latch(name, Arc::new(kernel), args)
    }

    /// Executes everything submitted so far and synchronizes the group.
    pub fn flush(&mut self) -> Result<()> {
        self.controller.flush()
    }

    /// Whether nothing is waiting for the next flush.
    pub fn empty(&self) -> bool {
        self.controller.empty()
    }

    /// See [`Controller::compact`].
    pub fn compact(&mut self, n: usize) {
        self.controller.compact(n);
    }

    /// Adds `cost` to the score of `candidate` for the next decision. Fails if
    /// `candidate` is not a rank of the group.
    pub fn score(&mut self, candidate: Rank, cost: usize) -> Result<()> {
        self.controller.score(candidate, cost)
    }

    /// Restricts the next decision to the registered stakeholders.
    pub fn select(&mut self, candidate: Rank) -> Result<()> {
        self.controller.select(candidate)
    }

    /// Enters a scope for the lifetime of the returned guard. If a scope is
    /// already active, the guard is dry and the outer scope stays in charge.
    pub fn scope(&mut self, kind: ScopeKind) -> ScopeGuard<'_> {
        let active = self.controller.enter(kind);
        ScopeGuard {
            context: self,
            active,
        }
    }

    /// The bytes of the tile's latest revision, if this rank holds them.
    pub fn snapshot(&self, tile: &Tile) -> Result<Option<Vec<u8>>> {
        Ok(self.controller.model().back(tile.id())?.snapshot())
    }

    /// The value of a future, once it was delivered to this rank.
    pub fn value(&self, future: &ScalarFuture) -> Result<Option<f64>> {
        let back = self.controller.model().back(future.id())?;
        Ok(back
            .snapshot()
            .and_then(|bytes| bytes.try_into().ok())
            .map(f64::from_le_bytes))
    }

    /// Number of revisions a tile went through, the initial one included.
    pub fn revisions(&self, tile: &Tile) -> Result<usize> {
        Ok(self.controller.model().history(tile.id())?.len())
    }

    /// The logical clock.
    pub fn clock(&self) -> usize {
        self.controller.model().clock()
    }

    pub fn stats(&self) -> ControllerStats {
        self.controller.stats()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.controller.channel_stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.controller.pool_stats()
    }

    /// Terminates every rank of the group.
    pub fn abort(&self, error: &Error) -> ! {
        self.controller.abort(error)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        info!(rank = self.rank(), clock = self.clock(); "Closing context");
    }
}

/// An active scope. Dereferences to the context, so calls go through the guard
/// while it lives.
pub struct ScopeGuard<'a> {
    context: &'a mut Context,
    /// Whether this guard activated its scope. Dry guards leave the outer scope
    /// alone.
    active: bool,
}

impl ScopeGuard<'_> {
    #[inline]
    pub fn is_dry(&self) -> bool {
        !self.active
    }

    fn single(&mut self) -> Result<Option<&mut SingleScope>> {
        if !self.active {
            return Ok(None);
        }
        self.context.controller.single_mut().map(Some)
    }

    /// Moves a single scope to its next step.
    pub fn shift(&mut self) -> Result<()> {
        if let Some(scope) = self.single()? {
            scope.shift();
        }
        Ok(())
    }

    /// Moves a single scope to its previous step.
    pub fn shift_back(&mut self) -> Result<()> {
        match self.single()? {
            Some(scope) => scope.shift_back(),
            None => Ok(()),
        }
    }

    /// Advances the loop index of a single scope together with its step.
    pub fn advance(&mut self) -> Result<()> {
        if let Some(scope) = self.single()? {
            scope.advance();
        }
        Ok(())
    }

    pub fn step_back(&mut self) -> Result<()> {
        match self.single()? {
            Some(scope) => scope.step_back(),
            None => Ok(()),
        }
    }

    /// The loop index of a single scope. Dry guards report zero.
    pub fn index(&mut self) -> Result<i64> {
        Ok(self.single()?.map_or(0, |scope| scope.index()))
    }
}

impl Deref for ScopeGuard<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.context
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.context
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.context.controller.leave();
        }
    }
}
