//! The scheduler of one rank. It asks the active scope who executes each call,
//! applies the consequences to the revision chains, spawns the transfers they
//! require and drains the resulting functors.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::channel::{Channel, ChannelStats};
use crate::config::RuntimeConfig;
use crate::controller::binding::{check_distinct, Arg, Kernel};
use crate::controller::functor::{Functor, FunctorId};
use crate::controller::scope::{
    BaseScope, DedicatedScope, Scope, ScopeKind, SharedScope, SingleScope,
};
use crate::error::{Error, Result};
use crate::memory::pool::{Pool, PoolStats, Squeeze};
use crate::model::revision::Revision;
use crate::model::Model;
use crate::types::{HistoryId, Locality, Rank, BROADCAST};

pub mod binding;
pub mod functor;
pub mod scope;

/// Scheduler statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Completed flushes.
    pub flushes: usize,
    /// Drain passes of the last flush.
    pub passes: usize,
    /// Functors invoked over all flushes, transfers included.
    pub invoked: usize,
    pub fetches: usize,
    pub pushes: usize,
}

pub struct Controller {
    rank: Rank,
    size: Rank,
    /// Single-rank groups never transfer.
    serial: bool,
    model: Model,
    channel: Box<dyn Channel>,
    pool: Pool,
    base: BaseScope,
    active: Option<Box<dyn Scope>>,
    compact_factor: usize,
    /// Pending functors of the current pass.
    chains: Vec<Arc<Functor>>,
    /// Functors carried over to the next pass.
    mirror: Vec<Arc<Functor>>,
    /// Superseded revisions whose payload could not be reclaimed yet.
    garbage: Vec<Arc<Revision>>,
    workers: ThreadPool,
    next_functor: FunctorId,
    config: RuntimeConfig,
    stats: ControllerStats,
}

impl Controller {
    /// Creates the scheduler on top of `channel`. The configuration must already
    /// be identical on every rank.
    pub fn new(channel: Box<dyn Channel>, config: RuntimeConfig) -> Result<Self> {
        let rank = channel.rank();
        let size = channel.size();
        config.validate(size)?;
        let workers = ThreadPoolBuilder::new()
            .num_threads(config.workers.unwrap_or(0))
            .thread_name(move |index| format!("rank{rank}-worker{index}"))
            .build()?;
        info!(rank, size, workers = workers.current_num_threads(); "Initialized controller");

        Ok(Self {
            rank,
            size,
            serial: size == 1,
            model: Model::new(rank),
            channel,
            pool: Pool::new(&config),
            base: BaseScope::new(rank, size),
            active: None,
            compact_factor: 1,
            chains: Vec::new(),
            mirror: Vec::new(),
            garbage: Vec::new(),
            workers,
            next_functor: 0,
            config,
            stats: ControllerStats::default(),
        })
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> Rank {
        self.size
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn model(&self) -> &Model {
        &self.model
    }

    #[inline]
    pub(crate) fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The scope deciding the current calls.
    pub fn scope(&self) -> &dyn Scope {
        match &self.active {
            Some(scope) => scope.as_ref(),
            None => &self.base,
        }
    }

    fn scope_mut(&mut self) -> &mut dyn Scope {
        match &mut self.active {
            Some(scope) => scope.as_mut(),
            None => &mut self.base,
        }
    }

    /// Activates a scope of the given kind. Scopes do not nest: if another scope
    /// is already active it stays active and `false` is returned.
    pub fn enter(&mut self, kind: ScopeKind) -> bool {
        // only single scopes consume a pending compaction, dry ones included
        let factor = match kind {
            ScopeKind::Single { .. } => std::mem::replace(&mut self.compact_factor, 1),
            ScopeKind::Dedicated | ScopeKind::Shared => 1,
        };
        if self.active.is_some() {
            debug!(rank = self.rank, kind:%; "Entered dry scope");
            return false;
        }
        let scope: Box<dyn Scope> = match kind {
            ScopeKind::Single { start } => {
                Box::new(SingleScope::new(start, factor, self.rank, self.size))
            }
            ScopeKind::Dedicated => {
                Box::new(DedicatedScope::new(self.config.dedicated_rank, self.rank))
            }
            ScopeKind::Shared => Box::new(SharedScope),
        };
        trace!(rank = self.rank, kind:%, sector = scope.sector(); "Entered scope");
        self.active = Some(scope);
        true
    }

    /// Falls back to the base scope.
    pub fn leave(&mut self) {
        self.active = None;
    }

    /// The active single scope.
    pub fn single_mut(&mut self) -> Result<&mut SingleScope> {
        self.active
            .as_mut()
            .and_then(|scope| scope.as_single_mut())
            .ok_or(Error::ScopeMismatch { expected: "single" })
    }

    /// Lets the next single scope stay on each rank for `n / size` steps. Has no
    /// effect unless `n` exceeds the group size.
    pub fn compact(&mut self, n: usize) {
        let size = self.size as usize;
        if n > size {
            self.compact_factor = n / size;
        }
    }

    /// Feeds an application-level cost estimate to the active scope. Ignored when
    /// the scope does not decide by score.
    pub fn score(&mut self, candidate: Rank, cost: usize) -> Result<()> {
        self.check_candidate(candidate)?;
        if self.tunable() {
            self.scope_mut().score(candidate, cost);
        }
        Ok(())
    }

    /// Registers an application-level stakeholder with the active scope.
    pub fn select(&mut self, candidate: Rank) -> Result<()> {
        self.check_candidate(candidate)?;
        if self.tunable() {
            self.scope_mut().select(candidate);
        }
        Ok(())
    }

    fn check_candidate(&self, candidate: Rank) -> Result<()> {
        if (0..self.size).contains(&candidate) {
            Ok(())
        } else {
            Err(Error::SchedulingInconsistency {
                scope: self.scope().name(),
                sector: candidate,
                size: self.size,
            })
        }
    }

    fn tunable(&self) -> bool {
        !self.serial && self.scope().tunable()
    }

    /// The rank executing the current call.
    #[inline]
    pub fn which(&self) -> Rank {
        self.scope().sector()
    }

    /// Every rank except this one.
    pub(crate) fn others(&self) -> Vec<Rank> {
        (0..self.size).filter(|&rank| rank != self.rank).collect()
    }

    fn candidate(&self, id: HistoryId) -> Result<Option<(Rank, usize)>> {
        let back = self.model.back(id)?;
        Ok(match back.owner() {
            None => None,
            Some(owner) => Some((owner, back.extent())),
        })
    }

    /// Scores the owner of the latest revision with its size.
    pub(crate) fn intend_read(&mut self, id: HistoryId) -> Result<()> {
        if let Some((candidate, extent)) = self.candidate(id)? {
            self.scope_mut().score(candidate, extent);
        }
        Ok(())
    }

    /// Makes the owner of the latest revision a stakeholder.
    pub(crate) fn intend_write(&mut self, id: HistoryId) -> Result<()> {
        if let Some((candidate, _)) = self.candidate(id)? {
            self.scope_mut().select(candidate);
        }
        Ok(())
    }

    fn validate_sector(&self) -> Result<()> {
        let scope = self.scope();
        let sector = scope.sector();
        let valid = match scope.state() {
            Locality::Common => sector == BROADCAST,
            Locality::Local | Locality::Remote => (0..self.size).contains(&sector),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::SchedulingInconsistency {
                scope: scope.name(),
                sector,
                size: self.size,
            })
        }
    }

    /// Schedules a kernel call. On ranks that do not execute it only the revision
    /// chains are updated.
    pub fn latch(&mut self, name: &str, kernel: Kernel, args: &[Arg]) -> Result<()> {
        check_distinct(name, args);
        if self.tunable() {
            for arg in args {
                arg.score(self)?;
            }
            self.scope_mut().toss()?;
        }
        self.validate_sector()?;

        let state = self.scope().state();
        trace!(rank = self.rank, name, state:?, sector = self.which(); "Latching");
        if state == Locality::Remote {
            for arg in args {
                arg.modify_remote(self)?;
            }
            return Ok(());
        }

        let functor = Arc::new(Functor::kernel(self.next_id(), name, kernel));
        let mut bindings = Vec::with_capacity(args.len());
        for arg in args {
            bindings.push(match state {
                Locality::Local => arg.modify_local(self, &functor)?,
                _ => arg.modify(self, &functor)?,
            });
        }
        functor.bind(bindings);
        self.pin_or_queue(functor);
        Ok(())
    }

    fn next_id(&mut self) -> FunctorId {
        let id = self.next_functor;
        self.next_functor += 1;
        id
    }

    /// Appends a functor to the pending list.
    pub fn queue(&mut self, functor: Arc<Functor>) {
        self.chains.push(functor);
    }

    fn pin_or_queue(&mut self, functor: Arc<Functor>) {
        match functor.pending_generator() {
            Some(generator) => {
                trace!(id = functor.id(), generator = generator.id(); "Pinned");
                generator.queue(functor);
            }
            None => self.queue(functor),
        }
    }

    /// Synchronizes a revision that every rank is about to use: its owner sends it
    /// to everybody else.
    pub(crate) fn sync(&mut self, revision: &Arc<Revision>) -> Result<()> {
        if self.serial || self.model.common(revision) {
            return Ok(());
        }
        if self.model.feeds(revision) {
            let others = self.others();
            self.push(revision, others)
        } else {
            self.fetch_from_owner(revision)
        }
    }

    /// Synchronizes a revision this rank is about to use.
    pub(crate) fn lsync(&mut self, revision: &Arc<Revision>) -> Result<()> {
        if self.serial || self.model.common(revision) || self.model.feeds(revision) {
            return Ok(());
        }
        self.fetch_from_owner(revision)
    }

    /// Synchronizes a revision the executing rank is about to use, from the point
    /// of view of a rank that does not execute.
    pub(crate) fn rsync(&mut self, revision: &Arc<Revision>) -> Result<()> {
        if self.serial || self.model.common(revision) {
            return Ok(());
        }
        let which = self.which();
        if self.model.feeds(revision) && revision.owner() != Some(which) {
            self.push(revision, vec![which])?;
        }
        Ok(())
    }

    fn fetch_from_owner(&mut self, revision: &Arc<Revision>) -> Result<()> {
        match revision.owner() {
            Some(owner) => self.fetch(revision, owner),
            None => Ok(()),
        }
    }

    /// Spawns the fetch of a revision from `source`, unless one was already
    /// spawned. The fetch becomes the revision's generator on this rank.
    pub(crate) fn fetch(&mut self, revision: &Arc<Revision>, source: Rank) -> Result<()> {
        if !revision.begin_fetch() {
            return Ok(());
        }
        let completion = self.channel.pull(source, revision.key(), revision.extent())?;
        let fetch = Arc::new(Functor::fetch(
            self.next_id(),
            revision.clone(),
            source,
            completion,
        ));
        debug!(rank = self.rank, key:% = revision.key(), source; "Spawned fetch");
        revision.set_generator(fetch.clone());
        revision.retain();
        self.stats.fetches += 1;
        self.queue(fetch);
        Ok(())
    }

    /// Spawns the push of a revision to those of `destinations` it was not yet
    /// sent to. The push waits for the revision's generator.
    pub(crate) fn push(&mut self, revision: &Arc<Revision>, destinations: Vec<Rank>) -> Result<()> {
        let destinations = revision.ship_to(destinations);
        if destinations.is_empty() {
            return Ok(());
        }
        debug!(rank = self.rank, key:% = revision.key(), destinations:?; "Spawned push");
        let push = Arc::new(Functor::push(self.next_id(), revision.clone(), destinations));
        revision.retain();
        self.stats.pushes += 1;
        match revision.generator() {
            Some(generator) => generator.queue(push),
            None => self.queue(push),
        }
        Ok(())
    }

    /// Marks a revision as superseded and reclaims its payload, now or after the
    /// next flush.
    pub(crate) fn destroy(&mut self, revision: &Arc<Revision>) {
        revision.supersede();
        if !self.config.squeeze {
            return;
        }
        if self.pool.squeeze(revision) == Squeeze::Retained {
            self.garbage.push(revision.clone());
        }
    }

    fn sweep(&mut self) {
        let pool = &self.pool;
        self.garbage
            .retain(|revision| pool.squeeze(revision) == Squeeze::Retained);
        if !self.garbage.is_empty() {
            warn!(rank = self.rank, retained = self.garbage.len(); "Superseded revisions could not be squeezed");
        }
    }

    fn check_stall(&self, since: Instant) -> Result<()> {
        let waited = since.elapsed();
        if waited < self.config.stall_timeout {
            return Ok(());
        }
        let in_flight = self.chains.iter().filter(|f| !f.is_kernel()).count()
            + self.channel.outstanding();
        error!(
            rank = self.rank,
            pending = self.chains.len(),
            in_flight,
            pulls = self.channel.pending_pulls();
            "No progress in drain loop"
        );
        Err(Error::Deadlock {
            pending: self.chains.len(),
            in_flight,
            waited,
        })
    }

    /// Executes every queued functor, then advances the clock and synchronizes the
    /// group.
    ///
    /// Every pass evaluates readiness in queue order, runs the ready kernels in
    /// parallel and the ready transfers in order, and moves the functors pinned on
    /// them into the next pass.
    pub fn flush(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut last_progress = started;
        let mut passes = 0;
        debug!(rank = self.rank, queued = self.chains.len(); "Flushing");

        while !self.chains.is_empty() {
            self.channel.progress()?;
            let ready = self
                .chains
                .iter()
                .map(|functor| functor.ready())
                .collect::<Vec<_>>();
            if !ready.contains(&true) {
                self.check_stall(last_progress)?;
                std::thread::yield_now();
                continue;
            }
            last_progress = Instant::now();

            let kernels = self
                .chains
                .iter()
                .zip(&ready)
                .filter(|(functor, ready)| **ready && functor.is_kernel())
                .map(|(functor, _)| Arc::clone(functor))
                .collect::<Vec<_>>();
            for kernel in &kernels {
                kernel.prepare(&self.pool)?;
            }
            self.workers
                .install(|| kernels.par_iter().for_each(|kernel| kernel.run()));

            for (functor, _) in self
                .chains
                .iter()
                .zip(&ready)
                .filter(|(functor, ready)| **ready && !functor.is_kernel())
            {
                functor.transfer(self.channel.as_mut())?;
            }

            let mut invoked = 0;
            for (functor, ready) in self.chains.drain(..).zip(ready) {
                if ready {
                    invoked += 1;
                    self.mirror.extend(functor.retire());
                } else {
                    self.mirror.push(functor);
                }
            }
            std::mem::swap(&mut self.chains, &mut self.mirror);
            passes += 1;
            self.stats.invoked += invoked;
            trace!(rank = self.rank, pass = passes, invoked, carried = self.chains.len(); "Finished pass");
        }

        while self.channel.outstanding() > 0 {
            if self.channel.progress()? > 0 {
                last_progress = Instant::now();
            } else {
                self.check_stall(last_progress)?;
                std::thread::yield_now();
            }
        }

        self.model.advance_clock();
        self.sweep();
        self.channel.barrier();

        self.stats.flushes += 1;
        self.stats.passes = passes;
        info!(
            rank = self.rank,
            clock = self.model.clock(),
            passes,
            elapsed:? = started.elapsed();
            "Flushed"
        );
        Ok(())
    }

    /// Whether no functor is queued.
    pub fn empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Number of queued functors, not counting pinned ones.
    pub fn queued(&self) -> usize {
        self.chains.len()
    }

    /// Terminates the whole group with a diagnostic.
    pub fn abort(&self, error: &Error) -> ! {
        error!(rank = self.rank, code = error.code(), error:%; "Fatal error");
        self.channel.abort(error.code())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !self.chains.is_empty() {
            error!(rank = self.rank, pending = self.chains.len(); "Exiting with functors still in queue");
        }
    }
}
