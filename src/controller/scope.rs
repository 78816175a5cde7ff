//! Rank selection strategies. Every rank runs the same strategy on the same
//! sequence of calls, so every rank arrives at the same decision without
//! exchanging a message.

use std::fmt;

use log::trace;

use crate::error::{Error, Result};
use crate::types::{Locality, Rank, BROADCAST};

/// The kinds of scope an application can enter. The base scope is always present
/// underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Round-robin over the ranks, starting after `start` steps.
    Single { start: usize },
    /// Everything runs on the configured dedicated rank.
    Dedicated,
    /// Everything runs on every rank and produces replicated data.
    Shared,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeKind::Single { .. } => "single",
            ScopeKind::Dedicated => "dedicated",
            ScopeKind::Shared => "shared",
        };
        write!(f, "{name}")
    }
}

/// A rank selection strategy.
pub trait Scope: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Whether the strategy decides per call from accumulated scores.
    fn tunable(&self) -> bool {
        false
    }

    /// Adds `cost` to the running score of `candidate`.
    fn score(&mut self, _candidate: Rank, _cost: usize) {}

    /// Registers `candidate` as a stakeholder of the next toss.
    fn select(&mut self, _candidate: Rank) {}

    /// Decides the executing rank from the accumulated scores.
    fn toss(&mut self) -> Result<()> {
        Ok(())
    }

    /// The executing rank, [`BROADCAST`] if every rank executes.
    fn sector(&self) -> Rank;

    /// Where the work of this scope runs relative to the current rank.
    fn state(&self) -> Locality;

    fn as_single_mut(&mut self) -> Option<&mut SingleScope> {
        None
    }
}

#[inline]
fn state_of(sector: Rank, rank: Rank) -> Locality {
    if sector == rank {
        Locality::Local
    } else {
        Locality::Remote
    }
}

/// Score-based selection, the scope that is active when no other is.
#[derive(Debug, Clone)]
pub struct BaseScope {
    rank: Rank,
    sector: Rank,
    state: Locality,
    scores: Vec<usize>,
    stakeholders: Vec<Rank>,
    /// First scored candidate outside the group, reported by the next toss.
    invalid: Option<Rank>,
}

impl BaseScope {
    pub fn new(rank: Rank, size: Rank) -> Self {
        Self {
            rank,
            sector: 0,
            state: state_of(0, rank),
            scores: vec![0; size as usize],
            stakeholders: Vec::new(),
            invalid: None,
        }
    }

    /// The accumulated scores of the current toss cycle.
    pub fn scores(&self) -> &[usize] {
        &self.scores
    }

    /// The stakeholders registered since the last toss.
    pub fn stakeholders(&self) -> &[Rank] {
        &self.stakeholders
    }

    fn inconsistency(&self, candidate: Rank) -> Error {
        Error::SchedulingInconsistency {
            scope: "base",
            sector: candidate,
            size: self.scores.len() as Rank,
        }
    }

    fn check(&self, candidate: Rank) -> Result<usize> {
        usize::try_from(candidate)
            .ok()
            .filter(|&index| index < self.scores.len())
            .ok_or_else(|| self.inconsistency(candidate))
    }

    fn reset(&mut self) {
        self.scores.fill(0);
        self.stakeholders.clear();
        self.invalid = None;
    }
}

impl Scope for BaseScope {
    fn name(&self) -> &'static str {
        "base"
    }

    fn tunable(&self) -> bool {
        true
    }

    fn score(&mut self, candidate: Rank, cost: usize) {
        match self.check(candidate) {
            Ok(index) => self.scores[index] += cost,
            Err(_) => {
                self.invalid.get_or_insert(candidate);
            }
        }
    }

    fn select(&mut self, candidate: Rank) {
        self.stakeholders.push(candidate);
    }

    /// Picks the candidate with the highest score. Candidates are the stakeholders
    /// in registration order if any were selected, all ranks in ascending order
    /// otherwise. Ties go to the candidate scanned first.
    fn toss(&mut self) -> Result<()> {
        if let Some(candidate) = self.invalid {
            let error = self.inconsistency(candidate);
            self.reset();
            return Err(error);
        }
        let candidates = if self.stakeholders.is_empty() {
            (0..self.scores.len() as Rank).collect()
        } else {
            std::mem::take(&mut self.stakeholders)
        };

        let mut winner = None;
        for &candidate in &candidates {
            let score = self.scores[self.check(candidate)?];
            match winner {
                Some((_, max)) if score <= max => {}
                _ => winner = Some((candidate, score)),
            }
        }

        if let Some((sector, _)) = winner {
            self.sector = sector;
        }
        trace!(scores:? = self.scores, sector = self.sector; "Tossed");
        self.reset();
        self.state = state_of(self.sector, self.rank);
        Ok(())
    }

    fn sector(&self) -> Rank {
        self.sector
    }

    fn state(&self) -> Locality {
        self.state
    }
}

/// Deterministic round-robin over the ranks. With a compaction factor `F` the
/// sector stays on one rank for `F` consecutive steps.
#[derive(Debug, Clone)]
pub struct SingleScope {
    rank: Rank,
    round: i64,
    factor: i64,
    /// Step counter driving the rotation.
    iterator: i64,
    /// Loop index, for scopes driving a loop.
    index: i64,
    sector: Rank,
    state: Locality,
}

impl SingleScope {
    /// Creates the scope and takes its first step.
    pub fn new(start: usize, factor: usize, rank: Rank, size: Rank) -> Self {
        let mut scope = Self {
            rank,
            round: i64::from(size),
            factor: factor.max(1) as i64,
            iterator: start as i64,
            index: start as i64,
            sector: 0,
            state: Locality::Remote,
        };
        scope.shift();
        scope
    }

    /// Moves to the next step.
    pub fn shift(&mut self) {
        self.iterator = (self.iterator + 1) % (self.round * self.factor);
        self.update();
    }

    /// Moves to the previous step.
    pub fn shift_back(&mut self) -> Result<()> {
        self.iterator -= 1;
        if self.iterator < 0 {
            return Err(Error::NegativeSector {
                step: self.iterator,
            });
        }
        self.update();
        Ok(())
    }

    /// Moves to the next step and increments the loop index.
    pub fn advance(&mut self) {
        self.shift();
        self.index += 1;
    }

    /// Moves to the previous step and decrements the loop index.
    pub fn step_back(&mut self) -> Result<()> {
        self.shift_back()?;
        self.index -= 1;
        Ok(())
    }

    #[inline]
    pub fn index(&self) -> i64 {
        self.index
    }

    #[inline]
    pub fn factor(&self) -> usize {
        self.factor as usize
    }

    fn update(&mut self) {
        self.sector = (self.iterator / self.factor) as Rank;
        self.state = state_of(self.sector, self.rank);
    }
}

impl Scope for SingleScope {
    fn name(&self) -> &'static str {
        "single"
    }

    fn sector(&self) -> Rank {
        self.sector
    }

    fn state(&self) -> Locality {
        self.state
    }

    fn as_single_mut(&mut self) -> Option<&mut SingleScope> {
        Some(self)
    }
}

/// Pins everything to one rank.
#[derive(Debug, Clone)]
pub struct DedicatedScope {
    sector: Rank,
    state: Locality,
}

impl DedicatedScope {
    pub fn new(dedicated: Rank, rank: Rank) -> Self {
        Self {
            sector: dedicated,
            state: state_of(dedicated, rank),
        }
    }
}

impl Scope for DedicatedScope {
    fn name(&self) -> &'static str {
        "dedicated"
    }

    fn sector(&self) -> Rank {
        self.sector
    }

    fn state(&self) -> Locality {
        self.state
    }
}

/// Runs everything everywhere.
#[derive(Debug, Clone, Default)]
pub struct SharedScope;

impl Scope for SharedScope {
    fn name(&self) -> &'static str {
        "shared"
    }

    fn sector(&self) -> Rank {
        BROADCAST
    }

    fn state(&self) -> Locality {
        Locality::Common
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_toss_first_maximum_wins() {
        let mut scope = BaseScope::new(1, 3);
        scope.score(0, 5);
        scope.score(1, 9);
        scope.score(2, 9);
        scope.toss().unwrap();
        assert_eq!(scope.sector(), 1);
        assert_eq!(scope.state(), Locality::Local);
        assert_eq!(scope.scores(), &[0, 0, 0]);
    }

    #[test]
    fn test_toss_all_zero_picks_first() {
        let mut scope = BaseScope::new(2, 3);
        scope.toss().unwrap();
        assert_eq!(scope.sector(), 0);
        assert_eq!(scope.state(), Locality::Remote);
    }

    #[test]
    fn test_toss_restricted_to_stakeholders() {
        let mut scope = BaseScope::new(0, 4);
        scope.score(0, 100);
        scope.score(3, 2);
        scope.score(2, 2);
        scope.select(3);
        scope.select(2);
        scope.toss().unwrap();
        // equal scores: the stakeholder registered first wins
        assert_eq!(scope.sector(), 3);

        // stakeholders are cleared by the toss
        scope.score(1, 1);
        scope.toss().unwrap();
        assert_eq!(scope.sector(), 1);
    }

    #[test]
    fn test_toss_out_of_range_stakeholder() {
        let mut scope = BaseScope::new(0, 2);
        scope.select(2);
        assert!(matches!(
            scope.toss(),
            Err(Error::SchedulingInconsistency { sector: 2, size: 2, .. })
        ));
    }

    #[test]
    fn test_toss_out_of_range_score() {
        for candidate in [5, -1] {
            let mut scope = BaseScope::new(1, 2);
            scope.score(0, 3);
            scope.score(candidate, 100);
            scope.score(7, 1);
            // the first offending candidate is reported
            assert!(matches!(
                scope.toss(),
                Err(Error::SchedulingInconsistency { scope: "base", sector, size: 2 }) if sector == candidate
            ));
            assert_eq!(scope.scores(), &[0, 0]);

            // the next cycle starts clean
            scope.score(1, 1);
            scope.toss().unwrap();
            assert_eq!(scope.sector(), 1);
        }
    }

    #[test]
    fn test_toss_agrees_on_every_rank() {
        let mut rng = StdRng::seed_from_u64(42);
        let size = 5;
        let mut scopes = (0..size).map(|r| BaseScope::new(r, size)).collect::<Vec<_>>();
        for _ in 0..50 {
            let calls = (0..rng.gen_range(1..6))
                .map(|_| (rng.gen_range(0..size), rng.gen_range(0..1000)))
                .collect::<Vec<_>>();
            for scope in &mut scopes {
                for &(candidate, cost) in &calls {
                    scope.score(candidate, cost);
                }
                scope.toss().unwrap();
            }
            let sector = scopes[0].sector();
            assert!(scopes.iter().all(|s| s.sector() == sector));
            assert_eq!(
                scopes.iter().filter(|s| s.state() == Locality::Local).count(),
                1
            );
        }
    }

    #[test]
    fn test_single_shift_sequence() {
        for (round, factor) in [(1, 1), (3, 1), (4, 2), (2, 3)] {
            let mut scope = SingleScope::new(0, factor, 0, round);
            // construction takes the first step
            let mut step = 1usize;
            for _ in 0..20 {
                let expected = ((step / factor) % round as usize) as Rank;
                assert_eq!(scope.sector(), expected, "R = {round}, F = {factor}");
                scope.shift();
                step += 1;
            }
        }
    }

    #[test]
    fn test_single_shift_back_inverts() {
        let mut scope = SingleScope::new(0, 2, 1, 3);
        let mut sectors = vec![scope.sector()];
        for _ in 0..4 {
            scope.shift();
            sectors.push(scope.sector());
        }
        for expected in sectors.iter().rev().skip(1) {
            scope.shift_back().unwrap();
            assert_eq!(scope.sector(), *expected);
        }
    }

    #[test]
    fn test_single_below_zero() {
        // step 1 after construction; -1 / 4 would truncate to sector 0
        let mut scope = SingleScope::new(0, 4, 0, 2);
        scope.shift_back().unwrap();
        assert_eq!(scope.sector(), 0);
        assert!(matches!(
            scope.shift_back(),
            Err(Error::NegativeSector { step: -1 })
        ));
    }

    #[test]
    fn test_single_loop_index() {
        let mut scope = SingleScope::new(1, 1, 0, 4);
        assert_eq!(scope.index(), 1);
        assert_eq!(scope.sector(), 2);
        scope.advance();
        assert_eq!(scope.index(), 2);
        assert_eq!(scope.sector(), 3);
        scope.step_back().unwrap();
        assert_eq!(scope.index(), 1);
        assert_eq!(scope.sector(), 2);
    }

    #[test]
    fn test_dedicated_and_shared() {
        let dedicated = DedicatedScope::new(2, 2);
        assert_eq!(dedicated.sector(), 2);
        assert_eq!(dedicated.state(), Locality::Local);
        assert_eq!(DedicatedScope::new(2, 0).state(), Locality::Remote);

        assert_eq!(SharedScope.sector(), BROADCAST);
        assert_eq!(SharedScope.state(), Locality::Common);
        assert!(!SharedScope.tunable());
    }
}
