use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ambient::channel::local::{run_local_group, LocalChannel};
use ambient::{Arg, Context, Dim2, Error, RuntimeConfig, ScopeKind};

fn context(channel: LocalChannel, config: RuntimeConfig) -> Context {
    Context::new(channel, config.with_workers(2)).unwrap()
}

fn as_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn test_dedicated_read_fetches_once() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let results = run_local_group(2, |channel| {
        let mut context = context(channel, RuntimeConfig::default().with_dedicated_rank(1));
        let x = context.tile(8, Dim2::new(4, 1));

        // nothing is owned yet, so the base scope picks rank 0
        context
            .submit("fill", |inv| inv.set_values(0, &[1.0, 2.0, 3.0, 4.0]), &[Arg::Write(x)])
            .unwrap();
        context.flush().unwrap();
        {
            let mut scope = context.scope(ScopeKind::Dedicated);
            for _ in 0..2 {
                let invoked = Arc::clone(&invoked);
                scope
                    .submit(
                        "check",
                        move |inv| {
                            assert_eq!(inv.values(0), [1.0, 2.0, 3.0, 4.0]);
                            invoked.fetch_add(1, Ordering::Relaxed);
                        },
                        &[Arg::Read(x)],
                    )
                    .unwrap();
            }
        }
        context.flush().unwrap();
        (context.rank(), context.channel_stats(), context.snapshot(&x).unwrap())
    });

    assert_eq!(invoked.load(Ordering::Relaxed), 2);
    let expected = as_bytes(&[1.0, 2.0, 3.0, 4.0]);
    for (rank, stats, snapshot) in results {
        match rank {
            0 => assert_eq!((stats.pushes, stats.pulls), (1, 0)),
            _ => assert_eq!((stats.pushes, stats.pulls), (0, 1)),
        }
        assert_eq!(snapshot.as_deref(), Some(&expected[..]));
    }
}

#[test]
fn test_future_reaches_every_rank() {
    let values = run_local_group(3, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let x = context.tile(8, Dim2::new(2, 2));
        let total = context.future();
        let mut scope = context.scope(ScopeKind::Dedicated);
        scope
            .submit("fill", |inv| inv.set_values(0, &[0.25; 4]), &[Arg::Write(x)])
            .unwrap();
        scope
            .submit(
                "sum",
                |inv| {
                    let sum = inv.values(0).iter().sum();
                    inv.set_future(1, sum);
                },
                &[Arg::Read(x), Arg::Future(total)],
            )
            .unwrap();
        drop(scope);
        context.flush().unwrap();
        context.value(&total).unwrap()
    });
    assert_eq!(values, vec![Some(1.0); 3]);
}

#[test]
fn test_single_scope_deals_round_robin() {
    let owners = run_local_group(4, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let rank = context.rank();
        let tiles = (0..8)
            .map(|_| context.tile(8, Dim2::new(1, 1)))
            .collect::<Vec<_>>();
        {
            let mut scope = context.scope(ScopeKind::Single { start: 0 });
            for tile in &tiles {
                scope
                    .submit(
                        "stamp",
                        move |inv| inv.set_values(0, &[rank as f64]),
                        &[Arg::Write(*tile)],
                    )
                    .unwrap();
                scope.shift().unwrap();
            }
        }
        context.flush().unwrap();
        tiles
            .iter()
            .map(|tile| context.snapshot(tile).unwrap())
            .collect::<Vec<_>>()
    });

    for (rank, snapshots) in owners.iter().enumerate() {
        for (i, snapshot) in snapshots.iter().enumerate() {
            // the scope takes one step on entry
            if (i + 1) % 4 == rank {
                assert_eq!(snapshot.as_deref(), Some(&as_bytes(&[rank as f64])[..]));
            } else {
                assert_eq!(snapshot, &None);
            }
        }
    }
}

#[test]
fn test_compacted_single_scope() {
    let owners = run_local_group(2, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let tiles = (0..4)
            .map(|_| context.tile(8, Dim2::new(1, 1)))
            .collect::<Vec<_>>();
        context.compact(4);
        {
            let mut scope = context.scope(ScopeKind::Single { start: 0 });
            for tile in &tiles {
                scope
                    .submit("touch", |inv| inv.set_values(0, &[1.0]), &[Arg::Write(*tile)])
                    .unwrap();
                scope.shift().unwrap();
            }
        }
        context.flush().unwrap();
        tiles
            .iter()
            .map(|tile| context.snapshot(tile).unwrap().is_some())
            .collect::<Vec<_>>()
    });
    assert_eq!(owners[0], vec![true, false, false, true]);
    assert_eq!(owners[1], vec![false, true, true, false]);
}

#[test]
fn test_compaction_waits_for_single_scope() {
    let owners = run_local_group(2, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let tiles = (0..4)
            .map(|_| context.tile(8, Dim2::new(1, 1)))
            .collect::<Vec<_>>();
        context.compact(4);
        drop(context.scope(ScopeKind::Dedicated));
        {
            let mut scope = context.scope(ScopeKind::Single { start: 0 });
            for tile in &tiles {
                scope
                    .submit("touch", |inv| inv.set_values(0, &[1.0]), &[Arg::Write(*tile)])
                    .unwrap();
                scope.shift().unwrap();
            }
        }
        context.flush().unwrap();
        tiles
            .iter()
            .map(|tile| context.snapshot(tile).unwrap().is_some())
            .collect::<Vec<_>>()
    });
    assert_eq!(owners[0], vec![true, false, false, true]);
    assert_eq!(owners[1], vec![false, true, true, false]);
}

#[test]
fn test_score_steers_base_scope() {
    let results = run_local_group(2, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let x = context.tile(8, Dim2::new(1, 1));
        context.score(1, 10).unwrap();
        context
            .submit("fill", |inv| inv.set_values(0, &[2.0]), &[Arg::Write(x)])
            .unwrap();
        context.flush().unwrap();
        let rejected = matches!(
            context.score(2, 1),
            Err(Error::SchedulingInconsistency { sector: 2, size: 2, .. })
        );
        (context.snapshot(&x).unwrap().is_some(), rejected)
    });
    assert_eq!(results, vec![(false, true), (true, true)]);
}

#[test]
fn test_shared_scope_broadcasts_owned_revision() {
    let results = run_local_group(3, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let x = context.tile(8, Dim2::new(2, 1));
        {
            let mut scope = context.scope(ScopeKind::Dedicated);
            scope
                .submit("fill", |inv| inv.set_values(0, &[1.0, 2.0]), &[Arg::Write(x)])
                .unwrap();
        }
        {
            let mut scope = context.scope(ScopeKind::Shared);
            scope
                .submit("read", |inv| assert_eq!(inv.values(0), [1.0, 2.0]), &[Arg::Read(x)])
                .unwrap();
        }
        context.flush().unwrap();
        (context.rank(), context.channel_stats(), context.snapshot(&x).unwrap())
    });

    let expected = as_bytes(&[1.0, 2.0]);
    for (rank, stats, snapshot) in results {
        match rank {
            // the owner pushes to both other ranks
            0 => assert_eq!((stats.pushes, stats.pulls), (2, 0)),
            _ => assert_eq!((stats.pushes, stats.pulls), (0, 1)),
        }
        assert_eq!(snapshot.as_deref(), Some(&expected[..]));
    }
}

#[test]
fn test_remote_update_returns_to_owner() {
    let seen = Arc::new(AtomicUsize::new(0));
    let results = run_local_group(3, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let x = context.tile(8, Dim2::new(2, 1));
        {
            let mut scope = context.scope(ScopeKind::Dedicated);
            scope
                .submit("fill", |inv| inv.set_values(0, &[1.0, 2.0]), &[Arg::Write(x)])
                .unwrap();
        }
        context.flush().unwrap();
        {
            // one shift past the entry step lands on rank 2
            let mut scope = context.scope(ScopeKind::Single { start: 0 });
            scope.shift().unwrap();
            scope
                .submit(
                    "add",
                    |inv| {
                        let next = inv.values(0).iter().map(|v| v + 10.0).collect::<Vec<_>>();
                        inv.set_values(0, &next);
                    },
                    &[Arg::ReadWrite(x)],
                )
                .unwrap();
        }
        {
            let seen = Arc::clone(&seen);
            let mut scope = context.scope(ScopeKind::Dedicated);
            scope
                .submit(
                    "check",
                    move |inv| {
                        assert_eq!(inv.values(0), [11.0, 12.0]);
                        seen.fetch_add(1, Ordering::Relaxed);
                    },
                    &[Arg::Read(x)],
                )
                .unwrap();
        }
        context.flush().unwrap();
        (
            context.channel_stats(),
            context.snapshot(&x).unwrap().is_some(),
            context.revisions(&x).unwrap(),
        )
    });

    assert_eq!(seen.load(Ordering::Relaxed), 1);
    let transfers = results
        .iter()
        .map(|(stats, _, _)| (stats.pushes, stats.pulls))
        .collect::<Vec<_>>();
    assert_eq!(transfers, vec![(1, 1), (0, 0), (1, 1)]);
    // rank 1 never held the updated revision
    let held = results.iter().map(|(_, held, _)| *held).collect::<Vec<_>>();
    assert_eq!(held, vec![true, false, true]);
    assert!(results.iter().all(|(_, _, revisions)| *revisions == 3));
}

#[test]
fn test_shared_scope_replicates_without_transfers() {
    let results = run_local_group(3, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let x = context.tile(8, Dim2::new(2, 1));
        {
            let mut scope = context.scope(ScopeKind::Shared);
            scope
                .submit("fill", |inv| inv.set_values(0, &[7.0, 8.0]), &[Arg::Write(x)])
                .unwrap();
        }
        // replicated data does not steer the base scope
        context
            .submit("read", |inv| assert_eq!(inv.values(0), [7.0, 8.0]), &[Arg::Read(x)])
            .unwrap();
        context.flush().unwrap();
        (context.channel_stats(), context.snapshot(&x).unwrap())
    });
    for (stats, snapshot) in results {
        assert_eq!((stats.pushes, stats.pulls), (0, 0));
        assert_eq!(snapshot, Some(as_bytes(&[7.0, 8.0])));
    }
}

#[test]
fn test_superseded_revisions_are_squeezed() {
    const ROUNDS: usize = 3;
    let reclaimed = run_local_group(2, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        let x = context.tile(8, Dim2::new(16, 1));
        for round in 0..ROUNDS {
            {
                let mut scope = context.scope(ScopeKind::Dedicated);
                scope
                    .submit(
                        "overwrite",
                        move |inv| inv.set_values(0, &[round as f64; 16]),
                        &[Arg::Write(x)],
                    )
                    .unwrap();
            }
            {
                // the first step of a single scope lands on rank 1
                let mut scope = context.scope(ScopeKind::Single { start: 0 });
                scope
                    .submit(
                        "check",
                        move |inv| assert_eq!(inv.values(0), [round as f64; 16]),
                        &[Arg::Read(x)],
                    )
                    .unwrap();
            }
            context.flush().unwrap();
        }
        assert_eq!(context.revisions(&x).unwrap(), ROUNDS + 1);
        context.pool_stats().reclaimed
    });
    assert_eq!(reclaimed, vec![ROUNDS - 1; 2]);
}

#[test]
fn test_unmatched_fetch_reports_deadlock() {
    let results = run_local_group(2, |channel| {
        let config = RuntimeConfig::default().with_stall_timeout(Duration::from_millis(200));
        let mut context = context(channel, config);
        if context.rank() == 0 {
            // rank 0 leaves the program early and never sends
            return None;
        }
        let x = context.tile(8, Dim2::new(1, 1));
        {
            let mut scope = context.scope(ScopeKind::Dedicated);
            scope
                .submit("fill", |inv| inv.set_values(0, &[1.0]), &[Arg::Write(x)])
                .unwrap();
        }
        {
            let mut scope = context.scope(ScopeKind::Single { start: 0 });
            scope
                .submit("read", |inv| assert_eq!(inv.values(0), [1.0]), &[Arg::Read(x)])
                .unwrap();
        }
        Some(context.flush())
    });

    assert!(results[0].is_none());
    match &results[1] {
        Some(Err(Error::Deadlock {
            pending, in_flight, ..
        })) => {
            assert_eq!(*pending, 1);
            assert_eq!(*in_flight, 1);
        }
        other => panic!("expected a deadlock, got {other:?}"),
    }
}

#[test]
fn test_clock_agrees_across_ranks() {
    let clocks = run_local_group(3, |channel| {
        let mut context = context(channel, RuntimeConfig::default());
        for _ in 0..3 {
            context.flush().unwrap();
        }
        context.clock()
    });
    assert_eq!(clocks, vec![3; 3]);
}

#[test]
#[should_panic(expected = "aborted the process group with code 4")]
fn test_abort_takes_down_the_group() {
    run_local_group(2, |channel| {
        let context = context(channel, RuntimeConfig::default());
        if context.rank() == 1 {
            let error = Error::Deadlock {
                pending: 0,
                in_flight: 0,
                waited: Duration::ZERO,
            };
            context.abort(&error);
        }
        // rank 0 blocks in the barrier until the abort releases it
        let mut context = context;
        context.flush().unwrap();
    });
}

#[cfg(feature = "mpi")]
mod mpi {
    use ambient::channel::mpi::MpiChannel;
    use ambient::channel::Channel;
    use ambient::mpi_test;
    use ambient::{Arg, Context, Dim2, RuntimeConfig, ScopeKind};

    mpi_test!(2, fn test_future_over_mpi() {
        let channel = MpiChannel::initialize().unwrap();
        let rank = channel.rank();
        let mut context = Context::new(channel, RuntimeConfig::default()).unwrap();
        let x = context.tile(8, Dim2::new(4, 1));
        let total = context.future();
        {
            let mut scope = context.scope(ScopeKind::Single { start: 0 });
            scope
                .submit("fill", |inv| inv.set_values(0, &[0.5; 4]), &[Arg::Write(x)])
                .unwrap();
        }
        {
            let mut scope = context.scope(ScopeKind::Dedicated);
            scope
                .submit(
                    "sum",
                    |inv| {
                        let sum = inv.values(0).iter().sum();
                        inv.set_future(1, sum);
                    },
                    &[Arg::Read(x), Arg::Future(total)],
                )
                .unwrap();
        }
        context.flush().unwrap();
        assert_eq!(context.value(&total).unwrap(), Some(2.0), "rank {rank}");
    });

    mpi_test!(3, fn test_shared_read_over_mpi() {
        let channel = MpiChannel::initialize().unwrap();
        let mut context = Context::new(channel, RuntimeConfig::default()).unwrap();
        let x = context.tile(8, Dim2::new(1024, 1));
        for round in 0..4 {
            {
                let mut scope = context.scope(ScopeKind::Dedicated);
                scope
                    .submit("fill", move |inv| inv.set_values(0, &[round as f64; 1024]), &[Arg::Write(x)])
                    .unwrap();
            }
            {
                let mut scope = context.scope(ScopeKind::Shared);
                scope
                    .submit(
                        "read",
                        move |inv| assert!(inv.values(0).iter().all(|v| *v == round as f64)),
                        &[Arg::Read(x)],
                    )
                    .unwrap();
            }
            context.flush().unwrap();
        }
        let stats = context.channel_stats();
        if context.rank() == 0 {
            assert_eq!((stats.pushes, stats.pulls), (8, 0));
        } else {
            assert_eq!((stats.pushes, stats.pulls), (0, 4));
        }
    });
}
