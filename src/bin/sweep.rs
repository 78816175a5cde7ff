use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{error, info};

use ambient::channel::local::run_local_group;
use ambient::channel::Channel;
use ambient::logging::setup_logging_local;
use ambient::{Arg, Context, Dim2, Rank, Result, RuntimeConfig, ScopeKind, Tile};

/// How the per-tile kernels are spread over the ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Distribution {
    /// Each call goes to the rank holding most of its data.
    Base,
    /// Tiles are dealt out round-robin.
    Single,
    /// Everything runs on the dedicated rank.
    Dedicated,
}

/// Relaxes a ring of tiles and reports a checksum after every step.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Ranks of the thread-backed group
    #[arg(short, long, default_value_t = 4)]
    ranks: Rank,

    #[arg(short, long, default_value_t = 8)]
    tiles: usize,

    /// Elements per tile
    #[arg(short, long, default_value_t = 1024)]
    elements: usize,

    #[arg(short, long, default_value_t = 10)]
    steps: usize,

    #[arg(short, long, value_enum, default_value_t = Distribution::Single)]
    distribution: Distribution,

    /// Seconds without progress before a flush gives up
    #[arg(long, default_value_t = 60)]
    stall_timeout: u64,

    /// Run one rank per MPI process instead of a thread-backed group
    #[cfg(feature = "mpi")]
    #[arg(long)]
    mpi: bool,
}

/// Calls `f` for every tile inside a scope of the chosen distribution.
fn for_each_tile<F>(context: &mut Context, distribution: Distribution, tiles: &[Tile], mut f: F) -> Result<()>
where
    F: FnMut(&mut Context, usize, Tile) -> Result<()>,
{
    match distribution {
        Distribution::Base => {
            for (i, tile) in tiles.iter().enumerate() {
                f(context, i, *tile)?;
            }
        }
        Distribution::Single => {
            context.compact(tiles.len());
            let mut guard = context.scope(ScopeKind::Single { start: 0 });
            for (i, tile) in tiles.iter().enumerate() {
                f(&mut *guard, i, *tile)?;
                guard.shift()?;
            }
        }
        Distribution::Dedicated => {
            let mut guard = context.scope(ScopeKind::Dedicated);
            for (i, tile) in tiles.iter().enumerate() {
                f(&mut *guard, i, *tile)?;
            }
        }
    }
    Ok(())
}

fn sweep(context: &mut Context, args: &Args) -> Result<Vec<f64>> {
    let dim = Dim2::new(args.elements, 1);
    let tiles = (0..args.tiles)
        .map(|_| context.tile(std::mem::size_of::<f64>(), dim))
        .collect::<Vec<_>>();
    let checksum = context.future();

    for_each_tile(context, args.distribution, &tiles, |context, i, tile| {
        context.submit(
            "init",
            move |inv| {
                let values = (0..inv.values(0).len())
                    .map(|j| i as f64 + j as f64 * 1e-3)
                    .collect::<Vec<_>>();
                inv.set_values(0, &values);
            },
            &[Arg::Write(tile)],
        )
    })?;
    context.flush()?;

    let mut sums = Vec::with_capacity(args.steps);
    for step in 0..args.steps {
        let started = Instant::now();
        for_each_tile(context, args.distribution, &tiles, |context, i, tile| {
            let neighbor = tiles[(i + 1) % tiles.len()];
            if neighbor == tile {
                return Ok(());
            }
            context.submit(
                "relax",
                |inv| {
                    let neighbor = inv.values(1);
                    let relaxed = inv
                        .values(0)
                        .iter()
                        .zip(&neighbor)
                        .map(|(own, next)| 0.5 * (own + next))
                        .collect::<Vec<_>>();
                    inv.set_values(0, &relaxed);
                },
                &[Arg::ReadWrite(tile), Arg::Read(neighbor)],
            )
        })?;

        {
            let mut guard = context.scope(ScopeKind::Dedicated);
            let args = std::iter::once(Arg::Future(checksum))
                .chain(tiles.iter().map(|tile| Arg::Read(*tile)))
                .collect::<Vec<_>>();
            guard.submit(
                "checksum",
                |inv| {
                    let sum = (1..inv.len()).flat_map(|i| inv.values(i)).sum();
                    inv.set_future(0, sum);
                },
                &args,
            )?;
        }
        context.flush()?;

        let sum = context.value(&checksum)?.unwrap_or(f64::NAN);
        info!(rank = context.rank(), step, sum, elapsed:? = started.elapsed(); "Finished step");
        sums.push(sum);
    }
    Ok(sums)
}

/// Runs the sweep on one rank. Errors tear down the whole group.
fn run<C>(channel: C, args: &Args) -> Vec<f64>
where
    C: Channel + 'static,
{
    let rank = channel.rank();
    let config = RuntimeConfig::default()
        .with_stall_timeout(Duration::from_secs(args.stall_timeout));
    let mut context = match Context::new(channel, config) {
        Ok(context) => context,
        Err(error) => {
            error!(rank, error:%; "Failed to create context");
            std::process::exit(error.code());
        }
    };
    match sweep(&mut context, args) {
        Ok(sums) => sums,
        Err(error) => context.abort(&error),
    }
}

fn report(sums: &[f64]) {
    for (step, sum) in sums.iter().enumerate() {
        println!("step {step}: checksum {sum:.6}");
    }
}

#[cfg(feature = "mpi")]
fn run_mpi(args: &Args) {
    use ambient::channel::mpi::MpiChannel;
    use ambient::logging::setup_logging;

    let Some(channel) = MpiChannel::initialize() else {
        eprintln!("MPI was already initialized");
        std::process::exit(1);
    };
    let rank = channel.rank();
    let _logger = setup_logging(rank).ok();
    let sums = run(channel, args);
    if rank == 0 {
        report(&sums);
    }
}

fn main() {
    let args = Args::parse();

    #[cfg(feature = "mpi")]
    {
        if args.mpi {
            run_mpi(&args);
            return;
        }
    }

    let _logger = setup_logging_local().ok();
    let mut results = run_local_group(args.ranks, |channel| run(channel, &args));
    report(&results.swap_remove(0));
}
