//! Thread-backed process group. Every rank is a thread of the same process and
//! owns one inbox; the wire format is the same as on a real network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::channel::mailbox::Mailbox;
use crate::channel::serialization::{decode_frame, encode_frame};
use crate::channel::{Channel, ChannelStats, Completion};
use crate::error::{Error, Result};
use crate::types::{Rank, TransferKey};

/// Interval at which blocked collectives check whether the group was aborted.
const POLL: Duration = Duration::from_millis(10);

/// Panic payload of ranks that were torn down because another rank aborted.
#[derive(Debug, Clone, Copy)]
pub struct GroupAborted;

#[derive(Debug)]
struct Envelope {
    source: Rank,
    frame: Vec<u8>,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// State shared by all ranks of a group.
#[derive(Debug)]
struct Group {
    size: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    aborted: AtomicBool,
}

impl Group {
    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        let _state = self.barrier.lock();
        self.released.notify_all();
    }

    fn check(&self) {
        if self.aborted.load(Ordering::Acquire) {
            std::panic::panic_any(GroupAborted);
        }
    }

    fn wait(&self) {
        let mut state = self.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return;
        }
        while state.generation == generation {
            self.check();
            self.released.wait_for(&mut state, POLL);
        }
    }
}

/// One rank of a thread-backed group.
#[derive(Debug)]
pub struct LocalChannel {
    rank: Rank,
    size: Rank,
    /// Inboxes of all ranks, indexed by destination.
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    /// Broadcast lanes to all ranks, indexed by destination.
    collective_out: Vec<Sender<Vec<u8>>>,
    /// Broadcast lanes from all ranks, indexed by root.
    collective_in: Vec<Receiver<Vec<u8>>>,
    group: Arc<Group>,
    mailbox: Mailbox,
    stats: ChannelStats,
}

impl LocalChannel {
    /// Creates the channels of a group of `size` ranks, ordered by rank.
    pub fn group(size: Rank) -> Vec<LocalChannel> {
        assert!(size > 0, "a process group needs at least one rank");
        let ranks = size as usize;
        let group = Arc::new(Group {
            size: ranks,
            barrier: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            aborted: AtomicBool::new(false),
        });

        let (peers, inboxes): (Vec<_>, Vec<_>) = (0..ranks).map(|_| unbounded()).unzip();

        // lanes[root][destination]
        let mut lanes = (0..ranks)
            .map(|_| (0..ranks).map(|_| unbounded()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let mut collective_in = vec![Vec::with_capacity(ranks); ranks];
        let mut collective_out = Vec::with_capacity(ranks);
        for lanes_of_root in lanes.iter_mut() {
            let mut senders = Vec::with_capacity(ranks);
            for (destination, (sender, receiver)) in lanes_of_root.drain(..).enumerate() {
                senders.push(sender);
                collective_in[destination].push(receiver);
            }
            collective_out.push(senders);
        }

        inboxes
            .into_iter()
            .zip(collective_out)
            .zip(collective_in)
            .enumerate()
            .map(|(rank, ((inbox, collective_out), collective_in))| LocalChannel {
                rank: rank as Rank,
                size,
                peers: peers.clone(),
                inbox,
                collective_out,
                collective_in,
                group: Arc::clone(&group),
                mailbox: Mailbox::default(),
                stats: ChannelStats::default(),
            })
            .collect()
    }
}

impl Channel for LocalChannel {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> Rank {
        self.size
    }

    fn push(&mut self, destination: Rank, key: TransferKey, payload: &[u8]) -> Result<Completion> {
        let frame = encode_frame(key, payload)?;
        trace!(rank = self.rank, destination, key:%, bytes = payload.len(); "Sending frame");
        self.peers[destination as usize]
            .send(Envelope {
                source: self.rank,
                frame,
            })
            .map_err(|_| Error::Disconnected(destination))?;
        self.stats.pushes += 1;
        self.stats.bytes_sent += payload.len();
        Ok(Completion::resolved())
    }

    fn pull(&mut self, source: Rank, key: TransferKey, extent: usize) -> Result<Completion> {
        self.stats.pulls += 1;
        self.mailbox.post(source, key, extent)
    }

    fn progress(&mut self) -> Result<usize> {
        self.group.check();
        let mut completed = 0;
        while let Ok(envelope) = self.inbox.try_recv() {
            let (key, payload) = decode_frame(&envelope.frame)?;
            self.stats.bytes_received += payload.len();
            if self.mailbox.deliver(envelope.source, key, payload.to_vec())? {
                completed += 1;
            }
        }
        Ok(completed)
    }

    fn outstanding(&self) -> usize {
        // sends are buffered by the inbox and complete immediately
        0
    }

    fn pending_pulls(&self) -> usize {
        self.mailbox.pending()
    }

    fn barrier(&mut self) {
        self.group.wait();
    }

    fn broadcast(&mut self, data: &mut Vec<u8>, root: Rank) -> Result<()> {
        if self.rank == root {
            for (destination, lane) in self.collective_out.iter().enumerate() {
                if destination as Rank != root {
                    lane.send(data.clone())
                        .map_err(|_| Error::Disconnected(destination as Rank))?;
                }
            }
            return Ok(());
        }

        let lane = &self.collective_in[root as usize];
        loop {
            self.group.check();
            match lane.recv_timeout(POLL) {
                Ok(received) => {
                    *data = received;
                    debug!(rank = self.rank, root, bytes = data.len(); "Received broadcast");
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Disconnected(root)),
            }
        }
    }

    fn abort(&self, code: i32) -> ! {
        error!(rank = self.rank, code; "Aborting process group");
        self.group.abort();
        panic!("rank {} aborted the process group with code {code}", self.rank);
    }

    fn stats(&self) -> ChannelStats {
        self.stats
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        // a rank unwinding on its own takes the others down with it
        if std::thread::panicking() {
            self.group.abort();
        }
    }
}

/// Runs `f` on every rank of a thread-backed group of `size` ranks and returns the
/// results ordered by rank. A panic on any rank tears down the group and is
/// resumed on the calling thread.
pub fn run_local_group<F, R>(size: Rank, f: F) -> Vec<R>
where
    F: Fn(LocalChannel) -> R + Sync,
    R: Send,
{
    let channels = LocalChannel::group(size);
    let results = std::thread::scope(|scope| {
        let handles = channels
            .into_iter()
            .map(|channel| {
                let f = &f;
                std::thread::Builder::new()
                    .name(format!("rank{}", channel.rank()))
                    .spawn_scoped(scope, move || f(channel))
                    .expect("failed to spawn rank thread")
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    });

    let mut values = Vec::with_capacity(results.len());
    let mut secondary = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(payload) if payload.is::<GroupAborted>() => secondary = Some(payload),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
    if let Some(payload) = secondary {
        std::panic::resume_unwind(payload);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::broadcast_serializing;

    #[test]
    fn test_transfer_between_ranks() {
        let received = run_local_group(2, |mut channel| {
            let key = TransferKey::new(4, 2);
            let result = if channel.rank() == 0 {
                let completion = channel.push(1, key, &[1, 2, 3, 4]).unwrap();
                assert!(completion.is_done());
                None
            } else {
                let completion = channel.pull(0, key, 4).unwrap();
                assert_eq!(channel.pending_pulls(), 1);
                while !completion.is_done() {
                    channel.progress().unwrap();
                    std::thread::yield_now();
                }
                assert_eq!(channel.pending_pulls(), 0);
                completion.take()
            };
            channel.barrier();
            (result, channel.stats())
        });

        assert_eq!(received[0].0, None);
        assert_eq!(received[0].1.pushes, 1);
        assert_eq!(received[1].0, Some(vec![1, 2, 3, 4]));
        assert_eq!(received[1].1.pulls, 1);
        assert_eq!(received[1].1.bytes_received, 4);
    }

    #[test]
    fn test_broadcast() {
        let values = run_local_group(3, |mut channel| {
            let value = if channel.rank() == 1 {
                vec![7u32, 8, 9]
            } else {
                Vec::new()
            };
            broadcast_serializing(value, 1, &mut channel).unwrap()
        });
        assert!(values.iter().all(|v| v == &[7, 8, 9]));
    }

    #[test]
    fn test_barrier_generations() {
        let rounds = run_local_group(4, |mut channel| {
            for _ in 0..10 {
                channel.barrier();
            }
            channel.rank()
        });
        assert_eq!(rounds, vec![0, 1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "aborted the process group with code 3")]
    fn test_abort_releases_barrier() {
        run_local_group(3, |mut channel| {
            if channel.rank() == 2 {
                channel.abort(3);
            }
            channel.barrier();
        });
    }
}
