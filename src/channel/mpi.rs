//! MPI-backed process group, one rank per MPI process.

use std::ptr::NonNull;

use log::{debug, error, info};
use mpi::environment::Universe;
use mpi::request::{Request, StaticScope};
use mpi::topology::{Process, SimpleCommunicator};
use mpi::traits::{BufferMut, Communicator, Destination, Root, Source};
use mpi::Tag;

use crate::channel::mailbox::Mailbox;
use crate::channel::serialization::{decode_frame, encode_frame};
use crate::channel::{Channel, ChannelStats, Completion};
use crate::error::Result;
use crate::types::{Rank, TransferKey};

/// Tag of all transfer frames. Frames carry their key, so one tag suffices.
const TRANSFER_TAG: Tag = 7;

/// A nonblocking send together with the frame it reads from.
///
/// MPI reads the frame until the request completes, but the request outlives the
/// `push` call that issued it, so the frame is leaked to obtain a `'static`
/// borrow. `InFlight` is the sole owner of that allocation: the frame is only
/// reclaimed in `drop`, after the request completed in [`InFlight::test`] or was
/// waited for.
struct InFlight {
    /// `None` once the send completed.
    request: Option<Request<'static, [u8], StaticScope>>,
    frame: NonNull<[u8]>,
    completion: Completion,
}

impl InFlight {
    fn send(world: &SimpleCommunicator, destination: Rank, frame: Vec<u8>) -> Self {
        let frame: &'static mut [u8] = Box::leak(frame.into_boxed_slice());
        let pointer = NonNull::from(&mut *frame);
        let request = world.process_at_rank(destination).immediate_send_with_tag(
            StaticScope,
            &*frame,
            TRANSFER_TAG,
        );
        Self {
            request: Some(request),
            frame: pointer,
            completion: Completion::default(),
        }
    }

    /// Whether the send completed. Resolves the completion when it did.
    fn test(&mut self) -> bool {
        if let Some(request) = self.request.take() {
            match request.test() {
                Ok(_status) => self.completion.resolve(None),
                Err(request) => self.request = Some(request),
            }
        }
        self.request.is_none()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            request.wait();
        }
        // SAFETY: `frame` came from `Box::leak` in `send` and is freed only here.
        // The request borrowing it has completed, so no reference to it is left.
        drop(unsafe { Box::from_raw(self.frame.as_ptr()) });
    }
}

/// Broadcasts a vector of `data` from `root` to all processes in `world`. For the
/// receivers, `data` can just be an empty vector.
fn broadcast_vec<T>(data: &mut Vec<T>, root: &Process)
where
    T: Clone + Default,
    Vec<T>: BufferMut,
{
    // Broadcast length
    let mut len = if root.is_self() { data.len() } else { 0 };
    root.broadcast_into(&mut len);

    // Broadcast data
    if !root.is_self() {
        data.resize(len, Default::default());
    }
    root.broadcast_into(data);
}

pub struct MpiChannel {
    world: SimpleCommunicator,
    in_flight: Vec<InFlight>,
    mailbox: Mailbox,
    stats: ChannelStats,
    /// Finalizes MPI on drop, so it must outlive `world`.
    _universe: Universe,
}

impl MpiChannel {
    /// Initializes MPI. Returns `None` if MPI was already initialized.
    pub fn initialize() -> Option<Self> {
        let universe = mpi::initialize()?;
        let world = universe.world();
        info!(rank = world.rank(), size = world.size(); "Initialized MPI channel");
        Some(Self {
            world,
            in_flight: Vec::new(),
            mailbox: Mailbox::default(),
            stats: ChannelStats::default(),
            _universe: universe,
        })
    }
}

impl Channel for MpiChannel {
    fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn size(&self) -> Rank {
        self.world.size()
    }

    fn push(&mut self, destination: Rank, key: TransferKey, payload: &[u8]) -> Result<Completion> {
        let send = InFlight::send(&self.world, destination, encode_frame(key, payload)?);
        let completion = send.completion.clone();
        self.in_flight.push(send);
        self.stats.pushes += 1;
        self.stats.bytes_sent += payload.len();
        Ok(completion)
    }

    fn pull(&mut self, source: Rank, key: TransferKey, extent: usize) -> Result<Completion> {
        self.stats.pulls += 1;
        self.mailbox.post(source, key, extent)
    }

    fn progress(&mut self) -> Result<usize> {
        let mut completed = 0;

        self.in_flight.retain_mut(|send| {
            let done = send.test();
            if done {
                completed += 1;
            }
            !done
        });

        while let Some((message, status)) = self
            .world
            .any_process()
            .immediate_matched_probe_with_tag(TRANSFER_TAG)
        {
            let (frame, _) = message.matched_receive_vec::<u8>();
            let (key, payload) = decode_frame(&frame)?;
            self.stats.bytes_received += payload.len();
            if self
                .mailbox
                .deliver(status.source_rank(), key, payload.to_vec())?
            {
                completed += 1;
            }
        }
        Ok(completed)
    }

    fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    fn pending_pulls(&self) -> usize {
        self.mailbox.pending()
    }

    fn barrier(&mut self) {
        self.world.barrier();
    }

    fn broadcast(&mut self, data: &mut Vec<u8>, root: Rank) -> Result<()> {
        let root = self.world.process_at_rank(root);
        broadcast_vec(data, &root);
        debug!(bytes = data.len(); "Broadcast done");
        Ok(())
    }

    fn abort(&self, code: i32) -> ! {
        error!(rank = self.world.rank(), code; "Aborting process group");
        self.world.abort(code)
    }

    fn stats(&self) -> ChannelStats {
        self.stats
    }
}

impl Drop for MpiChannel {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            error!(pending = self.in_flight.len(); "Dropping channel with sends in flight");
        }
        // each send waits for its request before freeing its frame
        self.in_flight.clear();
    }
}
