//! Point-to-point and collective communication between the ranks of a process
//! group.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::serialization::{deserialize, serialize};
use crate::error::Result;
use crate::types::{Rank, TransferKey};

pub mod local;
mod mailbox;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod serialization;
#[cfg(feature = "mpi")]
pub mod testing;

/// Completion handle of an asynchronous transfer. The issuing side polls it; the
/// transport resolves it, attaching the received bytes for pulls.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

#[derive(Default)]
struct CompletionInner {
    done: AtomicBool,
    payload: Mutex<Option<Vec<u8>>>,
}

impl Completion {
    /// A completion that is already resolved.
    pub fn resolved() -> Self {
        let completion = Self::default();
        completion.resolve(None);
        completion
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    pub(crate) fn resolve(&self, payload: Option<Vec<u8>>) {
        *self.inner.payload.lock() = payload;
        self.inner.done.store(true, Ordering::Release);
    }

    /// Takes the received bytes, if the transfer is done and carried any.
    pub fn take(&self) -> Option<Vec<u8>> {
        if !self.is_done() {
            return None;
        }
        self.inner.payload.lock().take()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Transfer counters of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub pushes: usize,
    pub pulls: usize,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

/// A fixed process group offering asynchronous point-to-point transfers of tile
/// versions and a few collectives.
///
/// Two transfers from the same source for the same key arrive in issuance order.
pub trait Channel {
    /// The rank of this process.
    fn rank(&self) -> Rank;

    /// The number of ranks in the group.
    fn size(&self) -> Rank;

    /// Starts sending `payload` under `key` to `destination`.
    fn push(&mut self, destination: Rank, key: TransferKey, payload: &[u8]) -> Result<Completion>;

    /// Starts receiving `extent` bytes under `key` from `source`. The returned
    /// completion carries the bytes once they arrived.
    fn pull(&mut self, source: Rank, key: TransferKey, extent: usize) -> Result<Completion>;

    /// Makes progress on outstanding transfers. Returns the number of transfers
    /// completed by this call.
    fn progress(&mut self) -> Result<usize>;

    /// Number of sends that have not completed yet.
    fn outstanding(&self) -> usize;

    /// Number of posted pulls still waiting for their frame.
    fn pending_pulls(&self) -> usize;

    /// Blocks until every rank of the group reached the barrier.
    fn barrier(&mut self);

    /// Broadcasts `data` from `root` to every rank. Receivers may pass an empty
    /// vector.
    fn broadcast(&mut self, data: &mut Vec<u8>, root: Rank) -> Result<()>;

    /// Terminates the whole group.
    fn abort(&self, code: i32) -> !;

    fn stats(&self) -> ChannelStats;
}

/// Broadcast a value by serializing it and sending it as byte array.
pub fn broadcast_serializing<T>(data: T, root: Rank, channel: &mut dyn Channel) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let is_root = channel.rank() == root;
    let mut raw_value = if is_root {
        serialize(&data)?
    } else {
        Default::default()
    };

    channel.broadcast(&mut raw_value, root)?;

    if is_root {
        Ok(data)
    } else {
        deserialize(&raw_value)
    }
}
