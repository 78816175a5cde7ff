use std::collections::VecDeque;

use log::trace;
use rustc_hash::FxHashMap;

use crate::channel::Completion;
use crate::error::{Error, Result};
use crate::types::{Rank, TransferKey};

#[derive(Debug)]
struct Waiting {
    completion: Completion,
    extent: usize,
}

/// Matches arrived frames with posted pulls by source and key. Both sides are
/// queued, so same-key transfers from one source match in order.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    arrived: FxHashMap<(Rank, TransferKey), VecDeque<Vec<u8>>>,
    waiting: FxHashMap<(Rank, TransferKey), VecDeque<Waiting>>,
}

impl Mailbox {
    /// Delivers the payload of a frame from `source`. Returns whether a posted pull
    /// was completed by it.
    pub fn deliver(&mut self, source: Rank, key: TransferKey, payload: Vec<u8>) -> Result<bool> {
        let slot = (source, key);
        if let Some(queue) = self.waiting.get_mut(&slot) {
            if let Some(waiting) = queue.pop_front() {
                if queue.is_empty() {
                    self.waiting.remove(&slot);
                }
                check_extent(source, key, waiting.extent, payload.len())?;
                trace!(source, key:%; "Matched arrival with posted pull");
                waiting.completion.resolve(Some(payload));
                return Ok(true);
            }
        }
        trace!(source, key:%; "Stashed early arrival");
        self.arrived.entry(slot).or_default().push_back(payload);
        Ok(false)
    }

    /// Posts a pull. It completes immediately if the frame already arrived.
    pub fn post(&mut self, source: Rank, key: TransferKey, extent: usize) -> Result<Completion> {
        let slot = (source, key);
        let completion = Completion::default();
        if let Some(queue) = self.arrived.get_mut(&slot) {
            if let Some(payload) = queue.pop_front() {
                if queue.is_empty() {
                    self.arrived.remove(&slot);
                }
                check_extent(source, key, extent, payload.len())?;
                completion.resolve(Some(payload));
                return Ok(completion);
            }
        }
        self.waiting.entry(slot).or_default().push_back(Waiting {
            completion: completion.clone(),
            extent,
        });
        Ok(completion)
    }

    /// Number of posted pulls still waiting.
    pub fn pending(&self) -> usize {
        self.waiting.values().map(VecDeque::len).sum()
    }
}

fn check_extent(source: Rank, key: TransferKey, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ExtentMismatch {
            key,
            source_rank: source,
            expected,
            actual,
        })
    }
}
