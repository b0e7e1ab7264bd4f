use std::collections::VecDeque;

use duet_shared::protocol::IceCandidate;

/// Holds remote candidates until the remote description is applied.
///
/// Before [`open`](Self::open) every pushed candidate is queued. `open`
/// returns the queue in arrival order; from then on `push` hands candidates
/// straight back to be applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    open: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate if it may be applied now.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.open {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Mark the remote description as applied and drain the queue.
    pub fn open(&mut self) -> Vec<IceCandidate> {
        self.open = true;
        self.pending.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.open = false;
    }
}
