//! Holding area for remote candidates that arrive early

use std::collections::VecDeque;

use crate::signaling::IceCandidateRecord;

/// FIFO of remote ICE candidates received before the remote description is set
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: VecDeque<IceCandidateRecord>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidateRecord) {
        self.pending.push_back(candidate);
    }

    /// Hand every buffered candidate to `apply` in arrival order.
    ///
    /// On error the failing candidate is consumed and the rest stay buffered.
    pub fn flush<F, E>(&mut self, mut apply: F) -> Result<usize, E>
    where
        F: FnMut(IceCandidateRecord) -> Result<(), E>,
    {
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            apply(candidate)?;
            applied += 1;
        }
        Ok(applied)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
