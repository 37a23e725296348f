//! Buffering for connectivity candidates that outrun their description.
//!
//! The relay preserves the order candidates were sent in, but gives no
//! ordering between a candidate and the session description it depends
//! on: candidates are generated only after a description existed locally
//! on the sending side, yet routinely arrive here first. The queue holds
//! them until the remote description is installed, then releases the
//! backlog in arrival order; afterwards candidates pass straight through.

use std::collections::VecDeque;

use crate::signaling::IceCandidate;

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    ready: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand in a newly arrived candidate. Returns the candidates that are
    /// now applicable, in arrival order: empty while buffering, exactly
    /// the given candidate once the queue is ready.
    pub fn push(&mut self, candidate: IceCandidate) -> Vec<IceCandidate> {
        if self.ready {
            vec![candidate]
        } else {
            self.pending.push_back(candidate);
            Vec::new()
        }
    }

    /// The remote description is installed: release the backlog, FIFO.
    pub fn mark_ready(&mut self) -> Vec<IceCandidate> {
        self.ready = true;
        self.pending.drain(..).collect()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
