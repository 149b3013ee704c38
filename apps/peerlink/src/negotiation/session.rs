use std::collections::VecDeque;
use std::fmt;

use crate::protocol::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionState {
    None,
    Pending,
    Set,
}

/// Bookkeeping for one call attempt.
#[derive(Debug)]
pub struct NegotiationSession {
    pub generation: u64,
    pub role: Role,
    pub local: DescriptionState,
    pub remote: DescriptionState,
    pending_remote_candidates: VecDeque<IceCandidate>,
    closed: bool,
}

impl NegotiationSession {
    pub fn new(generation: u64, role: Role) -> Self {
        Self {
            generation,
            role,
            local: DescriptionState::None,
            remote: DescriptionState::None,
            pending_remote_candidates: VecDeque::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn remote_is_set(&self) -> bool {
        self.remote == DescriptionState::Set
    }

    pub fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_remote_candidates.push_back(candidate);
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    /// Hands back the buffered candidates in arrival order.
    pub fn drain_pending(&mut self) -> Vec<IceCandidate> {
        self.pending_remote_candidates.drain(..).collect()
    }

    pub fn close(&mut self) -> usize {
        self.closed = true;
        let discarded = self.pending_remote_candidates.len();
        self.pending_remote_candidates.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CandidateInit;

    fn candidate(text: &str) -> IceCandidate {
        IceCandidate::Candidate(CandidateInit {
            candidate: text.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        })
    }

    #[test]
    fn pending_candidates_drain_fifo() {
        let mut session = NegotiationSession::new(1, Role::Responder);
        session.buffer_candidate(candidate("c1"));
        session.buffer_candidate(IceCandidate::EndOfCandidates);
        session.buffer_candidate(candidate("c2"));
        let drained: Vec<_> = session
            .drain_pending()
            .iter()
            .map(|c| c.describe().to_string())
            .collect();
        assert_eq!(drained, vec!["c1", "(null)", "c2"]);
        assert_eq!(session.pending_candidates(), 0);
    }

    #[test]
    fn close_discards_buffer() {
        let mut session = NegotiationSession::new(1, Role::Initiator);
        session.buffer_candidate(candidate("c1"));
        assert_eq!(session.close(), 1);
        assert!(session.is_closed());
        assert_eq!(session.pending_candidates(), 0);
    }
}
