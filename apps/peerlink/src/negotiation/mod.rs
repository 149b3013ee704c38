//! Offer/answer negotiation for one endpoint.

use std::fmt;

use thiserror::Error;

use crate::transport::TransportError;

pub mod machine;
pub mod session;

pub use machine::{MachineContext, NegotiationMachine};
pub use session::{DescriptionState, NegotiationSession, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    LocalOfferPending,
    LocalOfferSet,
    RemoteOfferApplied,
    AnswerPending,
    Stable,
    Closed,
}

impl NegotiationState {
    /// True while a session exists and has not been closed.
    pub fn is_active(self) -> bool {
        !matches!(self, NegotiationState::Idle | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::LocalOfferPending => "local-offer-pending",
            NegotiationState::LocalOfferSet => "local-offer-set",
            NegotiationState::RemoteOfferApplied => "remote-offer-applied",
            NegotiationState::AnswerPending => "answer-pending",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A message that does not fit the current state. The message is dropped
/// and the session carries on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingProtocolError {
    #[error("offer received while a session is {0}")]
    OfferWhileActive(NegotiationState),
    #[error("answer received without a session")]
    AnswerWithoutSession,
    #[error("answer received while {state} as {role}")]
    UnexpectedAnswer { state: NegotiationState, role: Role },
    #[error("already in call ({0})")]
    CallWhileActive(NegotiationState),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Protocol(#[from] SignalingProtocolError),
    #[error("{op} failed: {source}")]
    Operation {
        op: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("{op} interrupted by hangup")]
    Cancelled { op: &'static str },
}

impl NegotiationError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, NegotiationError::Protocol(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NegotiationError::Cancelled { .. })
    }
}
