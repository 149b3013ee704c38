pub mod config;
pub mod media;
pub mod metrics;
pub mod negotiation;
pub mod path;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use negotiation::NegotiationState;
pub use session::{SessionError, SessionEvent, SessionOrchestrator, SessionSettings};
