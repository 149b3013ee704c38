//! Signaling adapters.
//!
//! Outbound delivery is fire-and-forget through [`SignalingSink`]. Inbound
//! messages arrive on a [`SignalSubscription`] in the order their publisher
//! sent them.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::SignalingMessage;

pub mod bus;
pub mod direct;

pub use bus::BusSignaling;
pub use direct::DirectSignaling;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling peer is gone")]
    Closed,
}

pub trait SignalingSink: Send + Sync {
    /// Hands the message to the channel. An `Ok` says nothing about delivery.
    fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError>;
}

/// Inbound side of an adapter. Dropping it stops the pump task, if any.
pub struct SignalSubscription {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    pump: Option<JoinHandle<()>>,
}

impl SignalSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SignalingMessage>, pump: Option<JoinHandle<()>>) -> Self {
        Self { rx, pump }
    }

    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
