use tokio::sync::mpsc;
use tracing::trace;

use super::{SignalSubscription, SignalingError, SignalingSink};
use crate::protocol::SignalingMessage;

/// In-memory link feeding one endpoint's output straight into another's
/// input. Used by loopback sessions, where there is no bus and no echo.
pub struct DirectSignaling {
    peer: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl DirectSignaling {
    /// Returns the sending half for whoever talks to `peer`, and `peer`'s
    /// inbound subscription.
    pub fn channel(peer: impl Into<String>) -> (Self, SignalSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peer: peer.into(),
                tx,
            },
            SignalSubscription::new(rx, None),
        )
    }
}

impl SignalingSink for DirectSignaling {
    fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        trace!(to = %self.peer, kind = message.kind(), "direct signal");
        self.tx.send(message.clone()).map_err(|_| SignalingError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_send_order() {
        let (to_pc2, mut pc2_in) = DirectSignaling::channel("pc2");
        to_pc2.send(&SignalingMessage::Offer { sdp: "A".into() }).expect("send");
        to_pc2
            .send(&SignalingMessage::Candidate {
                candidate: None,
                sdp_mid: None,
                sdp_mline_index: None,
            })
            .expect("send");
        assert_eq!(pc2_in.recv().await.map(|m| m.kind()), Some("offer"));
        assert_eq!(pc2_in.recv().await.map(|m| m.kind()), Some("candidate"));
    }

    #[test]
    fn closed_peer_is_reported() {
        let (to_pc2, pc2_in) = DirectSignaling::channel("pc2");
        drop(pc2_in);
        assert!(matches!(
            to_pc2.send(&SignalingMessage::Bye),
            Err(SignalingError::Closed)
        ));
    }
}
