use std::sync::Arc;

use bytes::Bytes;
use signal_bus::{Bus, BusError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::{SignalSubscription, SignalingError, SignalingSink};
use crate::metrics;
use crate::protocol::SignalingMessage;

/// Adapter binding one endpoint identity to a bus topic.
///
/// The bus echoes every message back to its publisher, so the inbound pump
/// drops messages whose origin is this endpoint.
#[derive(Clone)]
pub struct BusSignaling {
    bus: Arc<dyn Bus>,
    topic: String,
    endpoint: String,
}

impl BusSignaling {
    pub fn new(bus: Arc<dyn Bus>, topic: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(&self) -> SignalSubscription {
        let mut inbound = self.bus.subscribe(&self.topic);
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = self.endpoint.clone();
        let pump = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => {
                        if message.origin == endpoint {
                            trace!(endpoint = %endpoint, "skipping own echo");
                            continue;
                        }
                        match SignalingMessage::decode(&message.payload) {
                            Ok(decoded) => {
                                trace!(
                                    endpoint = %endpoint,
                                    from = %message.origin,
                                    kind = decoded.kind(),
                                    "signal received"
                                );
                                if tx.send(decoded).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                metrics::SIGNALING_DROPPED.with_label_values(&["decode"]).inc();
                                warn!(endpoint = %endpoint, from = %message.origin, error = %err, "undecodable signal dropped");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(endpoint = %endpoint, skipped, "signaling subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(endpoint = %endpoint, "signaling pump stopped");
        });
        SignalSubscription::new(rx, Some(pump))
    }
}

impl SignalingSink for BusSignaling {
    fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        let payload = Bytes::from(message.encode()?);
        match self.bus.publish(&self.topic, &self.endpoint, payload) {
            Ok(receivers) => {
                trace!(endpoint = %self.endpoint, kind = message.kind(), receivers, "signal published");
                Ok(())
            }
            // Our own subscription always counts, so this only happens
            // before anybody subscribed; the message is simply lost.
            Err(BusError::NoSubscribers(topic)) => {
                debug!(endpoint = %self.endpoint, topic = %topic, kind = message.kind(), "nobody listening");
                Ok(())
            }
        }
    }
}
