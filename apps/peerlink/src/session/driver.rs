use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SessionError, SessionEvent};
use crate::media::{LocalMedia, MediaLiveness};
use crate::metrics;
use crate::negotiation::{NegotiationError, NegotiationMachine, SignalingProtocolError};
use crate::protocol::SignalingMessage;
use crate::signaling::{SignalSubscription, SignalingSink};
use crate::transport::TaggedPeerEvent;

pub(crate) enum DriverInput {
    Start {
        media: LocalMedia,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Call {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Hangup {
        reply: oneshot::Sender<()>,
    },
    Signal {
        slot: usize,
        message: SignalingMessage,
    },
    Peer {
        slot: usize,
        event: TaggedPeerEvent,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

pub(crate) struct Slot {
    pub machine: NegotiationMachine,
    /// Whether this endpoint sends the local media.
    pub takes_media: bool,
}

pub(crate) enum Wiring {
    /// One endpoint on a shared bus; `bye`/`ready` go out through `sink`.
    Channel { sink: Arc<dyn SignalingSink> },
    /// Two endpoints wired to each other.
    Loopback,
}

/// Owns the machines and the local media; the only task that touches them.
pub(crate) struct Driver {
    pub wiring: Wiring,
    pub slots: Vec<Slot>,
    pub media: Option<LocalMedia>,
    pub liveness: Arc<Mutex<Option<MediaLiveness>>>,
    pub events: broadcast::Sender<SessionEvent>,
    pub pumps: Vec<JoinHandle<()>>,
}

impl Driver {
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<DriverInput>) {
        while let Some(input) = inputs.recv().await {
            match input {
                DriverInput::Start { media, reply } => {
                    let _ = reply.send(self.start(media));
                }
                DriverInput::Call { reply } => {
                    let result = self.call().await;
                    let _ = reply.send(result);
                }
                DriverInput::Hangup { reply } => {
                    self.hangup(false).await;
                    let _ = reply.send(());
                }
                DriverInput::Signal { slot, message } => self.on_signal(slot, message).await,
                DriverInput::Peer { slot, event } => self.on_peer_event(slot, event),
                DriverInput::Shutdown { reply } => {
                    if self.media.is_some() {
                        self.hangup(false).await;
                    }
                    for pump in self.pumps.drain(..) {
                        pump.abort();
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        debug!("session driver stopped");
    }

    fn is_started(&self) -> bool {
        self.media.is_some()
    }

    fn start(&mut self, media: LocalMedia) -> Result<(), SessionError> {
        if self.is_started() {
            warn!("start requested twice; keeping the existing media");
            return Err(SessionError::AlreadyStarted);
        }
        for slot in &mut self.slots {
            slot.machine.reset();
        }
        *self.liveness.lock() = Some(media.liveness());
        info!(stream = media.stream_id(), tracks = media.tracks().len(), "received local stream");
        self.media = Some(media);
        if let Wiring::Channel { sink } = &self.wiring {
            if let Err(err) = sink.send(&SignalingMessage::Ready) {
                debug!(error = %err, "ready not sent");
            }
        }
        Ok(())
    }

    async fn call(&mut self) -> Result<(), SessionError> {
        if !self.is_started() {
            return Err(SessionError::NotStarted);
        }
        let slot = &mut self.slots[0];
        let media = if slot.takes_media { self.media.as_ref() } else { None };
        match slot.machine.call(media).await {
            Ok(()) => Ok(()),
            Err(NegotiationError::Protocol(SignalingProtocolError::CallWhileActive(state))) => {
                warn!(endpoint = slot.machine.label(), state = %state, "already in call, ignoring");
                Ok(())
            }
            Err(err) => {
                let _ = self.events.send(SessionEvent::NegotiationFailed {
                    endpoint: slot.machine.label().to_string(),
                    error: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    async fn hangup(&mut self, remote: bool) {
        for slot in &mut self.slots {
            slot.machine.hangup().await;
        }
        let was_started = self.media.is_some();
        if let Some(media) = self.media.take() {
            media.stop();
        }
        if !remote && was_started {
            if let Wiring::Channel { sink } = &self.wiring {
                if let Err(err) = sink.send(&SignalingMessage::Bye) {
                    debug!(error = %err, "bye not sent");
                }
            }
        }
        info!(remote, "hung up");
        let _ = self.events.send(SessionEvent::HungUp { remote });
    }

    async fn on_signal(&mut self, slot: usize, message: SignalingMessage) {
        let channel = matches!(self.wiring, Wiring::Channel { .. });
        if channel && !self.is_started() {
            metrics::SIGNALING_DROPPED.with_label_values(&["not-ready"]).inc();
            info!(kind = message.kind(), "not ready yet");
            return;
        }
        if self.slots.get(slot).is_none() {
            return;
        }

        match message {
            SignalingMessage::Ready if channel => {
                let state = self.slots[slot].machine.state();
                if state.is_active() {
                    info!(state = %state, "already in call, ignoring");
                    return;
                }
                if let Err(err) = self.call().await {
                    debug!(error = %err, "call on ready failed");
                }
            }
            SignalingMessage::Bye if channel => {
                let Slot { machine, .. } = &mut self.slots[slot];
                if machine.session().is_none() {
                    info!(state = %machine.state(), "no peerconnection; bye ignored");
                    return;
                }
                if let Err(err) = machine.handle_signal(SignalingMessage::Bye, None).await {
                    debug!(error = %err, "bye handling failed");
                }
                self.hangup(true).await;
            }
            message => {
                let Slot { machine, takes_media } = &mut self.slots[slot];
                let media = if *takes_media { self.media.as_ref() } else { None };
                if let Err(err) = machine.handle_signal(message, media).await {
                    let endpoint = machine.label().to_string();
                    let event = if err.is_protocol() {
                        SessionEvent::ProtocolError {
                            endpoint,
                            error: err.to_string(),
                        }
                    } else {
                        SessionEvent::NegotiationFailed {
                            endpoint,
                            error: err.to_string(),
                        }
                    };
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn on_peer_event(&mut self, slot: usize, event: TaggedPeerEvent) {
        let Some(Slot { machine, .. }) = self.slots.get_mut(slot) else {
            return;
        };
        if let Some(track) = machine.handle_peer_event(event) {
            let _ = self.events.send(SessionEvent::RemoteTrack {
                endpoint: machine.label().to_string(),
                track,
            });
        }
    }
}

pub(crate) fn pump_signals(
    slot: usize,
    mut subscription: SignalSubscription,
    inputs: mpsc::UnboundedSender<DriverInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            if inputs.send(DriverInput::Signal { slot, message }).is_err() {
                break;
            }
        }
    })
}

pub(crate) fn pump_peer_events(
    slot: usize,
    mut events: mpsc::UnboundedReceiver<TaggedPeerEvent>,
    inputs: mpsc::UnboundedSender<DriverInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inputs.send(DriverInput::Peer { slot, event }).is_err() {
                break;
            }
        }
    })
}
