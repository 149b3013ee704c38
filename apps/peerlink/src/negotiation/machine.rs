use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::{
    DescriptionState, NegotiationError, NegotiationSession, NegotiationState, Role, SignalingProtocolError,
};
use crate::media::LocalMedia;
use crate::metrics;
use crate::path::{CandidatePairMonitor, PathEventSource};
use crate::protocol::{IceCandidate, SignalingMessage};
use crate::signaling::SignalingSink;
use crate::transport::{
    PeerEvent, PeerEventSender, PeerTransport, RemoteTrackInfo, SessionDescription, TaggedPeerEvent,
    TransportConfig, TransportError, TransportFactory,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a machine needs from its owner.
pub struct MachineContext {
    pub label: String,
    pub factory: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingSink>,
    pub monitor: Arc<CandidatePairMonitor>,
    pub transport: TransportConfig,
    /// Hangup epoch. Any change interrupts the boundary call in flight.
    pub hangup: watch::Receiver<u64>,
    pub peer_events: mpsc::UnboundedSender<TaggedPeerEvent>,
}

struct LiveSession {
    record: NegotiationSession,
    peer: Arc<dyn PeerTransport>,
    path: PathEventSource,
    epoch: u64,
}

/// Drives offer/answer and trickled candidates for one endpoint.
///
/// Callers must serialize every input (signals, peer events, intents) onto
/// one task; a boundary call in flight is never interleaved with another
/// input for the same machine.
pub struct NegotiationMachine {
    label: String,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingSink>,
    monitor: Arc<CandidatePairMonitor>,
    transport: TransportConfig,
    hangup: watch::Receiver<u64>,
    peer_events: mpsc::UnboundedSender<TaggedPeerEvent>,
    state: watch::Sender<NegotiationState>,
    live: Option<LiveSession>,
    early_candidates: VecDeque<IceCandidate>,
    generation: u64,
}

impl NegotiationMachine {
    pub fn new(ctx: MachineContext) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            label: ctx.label,
            factory: ctx.factory,
            signaling: ctx.signaling,
            monitor: ctx.monitor,
            transport: ctx.transport,
            hangup: ctx.hangup,
            peer_events: ctx.peer_events,
            state,
            live: None,
            early_candidates: VecDeque::new(),
            generation: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> Option<&NegotiationSession> {
        self.live.as_ref().map(|live| &live.record)
    }

    pub fn monitor(&self) -> &Arc<CandidatePairMonitor> {
        &self.monitor
    }

    pub fn early_candidates(&self) -> usize {
        self.early_candidates.len()
    }

    pub fn set_transport_config(&mut self, config: TransportConfig) {
        self.transport = config;
    }

    /// Returns a closed machine to `Idle`. Active sessions are left alone.
    pub fn reset(&mut self) {
        if self.state() == NegotiationState::Closed {
            self.set_state(NegotiationState::Idle);
        }
    }

    pub async fn call(&mut self, media: Option<&LocalMedia>) -> Result<(), NegotiationError> {
        let state = self.state();
        if state.is_active() {
            return Err(self.reject(SignalingProtocolError::CallWhileActive(state)));
        }
        let result = self.run_initiator(media).await;
        self.settle(result).await
    }

    pub async fn handle_signal(
        &mut self,
        message: SignalingMessage,
        media: Option<&LocalMedia>,
    ) -> Result<(), NegotiationError> {
        let result = match message {
            SignalingMessage::Offer { sdp } => self.on_offer(sdp, media).await,
            SignalingMessage::Answer { sdp } => self.on_answer(sdp).await,
            SignalingMessage::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.on_candidate(IceCandidate::from_wire(candidate, sdp_mid, sdp_mline_index))
                    .await
            }
            SignalingMessage::Bye => {
                info!(endpoint = %self.label, "remote hung up");
                self.hangup().await;
                Ok(())
            }
            SignalingMessage::Ready => Ok(()),
        };
        self.settle(result).await
    }

    /// Routes an engine notification. Events from an older generation, or
    /// arriving after close, are dropped.
    pub fn handle_peer_event(&mut self, tagged: TaggedPeerEvent) -> Option<RemoteTrackInfo> {
        if tagged.generation != self.generation || self.live.is_none() {
            trace!(endpoint = %self.label, generation = tagged.generation, "stale peer event dropped");
            return None;
        }
        match tagged.event {
            PeerEvent::LocalCandidate(candidate) => {
                debug!(endpoint = %self.label, candidate = candidate.describe(), "local ICE candidate");
                self.publish(&SignalingMessage::candidate(&candidate));
                None
            }
            PeerEvent::RemoteTrack(track) => {
                info!(endpoint = %self.label, kind = %track.kind, stream = %track.stream_id, "received remote stream");
                Some(track)
            }
            PeerEvent::ConnectionState(state) => {
                info!(endpoint = %self.label, state = %state, "ICE state change");
                None
            }
        }
    }

    /// Closes from any state. Returns whether a session was torn down.
    pub async fn hangup(&mut self) -> bool {
        let early = self.early_candidates.len();
        self.early_candidates.clear();
        let Some(mut live) = self.live.take() else {
            self.monitor.freeze();
            self.set_state(NegotiationState::Closed);
            if early > 0 {
                debug!(endpoint = %self.label, discarded = early, "early candidates discarded");
            }
            return false;
        };

        let discarded = live.record.close() + early;
        live.path.detach();
        self.monitor.freeze();
        match tokio::time::timeout(CLOSE_TIMEOUT, live.peer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(endpoint = %self.label, error = %err, "peer close failed"),
            Err(_) => warn!(endpoint = %self.label, "peer close timed out"),
        }
        self.set_state(NegotiationState::Closed);
        info!(
            endpoint = %self.label,
            generation = live.record.generation,
            role = %live.record.role,
            discarded,
            "session closed"
        );
        true
    }

    async fn run_initiator(&mut self, media: Option<&LocalMedia>) -> Result<(), NegotiationError> {
        self.open(Role::Initiator, media).await?;
        self.set_state(NegotiationState::LocalOfferPending);
        let (peer, epoch) = self.live_peer("createOffer")?;

        let offer = guarded(&self.hangup, epoch, "createOffer", peer.create_offer()).await?;
        self.mark(|record| record.local = DescriptionState::Pending);
        self.publish(&SignalingMessage::Offer {
            sdp: offer.sdp.clone(),
        });

        guarded(&self.hangup, epoch, "setLocalDescription", peer.set_local_description(offer)).await?;
        self.mark(|record| record.local = DescriptionState::Set);
        debug!(endpoint = %self.label, "setLocalDescription complete");
        self.set_state(NegotiationState::LocalOfferSet);
        Ok(())
    }

    async fn on_offer(&mut self, sdp: String, media: Option<&LocalMedia>) -> Result<(), NegotiationError> {
        let state = self.state();
        if state.is_active() {
            warn!(endpoint = %self.label, state = %state, "existing peerconnection; offer ignored");
            return Err(self.reject(SignalingProtocolError::OfferWhileActive(state)));
        }

        self.open(Role::Responder, media).await?;
        let (peer, epoch) = self.live_peer("setRemoteDescription")?;

        self.mark(|record| record.remote = DescriptionState::Pending);
        guarded(
            &self.hangup,
            epoch,
            "setRemoteDescription",
            peer.set_remote_description(SessionDescription::offer(sdp)),
        )
        .await?;
        self.mark(|record| record.remote = DescriptionState::Set);
        debug!(endpoint = %self.label, "setRemoteDescription complete");
        self.set_state(NegotiationState::RemoteOfferApplied);
        self.flush_pending(&peer, epoch).await?;

        let answer = guarded(&self.hangup, epoch, "createAnswer", peer.create_answer()).await?;
        self.mark(|record| record.local = DescriptionState::Pending);
        self.set_state(NegotiationState::AnswerPending);

        let sdp = answer.sdp.clone();
        guarded(&self.hangup, epoch, "setLocalDescription", peer.set_local_description(answer)).await?;
        self.mark(|record| record.local = DescriptionState::Set);
        debug!(endpoint = %self.label, "setLocalDescription complete");
        self.publish(&SignalingMessage::Answer { sdp });
        self.reach_stable();
        Ok(())
    }

    async fn on_answer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        let state = self.state();
        let Some(role) = self.live.as_ref().map(|live| live.record.role) else {
            debug!(endpoint = %self.label, "no peerconnection; answer ignored");
            return Err(self.reject(SignalingProtocolError::AnswerWithoutSession));
        };
        match (state, role) {
            (NegotiationState::Stable, Role::Initiator) => {
                debug!(endpoint = %self.label, "duplicate answer ignored");
                return Ok(());
            }
            (NegotiationState::LocalOfferSet, Role::Initiator) => {}
            (state, role) => {
                return Err(self.reject(SignalingProtocolError::UnexpectedAnswer { state, role }));
            }
        }

        let (peer, epoch) = self.live_peer("setRemoteDescription")?;
        self.mark(|record| record.remote = DescriptionState::Pending);
        guarded(
            &self.hangup,
            epoch,
            "setRemoteDescription",
            peer.set_remote_description(SessionDescription::answer(sdp)),
        )
        .await?;
        self.mark(|record| record.remote = DescriptionState::Set);
        debug!(endpoint = %self.label, "setRemoteDescription complete");
        self.flush_pending(&peer, epoch).await?;
        self.reach_stable();
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        // Idle and Closed both accept the next offer, so both hold candidates
        // for it. Hangup discards them.
        let state = self.state();
        let Some(live) = self.live.as_mut() else {
            debug!(
                endpoint = %self.label,
                state = %state,
                candidate = candidate.describe(),
                "candidate buffered before offer"
            );
            self.early_candidates.push_back(candidate);
            return Ok(());
        };

        if !live.record.remote_is_set() {
            trace!(endpoint = %self.label, candidate = candidate.describe(), "candidate buffered");
            live.record.buffer_candidate(candidate);
            return Ok(());
        }

        let peer = Arc::clone(&live.peer);
        let epoch = live.epoch;
        debug!(endpoint = %self.label, candidate = candidate.describe(), "remote ICE candidate");
        guarded(&self.hangup, epoch, "addIceCandidate", peer.add_remote_candidate(candidate)).await
    }

    async fn open(&mut self, role: Role, media: Option<&LocalMedia>) -> Result<(), NegotiationError> {
        self.generation += 1;
        let generation = self.generation;
        let epoch = *self.hangup.borrow();
        self.monitor.begin_session(generation);

        let events = PeerEventSender::new(generation, self.peer_events.clone());
        let factory = Arc::clone(&self.factory);
        let handle = guarded(
            &self.hangup,
            epoch,
            "createPeer",
            factory.create(&self.label, &self.transport, media, events),
        )
        .await?;

        let mut path = PathEventSource::new(self.label.clone(), handle.path_controller.clone());
        path.attach(self.monitor.observer(generation));

        let mut record = NegotiationSession::new(generation, role);
        match role {
            Role::Responder => {
                for candidate in self.early_candidates.drain(..) {
                    record.buffer_candidate(candidate);
                }
            }
            Role::Initiator if !self.early_candidates.is_empty() => {
                debug!(
                    endpoint = %self.label,
                    discarded = self.early_candidates.len(),
                    "early candidates do not belong to an outgoing call"
                );
                self.early_candidates.clear();
            }
            Role::Initiator => {}
        }
        info!(endpoint = %self.label, generation, role = %role, media = media.is_some(), "session opened");
        self.live = Some(LiveSession {
            record,
            peer: handle.transport,
            path,
            epoch,
        });
        Ok(())
    }

    async fn flush_pending(&mut self, peer: &Arc<dyn PeerTransport>, epoch: u64) -> Result<(), NegotiationError> {
        let pending = match self.live.as_mut() {
            Some(live) => live.record.drain_pending(),
            None => return Ok(()),
        };
        if pending.is_empty() {
            return Ok(());
        }
        debug!(endpoint = %self.label, count = pending.len(), "applying buffered candidates");
        for candidate in pending {
            guarded(&self.hangup, epoch, "addIceCandidate", peer.add_remote_candidate(candidate)).await?;
        }
        Ok(())
    }

    /// Aborts the session on any failure other than a protocol error.
    async fn settle(&mut self, result: Result<(), NegotiationError>) -> Result<(), NegotiationError> {
        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) if err.is_protocol() => return Err(err),
            Err(err) => err,
        };
        let outcome = if err.is_cancelled() { "cancelled" } else { "failed" };
        metrics::NEGOTIATIONS.with_label_values(&[outcome]).inc();
        if err.is_cancelled() {
            info!(endpoint = %self.label, error = %err, "negotiation cancelled");
        } else {
            warn!(endpoint = %self.label, error = %err, "negotiation failed");
        }
        self.hangup().await;
        Err(err)
    }

    fn reject(&self, err: SignalingProtocolError) -> NegotiationError {
        metrics::SIGNALING_DROPPED.with_label_values(&["protocol"]).inc();
        debug!(endpoint = %self.label, error = %err, "signal rejected");
        err.into()
    }

    fn live_peer(&self, op: &'static str) -> Result<(Arc<dyn PeerTransport>, u64), NegotiationError> {
        self.live
            .as_ref()
            .map(|live| (Arc::clone(&live.peer), live.epoch))
            .ok_or(NegotiationError::Operation {
                op,
                source: TransportError::Closed,
            })
    }

    fn mark(&mut self, update: impl FnOnce(&mut NegotiationSession)) {
        if let Some(live) = self.live.as_mut() {
            update(&mut live.record);
        }
    }

    fn publish(&self, message: &SignalingMessage) {
        if let Err(err) = self.signaling.send(message) {
            debug!(endpoint = %self.label, kind = message.kind(), error = %err, "signal not sent");
        }
    }

    fn reach_stable(&mut self) {
        self.set_state(NegotiationState::Stable);
        metrics::NEGOTIATIONS.with_label_values(&["stable"]).inc();
        if let Some(live) = &self.live {
            info!(endpoint = %self.label, role = %live.record.role, generation = live.record.generation, "negotiation stable");
        }
    }

    fn set_state(&self, next: NegotiationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(endpoint = %self.label, from = %previous, to = %next, "negotiation state");
        }
    }
}

/// Runs one boundary call unless the hangup epoch moves first.
async fn guarded<T>(
    hangup: &watch::Receiver<u64>,
    epoch: u64,
    op: &'static str,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, NegotiationError> {
    let mut hangup = hangup.clone();
    if *hangup.borrow_and_update() != epoch {
        return Err(NegotiationError::Cancelled { op });
    }
    let interrupted = async move {
        loop {
            if hangup.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if *hangup.borrow() != epoch {
                return;
            }
        }
    };
    tokio::select! {
        biased;
        _ = interrupted => Err(NegotiationError::Cancelled { op }),
        result = call => result.map_err(|source| NegotiationError::Operation { op, source }),
    }
}
