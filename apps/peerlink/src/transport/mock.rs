//! Scriptable in-memory transport for tests and headless runs.
//!
//! Descriptions are plain strings naming their author, local candidates are
//! "gathered" as soon as a local description is set, and every peer comes
//! with a [`ManualPathController`] for driving pair events by hand.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    PeerEvent, PeerEventSender, PeerHandle, PeerTransport, SdpKind, SessionDescription, TransportConfig,
    TransportError, TransportFactory,
};
use crate::media::LocalMedia;
use crate::path::{ManualPathController, PathController};
use crate::protocol::{CandidateInit, IceCandidate};

pub const OP_CREATE: &str = "createPeer";
pub const OP_CREATE_OFFER: &str = "createOffer";
pub const OP_CREATE_ANSWER: &str = "createAnswer";
pub const OP_SET_LOCAL: &str = "setLocalDescription";
pub const OP_SET_REMOTE: &str = "setRemoteDescription";
pub const OP_ADD_CANDIDATE: &str = "addIceCandidate";

#[derive(Debug, Default)]
struct Script {
    failures: HashSet<(String, &'static str)>,
    remote_delay: Option<Duration>,
    gather: Option<Vec<String>>,
    without_controller: bool,
}

#[derive(Default)]
pub struct MockTransportFactory {
    script: Mutex<Script>,
    peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `op` fail on every peer created for `label` from now on.
    pub fn fail(&self, label: &str, op: &'static str) {
        self.script.lock().failures.insert((label.to_string(), op));
    }

    pub fn clear_failures(&self) {
        self.script.lock().failures.clear();
    }

    /// Suspends every `setRemoteDescription` for `delay`.
    pub fn delay_remote_description(&self, delay: Duration) {
        self.script.lock().remote_delay = Some(delay);
    }

    /// Candidate strings each peer gathers after its local description is
    /// set. Defaults to one host candidate per peer.
    pub fn gather(&self, candidates: Vec<String>) {
        self.script.lock().gather = Some(candidates);
    }

    pub fn without_path_controller(&self) {
        self.script.lock().without_controller = true;
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn peers_for(&self, label: &str) -> Vec<Arc<MockPeer>> {
        self.peers
            .lock()
            .iter()
            .filter(|peer| peer.label == label)
            .cloned()
            .collect()
    }

    pub fn latest(&self, label: &str) -> Option<Arc<MockPeer>> {
        self.peers_for(label).pop()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        label: &str,
        config: &TransportConfig,
        media: Option<&LocalMedia>,
        events: PeerEventSender,
    ) -> Result<PeerHandle, TransportError> {
        let (failures, remote_delay, gather, without_controller) = {
            let script = self.script.lock();
            let failures: HashSet<&'static str> = script
                .failures
                .iter()
                .filter(|(peer, _)| peer == label)
                .map(|(_, op)| *op)
                .collect();
            (
                failures,
                script.remote_delay,
                script.gather.clone(),
                script.without_controller,
            )
        };
        if failures.contains(OP_CREATE) {
            return Err(TransportError::Setup(format!("scripted failure creating {label}")));
        }

        let generation = events.generation();
        let gather = gather.unwrap_or_else(|| {
            vec![format!(
                "candidate:{generation} 1 udp 2122260223 127.0.0.1 {} typ host",
                50000 + generation
            )]
        });
        let controller = Arc::new(ManualPathController::new(format!("{label}-manual")));
        let peer = Arc::new(MockPeer {
            label: label.to_string(),
            generation,
            media_tracks: media.map(|m| m.tracks().len()).unwrap_or(0),
            failures,
            remote_delay,
            gather,
            events,
            controller: Arc::clone(&controller),
            state: Mutex::new(PeerState::default()),
        });
        self.peers.lock().push(Arc::clone(&peer));
        debug!(endpoint = label, generation, servers = config.ice.ice_servers.len(), "mock peer created");

        let path_controller = (config.path_controller && !without_controller)
            .then(|| controller as Arc<dyn PathController>);
        Ok(PeerHandle {
            transport: peer,
            path_controller,
        })
    }
}

#[derive(Debug, Default)]
struct PeerState {
    calls: Vec<&'static str>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    offers_created: u32,
    closed: bool,
}

pub struct MockPeer {
    label: String,
    generation: u64,
    media_tracks: usize,
    failures: HashSet<&'static str>,
    remote_delay: Option<Duration>,
    gather: Vec<String>,
    events: PeerEventSender,
    controller: Arc<ManualPathController>,
    state: Mutex<PeerState>,
}

impl MockPeer {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn media_tracks(&self) -> usize {
        self.media_tracks
    }

    pub fn controller(&self) -> Arc<ManualPathController> {
        Arc::clone(&self.controller)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Raises an event as the engine would, e.g. a remote track arriving.
    pub fn raise(&self, event: PeerEvent) -> bool {
        self.events.emit(event)
    }

    fn begin(&self, op: &'static str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.calls.push(op);
        if self.failures.contains(op) {
            return Err(TransportError::operation(op, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.begin(OP_CREATE_OFFER)?;
        let mut state = self.state.lock();
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer:{}:{}:{}",
            self.label, self.generation, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.begin(OP_CREATE_ANSWER)?;
        let state = self.state.lock();
        match &state.remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::answer(format!(
                "answer:{}:{}",
                self.label, self.generation
            ))),
            _ => Err(TransportError::operation(OP_CREATE_ANSWER, "no remote offer")),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        self.begin(OP_SET_LOCAL)?;
        self.state.lock().local = Some(description);
        for candidate in &self.gather {
            self.events.emit(PeerEvent::LocalCandidate(IceCandidate::Candidate(CandidateInit {
                candidate: candidate.clone(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })));
        }
        self.events
            .emit(PeerEvent::LocalCandidate(IceCandidate::EndOfCandidates));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        self.begin(OP_SET_REMOTE)?;
        if let Some(delay) = self.remote_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.begin(OP_ADD_CANDIDATE)?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(TransportError::operation(OP_ADD_CANDIDATE, "remote description not set"));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.calls.push("close");
        Ok(())
    }
}
