use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalMedia, TrackKind};
use crate::path::PathController;
use crate::protocol::IceCandidate;

pub mod ice_config;
pub mod mock;
pub mod webrtc;

pub use ice_config::{IceConfigLoader, IceConfiguration, IceServer, IceTransportPolicy};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("{op} failed: {message}")]
    Operation { op: &'static str, message: String },
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn operation(op: &'static str, err: impl fmt::Display) -> Self {
        TransportError::Operation {
            op,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description. The SDP text is never inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub kind: TrackKind,
    pub track_id: String,
    pub stream_id: String,
}

/// Asynchronous notifications raised by a live peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrackInfo),
    ConnectionState(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct TaggedPeerEvent {
    /// Session generation of the peer that raised the event.
    pub generation: u64,
    pub event: PeerEvent,
}

/// Handed to a transport at creation so it can report events for one
/// session generation.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedPeerEvent>,
}

impl PeerEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedPeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the owning machine is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(TaggedPeerEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ice: IceConfiguration,
    /// Ask the backend for a path controller. Backends without one ignore it.
    pub path_controller: bool,
    pub stats_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice: IceConfiguration::default(),
            path_controller: true,
            stats_interval: Duration::from_millis(500),
        }
    }
}

/// The connectivity engine as seen by one negotiation session.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

pub struct PeerHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub path_controller: Option<Arc<dyn PathController>>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        label: &str,
        config: &TransportConfig,
        media: Option<&LocalMedia>,
        events: PeerEventSender,
    ) -> Result<PeerHandle, TransportError>;
}
