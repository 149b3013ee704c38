//! Session orchestration.
//!
//! A [`SessionOrchestrator`] owns one endpoint on a shared signaling channel,
//! or two endpoints wired to each other in loopback. All machine inputs are
//! funnelled onto a single driver task; the handle only sends requests and
//! reads published state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use signal_bus::Bus;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::media::{MediaConstraints, MediaError, MediaLiveness, MediaSource};
use crate::negotiation::{MachineContext, NegotiationError, NegotiationMachine, NegotiationState};
use crate::path::{CandidatePairMonitor, ProposalPolicy};
use crate::signaling::{BusSignaling, DirectSignaling, SignalingSink};
use crate::transport::{RemoteTrackInfo, TaggedPeerEvent, TransportConfig, TransportFactory};

mod driver;

use driver::{Driver, DriverInput, Slot, Wiring, pump_peer_events, pump_signals};

pub const LOOPBACK_CALLER: &str = "pc1";
pub const LOOPBACK_CALLEE: &str = "pc2";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("session not started")]
    NotStarted,
    #[error("session already started")]
    AlreadyStarted,
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("session driver stopped")]
    DriverStopped,
}

/// Notifications for whoever presents the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    NegotiationFailed { endpoint: String, error: String },
    ProtocolError { endpoint: String, error: String },
    RemoteTrack { endpoint: String, track: RemoteTrackInfo },
    HungUp { remote: bool },
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub transport: TransportConfig,
    pub policy: ProposalPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            policy: ProposalPolicy::default(),
        }
    }
}

struct EndpointView {
    label: String,
    state: watch::Receiver<NegotiationState>,
    monitor: Arc<CandidatePairMonitor>,
}

pub struct SessionOrchestrator {
    loopback: bool,
    inputs: mpsc::UnboundedSender<DriverInput>,
    hangup: watch::Sender<u64>,
    events: broadcast::Sender<SessionEvent>,
    endpoints: Vec<EndpointView>,
    liveness: Arc<Mutex<Option<MediaLiveness>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Wired {
    machine: NegotiationMachine,
    view: EndpointView,
    peer_events: mpsc::UnboundedReceiver<TaggedPeerEvent>,
}

fn wire(
    label: &str,
    factory: &Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingSink>,
    settings: &SessionSettings,
    hangup: &watch::Sender<u64>,
) -> Wired {
    let monitor = Arc::new(CandidatePairMonitor::new(label, settings.policy));
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let machine = NegotiationMachine::new(MachineContext {
        label: label.to_string(),
        factory: factory.clone(),
        signaling,
        monitor: monitor.clone(),
        transport: settings.transport.clone(),
        hangup: hangup.subscribe(),
        peer_events: peer_tx,
    });
    let view = EndpointView {
        label: label.to_string(),
        state: machine.watch_state(),
        monitor,
    };
    Wired {
        machine,
        view,
        peer_events: peer_rx,
    }
}

impl SessionOrchestrator {
    /// One endpoint named `endpoint` on bus topic `channel`.
    pub fn channel(
        factory: Arc<dyn TransportFactory>,
        settings: SessionSettings,
        bus: Arc<dyn Bus>,
        channel: &str,
        endpoint: &str,
    ) -> Self {
        let (hangup, _) = watch::channel(0u64);
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let signaling = Arc::new(BusSignaling::new(bus, channel, endpoint));
        let subscription = signaling.subscribe();
        let sink: Arc<dyn SignalingSink> = signaling;
        let wired = wire(endpoint, &factory, sink.clone(), &settings, &hangup);

        let pumps = vec![
            pump_signals(0, subscription, inputs.clone()),
            pump_peer_events(0, wired.peer_events, inputs.clone()),
        ];
        info!(channel, endpoint, "session created");
        Self::spawn(
            false,
            Wiring::Channel { sink },
            vec![Slot {
                machine: wired.machine,
                takes_media: true,
            }],
            vec![wired.view],
            pumps,
            inputs,
            inputs_rx,
            hangup,
        )
    }

    /// Two endpoints, `pc1` sending media and `pc2` receive-only, signaling
    /// each other in memory.
    pub fn loopback(factory: Arc<dyn TransportFactory>, settings: SessionSettings) -> Self {
        let (hangup, _) = watch::channel(0u64);
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (to_callee, callee_inbox) = DirectSignaling::channel(LOOPBACK_CALLEE);
        let (to_caller, caller_inbox) = DirectSignaling::channel(LOOPBACK_CALLER);
        let caller = wire(LOOPBACK_CALLER, &factory, Arc::new(to_callee), &settings, &hangup);
        let callee = wire(LOOPBACK_CALLEE, &factory, Arc::new(to_caller), &settings, &hangup);

        let pumps = vec![
            pump_signals(0, caller_inbox, inputs.clone()),
            pump_signals(1, callee_inbox, inputs.clone()),
            pump_peer_events(0, caller.peer_events, inputs.clone()),
            pump_peer_events(1, callee.peer_events, inputs.clone()),
        ];
        info!("loopback session created");
        Self::spawn(
            true,
            Wiring::Loopback,
            vec![
                Slot {
                    machine: caller.machine,
                    takes_media: true,
                },
                Slot {
                    machine: callee.machine,
                    takes_media: false,
                },
            ],
            vec![caller.view, callee.view],
            pumps,
            inputs,
            inputs_rx,
            hangup,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        loopback: bool,
        wiring: Wiring,
        slots: Vec<Slot>,
        endpoints: Vec<EndpointView>,
        pumps: Vec<JoinHandle<()>>,
        inputs: mpsc::UnboundedSender<DriverInput>,
        inputs_rx: mpsc::UnboundedReceiver<DriverInput>,
        hangup: watch::Sender<u64>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let liveness = Arc::new(Mutex::new(None));
        let driver = Driver {
            wiring,
            slots,
            media: None,
            liveness: liveness.clone(),
            events: events.clone(),
            pumps,
        };
        let handle = tokio::spawn(driver.run(inputs_rx));
        Self {
            loopback,
            inputs,
            hangup,
            events,
            endpoints,
            liveness,
            driver: Mutex::new(Some(handle)),
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    /// Acquires local media and readies every endpoint. In channel mode this
    /// announces `ready` to the remote side.
    pub async fn start(
        &self,
        source: &dyn MediaSource,
        constraints: MediaConstraints,
    ) -> Result<(), SessionError> {
        let media = source.acquire(constraints).await?;
        let (reply, rx) = oneshot::channel();
        self.request(DriverInput::Start { media, reply })?;
        rx.await.map_err(|_| SessionError::DriverStopped)?
    }

    /// Starts an offer from the calling endpoint (`pc1` in loopback).
    /// Calling while a negotiation is active is ignored.
    pub async fn call(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(DriverInput::Call { reply })?;
        rx.await.map_err(|_| SessionError::DriverStopped)?
    }

    /// Closes every endpoint and releases local media. Interrupts any
    /// transport call in flight first.
    pub async fn hangup(&self) -> Result<(), SessionError> {
        self.hangup.send_modify(|epoch| *epoch += 1);
        let (reply, rx) = oneshot::channel();
        self.request(DriverInput::Hangup { reply })?;
        rx.await.map_err(|_| SessionError::DriverStopped)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.label.clone()).collect()
    }

    pub fn state(&self, endpoint: &str) -> Option<NegotiationState> {
        self.view(endpoint).map(|e| *e.state.borrow())
    }

    pub fn states(&self) -> Vec<(String, NegotiationState)> {
        self.endpoints
            .iter()
            .map(|e| (e.label.clone(), *e.state.borrow()))
            .collect()
    }

    pub fn watch_state(&self, endpoint: &str) -> Option<watch::Receiver<NegotiationState>> {
        self.view(endpoint).map(|e| e.state.clone())
    }

    /// Waits until `endpoint` reports `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, endpoint: &str, target: NegotiationState, timeout: Duration) -> bool {
        let Some(mut rx) = self.watch_state(endpoint) else {
            return false;
        };
        let wait = async move {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow() == target;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub fn monitor(&self, endpoint: &str) -> Option<Arc<CandidatePairMonitor>> {
        self.view(endpoint).map(|e| e.monitor.clone())
    }

    pub fn monitors(&self) -> Vec<Arc<CandidatePairMonitor>> {
        self.endpoints.iter().map(|e| e.monitor.clone()).collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether the media acquired by the last `start` is still held.
    pub fn media_is_live(&self) -> bool {
        self.liveness
            .lock()
            .as_ref()
            .map(MediaLiveness::is_live)
            .unwrap_or(false)
    }

    /// Hangs up if needed and stops the driver.
    pub async fn shutdown(&self) {
        self.hangup.send_modify(|epoch| *epoch += 1);
        let (reply, rx) = oneshot::channel();
        if self.request(DriverInput::Shutdown { reply: Some(reply) }).is_ok() {
            let _ = rx.await;
        }
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                debug!(error = %err, "session driver join failed");
            }
        }
    }

    fn view(&self, endpoint: &str) -> Option<&EndpointView> {
        self.endpoints.iter().find(|e| e.label == endpoint)
    }

    fn request(&self, input: DriverInput) -> Result<(), SessionError> {
        self.inputs.send(input).map_err(|_| SessionError::DriverStopped)
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.hangup.send_modify(|epoch| *epoch += 1);
        let _ = self.inputs.send(DriverInput::Shutdown { reply: None });
    }
}
