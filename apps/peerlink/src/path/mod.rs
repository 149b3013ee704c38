//! Transport-path (candidate pair) events.
//!
//! A [`PathController`] is an optional capability of the connectivity
//! engine. When present it reports candidate-pair lifecycle events and
//! asks an observer before acting on ping/switch/prune proposals. When it
//! is absent nothing is reported and the engine keeps its default path
//! selection.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod manual;
pub mod monitor;
pub mod stats;

pub use manual::ManualPathController;
pub use monitor::{CandidatePairMonitor, CandidatePairRecord, MonitorSnapshot, PairState, ProposalPolicy};
pub use stats::StatsPathController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathEventKind {
    #[serde(rename = "candidatepairadded")]
    PairAdded,
    #[serde(rename = "candidatepairreport")]
    PairReport,
    #[serde(rename = "candidatepairswitch")]
    PairSwitch,
    #[serde(rename = "candidatepairdestroyed")]
    PairDestroyed,
    #[serde(rename = "icepingproposal")]
    PingProposal,
    #[serde(rename = "iceswitchproposal")]
    SwitchProposal,
    #[serde(rename = "icepruneproposal")]
    PruneProposal,
}

impl PathEventKind {
    pub const ALL: [PathEventKind; 7] = [
        PathEventKind::PairAdded,
        PathEventKind::PairReport,
        PathEventKind::PairSwitch,
        PathEventKind::PairDestroyed,
        PathEventKind::PingProposal,
        PathEventKind::SwitchProposal,
        PathEventKind::PruneProposal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PathEventKind::PairAdded => "candidatepairadded",
            PathEventKind::PairReport => "candidatepairreport",
            PathEventKind::PairSwitch => "candidatepairswitch",
            PathEventKind::PairDestroyed => "candidatepairdestroyed",
            PathEventKind::PingProposal => "icepingproposal",
            PathEventKind::SwitchProposal => "iceswitchproposal",
            PathEventKind::PruneProposal => "icepruneproposal",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn is_proposal(self) -> bool {
        matches!(
            self,
            PathEventKind::PingProposal | PathEventKind::SwitchProposal | PathEventKind::PruneProposal
        )
    }
}

impl fmt::Display for PathEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accepted,
    Vetoed,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::Vetoed => "vetoed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEvent {
    pub kind: PathEventKind,
    #[serde(rename = "pairId")]
    pub pair_id: String,
    /// Free-form diagnostic text from the controller.
    pub diag: String,
}

impl PathEvent {
    pub fn new(kind: PathEventKind, pair_id: impl Into<String>, diag: impl Into<String>) -> Self {
        Self {
            kind,
            pair_id: pair_id.into(),
            diag: diag.into(),
        }
    }
}

/// Receives controller events. The return value only matters for proposal
/// kinds: the controller must not act on a vetoed proposal.
pub trait PathObserver: Send + Sync {
    fn observe(&self, event: &PathEvent) -> Decision;
}

pub trait PathController: Send + Sync {
    fn name(&self) -> &str;
    fn attach(&self, observer: Arc<dyn PathObserver>);
    /// Stops event delivery. Must be idempotent.
    fn detach(&self);
}

/// Boundary between one session's controller (if any) and its observer.
pub struct PathEventSource {
    endpoint: String,
    controller: Option<Arc<dyn PathController>>,
    attached: bool,
}

impl PathEventSource {
    pub fn new(endpoint: impl Into<String>, controller: Option<Arc<dyn PathController>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            controller,
            attached: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.controller.is_some()
    }

    pub fn attach(&mut self, observer: Arc<dyn PathObserver>) {
        match &self.controller {
            Some(controller) => {
                info!(
                    endpoint = %self.endpoint,
                    controller = controller.name(),
                    "attaching path controller"
                );
                controller.attach(observer);
                self.attached = true;
            }
            None => {
                debug!(endpoint = %self.endpoint, "path controller unavailable");
            }
        }
    }

    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        if let Some(controller) = &self.controller {
            controller.detach();
            debug!(endpoint = %self.endpoint, "path controller detached");
        }
        self.attached = false;
    }
}

impl Drop for PathEventSource {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_wire_names() {
        for kind in PathEventKind::ALL {
            assert_eq!(PathEventKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(PathEventKind::parse("candidatepairexploded"), None);
    }

    #[test]
    fn only_proposals_are_defeasible() {
        let proposals: Vec<_> = PathEventKind::ALL
            .into_iter()
            .filter(|kind| kind.is_proposal())
            .collect();
        assert_eq!(
            proposals,
            vec![
                PathEventKind::PingProposal,
                PathEventKind::SwitchProposal,
                PathEventKind::PruneProposal
            ]
        );
    }

    #[test]
    fn missing_controller_degrades_silently() {
        struct Never;
        impl PathObserver for Never {
            fn observe(&self, _event: &PathEvent) -> Decision {
                panic!("no controller, no events");
            }
        }
        let mut source = PathEventSource::new("pc1", None);
        assert!(!source.is_available());
        source.attach(Arc::new(Never));
        source.detach();
    }

    #[test]
    fn source_detaches_controller_on_drop() {
        let controller = Arc::new(ManualPathController::new("manual"));
        {
            let monitor = Arc::new(CandidatePairMonitor::new("pc1", ProposalPolicy::accept_all()));
            monitor.begin_session(1);
            let mut source = PathEventSource::new("pc1", Some(controller.clone()));
            source.attach(monitor.observer(1));
            assert!(controller.is_attached());
        }
        assert!(!controller.is_attached());
    }
}
