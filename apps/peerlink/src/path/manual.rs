use std::sync::Arc;

use parking_lot::Mutex;

use super::{Decision, PathController, PathEvent, PathEventKind, PathObserver};

/// Controller driven by hand, for scripted scenarios and tests.
///
/// Proposals follow controller semantics: the observer is asked first and
/// only an accepted switch or prune is carried out, which then surfaces as
/// the matching lifecycle event. An accepted ping has no visible effect.
pub struct ManualPathController {
    name: String,
    observer: Mutex<Option<Arc<dyn PathObserver>>>,
}

impl ManualPathController {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            observer: Mutex::new(None),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.observer.lock().is_some()
    }

    /// Dispatches one event. Returns `None` when nobody is attached.
    pub fn emit(&self, kind: PathEventKind, pair_id: &str, diag: &str) -> Option<Decision> {
        let observer = self.observer.lock().clone()?;
        let event = PathEvent::new(kind, pair_id, diag);
        let decision = observer.observe(&event);
        if kind.is_proposal() && decision == Decision::Accepted {
            let follow_up = match kind {
                PathEventKind::SwitchProposal => Some(PathEventKind::PairSwitch),
                PathEventKind::PruneProposal => Some(PathEventKind::PairDestroyed),
                _ => None,
            };
            if let Some(follow_up) = follow_up {
                observer.observe(&PathEvent::new(follow_up, pair_id, diag));
            }
        }
        Some(decision)
    }

    pub fn pair_added(&self, pair_id: &str) -> Option<Decision> {
        self.emit(PathEventKind::PairAdded, pair_id, &format!("added {pair_id}"))
    }

    pub fn pair_report(&self, pair_id: &str) -> Option<Decision> {
        self.emit(PathEventKind::PairReport, pair_id, &format!("report {pair_id}"))
    }

    pub fn pair_switch(&self, pair_id: &str) -> Option<Decision> {
        self.emit(PathEventKind::PairSwitch, pair_id, &format!("switch {pair_id}"))
    }

    pub fn pair_destroyed(&self, pair_id: &str) -> Option<Decision> {
        self.emit(PathEventKind::PairDestroyed, pair_id, &format!("destroyed {pair_id}"))
    }

    pub fn propose(&self, kind: PathEventKind, pair_id: &str) -> Option<Decision> {
        self.emit(kind, pair_id, &format!("{kind} {pair_id}"))
    }
}

impl PathController for ManualPathController {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, observer: Arc<dyn PathObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn detach(&self) {
        self.observer.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{CandidatePairMonitor, PairState, ProposalPolicy};

    fn attached(policy: ProposalPolicy) -> (ManualPathController, Arc<CandidatePairMonitor>) {
        let monitor = Arc::new(CandidatePairMonitor::new("pc1", policy));
        monitor.begin_session(7);
        let controller = ManualPathController::new("manual");
        controller.attach(monitor.observer(7));
        (controller, monitor)
    }

    #[test]
    fn detached_controller_emits_nothing() {
        let controller = ManualPathController::new("manual");
        assert_eq!(controller.pair_added("p1"), None);
    }

    #[test]
    fn accepted_prune_destroys_the_pair() {
        let (controller, monitor) = attached(ProposalPolicy::accept_all());
        controller.pair_added("p1");
        let decision = controller.propose(PathEventKind::PruneProposal, "p1");
        assert_eq!(decision, Some(Decision::Accepted));
        assert_eq!(monitor.pair("p1").expect("record").state, PairState::Destroyed);
    }

    #[test]
    fn vetoed_prune_keeps_the_pair() {
        let (controller, monitor) = attached(ProposalPolicy::preserve_pairs());
        controller.pair_added("p1");
        let decision = controller.propose(PathEventKind::PruneProposal, "p1");
        assert_eq!(decision, Some(Decision::Vetoed));
        assert_eq!(monitor.pair("p1").expect("record").state, PairState::Added);
        assert_eq!(monitor.count(PathEventKind::PruneProposal), 1);
        assert_eq!(monitor.count(PathEventKind::PairDestroyed), 0);
    }

    #[test]
    fn accepted_switch_activates_the_pair() {
        let (controller, monitor) = attached(ProposalPolicy::accept_all());
        controller.pair_added("p1");
        controller.propose(PathEventKind::SwitchProposal, "p1");
        assert_eq!(monitor.active_pair().as_deref(), Some("p1"));
    }
}
