//! Event-sourced ledger of candidate pairs for one endpoint.
//!
//! The monitor is written only from path controller callbacks and read by
//! diagnostics. Every event belongs to a session generation; once that
//! session is frozen (or a newer one begins) late events are ignored.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::{Decision, PathEvent, PathEventKind, PathObserver};
use crate::metrics;

const MAX_TIMELINE: usize = 4096;

/// How the monitor answers controller proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProposalPolicy {
    pub ping: Decision,
    pub switch: Decision,
    pub prune: Decision,
}

impl ProposalPolicy {
    pub fn accept_all() -> Self {
        Self {
            ping: Decision::Accepted,
            switch: Decision::Accepted,
            prune: Decision::Accepted,
        }
    }

    /// Vetoes pruning so every pair stays visible for inspection.
    pub fn preserve_pairs() -> Self {
        Self {
            prune: Decision::Vetoed,
            ..Self::accept_all()
        }
    }

    pub fn decide(&self, kind: PathEventKind) -> Decision {
        match kind {
            PathEventKind::PingProposal => self.ping,
            PathEventKind::SwitchProposal => self.switch,
            PathEventKind::PruneProposal => self.prune,
            _ => Decision::Accepted,
        }
    }
}

impl Default for ProposalPolicy {
    fn default() -> Self {
        Self::accept_all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PairState {
    Added,
    Reported,
    Active,
    Destroyed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePairRecord {
    pub pair_id: String,
    pub state: PairState,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub destroyed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_report_at: Option<OffsetDateTime>,
    pub reports: u64,
    pub last_diag: String,
}

impl CandidatePairRecord {
    fn new(pair_id: &str, diag: &str, now: OffsetDateTime) -> Self {
        Self {
            pair_id: pair_id.to_string(),
            state: PairState::Added,
            added_at: now,
            destroyed_at: None,
            last_report_at: None,
            reports: 0,
            last_diag: diag.to_string(),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == PairState::Destroyed
    }

    fn resting_state(&self) -> PairState {
        if self.last_report_at.is_some() {
            PairState::Reported
        } else {
            PairState::Added
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub kind: PathEventKind,
    pub pair_id: String,
    pub diag: String,
    /// Whether the event changed the ledger.
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub endpoint: String,
    pub session: u64,
    pub frozen: bool,
    pub counts: BTreeMap<PathEventKind, u64>,
    pub active_pair: Option<String>,
    pub pairs: Vec<CandidatePairRecord>,
    pub timeline_len: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    session: u64,
    live: bool,
    counts: BTreeMap<PathEventKind, u64>,
    pairs: HashMap<String, CandidatePairRecord>,
    order: Vec<String>,
    active: Option<String>,
    timeline: VecDeque<TimelineEntry>,
    next_seq: u64,
}

impl Ledger {
    fn fresh(session: u64) -> Self {
        Self {
            session,
            live: true,
            counts: PathEventKind::ALL.into_iter().map(|kind| (kind, 0)).collect(),
            ..Self::default()
        }
    }

    fn note(&mut self, event: &PathEvent, applied: bool, decision: Option<Decision>, now: OffsetDateTime) {
        *self.counts.entry(event.kind).or_insert(0) += 1;
        self.next_seq += 1;
        if self.timeline.len() == MAX_TIMELINE {
            self.timeline.pop_front();
        }
        self.timeline.push_back(TimelineEntry {
            seq: self.next_seq,
            at: now,
            kind: event.kind,
            pair_id: event.pair_id.clone(),
            diag: event.diag.clone(),
            applied,
            decision,
        });
    }
}

pub struct CandidatePairMonitor {
    endpoint: String,
    policy: RwLock<ProposalPolicy>,
    ledger: Mutex<Ledger>,
}

impl CandidatePairMonitor {
    pub fn new(endpoint: impl Into<String>, policy: ProposalPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy: RwLock::new(policy),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn policy(&self) -> ProposalPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: ProposalPolicy) {
        *self.policy.write() = policy;
    }

    /// Clears all records and starts accepting events for `session`.
    pub fn begin_session(&self, session: u64) {
        *self.ledger.lock() = Ledger::fresh(session);
        debug!(endpoint = %self.endpoint, session, "pair ledger reset");
    }

    /// Stops accepting events; records stay readable.
    pub fn freeze(&self) {
        let mut ledger = self.ledger.lock();
        if ledger.live {
            ledger.live = false;
            debug!(
                endpoint = %self.endpoint,
                session = ledger.session,
                pairs = ledger.pairs.len(),
                "pair ledger frozen"
            );
        }
    }

    pub fn is_frozen(&self) -> bool {
        !self.ledger.lock().live
    }

    pub fn observer(self: &Arc<Self>, session: u64) -> Arc<dyn PathObserver> {
        Arc::new(SessionObserver {
            monitor: Arc::clone(self),
            session,
        })
    }

    /// Single entry point for controller events of one session.
    pub fn handle(&self, session: u64, event: &PathEvent) -> Decision {
        let mut ledger = self.ledger.lock();
        if !ledger.live || ledger.session != session {
            debug!(
                endpoint = %self.endpoint,
                session,
                kind = %event.kind,
                pair = %event.pair_id,
                "path event for inactive session ignored"
            );
            return Decision::Accepted;
        }
        metrics::PATH_EVENTS.with_label_values(&[event.kind.as_str()]).inc();
        let now = OffsetDateTime::now_utc();
        match event.kind {
            PathEventKind::PairAdded => {
                let applied = self.pair_added(&mut ledger, event, now);
                ledger.note(event, applied, None, now);
                Decision::Accepted
            }
            PathEventKind::PairReport => {
                let applied = self.pair_report(&mut ledger, event, now);
                ledger.note(event, applied, None, now);
                Decision::Accepted
            }
            PathEventKind::PairSwitch => {
                let applied = self.pair_switch(&mut ledger, event);
                ledger.note(event, applied, None, now);
                Decision::Accepted
            }
            PathEventKind::PairDestroyed => {
                let applied = self.pair_destroyed(&mut ledger, event, now);
                ledger.note(event, applied, None, now);
                Decision::Accepted
            }
            kind => {
                let decision = self.policy.read().decide(kind);
                info!(
                    endpoint = %self.endpoint,
                    kind = %kind,
                    pair = %event.pair_id,
                    decision = decision.as_str(),
                    "proposal: [{}]",
                    event.diag
                );
                metrics::PROPOSAL_DECISIONS
                    .with_label_values(&[kind.as_str(), decision.as_str()])
                    .inc();
                ledger.note(event, true, Some(decision), now);
                decision
            }
        }
    }

    pub fn on_pair_added(&self, pair_id: &str, diag: &str) {
        self.apply_current(PathEvent::new(PathEventKind::PairAdded, pair_id, diag));
    }

    pub fn on_pair_report(&self, pair_id: &str, diag: &str) {
        self.apply_current(PathEvent::new(PathEventKind::PairReport, pair_id, diag));
    }

    pub fn on_pair_switch(&self, pair_id: &str, diag: &str) {
        self.apply_current(PathEvent::new(PathEventKind::PairSwitch, pair_id, diag));
    }

    pub fn on_pair_destroyed(&self, pair_id: &str, diag: &str) {
        self.apply_current(PathEvent::new(PathEventKind::PairDestroyed, pair_id, diag));
    }

    pub fn on_proposal(&self, kind: PathEventKind, pair_id: &str, diag: &str) -> Decision {
        self.apply_current(PathEvent::new(kind, pair_id, diag))
    }

    fn apply_current(&self, event: PathEvent) -> Decision {
        let session = self.ledger.lock().session;
        self.handle(session, &event)
    }

    fn pair_added(&self, ledger: &mut Ledger, event: &PathEvent, now: OffsetDateTime) -> bool {
        if ledger.pairs.contains_key(&event.pair_id) {
            warn!(endpoint = %self.endpoint, pair = %event.pair_id, "duplicate pair added; ignoring");
            return false;
        }
        info!(endpoint = %self.endpoint, pair = %event.pair_id, "pair added: [{}]", event.diag);
        ledger
            .pairs
            .insert(event.pair_id.clone(), CandidatePairRecord::new(&event.pair_id, &event.diag, now));
        ledger.order.push(event.pair_id.clone());
        true
    }

    fn pair_report(&self, ledger: &mut Ledger, event: &PathEvent, now: OffsetDateTime) -> bool {
        let Some(record) = ledger.pairs.get_mut(&event.pair_id) else {
            debug!(endpoint = %self.endpoint, pair = %event.pair_id, "report for unknown pair");
            return false;
        };
        if record.is_destroyed() {
            return false;
        }
        debug!(endpoint = %self.endpoint, pair = %event.pair_id, "pair report: [{}]", event.diag);
        record.last_report_at = Some(now);
        record.reports += 1;
        record.last_diag = event.diag.clone();
        if record.state == PairState::Added {
            record.state = PairState::Reported;
        }
        true
    }

    fn pair_switch(&self, ledger: &mut Ledger, event: &PathEvent) -> bool {
        match ledger.pairs.get(&event.pair_id) {
            Some(record) if !record.is_destroyed() => {}
            _ => {
                debug!(endpoint = %self.endpoint, pair = %event.pair_id, "switch to unknown or destroyed pair");
                return false;
            }
        }
        if let Some(previous) = ledger.active.take() {
            if previous != event.pair_id {
                if let Some(record) = ledger.pairs.get_mut(&previous) {
                    record.state = record.resting_state();
                }
            }
        }
        if let Some(record) = ledger.pairs.get_mut(&event.pair_id) {
            record.state = PairState::Active;
            record.last_diag = event.diag.clone();
        }
        ledger.active = Some(event.pair_id.clone());
        info!(endpoint = %self.endpoint, pair = %event.pair_id, "pair switch: [{}]", event.diag);
        true
    }

    fn pair_destroyed(&self, ledger: &mut Ledger, event: &PathEvent, now: OffsetDateTime) -> bool {
        let Some(record) = ledger.pairs.get_mut(&event.pair_id) else {
            debug!(endpoint = %self.endpoint, pair = %event.pair_id, "destroy for unknown pair");
            return false;
        };
        if record.is_destroyed() {
            return false;
        }
        record.state = PairState::Destroyed;
        record.destroyed_at = Some(now);
        record.last_diag = event.diag.clone();
        if ledger.active.as_deref() == Some(event.pair_id.as_str()) {
            ledger.active = None;
        }
        info!(endpoint = %self.endpoint, pair = %event.pair_id, "pair destroyed: [{}]", event.diag);
        true
    }

    pub fn count(&self, kind: PathEventKind) -> u64 {
        self.ledger.lock().counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> BTreeMap<PathEventKind, u64> {
        let ledger = self.ledger.lock();
        PathEventKind::ALL
            .into_iter()
            .map(|kind| (kind, ledger.counts.get(&kind).copied().unwrap_or(0)))
            .collect()
    }

    pub fn pair(&self, pair_id: &str) -> Option<CandidatePairRecord> {
        self.ledger.lock().pairs.get(pair_id).cloned()
    }

    /// Records in the order their pairs were first added.
    pub fn pairs(&self) -> Vec<CandidatePairRecord> {
        let ledger = self.ledger.lock();
        ledger
            .order
            .iter()
            .filter_map(|id| ledger.pairs.get(id).cloned())
            .collect()
    }

    pub fn active_pair(&self) -> Option<String> {
        self.ledger.lock().active.clone()
    }

    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.ledger.lock().timeline.iter().cloned().collect()
    }

    pub fn timeline_for(&self, pair_id: &str) -> Vec<TimelineEntry> {
        self.ledger
            .lock()
            .timeline
            .iter()
            .filter(|entry| entry.pair_id == pair_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let counts = self.counts();
        let pairs = self.pairs();
        let ledger = self.ledger.lock();
        MonitorSnapshot {
            endpoint: self.endpoint.clone(),
            session: ledger.session,
            frozen: !ledger.live,
            counts,
            active_pair: ledger.active.clone(),
            pairs,
            timeline_len: ledger.timeline.len(),
        }
    }
}

struct SessionObserver {
    monitor: Arc<CandidatePairMonitor>,
    session: u64,
}

impl PathObserver for SessionObserver {
    fn observe(&self, event: &PathEvent) -> Decision {
        self.monitor.handle(self.session, event)
    }
}
