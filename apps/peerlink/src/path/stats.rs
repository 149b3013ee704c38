use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use super::{PathController, PathEvent, PathEventKind, PathObserver};

/// Derives pair lifecycle events by diffing periodic candidate-pair stats.
///
/// The engine picks and prunes pairs on its own, so this controller only
/// reports what already happened and never raises proposals.
pub struct StatsPathController {
    name: String,
    peer: Arc<RTCPeerConnection>,
    interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl StatsPathController {
    pub fn new(name: impl Into<String>, peer: Arc<RTCPeerConnection>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            peer,
            interval,
            poller: Mutex::new(None),
        }
    }
}

impl PathController for StatsPathController {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, observer: Arc<dyn PathObserver>) {
        let peer = Arc::clone(&self.peer);
        let interval = self.interval;
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut tracker = PairTracker::default();
            loop {
                ticker.tick().await;
                let report = peer.get_stats().await;
                let samples = report.reports.values().filter_map(|entry| match entry {
                    StatsReportType::CandidatePair(pair) => Some(PairSample {
                        id: pair.id.clone(),
                        local: pair.local_candidate_id.clone(),
                        remote: pair.remote_candidate_id.clone(),
                        nominated: pair.nominated,
                        bytes_sent: pair.bytes_sent,
                        bytes_received: pair.bytes_received,
                        rtt_ms: pair.current_round_trip_time * 1000.0,
                    }),
                    _ => None,
                });
                let events = tracker.diff(samples);
                trace!(controller = %name, events = events.len(), "stats poll");
                for event in events {
                    observer.observe(&event);
                }
            }
        });
        if let Some(previous) = self.poller.lock().replace(handle) {
            previous.abort();
        }
        debug!(controller = %self.name, interval_ms = self.interval.as_millis() as u64, "stats polling started");
    }

    fn detach(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
            debug!(controller = %self.name, "stats polling stopped");
        }
    }
}

impl Drop for StatsPathController {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone)]
struct PairSample {
    id: String,
    local: String,
    remote: String,
    nominated: bool,
    bytes_sent: u64,
    bytes_received: u64,
    rtt_ms: f64,
}

#[derive(Debug, Default)]
struct PairTracker {
    seen: HashMap<String, (u64, u64)>,
    nominated: Option<String>,
}

impl PairTracker {
    fn diff(&mut self, samples: impl IntoIterator<Item = PairSample>) -> Vec<PathEvent> {
        let mut events = Vec::new();
        let mut current = HashMap::new();
        let mut nominated = None;

        for sample in samples {
            let counters = (sample.bytes_sent, sample.bytes_received);
            match self.seen.get(&sample.id) {
                None => events.push(PathEvent::new(
                    PathEventKind::PairAdded,
                    &sample.id,
                    format!("local={} remote={}", sample.local, sample.remote),
                )),
                Some(previous) if *previous != counters => events.push(PathEvent::new(
                    PathEventKind::PairReport,
                    &sample.id,
                    format!(
                        "rtt={:.1}ms sent={} recv={}",
                        sample.rtt_ms, sample.bytes_sent, sample.bytes_received
                    ),
                )),
                Some(_) => {}
            }
            if sample.nominated && nominated.is_none() {
                nominated = Some(sample.id.clone());
            }
            current.insert(sample.id, counters);
        }

        if let Some(id) = &nominated {
            if self.nominated.as_ref() != Some(id) {
                events.push(PathEvent::new(PathEventKind::PairSwitch, id, "nominated"));
            }
            self.nominated = nominated;
        }

        let mut gone: Vec<_> = self
            .seen
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        gone.sort();
        for id in gone {
            if self.nominated.as_ref() == Some(&id) {
                self.nominated = None;
            }
            events.push(PathEvent::new(PathEventKind::PairDestroyed, id, "no longer reported"));
        }

        self.seen = current;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, nominated: bool, sent: u64) -> PairSample {
        PairSample {
            id: id.into(),
            local: format!("{id}-l"),
            remote: format!("{id}-r"),
            nominated,
            bytes_sent: sent,
            bytes_received: 0,
            rtt_ms: 1.5,
        }
    }

    fn kinds(events: &[PathEvent]) -> Vec<(PathEventKind, &str)> {
        events.iter().map(|event| (event.kind, event.pair_id.as_str())).collect()
    }

    #[test]
    fn first_sighting_adds_and_nomination_switches() {
        let mut tracker = PairTracker::default();
        let events = tracker.diff([sample("a", false, 0), sample("b", true, 0)]);
        assert_eq!(
            kinds(&events),
            vec![
                (PathEventKind::PairAdded, "a"),
                (PathEventKind::PairAdded, "b"),
                (PathEventKind::PairSwitch, "b"),
            ]
        );
    }

    #[test]
    fn counter_movement_reports_and_stable_nomination_is_quiet() {
        let mut tracker = PairTracker::default();
        tracker.diff([sample("a", true, 0)]);
        let events = tracker.diff([sample("a", true, 120)]);
        assert_eq!(kinds(&events), vec![(PathEventKind::PairReport, "a")]);
        assert!(tracker.diff([sample("a", true, 120)]).is_empty());
    }

    #[test]
    fn vanished_pair_is_destroyed() {
        let mut tracker = PairTracker::default();
        tracker.diff([sample("a", false, 0), sample("b", true, 0)]);
        let events = tracker.diff([sample("a", true, 0)]);
        assert_eq!(
            kinds(&events),
            vec![(PathEventKind::PairSwitch, "a"), (PathEventKind::PairDestroyed, "b")]
        );
    }
}
