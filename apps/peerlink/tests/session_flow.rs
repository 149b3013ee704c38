use std::sync::Arc;
use std::time::Duration;

use signal_bus::LocalBus;
use tokio::time::{Instant, sleep};

use peerlink_core::media::{DeniedMediaSource, MediaConstraints, MediaError, SyntheticMediaSource};
use peerlink_core::negotiation::NegotiationState;
use peerlink_core::path::{Decision, PathEventKind, PairState, ProposalPolicy};
use peerlink_core::protocol::{CandidateInit, IceCandidate, SignalingMessage};
use peerlink_core::session::{SessionError, SessionEvent, SessionOrchestrator, SessionSettings};
use peerlink_core::signaling::{BusSignaling, SignalSubscription, SignalingSink};
use peerlink_core::transport::mock::{
    MockTransportFactory, OP_ADD_CANDIDATE, OP_CREATE_ANSWER, OP_SET_LOCAL, OP_SET_REMOTE,
};

const SETTLE: Duration = Duration::from_secs(3);

fn settings(policy: ProposalPolicy) -> SessionSettings {
    SessionSettings {
        policy,
        ..SessionSettings::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + SETTLE;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn started_loopback(factory: &Arc<MockTransportFactory>, policy: ProposalPolicy) -> SessionOrchestrator {
    let session = SessionOrchestrator::loopback(factory.clone(), settings(policy));
    session
        .start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("start");
    session
}

async fn next_answer(subscription: &mut SignalSubscription) -> String {
    loop {
        match tokio::time::timeout(SETTLE, subscription.recv()).await {
            Ok(Some(SignalingMessage::Answer { sdp })) => return sdp,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("subscription closed"),
            Err(_) => panic!("no answer received"),
        }
    }
}

fn host_candidate(candidate: &str) -> SignalingMessage {
    SignalingMessage::candidate(&IceCandidate::Candidate(CandidateInit {
        candidate: candidate.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }))
}

#[test_timeout::tokio_timeout_test(15)]
async fn loopback_reaches_stable_on_both_sides() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = started_loopback(&factory, ProposalPolicy::accept_all()).await;
    session.call().await.expect("call");

    assert!(session.wait_for_state("pc1", NegotiationState::Stable, SETTLE).await);
    assert!(session.wait_for_state("pc2", NegotiationState::Stable, SETTLE).await);

    let pc1 = factory.latest("pc1").expect("pc1 peer");
    let pc2 = factory.latest("pc2").expect("pc2 peer");
    assert_eq!(pc1.media_tracks(), 2);
    assert_eq!(pc2.media_tracks(), 0);
    assert_eq!(pc2.remote_description(), pc1.local_description());
    assert_eq!(pc1.remote_description(), pc2.local_description());

    // Each side ends with the other's host candidate plus end-of-candidates.
    eventually("pc2 candidates", || pc2.applied_candidates().len() == 2).await;
    eventually("pc1 candidates", || pc1.applied_candidates().len() == 2).await;
    assert_eq!(pc2.applied_candidates()[1], IceCandidate::EndOfCandidates);
    assert!(matches!(&pc1.applied_candidates()[0], IceCandidate::Candidate(init) if init.candidate.contains("typ host")));

    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn call_while_active_is_ignored() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = started_loopback(&factory, ProposalPolicy::accept_all()).await;
    session.call().await.expect("call");
    assert!(session.wait_for_state("pc2", NegotiationState::Stable, SETTLE).await);

    session.call().await.expect("second call is a no-op");
    assert_eq!(factory.peers_for("pc1").len(), 1);
    assert_eq!(session.state("pc1"), Some(NegotiationState::Stable));
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn call_requires_start() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = SessionOrchestrator::loopback(factory.clone(), SessionSettings::default());
    assert!(matches!(session.call().await, Err(SessionError::NotStarted)));
    assert!(factory.peers().is_empty());
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn denied_media_never_starts_the_session() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = SessionOrchestrator::loopback(factory.clone(), SessionSettings::default());
    let err = session
        .start(&DeniedMediaSource, MediaConstraints::default())
        .await
        .expect_err("denied");
    assert!(matches!(err, SessionError::Media(MediaError::Denied(_))));
    assert!(!session.media_is_live());
    assert!(matches!(session.call().await, Err(SessionError::NotStarted)));
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn second_start_is_rejected() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = started_loopback(&factory, ProposalPolicy::accept_all()).await;
    let again = session
        .start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await;
    assert!(matches!(again, Err(SessionError::AlreadyStarted)));
    assert!(session.media_is_live());
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn hangup_closes_everything_and_releases_media() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = started_loopback(&factory, ProposalPolicy::accept_all()).await;
    let mut events = session.subscribe_events();
    session.call().await.expect("call");
    assert!(session.wait_for_state("pc2", NegotiationState::Stable, SETTLE).await);
    assert!(session.media_is_live());

    session.hangup().await.expect("hangup");

    for (endpoint, state) in session.states() {
        assert_eq!(state, NegotiationState::Closed, "{endpoint}");
    }
    assert!(factory.peers().iter().all(|peer| peer.is_closed()));
    assert!(session.monitors().iter().all(|monitor| monitor.is_frozen()));
    assert!(!session.media_is_live());
    loop {
        match events.recv().await.expect("event") {
            SessionEvent::HungUp { remote } => {
                assert!(!remote);
                break;
            }
            _ => continue,
        }
    }
    assert!(matches!(session.call().await, Err(SessionError::NotStarted)));
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn hangup_interrupts_a_suspended_operation() {
    let factory = Arc::new(MockTransportFactory::new());
    factory.delay_remote_description(Duration::from_secs(30));
    let session = started_loopback(&factory, ProposalPolicy::accept_all()).await;
    session.call().await.expect("call");
    eventually("pc2 peer", || factory.latest("pc2").is_some()).await;
    sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    session.hangup().await.expect("hangup");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state("pc1"), Some(NegotiationState::Closed));
    assert_eq!(session.state("pc2"), Some(NegotiationState::Closed));
    assert!(factory.latest("pc2").expect("pc2").is_closed());
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn session_restarts_after_hangup() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = started_loopback(&factory, ProposalPolicy::accept_all()).await;
    session.call().await.expect("call");
    assert!(session.wait_for_state("pc2", NegotiationState::Stable, SETTLE).await);
    session.hangup().await.expect("hangup");

    session
        .start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("restart");
    assert_eq!(session.state("pc1"), Some(NegotiationState::Idle));
    session.call().await.expect("call again");
    assert!(session.wait_for_state("pc2", NegotiationState::Stable, SETTLE).await);

    let peers = factory.peers_for("pc1");
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[1].generation(), 2);
    assert!(peers[0].is_closed());
    assert!(!peers[1].is_closed());
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn failed_answer_closes_the_responder() {
    let factory = Arc::new(MockTransportFactory::new());
    factory.fail("pc2", OP_CREATE_ANSWER);
    let session = started_loopback(&factory, ProposalPolicy::accept_all()).await;
    let mut events = session.subscribe_events();
    session.call().await.expect("call");

    assert!(session.wait_for_state("pc2", NegotiationState::Closed, SETTLE).await);
    assert_eq!(session.state("pc1"), Some(NegotiationState::LocalOfferSet));
    loop {
        if let SessionEvent::NegotiationFailed { endpoint, error } = events.recv().await.expect("event") {
            assert_eq!(endpoint, "pc2");
            assert!(error.contains("createAnswer"), "{error}");
            break;
        }
    }
    assert!(session.media_is_live());
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn loopback_prune_veto_keeps_pairs() {
    let factory = Arc::new(MockTransportFactory::new());
    let session = started_loopback(&factory, ProposalPolicy::preserve_pairs()).await;
    session.call().await.expect("call");
    assert!(session.wait_for_state("pc1", NegotiationState::Stable, SETTLE).await);

    let controller = factory.latest("pc1").expect("pc1").controller();
    assert!(controller.is_attached());
    controller.pair_added("p1");
    controller.pair_switch("p1");
    assert_eq!(controller.propose(PathEventKind::PruneProposal, "p1"), Some(Decision::Vetoed));
    assert_eq!(controller.propose(PathEventKind::PingProposal, "p1"), Some(Decision::Accepted));

    let monitor = session.monitor("pc1").expect("monitor");
    assert_eq!(monitor.count(PathEventKind::PruneProposal), 1);
    assert_eq!(monitor.count(PathEventKind::PairDestroyed), 0);
    assert_eq!(monitor.active_pair().as_deref(), Some("p1"));
    assert_eq!(monitor.pair("p1").map(|pair| pair.state), Some(PairState::Active));

    session.hangup().await.expect("hangup");
    assert!(!controller.is_attached());
    assert!(controller.pair_report("p1").is_none());
    assert_eq!(monitor.count(PathEventKind::PairReport), 0);
    session.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn channel_peers_negotiate_over_the_bus() {
    let bus = Arc::new(LocalBus::new());
    let factory = Arc::new(MockTransportFactory::new());
    let alice = SessionOrchestrator::channel(factory.clone(), SessionSettings::default(), bus.clone(), "room", "alice");
    alice
        .start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("alice start");

    let bob = SessionOrchestrator::channel(factory.clone(), SessionSettings::default(), bus.clone(), "room", "bob");
    let mut alice_events = alice.subscribe_events();
    bob.start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("bob start");

    // Bob's `ready` prompts alice to offer.
    assert!(alice.wait_for_state("alice", NegotiationState::Stable, SETTLE).await);
    assert!(bob.wait_for_state("bob", NegotiationState::Stable, SETTLE).await);
    let offer = factory.latest("alice").expect("alice").local_description();
    assert_eq!(factory.latest("bob").expect("bob").remote_description(), offer);
    assert_eq!(factory.latest("bob").expect("bob").media_tracks(), 2);

    bob.hangup().await.expect("bob hangup");
    assert!(alice.wait_for_state("alice", NegotiationState::Closed, SETTLE).await);
    eventually("alice media release", || !alice.media_is_live()).await;
    loop {
        if let SessionEvent::HungUp { remote } = alice_events.recv().await.expect("event") {
            assert!(remote);
            break;
        }
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn channel_drops_signals_before_start() {
    let bus = Arc::new(LocalBus::new());
    let factory = Arc::new(MockTransportFactory::new());
    let bob = SessionOrchestrator::channel(factory.clone(), SessionSettings::default(), bus.clone(), "room", "bob");
    let dave = BusSignaling::new(bus.clone(), "room", "dave");

    dave.send(&SignalingMessage::Offer { sdp: "offer:dave".into() })
        .expect("publish");
    sleep(Duration::from_millis(100)).await;
    assert!(factory.peers_for("bob").is_empty());
    assert_eq!(bob.state("bob"), Some(NegotiationState::Idle));

    // Dropped, not queued: starting later does not replay it.
    bob.start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("start");
    sleep(Duration::from_millis(100)).await;
    assert!(factory.peers_for("bob").is_empty());
    bob.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn early_candidate_is_applied_once_after_the_offer() {
    let bus = Arc::new(LocalBus::new());
    let factory = Arc::new(MockTransportFactory::new());
    let bob = SessionOrchestrator::channel(factory.clone(), SessionSettings::default(), bus.clone(), "room", "bob");
    let carol = BusSignaling::new(bus.clone(), "room", "carol");
    let mut carol_inbox = carol.subscribe();
    bob.start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("start");

    let early = "candidate:7 1 udp 2122260223 10.0.0.7 40007 typ host";
    carol.send(&host_candidate(early)).expect("candidate");
    carol
        .send(&SignalingMessage::Offer { sdp: "offer:carol:1:1".into() })
        .expect("offer");

    assert!(bob.wait_for_state("bob", NegotiationState::Stable, SETTLE).await);
    let answer = next_answer(&mut carol_inbox).await;
    assert!(answer.starts_with("answer:bob"));

    let peer = factory.latest("bob").expect("bob");
    let applied: Vec<_> = peer
        .applied_candidates()
        .into_iter()
        .filter(|c| matches!(c, IceCandidate::Candidate(init) if init.candidate == early))
        .collect();
    assert_eq!(applied.len(), 1);
    bob.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn stray_answer_is_reported_as_protocol_error() {
    let bus = Arc::new(LocalBus::new());
    let factory = Arc::new(MockTransportFactory::new());
    let bob = SessionOrchestrator::channel(factory.clone(), SessionSettings::default(), bus.clone(), "room", "bob");
    let mut events = bob.subscribe_events();
    bob.start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("start");

    let carol = BusSignaling::new(bus, "room", "carol");
    carol
        .send(&SignalingMessage::Answer { sdp: "answer:carol".into() })
        .expect("answer");

    loop {
        if let SessionEvent::ProtocolError { endpoint, .. } = events.recv().await.expect("event") {
            assert_eq!(endpoint, "bob");
            break;
        }
    }
    assert_eq!(bob.state("bob"), Some(NegotiationState::Idle));
    assert!(factory.peers_for("bob").is_empty());
    bob.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn signals_during_a_suspended_offer_wait_for_it() {
    let bus = Arc::new(LocalBus::new());
    let factory = Arc::new(MockTransportFactory::new());
    factory.delay_remote_description(Duration::from_millis(300));
    let bob = SessionOrchestrator::channel(factory.clone(), SessionSettings::default(), bus.clone(), "room", "bob");
    bob.start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("start");

    let carol = BusSignaling::new(bus, "room", "carol");
    carol
        .send(&SignalingMessage::Offer { sdp: "offer:carol:1:1".into() })
        .expect("offer");
    eventually("bob peer", || factory.latest("bob").is_some()).await;
    let late = "candidate:9 1 udp 2122260223 10.0.0.9 40009 typ host";
    carol.send(&host_candidate(late)).expect("candidate");
    carol.send(&SignalingMessage::Bye).expect("bye");

    assert!(bob.wait_for_state("bob", NegotiationState::Closed, SETTLE).await);
    let peer = factory.latest("bob").expect("bob");
    assert_eq!(
        peer.calls(),
        vec![OP_SET_REMOTE, OP_CREATE_ANSWER, OP_SET_LOCAL, OP_ADD_CANDIDATE, "close"]
    );
    let applied: Vec<_> = peer
        .applied_candidates()
        .into_iter()
        .filter(|c| matches!(c, IceCandidate::Candidate(init) if init.candidate == late))
        .collect();
    assert_eq!(applied.len(), 1);
    assert!(peer.is_closed());
    eventually("media release", || !bob.media_is_live()).await;
    bob.shutdown().await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn bye_without_a_session_is_ignored() {
    let bus = Arc::new(LocalBus::new());
    let factory = Arc::new(MockTransportFactory::new());
    let bob = SessionOrchestrator::channel(factory.clone(), SessionSettings::default(), bus.clone(), "room", "bob");
    let mut events = bob.subscribe_events();
    bob.start(&SyntheticMediaSource::default(), MediaConstraints::default())
        .await
        .expect("start");

    let carol = BusSignaling::new(bus, "room", "carol");
    carol.send(&SignalingMessage::Bye).expect("bye");
    sleep(Duration::from_millis(100)).await;

    assert_eq!(bob.state("bob"), Some(NegotiationState::Idle));
    assert!(bob.media_is_live());
    assert!(events.try_recv().is_err());

    // Still started, so a real offer is answered.
    carol
        .send(&SignalingMessage::Offer { sdp: "offer:carol:1:1".into() })
        .expect("offer");
    assert!(bob.wait_for_state("bob", NegotiationState::Stable, SETTLE).await);
    bob.shutdown().await;
}
