use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    // Names and labels are compile-time constants; a failure here is a typo.
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static PATH_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "peerlink_path_events_total",
        "transport-path events observed by kind",
        &["kind"],
    )
});

pub static PROPOSAL_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "peerlink_proposal_decisions_total",
        "path-controller proposals by kind and decision",
        &["kind", "decision"],
    )
});

pub static NEGOTIATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "peerlink_negotiations_total",
        "negotiation attempts by outcome",
        &["outcome"],
    )
});

pub static SIGNALING_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "peerlink_signaling_dropped_total",
        "inbound signaling messages dropped by reason",
        &["reason"],
    )
});

/// Text exposition of every registered metric.
pub fn gather() -> Vec<u8> {
    Lazy::force(&PATH_EVENTS);
    Lazy::force(&PROPOSAL_DECISIONS);
    Lazy::force(&NEGOTIATIONS);
    Lazy::force(&SIGNALING_DROPPED);
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %err, "metrics encode error");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_lists_counters_once_touched() {
        NEGOTIATIONS.with_label_values(&["stable"]).inc();
        SIGNALING_DROPPED.with_label_values(&["not-ready"]).inc();
        let text = String::from_utf8(gather()).expect("utf8");
        assert!(text.contains("peerlink_negotiations_total{outcome=\"stable\"}"));
        assert!(text.contains("peerlink_signaling_dropped_total{reason=\"not-ready\"}"));
    }
}
