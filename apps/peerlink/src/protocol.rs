use serde::{Deserialize, Deserializer, Serialize};

/// Messages exchanged over the signaling channel.
///
/// The JSON shape is `{"type": "...", ...}` with candidate fields named as
/// browsers emit them (`sdpMid`, `sdpMLineIndex`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Ready,
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        #[serde(default)]
        candidate: Option<String>,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default, deserialize_with = "lenient_mline_index")]
        sdp_mline_index: Option<u16>,
    },
    Bye,
}

/// Any integer is accepted; one outside `0..=65535` is treated as absent so
/// the candidate itself still gets through.
fn lenient_mline_index<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.and_then(|index| u16::try_from(index).ok()))
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Ready => "ready",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Bye => "bye",
        }
    }

    pub fn candidate(candidate: &IceCandidate) -> Self {
        match candidate {
            IceCandidate::Candidate(init) => SignalingMessage::Candidate {
                candidate: Some(init.candidate.clone()),
                sdp_mid: init.sdp_mid.clone(),
                sdp_mline_index: init.sdp_mline_index,
            },
            IceCandidate::EndOfCandidates => SignalingMessage::Candidate {
                candidate: None,
                sdp_mid: None,
                sdp_mline_index: None,
            },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// A trickled candidate, or the marker that no more will follow for the
/// current description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceCandidate {
    Candidate(CandidateInit),
    EndOfCandidates,
}

impl IceCandidate {
    /// An absent or empty candidate string is end-of-candidates.
    pub fn from_wire(
        candidate: Option<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        match candidate {
            Some(candidate) if !candidate.is_empty() => IceCandidate::Candidate(CandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
            }),
            _ => IceCandidate::EndOfCandidates,
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        matches!(self, IceCandidate::EndOfCandidates)
    }

    pub fn describe(&self) -> &str {
        match self {
            IceCandidate::Candidate(init) => &init.candidate,
            IceCandidate::EndOfCandidates => "(null)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_wire_shape_uses_browser_field_names() {
        let message = SignalingMessage::Candidate {
            candidate: Some("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into()),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "candidate");
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
    }

    #[test]
    fn null_candidate_decodes_as_end_of_candidates() {
        let decoded: SignalingMessage =
            serde_json::from_value(json!({"type": "candidate", "candidate": null}))
                .expect("decode");
        let SignalingMessage::Candidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } = decoded
        else {
            panic!("expected candidate message");
        };
        assert!(IceCandidate::from_wire(candidate, sdp_mid, sdp_mline_index).is_end_of_candidates());
    }

    #[test]
    fn empty_candidate_string_is_end_of_candidates() {
        let parsed = IceCandidate::from_wire(Some(String::new()), Some("0".into()), Some(0));
        assert_eq!(parsed, IceCandidate::EndOfCandidates);
    }

    #[test]
    fn bare_control_messages_decode() {
        let ready = SignalingMessage::decode(br#"{"type":"ready"}"#).expect("ready");
        assert_eq!(ready, SignalingMessage::Ready);
        let bye = SignalingMessage::decode(br#"{"type":"bye"}"#).expect("bye");
        assert_eq!(bye.kind(), "bye");
    }

    #[test]
    fn offer_sdp_is_passed_through_untouched() {
        let sdp = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n";
        let encoded = SignalingMessage::Offer { sdp: sdp.into() }
            .encode()
            .expect("encode");
        match SignalingMessage::decode(&encoded).expect("decode") {
            SignalingMessage::Offer { sdp: decoded } => assert_eq!(decoded, sdp),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn out_of_range_mline_index_keeps_the_candidate() {
        for index in [json!(-1), json!(70000)] {
            let decoded: SignalingMessage = serde_json::from_value(json!({
                "type": "candidate",
                "candidate": "candidate:1 1 udp 1 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": index,
            }))
            .expect("decode");
            assert_eq!(
                decoded,
                SignalingMessage::Candidate {
                    candidate: Some("candidate:1 1 udp 1 10.0.0.2 50000 typ host".into()),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: None,
                }
            );
        }

        let decoded = SignalingMessage::decode(br#"{"type":"candidate","candidate":"c","sdpMLineIndex":null}"#)
            .expect("decode");
        assert!(matches!(decoded, SignalingMessage::Candidate { sdp_mline_index: None, .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(SignalingMessage::decode(br#"{"type":"renegotiate"}"#).is_err());
    }
}
