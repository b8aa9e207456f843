use movecall::{SessionError, SignalEnvelope, SignalMessage};

#[test]
fn envelope_json_shape() {
    let envelope = SignalEnvelope::new("abc", SignalMessage::Answer { sdp: "v=0".into() });
    let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

    assert_eq!(json["sessionId"], "abc");
    assert_eq!(json["message"]["type"], "answer");
    assert_eq!(json["message"]["sdp"], "v=0");
    assert!(json["ts"].as_i64().unwrap() > 0);
}

#[test]
fn compact_form_survives_transfer() {
    let envelope = SignalEnvelope::new(
        "abc",
        SignalMessage::IceCandidate {
            candidate: "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        },
    );
    let encoded = envelope.encode_compact().unwrap();
    // Pasted text often picks up a trailing newline
    let decoded = SignalEnvelope::decode_compact(&format!("{}\n", encoded)).unwrap();
    assert_eq!(decoded, envelope);
}

#[test]
fn truncated_compact_form_is_codec_error() {
    let envelope = SignalEnvelope::new("abc", SignalMessage::Offer { sdp: "v=0".repeat(40) });
    let encoded = envelope.encode_compact().unwrap();
    let truncated = &encoded[..encoded.len() / 2];
    // Keep the base64 itself well formed
    let truncated = &truncated[..truncated.len() - truncated.len() % 4];

    assert!(matches!(
        SignalEnvelope::decode_compact(truncated),
        Err(SessionError::Codec(_))
    ));
}

#[test]
fn unknown_message_type_rejected() {
    let result = SignalEnvelope::from_json(
        r#"{"sessionId":"abc","ts":1,"message":{"type":"hangup"}}"#,
    );
    assert!(matches!(result, Err(SessionError::Codec(_))));
}
