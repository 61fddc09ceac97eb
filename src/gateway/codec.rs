//! Text-frame codec for gateway envelopes.
//!
//! Frames are UTF-8 JSON objects discriminated by `type`:
//! `req`, `res`, or `event`. Unknown types decode to
//! [`Envelope::Unknown`]; only malformed JSON or a missing required field is a
//! [`DecodeError`].

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::gateway::proto::{
    Envelope, ErrorShape, GatewayEvent, RequestFrame, ResponseFrame, ResponseOutcome,
};

/// A single frame could not be decoded. Never fatal on its own.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has an unexpected type")]
    InvalidField(&'static str),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("unknown `{0}` frames cannot be encoded")]
    UnknownKind(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum Outgoing<'a> {
    #[serde(rename = "req")]
    Request(&'a RequestFrame),
    #[serde(rename = "res")]
    Response(&'a ResponseFrame),
    #[serde(rename = "event")]
    Event(&'a GatewayEvent),
}

impl Envelope {
    /// Encodes the envelope as a text frame.
    pub fn to_text(&self) -> Result<String, EncodeError> {
        let outgoing = match self {
            Envelope::Request(frame) => Outgoing::Request(frame),
            Envelope::Response(frame) => Outgoing::Response(frame),
            Envelope::Event(frame) => Outgoing::Event(frame),
            Envelope::Unknown { kind, .. } => return Err(EncodeError::UnknownKind(kind.clone())),
        };
        Ok(serde_json::to_string(&outgoing)?)
    }

    /// Decodes a text frame.
    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        let Value::Object(mut body) = serde_json::from_str::<Value>(text)? else {
            return Err(DecodeError::NotAnObject);
        };

        let kind = match body.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(DecodeError::InvalidField("type")),
            None => return Err(DecodeError::MissingField("type")),
        };

        match kind.as_str() {
            "req" => decode_request(&mut body).map(Envelope::Request),
            "res" => decode_response(&mut body).map(Envelope::Response),
            "event" => decode_event(&mut body).map(Envelope::Event),
            _ => Ok(Envelope::Unknown { kind, body }),
        }
    }
}

fn decode_request(body: &mut Map<String, Value>) -> Result<RequestFrame, DecodeError> {
    Ok(RequestFrame {
        id: take_id(body)?,
        method: take_string(body, "method")?,
        params: body.remove("params").unwrap_or(Value::Null),
    })
}

fn decode_response(body: &mut Map<String, Value>) -> Result<ResponseFrame, DecodeError> {
    let id = take_id(body)?;

    let outcome = match body.remove("error") {
        Some(Value::Null) | None => {
            let failed = matches!(body.get("ok"), Some(Value::Bool(false)));
            if failed {
                ResponseOutcome::Error(ErrorShape::new("request failed"))
            } else {
                ResponseOutcome::Payload(body.remove("payload").unwrap_or(Value::Null))
            }
        }
        Some(Value::String(message)) => ResponseOutcome::Error(ErrorShape::new(message)),
        Some(error @ Value::Object(_)) => ResponseOutcome::Error(
            serde_json::from_value(error).map_err(|_| DecodeError::InvalidField("error"))?,
        ),
        Some(_) => return Err(DecodeError::InvalidField("error")),
    };

    Ok(ResponseFrame { id, outcome })
}

fn decode_event(body: &mut Map<String, Value>) -> Result<GatewayEvent, DecodeError> {
    let name = take_string(body, "event")?;
    let payload = match body.remove("payload") {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(payload) => payload,
    };
    let seq = match body.get("seq") {
        None | Some(Value::Null) => None,
        Some(seq) => {
            let parsed = seq.as_u64();
            if parsed.is_none() {
                debug!(event = "gateway_event_seq_ignored", name = %name, seq = %seq);
            }
            parsed
        }
    };

    Ok(GatewayEvent { name, payload, seq })
}

fn take_id(body: &mut Map<String, Value>) -> Result<String, DecodeError> {
    match body.remove("id") {
        Some(Value::String(id)) => Ok(id),
        Some(Value::Number(id)) => Ok(id.to_string()),
        Some(Value::Null) | None => Err(DecodeError::MissingField("id")),
        Some(_) => Err(DecodeError::InvalidField("id")),
    }
}

fn take_string(body: &mut Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match body.remove(field) {
        Some(Value::String(value)) => Ok(value),
        Some(Value::Null) | None => Err(DecodeError::MissingField(field)),
        Some(_) => Err(DecodeError::InvalidField(field)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{DecodeError, EncodeError};
    use crate::gateway::proto::{
        Envelope, ErrorShape, GatewayEvent, RequestFrame, ResponseFrame, ResponseOutcome,
    };

    fn encoded_value(envelope: &Envelope) -> Value {
        serde_json::from_str(&envelope.to_text().expect("encode")).expect("valid json")
    }

    #[test]
    fn request_encodes_with_req_tag() {
        let envelope = Envelope::Request(RequestFrame {
            id: "r1".to_string(),
            method: "sessions.list".to_string(),
            params: json!({"activeMinutes": 120}),
        });

        assert_eq!(
            envelope.to_text().expect("encode"),
            r#"{"type":"req","id":"r1","method":"sessions.list","params":{"activeMinutes":120}}"#
        );
    }

    #[test]
    fn response_encodes_payload_xor_error() {
        let ok = encoded_value(&Envelope::Response(ResponseFrame::ok(
            "r1",
            json!({"sessions": []}),
        )));
        assert_eq!(ok, json!({"type": "res", "id": "r1", "payload": {"sessions": []}}));

        let failed = encoded_value(&Envelope::Response(ResponseFrame::error(
            "r2",
            ErrorShape::new("denied"),
        )));
        assert_eq!(failed, json!({"type": "res", "id": "r2", "error": {"message": "denied"}}));
        assert!(failed.get("payload").is_none());
    }

    #[test]
    fn event_encodes_without_id() {
        let value = encoded_value(&Envelope::Event(GatewayEvent::new(
            "chat",
            json!({"state": "delta"}),
        )));
        assert_eq!(value, json!({"type": "event", "event": "chat", "payload": {"state": "delta"}}));
    }

    #[test]
    fn unknown_envelopes_refuse_to_encode() {
        let envelope = Envelope::Unknown {
            kind: "stream".to_string(),
            body: serde_json::Map::new(),
        };
        assert!(matches!(envelope.to_text(), Err(EncodeError::UnknownKind(kind)) if kind == "stream"));
    }

    #[test]
    fn decodes_success_response() {
        let envelope =
            Envelope::from_text(r#"{"type":"res","id":"h1","payload":{"ok":true}}"#).expect("decode");
        assert_eq!(
            envelope,
            Envelope::Response(ResponseFrame::ok("h1", json!({"ok": true})))
        );
    }

    #[test]
    fn decodes_error_object_and_bare_string() {
        let object = Envelope::from_text(
            r#"{"type":"res","id":"r3","ok":false,"error":{"code":"INVALID_REQUEST","message":"bad params"}}"#,
        )
        .expect("decode object error");
        let Envelope::Response(ResponseFrame {
            outcome: ResponseOutcome::Error(error),
            ..
        }) = object
        else {
            panic!("expected error response");
        };
        assert_eq!(error.code.as_deref(), Some("INVALID_REQUEST"));
        assert_eq!(error.message, "bad params");

        let bare = Envelope::from_text(r#"{"type":"res","id":"r4","error":"nope"}"#)
            .expect("decode string error");
        assert_eq!(
            bare,
            Envelope::Response(ResponseFrame::error("r4", ErrorShape::new("nope")))
        );
    }

    #[test]
    fn error_without_message_gets_placeholder() {
        let envelope =
            Envelope::from_text(r#"{"type":"res","id":"r5","error":{}}"#).expect("decode");
        assert_eq!(
            envelope,
            Envelope::Response(ResponseFrame::error("r5", ErrorShape::new("unknown error")))
        );
    }

    #[test]
    fn ok_false_without_error_is_rejected() {
        let envelope = Envelope::from_text(r#"{"type":"res","id":"r6","ok":false}"#).expect("decode");
        assert!(matches!(
            envelope,
            Envelope::Response(ResponseFrame {
                outcome: ResponseOutcome::Error(_),
                ..
            })
        ));
    }

    #[test]
    fn response_without_payload_resolves_null() {
        let envelope = Envelope::from_text(r#"{"type":"res","id":7}"#).expect("decode");
        assert_eq!(envelope, Envelope::Response(ResponseFrame::ok("7", Value::Null)));
    }

    #[test]
    fn event_payload_defaults_to_empty_object() {
        let envelope = Envelope::from_text(r#"{"type":"event","event":"tick","seq":12}"#)
            .expect("decode");
        assert_eq!(
            envelope,
            Envelope::Event(GatewayEvent {
                name: "tick".to_string(),
                payload: json!({}),
                seq: Some(12),
            })
        );
    }

    #[test]
    fn ill_typed_seq_keeps_the_event() {
        for text in [
            r#"{"type":"event","event":"tick","seq":"5","payload":{"n":1}}"#,
            r#"{"type":"event","event":"tick","seq":-1,"payload":{"n":1}}"#,
        ] {
            let Envelope::Event(event) = Envelope::from_text(text).expect("decode") else {
                panic!("expected event");
            };
            assert_eq!(event.name, "tick");
            assert_eq!(event.payload, json!({"n": 1}));
            assert_eq!(event.seq, None);
        }
    }

    #[test]
    fn nested_payloads_stay_opaque() {
        let text = r#"{"type":"event","event":"agent","payload":{"a":[1,{"b":null}],"c":{"d":[true,"x"]}}}"#;
        let Envelope::Event(event) = Envelope::from_text(text).expect("decode") else {
            panic!("expected event");
        };
        assert_eq!(event.payload, json!({"a": [1, {"b": null}], "c": {"d": [true, "x"]}}));
    }

    #[test]
    fn unknown_kind_is_forward_compatible() {
        let envelope =
            Envelope::from_text(r#"{"type":"hello","server":"v9"}"#).expect("unknown kinds decode");
        let Envelope::Unknown { kind, body } = envelope else {
            panic!("expected unknown envelope");
        };
        assert_eq!(kind, "hello");
        assert_eq!(body.get("server"), Some(&json!("v9")));
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        assert!(matches!(Envelope::from_text("{not json"), Err(DecodeError::Syntax(_))));
        assert!(matches!(Envelope::from_text("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            Envelope::from_text(r#"{"id":"r1"}"#),
            Err(DecodeError::MissingField("type"))
        ));
        assert!(matches!(
            Envelope::from_text(r#"{"type":"res","payload":{}}"#),
            Err(DecodeError::MissingField("id"))
        ));
        assert!(matches!(
            Envelope::from_text(r#"{"type":"event","payload":{}}"#),
            Err(DecodeError::MissingField("event"))
        ));
        assert!(matches!(
            Envelope::from_text(r#"{"type":"req","id":"x","method":5}"#),
            Err(DecodeError::InvalidField("method"))
        ));
    }
}
