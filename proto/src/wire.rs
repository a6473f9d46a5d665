use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::merge::is_private_key;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("lab frame missing discriminator")]
    TruncatedLab,
    #[error("unknown lab discriminator: {0:?}")]
    UnknownLab(char),
    #[error("unknown frame discriminator: {0:?}")]
    UnknownDiscriminator(char),
}

/// A parsed wire message. Frames are newline-free UTF-8 text; the first
/// character(s) discriminate the shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `@<id>` — hub assigns the receiving connection its own identity.
    Identity(String),
    /// `+<id>` — another connection joined the room.
    Joined(String),
    /// `-<id>` — another connection left the room.
    Left(String),
    /// `_<payload>` — lab sub-protocol envelope.
    Lab(LabFrame),
    /// JSON-object envelope, the simpler client/server framing with
    /// semantics equivalent to the prefixed frames.
    Envelope(Envelope),
}

/// Payload of a `_`-prefixed lab frame; the first payload character
/// discriminates further.
#[derive(Clone, Debug, PartialEq)]
pub enum LabFrame {
    /// `_s<json>` — full-state snapshot.
    Snapshot(Value),
    /// `_d<json>` — state delta.
    Delta(Value),
    /// `_i<id>` — identity announcement / presence ident.
    Ident(String),
    /// `_?<payload>` — query, e.g. `s` requests a snapshot.
    Query(String),
    /// `_.<payload>` — reply to a query.
    Reply(String),
}

/// The JSON-envelope framing. Exactly one field is set per message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame, WireError> {
        let mut chars = text.chars();
        let discriminator = chars.next().ok_or(WireError::Empty)?;
        let rest = &text[discriminator.len_utf8()..];

        match discriminator {
            '@' => Ok(Frame::Identity(rest.to_string())),
            '+' => Ok(Frame::Joined(rest.to_string())),
            '-' => Ok(Frame::Left(rest.to_string())),
            '_' => {
                let tag = rest.chars().next().ok_or(WireError::TruncatedLab)?;
                let payload = &rest[tag.len_utf8()..];
                match tag {
                    's' => Ok(Frame::Lab(LabFrame::Snapshot(serde_json::from_str(payload)?))),
                    'd' => Ok(Frame::Lab(LabFrame::Delta(serde_json::from_str(payload)?))),
                    'i' => Ok(Frame::Lab(LabFrame::Ident(payload.to_string()))),
                    '?' => Ok(Frame::Lab(LabFrame::Query(payload.to_string()))),
                    '.' => Ok(Frame::Lab(LabFrame::Reply(payload.to_string()))),
                    other => Err(WireError::UnknownLab(other)),
                }
            }
            '{' => Ok(Frame::Envelope(serde_json::from_str(text)?)),
            other => Err(WireError::UnknownDiscriminator(other)),
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        match self {
            Frame::Identity(id) => Ok(format!("@{id}")),
            Frame::Joined(id) => Ok(format!("+{id}")),
            Frame::Left(id) => Ok(format!("-{id}")),
            Frame::Lab(lab) => lab.encode(),
            Frame::Envelope(env) => Ok(serde_json::to_string(env)?),
        }
    }
}

impl LabFrame {
    pub fn encode(&self) -> Result<String, WireError> {
        match self {
            LabFrame::Snapshot(v) => Ok(format!("_s{}", serde_json::to_string(v)?)),
            LabFrame::Delta(v) => Ok(format!("_d{}", serde_json::to_string(v)?)),
            LabFrame::Ident(id) => Ok(format!("_i{id}")),
            LabFrame::Query(q) => Ok(format!("_?{q}")),
            LabFrame::Reply(r) => Ok(format!("_.{r}")),
        }
    }
}

/// Deep-copy `value` with every `_`-prefixed key removed.
///
/// Applied to every snapshot and delta payload before it crosses the wire;
/// recipients apply what they receive as-is.
pub fn strip_private(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut kept = Map::new();
            for (key, val) in map {
                if is_private_key(key) {
                    continue;
                }
                kept.insert(key.clone(), strip_private(val));
            }
            Value::Object(kept)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_private).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_frames_roundtrip() {
        for text in ["@p1", "+p2", "-p3"] {
            let frame = Frame::parse(text).unwrap();
            assert_eq!(frame.encode().unwrap(), text);
        }
        assert_eq!(Frame::parse("@p1").unwrap(), Frame::Identity("p1".into()));
        assert_eq!(Frame::parse("+p2").unwrap(), Frame::Joined("p2".into()));
        assert_eq!(Frame::parse("-p3").unwrap(), Frame::Left("p3".into()));
    }

    #[test]
    fn lab_snapshot_and_delta_carry_json() {
        let frame = Frame::parse(r#"_s{"@players":{"p1":{"x":1}}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Lab(LabFrame::Snapshot(json!({"@players": {"p1": {"x": 1}}})))
        );

        let frame = Frame::parse(r#"_d{"round":2}"#).unwrap();
        assert_eq!(frame, Frame::Lab(LabFrame::Delta(json!({"round": 2}))));
    }

    #[test]
    fn lab_ident_query_reply() {
        assert_eq!(
            Frame::parse("_ip7").unwrap(),
            Frame::Lab(LabFrame::Ident("p7".into()))
        );
        assert_eq!(
            Frame::parse("_?s").unwrap(),
            Frame::Lab(LabFrame::Query("s".into()))
        );
        assert!(matches!(
            Frame::parse("_.sdone").unwrap(),
            Frame::Lab(LabFrame::Reply(r)) if r == "sdone"
        ));
    }

    #[test]
    fn lab_encode_roundtrip() {
        let frame = Frame::Lab(LabFrame::Delta(json!({"x": 1.5})));
        let text = frame.encode().unwrap();
        assert!(text.starts_with("_d"));
        assert_eq!(Frame::parse(&text).unwrap(), frame);
    }

    #[test]
    fn envelope_roundtrip_omits_unset_fields() {
        let env = Envelope {
            delta: Some(json!({"score": 1})),
            ..Default::default()
        };
        let text = Frame::Envelope(env.clone()).encode().unwrap();
        assert_eq!(text, r#"{"delta":{"score":1}}"#);
        assert_eq!(Frame::parse(&text).unwrap(), Frame::Envelope(env));
    }

    #[test]
    fn envelope_variants_parse() {
        let frame = Frame::parse(r#"{"connect":"p4"}"#).unwrap();
        match frame {
            Frame::Envelope(env) => assert_eq!(env.connect.as_deref(), Some("p4")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(Frame::parse(""), Err(WireError::Empty)));
        assert!(matches!(Frame::parse("_"), Err(WireError::TruncatedLab)));
        assert!(matches!(Frame::parse("_x1"), Err(WireError::UnknownLab('x'))));
        assert!(matches!(
            Frame::parse("_d{not json"),
            Err(WireError::MalformedJson(_))
        ));
        assert!(matches!(
            Frame::parse("{broken"),
            Err(WireError::MalformedJson(_))
        ));
        assert!(matches!(
            Frame::parse("hello"),
            Err(WireError::UnknownDiscriminator('h'))
        ));
    }

    #[test]
    fn strip_private_removes_underscore_keys_at_any_depth() {
        let state = json!({
            "_draft": true,
            "score": 5,
            "@players": {
                "p1": {"x": 1, "_aim": [0.2, 0.3]},
            },
            "notes": [{"_scratch": 1, "text": "hi"}]
        });
        assert_eq!(
            strip_private(&state),
            json!({
                "score": 5,
                "@players": {"p1": {"x": 1}},
                "notes": [{"text": "hi"}]
            })
        );
    }

    #[test]
    fn strip_private_leaves_clean_trees_alone() {
        let state = json!({"a": {"b": 1}, "c": [1, 2]});
        assert_eq!(strip_private(&state), state);
    }
}
