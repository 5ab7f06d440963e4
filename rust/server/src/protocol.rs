//! The JSON control protocol.
//!
//! Every frame is `{"header": {...}, "payload": {...}}`. Inbound headers
//! carry `name` ("Begin" | "End") and a client message id; outbound headers
//! carry `name`, `status`, a server-issued `mid`, `status_text`, and the
//! session id once known. Unknown fields are ignored on the way in.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Protocol status codes carried in `header.status`.
pub mod code {
    /// Default status of every non-error event.
    pub const SUCCESS: i32 = 20_000_000;

    pub const INVALID_STATE_FOR_BEGIN: i32 = 1001;
    pub const UNSUPPORTED_AUDIO_FORMAT: i32 = 1002;
    pub const UNSUPPORTED_SAMPLE_RATE: i32 = 1003;
    pub const BEGIN_FAILED: i32 = 1004;
    pub const NOT_STARTED: i32 = 1005;
    pub const BINARY_IN_WRONG_STATE: i32 = 1006;

    pub const INVALID_JSON: i32 = 2001;
    pub const MESSAGE_ERROR: i32 = 2002;
    pub const MISSING_HEADER: i32 = 2003;
    pub const MISSING_NAME: i32 = 2004;
    pub const UNSUPPORTED_NAME: i32 = 2005;
    pub const PROTOCOL_ERROR: i32 = 2006;
    pub const SERVER_CONFIG_UNAVAILABLE: i32 = 2007;

    /// Generic mid-stream pipeline failure.
    pub const PIPELINE_ERROR: i32 = 41_040_009;
}

/// `status_text` of every non-error event.
pub const SUCCESS_TEXT: &str = "Gateway:SUCCESS:Success.";

/// A schema-level rejection of an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    pub code: i32,
    pub message: String,
}

impl ProtocolViolation {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A parsed inbound control message.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub name: String,
    pub payload: Value,
}

/// Parses an inbound text frame, enforcing the envelope schema.
pub fn parse_inbound(text: &str) -> std::result::Result<Inbound, ProtocolViolation> {
    let root: Value = serde_json::from_str(text).map_err(|e| {
        ProtocolViolation::new(code::INVALID_JSON, format!("Invalid JSON format: {e}"))
    })?;

    let header = match root.get("header") {
        Some(h) if h.is_object() => h,
        _ => {
            return Err(ProtocolViolation::new(
                code::MISSING_HEADER,
                "Missing or invalid header",
            ))
        }
    };

    let name = match header.get("name").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => {
            return Err(ProtocolViolation::new(
                code::MISSING_NAME,
                "Missing name in header",
            ))
        }
    };

    let payload = root.get("payload").cloned().unwrap_or_else(|| json!({}));
    Ok(Inbound { name, payload })
}

/// `Begin.payload` with protocol defaults. Unrecognized fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct BeginPayload {
    #[serde(default = "default_fmt")]
    pub fmt: String,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_itn")]
    pub itn: bool,
    #[serde(default = "default_silence")]
    pub silence: u32,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_fmt() -> String {
    "pcm".to_string()
}
fn default_rate() -> u32 {
    16000
}
fn default_itn() -> bool {
    true
}
fn default_silence() -> u32 {
    800
}

impl Default for BeginPayload {
    fn default() -> Self {
        Self {
            fmt: default_fmt(),
            rate: default_rate(),
            itn: default_itn(),
            silence: default_silence(),
            session_id: None,
        }
    }
}

impl BeginPayload {
    /// Parses the payload, falling back to defaults on schema mismatch.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
struct OutboundHeader<'a> {
    name: &'a str,
    status: i32,
    mid: String,
    status_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<&'a str>,
}

fn envelope(name: &str, status: i32, status_text: &str, sid: Option<&str>, payload: Value) -> String {
    let message = json!({
        "header": OutboundHeader {
            name,
            status,
            mid: Uuid::new_v4().to_string(),
            status_text,
            sid,
        },
        "payload": payload,
    });
    message.to_string()
}

fn event(name: &str, sid: Option<&str>, payload: Value) -> String {
    envelope(name, code::SUCCESS, SUCCESS_TEXT, sid, payload)
}

/// Optional speaker attribution attached to `Result` / `SentenceEnd`.
fn with_speaker(mut payload: Value, speaker: Option<&(String, String)>) -> Value {
    if let Some((id, name)) = speaker {
        if !id.is_empty() {
            payload["speaker_id"] = json!(id);
            payload["speaker"] = json!(name);
        }
    }
    payload
}

/// `Started` event.
pub fn started(sid: &str) -> String {
    event("Started", Some(sid), json!({ "sid": sid }))
}

/// `SentenceBegin` event.
pub fn sentence_begin(sid: &str, idx: u32, time: u64) -> String {
    event("SentenceBegin", Some(sid), json!({ "idx": idx, "time": time }))
}

/// Partial `Result` event.
pub fn result(
    sid: &str,
    idx: u32,
    time: u64,
    text: &str,
    speaker: Option<&(String, String)>,
) -> String {
    let payload = json!({ "idx": idx, "time": time, "text": text });
    event("Result", Some(sid), with_speaker(payload, speaker))
}

/// Terminal `SentenceEnd` event.
pub fn sentence_end(
    sid: &str,
    idx: u32,
    time: u64,
    begin: u64,
    text: &str,
    speaker: Option<&(String, String)>,
) -> String {
    let payload = json!({ "idx": idx, "time": time, "begin": begin, "text": text });
    event("SentenceEnd", Some(sid), with_speaker(payload, speaker))
}

/// `Completed` event.
pub fn completed(sid: &str) -> String {
    event("Completed", Some(sid), json!({}))
}

/// `Failed` event with a non-default status.
pub fn failed(sid: Option<&str>, status: i32, status_text: &str) -> String {
    envelope("Failed", status, status_text, sid, json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_begin_with_defaults() {
        let inbound = parse_inbound(r#"{"header":{"name":"Begin","mid":"1"},"payload":{}}"#)
            .expect("valid frame");
        assert_eq!(inbound.name, "Begin");
        let begin = BeginPayload::from_value(&inbound.payload);
        assert_eq!(begin.fmt, "pcm");
        assert_eq!(begin.rate, 16000);
        assert!(begin.itn);
        assert_eq!(begin.silence, 800);
        assert!(begin.session_id.is_none());
    }

    #[test]
    fn parses_begin_with_overrides_and_unknown_fields() {
        let inbound = parse_inbound(
            r#"{"header":{"name":"Begin"},"payload":{"rate":8000,"itn":false,"silence":500,"future_knob":42}}"#,
        )
        .expect("valid frame");
        let begin = BeginPayload::from_value(&inbound.payload);
        assert_eq!(begin.rate, 8000);
        assert!(!begin.itn);
        assert_eq!(begin.silence, 500);
    }

    #[test]
    fn missing_payload_defaults_to_empty_object() {
        let inbound = parse_inbound(r#"{"header":{"name":"End"}}"#).expect("valid frame");
        assert_eq!(inbound.name, "End");
        assert!(inbound.payload.as_object().map(|o| o.is_empty()).unwrap_or(false));
    }

    #[test]
    fn rejects_bad_json() {
        let err = parse_inbound("{not json").unwrap_err();
        assert_eq!(err.code, code::INVALID_JSON);
    }

    #[test]
    fn rejects_missing_header() {
        let err = parse_inbound(r#"{"payload":{}}"#).unwrap_err();
        assert_eq!(err.code, code::MISSING_HEADER);

        let err = parse_inbound(r#"{"header":"nope"}"#).unwrap_err();
        assert_eq!(err.code, code::MISSING_HEADER);
    }

    #[test]
    fn rejects_missing_name() {
        let err = parse_inbound(r#"{"header":{"mid":"7"}}"#).unwrap_err();
        assert_eq!(err.code, code::MISSING_NAME);
    }

    #[test]
    fn outbound_envelope_shape() {
        let text = sentence_end("sid-1", 2, 2500, 400, "hello world.", None);
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["header"]["name"], "SentenceEnd");
        assert_eq!(v["header"]["status"], code::SUCCESS);
        assert_eq!(v["header"]["status_text"], SUCCESS_TEXT);
        assert_eq!(v["header"]["sid"], "sid-1");
        assert!(v["header"]["mid"].as_str().is_some());
        assert_eq!(v["payload"]["idx"], 2);
        assert_eq!(v["payload"]["time"], 2500);
        assert_eq!(v["payload"]["begin"], 400);
        assert_eq!(v["payload"]["text"], "hello world.");
        assert!(v["payload"].get("speaker_id").is_none());
    }

    #[test]
    fn speaker_fields_attached_only_when_identified() {
        let tag = ("speaker-1".to_string(), "Alice".to_string());
        let text = result("sid", 1, 100, "hello", Some(&tag));
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["payload"]["speaker_id"], "speaker-1");
        assert_eq!(v["payload"]["speaker"], "Alice");

        let empty = ("".to_string(), "".to_string());
        let text = result("sid", 1, 100, "hello", Some(&empty));
        let v: Value = serde_json::from_str(&text).unwrap();
        assert!(v["payload"].get("speaker_id").is_none());
    }

    #[test]
    fn failed_carries_status_and_no_sid_before_start() {
        let text = failed(None, code::NOT_STARTED, "Transcription not started");
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["header"]["name"], "Failed");
        assert_eq!(v["header"]["status"], code::NOT_STARTED);
        assert!(v["header"].get("sid").is_none());
    }
}
