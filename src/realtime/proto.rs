//! Wire frames and inbound classification.
//!
//! Inbound frames are either structured JSON envelopes or free-form text.
//! Classification is total: anything that does not parse as an envelope
//! object degrades to opaque log text and is never re-encoded.

use serde::Deserialize;
use serde_json::Value;

/// Bus event name under which key-change notifications are published.
pub const KEY_UPDATE_EVENT: &str = "key-update";

/// Session event announcing a newly assigned session identity.
pub const EVENT_NEW: &str = "NEW";
/// Session event confirming an opened session identity.
pub const EVENT_OPENED: &str = "OPENED";
/// Session event announcing a closed session.
pub const EVENT_CLOSED: &str = "CLOSED";
/// Server-side error report.
pub const EVENT_ERROR: &str = "ERROR";

/// Builds the credential frame sent as the first message after open.
pub(crate) fn credential_frame(api_key: &str) -> String {
    serde_json::json!({ "API_KEY": api_key }).to_string()
}

/// Parsed shape of a structured inbound frame.
///
/// Every field is optional on the wire; generic change events carry at least
/// `event` and `key`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Envelope {
    pub event: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub key: Option<String>,
    pub exception: Option<String>,
    pub message: Option<String>,
}

/// Classification of one inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameClass {
    /// Unstructured text, forwarded to the log unchanged.
    Opaque,
    /// The server assigned or confirmed a session identity.
    SessionOpened { session_id: String },
    /// A session ended.
    SessionClosed { session_id: Option<String> },
    /// Server-side error report.
    ServerError {
        exception: Option<String>,
        message: Option<String>,
    },
    /// A record changed; consumers should refetch `key`.
    KeyChanged { key: String },
}

/// Classifies one raw inbound text frame.
///
/// Rules, in order: non-JSON or non-object frames are opaque; `NEW`/`OPENED`
/// with a session id announce the session; `CLOSED` and `ERROR` are session
/// lifecycle reports; any other event carrying a key is a change
/// notification; everything else is opaque.
pub fn classify_frame(text: &str) -> FrameClass {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return FrameClass::Opaque,
    };
    if !value.is_object() {
        return FrameClass::Opaque;
    }
    let envelope: Envelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(_) => return FrameClass::Opaque,
    };

    let event = envelope.event.as_deref();
    if matches!(event, Some(EVENT_NEW | EVENT_OPENED)) {
        // A session announcement without an id falls through to the
        // generic rules below.
        if let Some(session_id) = envelope.session_id {
            return FrameClass::SessionOpened { session_id };
        }
    } else if event == Some(EVENT_CLOSED) {
        return FrameClass::SessionClosed {
            session_id: envelope.session_id,
        };
    } else if event == Some(EVENT_ERROR) {
        return FrameClass::ServerError {
            exception: envelope.exception,
            message: envelope.message,
        };
    }

    match envelope.key {
        Some(key) => FrameClass::KeyChanged { key },
        None => FrameClass::Opaque,
    }
}
