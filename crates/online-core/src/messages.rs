//! Control-channel message envelopes.
//!
//! One envelope per WebSocket text frame, serialized as a JSON object with a
//! `"type"` tag (e.g. `{"type": "register"}`). The server and the client
//! exchange no other message shapes; both sides must tolerate envelope types
//! they do not understand, so the enum carries an [`Envelope::Unknown`]
//! catch-all variant for forward compatibility.

use serde::{Deserialize, Serialize};

/// Ordered header pairs. A `Vec` rather than a map because HTTP permits
/// repeated header names and their order matters (e.g. `Set-Cookie`).
pub type HeaderPairs = Vec<(String, String)>;

/// All messages exchanged over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame from a connecting client: request a tunnel.
    Register,

    /// Server reply to a successful registration.
    Registered { client_id: String, public_port: u16 },

    /// A public HTTP request forwarded to the client.
    Request {
        request_id: String,
        method: String,
        /// Request-target including the query string, forwarded verbatim.
        path: String,
        headers: HeaderPairs,
        body_b64: String,
    },

    /// The client's answer to a forwarded request, matched by `request_id`.
    Response {
        request_id: String,
        status: u16,
        headers: HeaderPairs,
        body_b64: String,
    },

    /// Error notification, sent by either side.
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Heartbeat request.
    Ping,

    /// Heartbeat response.
    Pong,

    /// Any envelope type this build does not know. Logged and skipped.
    #[serde(other)]
    Unknown,
}

/// Wire values for the `code` field of [`Envelope::Error`].
pub mod codes {
    pub const NO_PORT: &str = "no_port";
    pub const BIND_FAILED: &str = "bind_failed";
    pub const MAX_CLIENTS: &str = "max_clients";
    pub const PROTOCOL: &str = "protocol";
    pub const FRAME_TOO_LARGE: &str = "frame_too_large";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const INTERNAL: &str = "internal";
}

impl Envelope {
    /// Build an [`Envelope::Error`] without a request id.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Envelope::Error {
            code: code.to_string(),
            message: message.into(),
            request_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_wire_shape() {
        let json = serde_json::to_string(&Envelope::Register).unwrap();
        assert_eq!(json, r#"{"type":"register"}"#);
    }

    #[test]
    fn registered_wire_shape() {
        let json = serde_json::to_string(&Envelope::Registered {
            client_id: "ab12".into(),
            public_port: 5000,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"registered","client_id":"ab12","public_port":5000}"#
        );
    }

    #[test]
    fn request_headers_serialize_as_pair_arrays() {
        let envelope = Envelope::Request {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/x?q=1".into(),
            headers: vec![
                ("host".into(), "example.com".into()),
                ("set-cookie".into(), "a=1".into()),
                ("set-cookie".into(), "b=2".into()),
            ],
            body_b64: String::new(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""headers":[["host","example.com"],["set-cookie","a=1"],["set-cookie","b=2"]]"#));

        // Order must survive a round trip.
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn error_request_id_omitted_when_absent() {
        let json = serde_json::to_string(&Envelope::error(codes::NO_PORT, "range exhausted")).unwrap();
        assert!(!json.contains("request_id"));

        let with_id: Envelope = serde_json::from_str(
            r#"{"type":"error","code":"protocol","message":"bad","request_id":"r9"}"#,
        )
        .unwrap();
        match with_id {
            Envelope::Error { request_id, .. } => assert_eq!(request_id.as_deref(), Some("r9")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"compress_begin","level":3}"#).unwrap();
        assert_eq!(envelope, Envelope::Unknown);
    }
}
