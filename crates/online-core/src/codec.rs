//! JSON framing for the control channel.
//!
//! The transport is message-oriented (WebSocket text frames), so frames are
//! self-delimited: one JSON envelope per frame, no length prefix. The codec
//! enforces the inbound frame size limit and carries request/response bodies
//! as base64 so arbitrary bytes survive the text transport.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{TunnelError, TunnelResult};
use crate::messages::Envelope;

/// Default inbound frame size limit: 16 MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Encode one envelope as a JSON text frame.
pub fn encode_frame(envelope: &Envelope) -> TunnelResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode one JSON text frame into an envelope.
///
/// Frames larger than `max_bytes` are rejected with
/// [`TunnelError::FrameTooLarge`]; the caller is expected to close the
/// session. Unknown envelope types decode to [`Envelope::Unknown`].
pub fn decode_frame(text: &str, max_bytes: usize) -> TunnelResult<Envelope> {
    if text.len() > max_bytes {
        return Err(TunnelError::FrameTooLarge {
            len: text.len(),
            max: max_bytes,
        });
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode a request/response body for transport. Empty bodies become `""`.
pub fn encode_body(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a transported body. Invalid base64 is a protocol violation.
pub fn decode_body(body_b64: &str) -> TunnelResult<Vec<u8>> {
    BASE64
        .decode(body_b64)
        .map_err(|e| TunnelError::Protocol(format!("invalid base64 body: {e}")))
}
