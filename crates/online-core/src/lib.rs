//! online-core: Shared protocol library for the online tunnel.
//!
//! Provides the JSON message envelopes exchanged over the control channel,
//! the frame codec with its size limit, the error taxonomy, and the
//! hop-by-hop header rules applied on both ends of the tunnel.

pub mod codec;
pub mod error;
pub mod headers;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_body, decode_frame, encode_body, encode_frame, MAX_FRAME_BYTES};
pub use error::{TunnelError, TunnelResult};
pub use headers::{is_hop_by_hop, strip_hop_by_hop};
pub use messages::{codes, Envelope, HeaderPairs};
