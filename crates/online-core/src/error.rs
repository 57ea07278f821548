use thiserror::Error;

/// Errors produced by the tunnel protocol and its endpoints.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("no public port available")]
    NoPortAvailable,

    #[error("client limit of {0} reached")]
    ClientLimit(usize),

    #[error("failed to bind public port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("session closed")]
    SessionClosed,

    #[error("local server error: {0}")]
    LocalServer(String),

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("bad public request: {0}")]
    BadRequest(String),

    #[error("heartbeat lost")]
    Heartbeat,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
