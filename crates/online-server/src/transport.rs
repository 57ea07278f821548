//! WebSocket listener for the control channel.
//!
//! Accepts TCP connections on the configured listen address and performs the
//! WebSocket upgrade. The upgrade does not route on the request path; any
//! path a client uses is accepted. Handshaken connections are handed to the
//! control loop through an `mpsc` channel.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A handle to an accepted control connection.
pub struct ControlConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind the control listener and start accepting.
///
/// Returns the bound address and a receiver that yields handshaken
/// connections. Bind errors are returned to the caller (exit code 2).
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> io::Result<(SocketAddr, mpsc::Receiver<ControlConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr).await?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "control listener started");

    let (tx, rx) = mpsc::channel::<ControlConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "control connection accepted");
                                let conn = ControlConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("control connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "websocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "control accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}
