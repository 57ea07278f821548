//! Client connection lifecycle.
//!
//! Maintains the control channel to the server: register, serve forwarded
//! requests, heartbeat, and reconnect with jittered exponential backoff when
//! the channel drops. Each reconnect performs a fresh registration; the
//! previous client id is discarded.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use online_core::{codec, codes, Envelope, TunnelError, TunnelResult, MAX_FRAME_BYTES};

use crate::forward::Forwarder;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8765/ws";

/// Deadline for each request against the local service.
pub const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_JITTER: f64 = 0.25;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_MISSED_PONGS: u32 = 3;
/// Give up if the first registration never succeeds within this many tries.
const GIVE_UP_ATTEMPTS: u32 = 10;
const OUTBOUND_QUEUE: usize = 256;

type ControlStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: Url,
    pub local_host: String,
    pub local_port: u16,
}

/// Run the client until the process is interrupted.
///
/// Returns an error only when the server has never been reachable and the
/// initial connection attempts are exhausted; after a first successful
/// registration the client reconnects indefinitely.
pub async fn run(config: ClientConfig) -> TunnelResult<()> {
    let forwarder = Arc::new(Forwarder::new(
        &config.local_host,
        config.local_port,
        LOCAL_REQUEST_TIMEOUT,
    )?);

    let mut backoff = INITIAL_BACKOFF;
    let mut ever_registered = false;
    let mut failed_attempts: u32 = 0;

    loop {
        let mut registered = false;
        match connect_and_serve(&config, &forwarder, &mut registered).await {
            Ok(()) => info!("control channel closed"),
            Err(e) => warn!(error = %e, "control channel failed"),
        }

        if registered {
            ever_registered = true;
            failed_attempts = 0;
            backoff = INITIAL_BACKOFF;
        } else {
            failed_attempts += 1;
            if !ever_registered && failed_attempts >= GIVE_UP_ATTEMPTS {
                return Err(TunnelError::Transport(format!(
                    "could not register with {} after {} attempts",
                    config.server_url, failed_attempts
                )));
            }
        }

        let delay = jittered(backoff);
        info!(delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One connection: register, then serve until the channel ends.
async fn connect_and_serve(
    config: &ClientConfig,
    forwarder: &Arc<Forwarder>,
    registered: &mut bool,
) -> TunnelResult<()> {
    let (mut ws, _response) = connect_async(config.server_url.as_str())
        .await
        .map_err(|e| TunnelError::Transport(format!("connect failed: {e}")))?;

    send_frame(&mut ws, &Envelope::Register).await?;
    let (client_id, public_port) = await_registered(&mut ws).await?;
    *registered = true;

    let public_host = config.server_url.host_str().unwrap_or("127.0.0.1");
    // The public URL is the one piece of output a script can rely on.
    println!("http://{public_host}:{public_port}");
    let local = format!("http://{}:{}", config.local_host, config.local_port);
    info!(
        client_id = %client_id,
        public_port,
        local = %local,
        "tunnel established"
    );

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await; // skip the immediate tick
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            Some(frame) = outbound_rx.recv() => {
                send_frame(&mut ws, &frame).await?;
            }

            _ = ping_timer.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    let _ = ws.close(None).await;
                    return Err(TunnelError::Heartbeat);
                }
                send_frame(&mut ws, &Envelope::Ping).await?;
                missed_pongs += 1;
            }

            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = codec::decode_frame(text.as_str(), MAX_FRAME_BYTES)?;
                        handle_frame(envelope, forwarder, &outbound_tx, &mut missed_pongs, &mut ws).await?;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        return Err(TunnelError::Protocol(
                            "binary frames are not part of the protocol".into(),
                        ));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(TunnelError::Transport(format!("control read failed: {e}")));
                    }
                }
            }
        }
    }
}

/// Apply one post-registration envelope.
async fn handle_frame(
    envelope: Envelope,
    forwarder: &Arc<Forwarder>,
    outbound_tx: &mpsc::Sender<Envelope>,
    missed_pongs: &mut u32,
    ws: &mut ControlStream,
) -> TunnelResult<()> {
    match envelope {
        Envelope::Request {
            request_id,
            method,
            path,
            headers,
            body_b64,
        } => {
            // Each forwarded request runs in its own task; replies funnel
            // back through the outbound queue to the single socket writer.
            let forwarder = Arc::clone(forwarder);
            let outbound = outbound_tx.clone();
            tokio::spawn(async move {
                let reply = match codec::decode_body(&body_b64) {
                    Ok(body) => {
                        forwarder
                            .forward(&request_id, &method, &path, headers, body)
                            .await
                    }
                    Err(e) => Envelope::Error {
                        code: codes::PROTOCOL.to_string(),
                        message: e.to_string(),
                        request_id: Some(request_id),
                    },
                };
                let _ = outbound.send(reply).await;
            });
        }
        Envelope::Ping => send_frame(ws, &Envelope::Pong).await?,
        Envelope::Pong => *missed_pongs = 0,
        Envelope::Error { code, message, .. } => {
            warn!(code = %code, message = %message, "server reported error");
        }
        Envelope::Registered { .. } => {
            debug!("duplicate registered envelope ignored");
        }
        Envelope::Register | Envelope::Response { .. } => {
            warn!("unexpected envelope direction, skipping");
        }
        Envelope::Unknown => {
            debug!("unknown envelope type skipped");
        }
    }
    Ok(())
}

/// Wait for the server's reply to `register`.
async fn await_registered(ws: &mut ControlStream) -> TunnelResult<(String, u16)> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                match codec::decode_frame(text.as_str(), MAX_FRAME_BYTES)? {
                    Envelope::Registered {
                        client_id,
                        public_port,
                    } => return Ok((client_id, public_port)),
                    Envelope::Error { code, message, .. } => {
                        return Err(TunnelError::Transport(format!(
                            "registration refused ({code}): {message}"
                        )));
                    }
                    Envelope::Ping => send_frame(ws, &Envelope::Pong).await?,
                    Envelope::Unknown => {
                        debug!("unknown envelope type skipped during registration");
                    }
                    other => {
                        return Err(TunnelError::Protocol(format!(
                            "unexpected envelope before registered: {other:?}"
                        )));
                    }
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(TunnelError::Transport(
                    "connection closed during registration".into(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(TunnelError::Transport(format!("control read failed: {e}")));
            }
        }
    }
}

async fn send_frame(ws: &mut ControlStream, envelope: &Envelope) -> TunnelResult<()> {
    let text = codec::encode_frame(envelope)?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TunnelError::Transport(format!("control send failed: {e}")))
}

/// Apply ±25 % jitter to a backoff delay.
fn jittered(delay: Duration) -> Duration {
    use rand::Rng;
    let factor = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let delay = jittered(base);
            assert!(delay >= Duration::from_millis(750), "too short: {delay:?}");
            assert!(delay <= Duration::from_millis(1250), "too long: {delay:?}");
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = INITIAL_BACKOFF;
        let mut schedule = Vec::new();
        for _ in 0..8 {
            schedule.push(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(schedule[0], Duration::from_millis(500));
        assert_eq!(schedule[1], Duration::from_secs(1));
        assert_eq!(schedule[2], Duration::from_secs(2));
        assert_eq!(*schedule.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn default_server_url_is_well_formed() {
        let url = Url::parse(DEFAULT_SERVER_URL).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(8765));
    }
}
