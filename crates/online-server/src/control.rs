//! Per-client control loop.
//!
//! Each accepted control connection runs the registration handshake and then
//! a single task that multiplexes everything touching the WebSocket: the
//! outbound frame queue, inbound frames, the heartbeat timer, and server
//! shutdown. The task is the session's single writer; no other task writes
//! to the socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use online_core::{codec, codes, Envelope, TunnelError, TunnelResult, MAX_FRAME_BYTES};

use crate::pending::UpstreamResponse;
use crate::registry::{Session, SessionRegistry, OUTBOUND_QUEUE};
use crate::transport::ControlConnection;

/// Envelope heartbeat cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Consecutive unanswered pings before the session is torn down.
const MAX_MISSED_PONGS: u32 = 3;
/// How long a connection may sit idle before its `register` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of the tunnel stats log line.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

type ControlStream = WebSocketStream<TcpStream>;

/// What to do after applying one inbound frame.
enum FrameAction {
    Continue,
    Reply(Envelope),
    Close(&'static str),
}

pub struct ControlServer {
    registry: Arc<SessionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Handle used by the shutdown path to stop every control loop.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept control connections until the transport channel closes.
    pub async fn run(self: Arc<Self>, mut conn_rx: mpsc::Receiver<ControlConnection>) {
        let stats_registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let tunnels = stats_registry.list().await;
                debug!(
                    active = tunnels.len(),
                    ports_in_use = stats_registry.ports_in_use(),
                    "tunnel stats"
                );
            }
        });

        while let Some(conn) = conn_rx.recv().await {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = server.handle_connection(conn).await {
                    debug!(remote = %remote, error = %e, "control connection ended");
                }
            });
        }
    }

    /// Registration handshake followed by the session message loop.
    async fn handle_connection(&self, conn: ControlConnection) -> TunnelResult<()> {
        let remote = conn.remote_addr;
        let mut ws = conn.ws_stream;

        // The first frame must be `register`; anything else is a protocol
        // violation and closes the connection before a session exists.
        let first = match timeout(HANDSHAKE_TIMEOUT, recv_frame(&mut ws)).await {
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => {
                debug!(remote = %remote, "closed before register");
                return Ok(());
            }
            Ok(Err(e)) => {
                send_error_and_close(&mut ws, codes::PROTOCOL, &e.to_string()).await;
                return Err(e);
            }
            Err(_) => {
                send_error_and_close(&mut ws, codes::PROTOCOL, "register timed out").await;
                return Err(TunnelError::Protocol("register timed out".into()));
            }
        };
        if first != Envelope::Register {
            send_error_and_close(&mut ws, codes::PROTOCOL, "expected register").await;
            return Err(TunnelError::Protocol("first frame was not register".into()));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
        let session = match self.registry.register(outbound_tx).await {
            Ok(session) => session,
            Err(e) => {
                let code = match &e {
                    TunnelError::NoPortAvailable => codes::NO_PORT,
                    TunnelError::Bind { .. } => codes::BIND_FAILED,
                    TunnelError::ClientLimit(_) => codes::MAX_CLIENTS,
                    _ => codes::INTERNAL,
                };
                warn!(remote = %remote, error = %e, "registration refused");
                send_error_and_close(&mut ws, code, &e.to_string()).await;
                return Ok(());
            }
        };

        let registered = Envelope::Registered {
            client_id: session.client_id.clone(),
            public_port: session.public_port,
        };
        if let Err(e) = send_frame(&mut ws, &registered).await {
            self.registry
                .close(&session.client_id, "registered reply failed")
                .await;
            return Err(e);
        }
        info!(
            remote = %remote,
            client_id = %session.client_id,
            public_port = session.public_port,
            "client registered"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await; // skip the immediate tick
        let mut missed_pongs: u32 = 0;
        let close_reason;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    close_reason = "server shutdown";
                    break;
                }

                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = send_frame(&mut ws, &frame).await {
                        debug!(client_id = %session.client_id, error = %e, "control write failed");
                        close_reason = "control write failed";
                        break;
                    }
                }

                _ = ping_timer.tick() => {
                    if missed_pongs >= MAX_MISSED_PONGS {
                        warn!(client_id = %session.client_id, "heartbeat lost");
                        let _ = send_frame(&mut ws, &Envelope::error(codes::HEARTBEAT, "heartbeat lost")).await;
                        close_reason = "heartbeat lost";
                        break;
                    }
                    if send_frame(&mut ws, &Envelope::Ping).await.is_err() {
                        close_reason = "control write failed";
                        break;
                    }
                    missed_pongs += 1;
                }

                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            session.touch();
                            match codec::decode_frame(text.as_str(), MAX_FRAME_BYTES) {
                                Ok(envelope) => {
                                    match apply_frame(envelope, &session, &mut missed_pongs) {
                                        FrameAction::Continue => {}
                                        FrameAction::Reply(reply) => {
                                            if send_frame(&mut ws, &reply).await.is_err() {
                                                close_reason = "control write failed";
                                                break;
                                            }
                                        }
                                        FrameAction::Close(reason) => {
                                            close_reason = reason;
                                            break;
                                        }
                                    }
                                }
                                Err(TunnelError::FrameTooLarge { len, max }) => {
                                    warn!(client_id = %session.client_id, len, max, "frame too large");
                                    let _ = send_frame(&mut ws, &Envelope::error(codes::FRAME_TOO_LARGE, "frame too large")).await;
                                    close_reason = "frame too large";
                                    break;
                                }
                                Err(e) => {
                                    warn!(client_id = %session.client_id, error = %e, "undecodable frame");
                                    let _ = send_frame(&mut ws, &Envelope::error(codes::PROTOCOL, "undecodable frame")).await;
                                    close_reason = "protocol error";
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let _ = send_frame(&mut ws, &Envelope::error(codes::PROTOCOL, "binary frames are not part of the protocol")).await;
                            close_reason = "binary frame";
                            break;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            // Transport-level pong; the protocol uses envelopes.
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            close_reason = "client disconnected";
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(client_id = %session.client_id, error = %e, "control read error");
                            close_reason = "control read error";
                            break;
                        }
                    }
                }
            }
        }

        let _ = ws.close(None).await;
        self.registry.close(&session.client_id, close_reason).await;
        Ok(())
    }
}

/// Apply one inbound envelope to the session.
fn apply_frame(envelope: Envelope, session: &Session, missed_pongs: &mut u32) -> FrameAction {
    match envelope {
        Envelope::Response {
            request_id,
            status,
            headers,
            body_b64,
        } => {
            let result = codec::decode_body(&body_b64).map(|body| UpstreamResponse {
                status,
                headers,
                body,
            });
            if !session.pending.complete(&request_id, result) {
                debug!(
                    client_id = %session.client_id,
                    request_id = %request_id,
                    "late response dropped"
                );
            }
            FrameAction::Continue
        }
        Envelope::Ping => FrameAction::Reply(Envelope::Pong),
        Envelope::Pong => {
            *missed_pongs = 0;
            FrameAction::Continue
        }
        Envelope::Error {
            code,
            message,
            request_id,
        } => {
            warn!(
                client_id = %session.client_id,
                code = %code,
                message = %message,
                "client reported error"
            );
            if let Some(id) = request_id {
                session
                    .pending
                    .complete(&id, Err(TunnelError::LocalServer(message)));
                FrameAction::Continue
            } else if code == codes::PROTOCOL || code == codes::FRAME_TOO_LARGE {
                FrameAction::Close("client reported protocol error")
            } else {
                FrameAction::Continue
            }
        }
        Envelope::Register => FrameAction::Close("duplicate register"),
        Envelope::Registered { .. } | Envelope::Request { .. } => {
            FrameAction::Close("unexpected envelope direction")
        }
        Envelope::Unknown => {
            debug!(client_id = %session.client_id, "unknown envelope type skipped");
            FrameAction::Continue
        }
    }
}

/// Read frames until one decodes to an envelope; transport ping/pong frames
/// are answered or ignored. `None` means the peer closed.
async fn recv_frame(ws: &mut ControlStream) -> TunnelResult<Option<Envelope>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return decode_handshake(text.as_str()).map(Some);
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(TunnelError::Protocol(
                    "binary frames are not part of the protocol".into(),
                ));
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TunnelError::Transport(e.to_string())),
        }
    }
}

fn decode_handshake(text: &str) -> TunnelResult<Envelope> {
    codec::decode_frame(text, MAX_FRAME_BYTES)
}

async fn send_frame(ws: &mut ControlStream, envelope: &Envelope) -> TunnelResult<()> {
    let text = codec::encode_frame(envelope)?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TunnelError::Transport(format!("control send failed: {e}")))
}

async fn send_error_and_close(ws: &mut ControlStream, code: &str, message: &str) {
    let _ = send_frame(ws, &Envelope::error(code, message)).await;
    let _ = ws.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, SessionRegistry};

    // Each test gets its own port so parallel tests never contend for a bind.
    async fn scratch_session(
        port: u16,
    ) -> (Arc<SessionRegistry>, Arc<Session>, mpsc::Receiver<Envelope>) {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            port_min: port,
            port_max: port,
            max_clients: 8,
            request_timeout: Duration::from_secs(5),
        }));
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = registry.register(tx).await.unwrap();
        (registry, session, rx)
    }

    #[tokio::test]
    async fn response_frame_completes_the_waiter() {
        let (registry, session, _rx) = scratch_session(41300).await;
        let (waiter_rx, _guard) = session.pending.insert("r1").unwrap();

        let mut missed = 0;
        let action = apply_frame(
            Envelope::Response {
                request_id: "r1".into(),
                status: 200,
                headers: vec![("x-a".into(), "1".into())],
                body_b64: codec::encode_body(b"hello"),
            },
            &session,
            &mut missed,
        );
        assert!(matches!(action, FrameAction::Continue));

        let upstream = waiter_rx.await.unwrap().unwrap();
        assert_eq!(upstream.status, 200);
        assert_eq!(upstream.body, b"hello");

        registry.close(&session.client_id, "test").await;
    }

    #[tokio::test]
    async fn invalid_base64_fails_the_waiter() {
        let (registry, session, _rx) = scratch_session(41301).await;
        let (waiter_rx, _guard) = session.pending.insert("r1").unwrap();

        let mut missed = 0;
        apply_frame(
            Envelope::Response {
                request_id: "r1".into(),
                status: 200,
                headers: vec![],
                body_b64: "%%%".into(),
            },
            &session,
            &mut missed,
        );

        assert!(matches!(
            waiter_rx.await.unwrap(),
            Err(TunnelError::Protocol(_))
        ));
        registry.close(&session.client_id, "test").await;
    }

    #[tokio::test]
    async fn envelope_pong_resets_the_heartbeat_counter() {
        let (registry, session, _rx) = scratch_session(41302).await;
        let mut missed = 2;
        let action = apply_frame(Envelope::Pong, &session, &mut missed);
        assert!(matches!(action, FrameAction::Continue));
        assert_eq!(missed, 0);
        registry.close(&session.client_id, "test").await;
    }

    #[tokio::test]
    async fn envelope_ping_is_answered_with_pong() {
        let (registry, session, _rx) = scratch_session(41303).await;
        let mut missed = 0;
        match apply_frame(Envelope::Ping, &session, &mut missed) {
            FrameAction::Reply(Envelope::Pong) => {}
            other => panic!("unexpected action for ping: {:?}", discriminant_name(&other)),
        }
        registry.close(&session.client_id, "test").await;
    }

    #[tokio::test]
    async fn duplicate_register_closes_the_session() {
        let (registry, session, _rx) = scratch_session(41304).await;
        let mut missed = 0;
        assert!(matches!(
            apply_frame(Envelope::Register, &session, &mut missed),
            FrameAction::Close(_)
        ));
        registry.close(&session.client_id, "test").await;
    }

    fn discriminant_name(action: &FrameAction) -> &'static str {
        match action {
            FrameAction::Continue => "continue",
            FrameAction::Reply(_) => "reply",
            FrameAction::Close(_) => "close",
        }
    }

    #[test]
    fn handshake_rejects_non_register_first_frame() {
        let text = serde_json::to_string(&Envelope::Ping).unwrap();
        // Decodes fine; the caller compares against `register`.
        let envelope = decode_handshake(&text).unwrap();
        assert_ne!(envelope, Envelope::Register);

        assert!(decode_handshake("{").is_err());
    }

}
