//! Per-session public HTTP listener.
//!
//! Each session owns one TCP listener on its public port. Accepted
//! connections are parsed as HTTP/1.1, serialized into a `request` frame,
//! and parked on the session's correlation table until the client's
//! `response` frame (or a terminal failure) arrives. The accept loop runs in
//! its own task and is cancelled through the session's cancel channel.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::CONNECTION;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use online_core::{codec, headers, Envelope, HeaderPairs, TunnelError};

use crate::pending::UpstreamResponse;
use crate::registry::Session;

/// Largest public request body forwarded through the tunnel: 16 MiB.
pub const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Spawn the accept loop for a session's public listener.
///
/// The returned handle completes once the loop has exited and the listener
/// socket is dropped; `close` awaits it so the port is no longer accepting
/// before it is returned to the allocator.
pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    session: Arc<Session>,
    cancel_rx: mpsc::Receiver<()>,
    request_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let port = session.public_port;
        accept_loop(listener, session, cancel_rx, request_timeout).await;
        debug!(public_port = port, "public accept loop ended");
    })
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Session>,
    mut cancel_rx: mpsc::Receiver<()>,
    request_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(public_port = session.public_port, "public listener cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(public_port = session.public_port, peer = %peer, "public connection accepted");
                        let session = Arc::clone(&session);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let conn_session = Arc::clone(&session);
                            let service = service_fn(move |req: Request<Incoming>| {
                                handle_public_request(req, Arc::clone(&conn_session), request_timeout)
                            });
                            // No keep-alive: one request per public connection.
                            let conn = http1::Builder::new()
                                .keep_alive(false)
                                .serve_connection(io, service);
                            if let Err(e) = conn.await {
                                debug!(peer = %peer, error = %e, "public connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(public_port = session.public_port, error = %e, "public accept failed");
                    }
                }
            }
        }
    }
}

/// Serve one public HTTP request through the tunnel.
async fn handle_public_request(
    req: Request<Incoming>,
    session: Arc<Session>,
    request_timeout: Duration,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let header_pairs: HeaderPairs = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let header_pairs = headers::strip_hop_by_hop(header_pairs);

    let body = match Limited::new(req.into_body(), MAX_REQUEST_BODY_BYTES)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
            return Ok(plain_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
            ));
        }
        Err(e) => {
            debug!(error = %e, "failed to read public request body");
            return Ok(plain_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    let request_id = generate_request_id();
    let (waiter_rx, _guard) = match session.pending.insert(&request_id) {
        Ok(parked) => parked,
        Err(e) => {
            warn!(error = %e, "failed to park waiter");
            return Ok(plain_response(StatusCode::BAD_GATEWAY, "bad gateway"));
        }
    };

    let frame = Envelope::Request {
        request_id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        headers: header_pairs,
        body_b64: codec::encode_body(&body),
    };
    // Bounded queue: awaiting here backpressures the public side when the
    // control channel falls behind.
    if session.outbound.send(frame).await.is_err() {
        return Ok(finish(
            &method,
            &path,
            started,
            plain_response(StatusCode::BAD_GATEWAY, "session closed"),
        ));
    }
    session.touch();

    let response = match timeout(request_timeout, waiter_rx).await {
        // Deadline elapsed; the guard removes the waiter and any late
        // response frame is dropped by the correlation table.
        Err(_) => plain_response(StatusCode::GATEWAY_TIMEOUT, "upstream timeout"),
        // Waiter removed without a terminal event (session torn down).
        Ok(Err(_)) => plain_response(StatusCode::BAD_GATEWAY, "session closed"),
        Ok(Ok(Err(e))) => {
            let status = match e {
                TunnelError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            plain_response(status, &e.to_string())
        }
        Ok(Ok(Ok(upstream))) => build_public_response(upstream),
    };

    session.touch();
    Ok(finish(&method, &path, started, response))
}

/// Translate the client's response payload into the public HTTP response.
fn build_public_response(upstream: UpstreamResponse) -> Response<Full<Bytes>> {
    let Ok(status) = StatusCode::from_u16(upstream.status) else {
        return plain_response(StatusCode::BAD_GATEWAY, "invalid upstream status");
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers {
        if headers::is_hop_by_hop(&name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(CONNECTION, "close");

    match builder.body(Full::new(Bytes::from(upstream.body))) {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "upstream response had malformed headers");
            plain_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(CONNECTION, http::HeaderValue::from_static("close"));
    response
}

fn finish(
    method: &str,
    path: &str,
    started: Instant,
    response: Response<Full<Bytes>>,
) -> Response<Full<Bytes>> {
    info!(
        method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "public request"
    );
    response
}

/// Request identifier: 16 random bytes, hex-encoded. Unique within a session.
fn generate_request_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use online_core::TunnelResult;

    fn upstream(status: u16, headers: HeaderPairs) -> UpstreamResponse {
        UpstreamResponse {
            status,
            headers,
            body: b"body".to_vec(),
        }
    }

    #[test]
    fn request_ids_are_unique_and_hex() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn upstream_headers_survive_minus_hop_by_hop() {
        let response = build_public_response(upstream(
            200,
            vec![
                ("set-cookie".into(), "a=1".into()),
                ("connection".into(), "keep-alive".into()),
                ("set-cookie".into(), "b=2".into()),
            ],
        ));
        assert_eq!(response.status(), StatusCode::OK);
        let cookies: Vec<_> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
    }

    #[test]
    fn invalid_upstream_status_maps_to_bad_gateway() {
        let response = build_public_response(upstream(1000, vec![]));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn malformed_upstream_header_maps_to_bad_gateway() {
        let response = build_public_response(upstream(
            200,
            vec![("bad header name".into(), "x".into())],
        ));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn late_completion_after_timeout_is_dropped() {
        let pending = Arc::new(crate::pending::PendingRequests::new());
        let (waiter_rx, guard) = pending.insert("r1").unwrap();

        // Deadline fires first.
        let outcome = timeout(Duration::from_millis(10), waiter_rx).await;
        assert!(outcome.is_err());
        drop(guard);

        // The late response finds no waiter.
        let late: TunnelResult<UpstreamResponse> = Ok(upstream(200, vec![]));
        assert!(!pending.complete("r1", late));
    }
}
