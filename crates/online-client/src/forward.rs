//! Local HTTP forwarding.
//!
//! Turns a `request` frame into an HTTP call against the configured local
//! service and the result into a `response` frame. A failing local call
//! never takes the tunnel down; it becomes a `502` response with a short
//! plain-text body so the public caller sees what happened.

use std::time::Duration;

use tracing::{debug, warn};

use online_core::{codec, headers, Envelope, HeaderPairs, TunnelError, TunnelResult};

pub struct Forwarder {
    client: reqwest::Client,
    base: String,
}

impl Forwarder {
    /// Build a forwarder for `http://<local_host>:<local_port>`.
    ///
    /// The client is built without any content decompression (none of
    /// reqwest's compression features are enabled), so response bytes pass
    /// through the tunnel exactly as the local service produced them.
    pub fn new(local_host: &str, local_port: u16, timeout: Duration) -> TunnelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TunnelError::LocalServer(e.to_string()))?;
        Ok(Self {
            client,
            base: format!("http://{local_host}:{local_port}"),
        })
    }

    /// Forward one request to the local service. Always produces a
    /// `response` frame carrying the same `request_id`.
    pub async fn forward(
        &self,
        request_id: &str,
        method: &str,
        path: &str,
        header_pairs: HeaderPairs,
        body: Vec<u8>,
    ) -> Envelope {
        match self.call(method, path, header_pairs, body).await {
            Ok((status, response_headers, response_body)) => {
                debug!(request_id, method, path, status, "forwarded to local service");
                Envelope::Response {
                    request_id: request_id.to_string(),
                    status,
                    headers: response_headers,
                    body_b64: codec::encode_body(&response_body),
                }
            }
            Err(kind) => {
                warn!(request_id, method, path, kind, "local request failed");
                local_error_response(request_id, kind)
            }
        }
    }

    async fn call(
        &self,
        method: &str,
        path: &str,
        header_pairs: HeaderPairs,
        body: Vec<u8>,
    ) -> Result<(u16, HeaderPairs, Vec<u8>), &'static str> {
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| "request")?;
        let url = format!("{}{}", self.base, path);

        let mut request = self.client.request(method, &url);
        for (name, value) in header_pairs {
            // The local service sees its own Host; reqwest derives it from
            // the URL. Hop-by-hop headers never cross the tunnel.
            if headers::is_hop_by_hop(&name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(&name, &value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let response_headers: HeaderPairs = response
            .headers()
            .iter()
            .filter(|(name, _)| !headers::is_hop_by_hop(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let response_body = response.bytes().await.map_err(|_| "body")?.to_vec();

        Ok((status, response_headers, response_body))
    }
}

/// Short failure kind reported to the public caller.
fn classify(e: reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect"
    } else if e.is_body() || e.is_decode() {
        "body"
    } else {
        "request"
    }
}

fn local_error_response(request_id: &str, kind: &str) -> Envelope {
    Envelope::Response {
        request_id: request_id.to_string(),
        status: 502,
        headers: vec![(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )],
        body_b64: codec::encode_body(format!("Local server error: {kind}").as_bytes()),
    }
}
