//! Per-session request correlation.
//!
//! Every public HTTP request parks a single-fire waiter here before its
//! `request` frame is queued on the control channel. The waiter is removed
//! exactly once, by whichever terminal event comes first: the client's
//! response, the deadline, the public connection aborting, or the session
//! closing. Removal is idempotent; a `response` frame for an id that is no
//! longer present is silently dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use online_core::{HeaderPairs, TunnelError, TunnelResult};

/// Decoded payload of a client `response` frame.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderPairs,
    pub body: Vec<u8>,
}

type Waiter = oneshot::Sender<TunnelResult<UpstreamResponse>>;

/// The correlation table: `request_id` → waiter.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a waiter for `request_id`. The caller holds the receiver and the
    /// returned guard; dropping the guard (public connection aborted, timed
    /// out) removes the entry if it is still present.
    pub fn insert(
        self: &Arc<Self>,
        request_id: &str,
    ) -> TunnelResult<(oneshot::Receiver<TunnelResult<UpstreamResponse>>, WaiterGuard)> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(request_id) {
            return Err(TunnelError::Protocol(format!(
                "duplicate request id {request_id}"
            )));
        }
        inner.insert(request_id.to_string(), tx);
        Ok((
            rx,
            WaiterGuard {
                request_id: request_id.to_string(),
                table: Arc::clone(self),
            },
        ))
    }

    /// Hand a terminal result to the waiter for `request_id`, removing it.
    /// Returns `false` when no waiter is present (late arrival after a
    /// timeout, abort, or session close); the result is discarded.
    pub fn complete(&self, request_id: &str, result: TunnelResult<UpstreamResponse>) -> bool {
        let waiter = self.inner.lock().unwrap().remove(request_id);
        match waiter {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every parked waiter with `SessionClosed` and empty the table.
    pub fn fail_all(&self) {
        let drained: Vec<(String, Waiter)> = self.inner.lock().unwrap().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(TunnelError::SessionClosed));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, request_id: &str) {
        self.inner.lock().unwrap().remove(request_id);
    }
}

/// Removes the waiter on drop unless a terminal event already did.
pub struct WaiterGuard {
    request_id: String,
    table: Arc<PendingRequests>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> TunnelResult<UpstreamResponse> {
        Ok(UpstreamResponse {
            status,
            headers: vec![],
            body: b"ok".to_vec(),
        })
    }

    #[tokio::test]
    async fn complete_fulfils_the_waiter_once() {
        let table = Arc::new(PendingRequests::new());
        let (rx, _guard) = table.insert("r1").unwrap();

        assert!(table.complete("r1", response(200)));
        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.status, 200);

        // Second completion finds nothing: the late response is dropped.
        assert!(!table.complete("r1", response(200)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let table = Arc::new(PendingRequests::new());
        let (_rx, _guard) = table.insert("r1").unwrap();
        assert!(matches!(
            table.insert("r1"),
            Err(TunnelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_guard_removes_the_waiter() {
        let table = Arc::new(PendingRequests::new());
        {
            let (_rx, _guard) = table.insert("r1").unwrap();
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
        assert!(!table.complete("r1", response(200)));
    }

    #[tokio::test]
    async fn fail_all_closes_every_waiter() {
        let table = Arc::new(PendingRequests::new());
        let (rx1, _g1) = table.insert("r1").unwrap();
        let (rx2, _g2) = table.insert("r2").unwrap();

        table.fail_all();
        assert!(table.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(TunnelError::SessionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(TunnelError::SessionClosed)));
    }

    #[tokio::test]
    async fn receiver_errors_when_waiter_is_dropped_without_completion() {
        let table = Arc::new(PendingRequests::new());
        let (rx, guard) = table.insert("r1").unwrap();
        drop(guard);
        // No terminal event was delivered; the receiver observes the drop.
        assert!(rx.await.is_err());
    }
}
