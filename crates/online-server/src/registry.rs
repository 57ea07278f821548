//! Session registry.
//!
//! One entry per connected client: its public port, the outbound frame queue
//! drained by the control loop, and the correlation table for in-flight
//! requests. The registry owns the port allocator and is the only place a
//! session is created or destroyed, so listener lifetime tracks session
//! lifetime on every exit path.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use online_core::{Envelope, TunnelError, TunnelResult};

use crate::pending::PendingRequests;
use crate::ports::PortAllocator;
use crate::public;

/// Capacity of the per-session outbound frame queue. Producers block when it
/// fills, which backpressures the public listener.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Registering,
    Active,
    Draining,
    Closed,
}

/// Server-side state for one connected client.
pub struct Session {
    pub client_id: String,
    pub public_port: u16,
    /// Frames bound for the client. A single writer (the control loop)
    /// drains this; everyone else enqueues.
    pub outbound: mpsc::Sender<Envelope>,
    pub pending: Arc<PendingRequests>,
    cancel_tx: mpsc::Sender<()>,
    /// Accept-loop task; taken and awaited on close so the public socket is
    /// gone before the port is reused.
    listener_task: StdMutex<Option<JoinHandle<()>>>,
    pub created_at: Instant,
    last_activity: StdMutex<Instant>,
    state: StdMutex<SessionState>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }

    /// Record activity for idle accounting.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

/// A row of [`SessionRegistry::list`].
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub client_id: String,
    pub public_port: u16,
    pub pending_requests: usize,
    pub idle_secs: u64,
}

pub struct RegistryConfig {
    /// Address public listeners bind on (the listen host of the server).
    pub bind_addr: IpAddr,
    pub port_min: u16,
    pub port_max: u16,
    pub max_clients: usize,
    /// Deadline for each forwarded public request.
    pub request_timeout: Duration,
}

/// Table of live sessions plus the shared port allocator.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ports: StdMutex<PortAllocator>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ports: StdMutex::new(PortAllocator::new(config.port_min, config.port_max)),
            config,
        }
    }

    /// Create a session for a freshly registered client: allocate a port,
    /// bind its public listener, spawn the accept loop, and publish the
    /// session. `outbound` is the queue the caller's control loop drains.
    pub async fn register(&self, outbound: mpsc::Sender<Envelope>) -> TunnelResult<Arc<Session>> {
        if self.sessions.read().await.len() >= self.config.max_clients {
            return Err(TunnelError::ClientLimit(self.config.max_clients));
        }

        let port = self.ports.lock().unwrap().allocate()?;
        let addr = SocketAddr::new(self.config.bind_addr, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.ports.lock().unwrap().release(port);
                return Err(TunnelError::Bind { port, source });
            }
        };

        let client_id = generate_client_id();
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let now = Instant::now();
        let session = Arc::new(Session {
            client_id: client_id.clone(),
            public_port: port,
            outbound,
            pending: Arc::new(PendingRequests::new()),
            cancel_tx,
            listener_task: StdMutex::new(None),
            created_at: now,
            last_activity: StdMutex::new(now),
            state: StdMutex::new(SessionState::Registering),
        });

        let listener_task = public::spawn_accept_loop(
            listener,
            Arc::clone(&session),
            cancel_rx,
            self.config.request_timeout,
        );
        *session.listener_task.lock().unwrap() = Some(listener_task);

        self.sessions
            .write()
            .await
            .insert(client_id.clone(), Arc::clone(&session));
        session.set_state(SessionState::Active);

        info!(client_id = %client_id, public_port = port, "tunnel registered");
        Ok(session)
    }

    pub async fn lookup(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    /// Tear a session down: Active → Draining → Closed. Exactly one caller
    /// performs the teardown (the one that removes the map entry); every
    /// later call is a no-op. Fails all pending waiters, stops the public
    /// listener, and returns the port to the allocator. The accept loop is
    /// awaited, not just signalled: when `close` returns, the public socket
    /// is closed and the port can be bound again.
    pub async fn close(&self, client_id: &str, reason: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(client_id) else {
            return false;
        };

        session.set_state(SessionState::Draining);
        let _ = session.cancel_tx.send(()).await;
        let listener_task = session.listener_task.lock().unwrap().take();
        if let Some(task) = listener_task {
            let _ = task.await;
        }
        session.pending.fail_all();
        self.ports.lock().unwrap().release(session.public_port);
        session.set_state(SessionState::Closed);

        info!(
            client_id = %client_id,
            public_port = session.public_port,
            reason,
            "tunnel closed"
        );
        true
    }

    pub async fn list(&self) -> Vec<TunnelInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|s| TunnelInfo {
                client_id: s.client_id.clone(),
                public_port: s.public_port,
                pending_requests: s.pending.len(),
                idle_secs: s.idle().as_secs(),
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn ports_in_use(&self) -> usize {
        self.ports.lock().unwrap().in_use_count()
    }

    /// Move every session to Draining: public listeners stop accepting but
    /// in-flight requests may still complete. Part of graceful shutdown.
    pub async fn begin_drain(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.set_state(SessionState::Draining);
            let _ = session.cancel_tx.send(()).await;
        }
        debug!("all sessions draining");
    }

    /// Wait until no session has in-flight requests, or `grace` elapses.
    pub async fn wait_drained(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let in_flight: usize = self
                .sessions
                .read()
                .await
                .values()
                .map(|s| s.pending.len())
                .sum();
            if in_flight == 0 || Instant::now() >= deadline {
                if in_flight > 0 {
                    info!(in_flight, "shutdown grace elapsed, forcing close");
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Close every remaining session.
    pub async fn close_all(&self, reason: &str) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.close(&id, reason).await;
        }
    }
}

/// Short opaque client identifier: 8 random bytes, hex-encoded.
fn generate_client_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
