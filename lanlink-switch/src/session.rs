//! Per-connection endpoint session.
//!
//! A session owns its transport exclusively; the tenant only ever sees
//! the bounded outbound queue. Counters are atomics, state lives under
//! short std mutexes, and `close` is idempotent with `Closed` as the
//! absorbing state.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use lanlink_proto::codec::{self, Action, Operator};

pub type SessionId = Uuid;

/// Frames a session can queue for its writer task before the switch
/// starts dropping for that peer.
pub const OUTBOUND_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Init,
    Connected,
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Monotonic per-session counters. Reads are eventually consistent.
#[derive(Debug, Default)]
pub struct Counters {
    tx_ok: AtomicU64,
    rx_ok: AtomicU64,
    tx_err: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterSnapshot {
    pub tx_ok: u64,
    pub rx_ok: u64,
    pub tx_err: u64,
    pub dropped: u64,
}

impl Counters {
    pub fn add_tx_ok(&self) {
        self.tx_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rx_ok(&self) {
        self.rx_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tx_err(&self) {
        self.tx_err.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            tx_ok: self.tx_ok.load(Ordering::Relaxed),
            rx_ok: self.rx_ok.load(Ordering::Relaxed),
            tx_err: self.tx_err.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub remote: String,
    pub status: SessionStatus,
    pub identity: Option<String>,
    pub alias: Option<String>,
    pub tenant: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub counters: CounterSnapshot,
}

/// One remote endpoint's connection state.
pub struct PointSession {
    id: SessionId,
    remote: String,
    created_at: DateTime<Utc>,
    started: Instant,
    status: Mutex<SessionStatus>,
    identity: Mutex<Option<String>>,
    alias: Mutex<Option<String>>,
    tenant: Mutex<Option<String>>,
    address: Mutex<Option<Ipv4Addr>>,
    last_seen: Mutex<Instant>,
    pub counters: Counters,
    outbound: mpsc::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
}

impl PointSession {
    /// Create a session in `Init`; the receiver half of `outbound`
    /// belongs to the session's writer task.
    pub fn new(remote: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let (closed_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            remote: remote.into(),
            created_at: Utc::now(),
            started: Instant::now(),
            status: Mutex::new(SessionStatus::Init),
            identity: Mutex::new(None),
            alias: Mutex::new(None),
            tenant: Mutex::new(None),
            address: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            counters: Counters::default(),
            outbound,
            closed_tx,
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().expect("session status poisoned")
    }

    /// Move the state machine forward. Transitions are unidirectional;
    /// a request to move backwards (or out of `Closed`) is refused.
    pub fn advance(&self, to: SessionStatus) -> bool {
        let mut status = self.status.lock().expect("session status poisoned");
        if *status == SessionStatus::Closed || to <= *status {
            return false;
        }
        debug!(session = %self.id, from = ?*status, to = ?to, "session state");
        *status = to;
        true
    }

    pub fn on_connect(&self) {
        self.advance(SessionStatus::Connected);
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.lock().expect("identity poisoned").clone()
    }

    pub fn set_identity(&self, identity: &str, alias: Option<String>) {
        *self.identity.lock().expect("identity poisoned") = Some(identity.to_string());
        *self.alias.lock().expect("alias poisoned") = alias;
    }

    pub fn tenant(&self) -> Option<String> {
        self.tenant.lock().expect("tenant poisoned").clone()
    }

    pub fn set_tenant(&self, tenant: &str) {
        *self.tenant.lock().expect("tenant poisoned") = Some(tenant.to_string());
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        *self.address.lock().expect("address poisoned")
    }

    pub fn set_address(&self, address: Ipv4Addr) {
        *self.address.lock().expect("address poisoned") = Some(address);
    }

    pub fn touch(&self) {
        *self.last_seen.lock().expect("last_seen poisoned") = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_seen.lock().expect("last_seen poisoned").elapsed()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Observe closing; used by the reader and writer tasks.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Queue a control message for the writer task.
    pub fn send_control(&self, action: Action, operator: Operator, body: &[u8]) -> bool {
        self.enqueue(codec::encode_control(action, operator, body))
    }

    /// Queue a control message echoing raw action bytes, for answering
    /// requests whose action the switch does not know.
    pub fn send_control_raw(&self, action: &[u8; 4], operator: Operator, body: &[u8]) -> bool {
        let mut payload = codec::encode_control(Action::Ping, operator, body);
        payload[codec::SENTINEL_SIZE..codec::SENTINEL_SIZE + 4].copy_from_slice(action);
        self.enqueue(payload)
    }

    /// Queue an Ethernet frame for the writer task. Never blocks: a
    /// full queue drops the frame for this peer only.
    pub fn send_data(&self, frame: &[u8]) -> bool {
        if self.is_closed() {
            self.counters.add_dropped();
            return false;
        }
        self.enqueue(frame.to_vec())
    }

    fn enqueue(&self, payload: Vec<u8>) -> bool {
        match self.outbound.try_send(payload) {
            Ok(()) => true,
            Err(_) => {
                self.counters.add_dropped();
                false
            }
        }
    }

    /// Transition to `Closed` and wake the reader and writer tasks.
    /// Idempotent; after the first call no further hooks run and no
    /// further bytes are written for this session.
    pub fn close(&self) {
        {
            let mut status = self.status.lock().expect("session status poisoned");
            if *status == SessionStatus::Closed {
                return;
            }
            *status = SessionStatus::Closed;
        }
        info!(session = %self.id, remote = %self.remote, "session closed");
        let _ = self.closed_tx.send(true);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            remote: self.remote.clone(),
            status: self.status(),
            identity: self.identity(),
            alias: self.alias.lock().expect("alias poisoned").clone(),
            tenant: self.tenant(),
            address: self.address(),
            created_at: self.created_at,
            uptime_secs: self.uptime_secs(),
            counters: self.counters.snapshot(),
        }
    }
}

impl std::fmt::Debug for PointSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("status", &self.status())
            .finish()
    }
}
