//! Server acceptor and per-connection task pair.
//!
//! Every connection gets an inbound reader task and an outbound writer
//! task joined by the session's bounded queue, so a slow peer never
//! blocks the TAP readers or other peers. The handler chain runs on the
//! reader task in arrival order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lanlink_net::BridgeKind;
use lanlink_proto::codec::{FrameMessage, HEADER_SIZE};
use lanlink_proto::transport::{
    self, DatagramInbox, DatagramSender, FrameSink, FrameSource, StreamTransport,
    TransportOptions,
};
use lanlink_proto::{PayloadCipher, ProtoError};

use crate::admin;
use crate::config::{Protocol, SwitchConfig};
use crate::error::Result;
use crate::hooks::{run_chain, standard_chain, Hook, HookFlow, OnlineEntry, OnlineLog};
use crate::logring::LogRing;
use crate::session::{PointSession, SessionId, SessionSnapshot};
use crate::tenant::{Tenant, TenantSnapshot};

/// Payloads a datagram peer can queue before the demux loop drops for
/// that peer.
const INBOX_DEPTH: usize = 128;

/// `stats` response and admin snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReply {
    pub uuid: String,
    pub alias: String,
    pub uptime_secs: u64,
    pub tenants: Vec<TenantSnapshot>,
    pub points: Vec<SessionSnapshot>,
}

/// State shared by the acceptor, the hooks and the admin surface.
pub struct SwitchCore {
    cfg: SwitchConfig,
    uuid: String,
    started: Instant,
    pub started_at: DateTime<Utc>,
    cipher: Option<Arc<PayloadCipher>>,
    tenants: HashMap<String, Arc<Tenant>>,
    sessions: RwLock<HashMap<SessionId, Arc<PointSession>>>,
    online: Mutex<OnlineLog>,
    log_ring: Arc<LogRing>,
}

impl SwitchCore {
    fn new(cfg: SwitchConfig, log_ring: Arc<LogRing>) -> Result<Arc<Self>> {
        let cipher = cfg
            .crypt
            .as_ref()
            .map(|c| Arc::new(PayloadCipher::new(&c.secret)));

        let mut tenants = HashMap::new();
        for network in &cfg.networks {
            let kind: BridgeKind = network.bridge.provider.parse()?;
            let bridge = lanlink_net::new_bridge(
                kind,
                &network.bridge.name,
                &network.name,
                network.bridge.mtu,
            );
            let tenant = Arc::new(Tenant::new(network, bridge));
            tenants.insert(network.name.clone(), tenant);
        }

        Ok(Arc::new(Self {
            cfg,
            uuid: Uuid::new_v4().simple().to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            cipher,
            tenants,
            sessions: RwLock::new(HashMap::new()),
            online: Mutex::new(OnlineLog::default()),
            log_ring,
        }))
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.cfg
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn alias(&self) -> &str {
        &self.cfg.alias
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn log_ring(&self) -> &Arc<LogRing> {
        &self.log_ring
    }

    pub fn tenant(&self, name: &str) -> Option<Arc<Tenant>> {
        self.tenants.get(name).cloned()
    }

    /// The only tenant, when exactly one is configured; unqualified
    /// logins land here.
    pub fn sole_tenant(&self) -> Option<Arc<Tenant>> {
        if self.tenants.len() == 1 {
            self.tenants.values().next().cloned()
        } else {
            None
        }
    }

    pub fn tenants(&self) -> Vec<Arc<Tenant>> {
        self.tenants.values().cloned().collect()
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: Some(Duration::from_secs(self.cfg.timeout)),
            cipher: self.cipher.clone(),
            ..Default::default()
        }
    }

    fn register_session(&self, session: &Arc<PointSession>) {
        self.sessions
            .write()
            .expect("session registry poisoned")
            .insert(session.id(), session.clone());
    }

    pub fn sessions_snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .expect("session registry poisoned")
            .values()
            .map(|s| s.snapshot())
            .collect()
    }

    pub fn record_online(&self, session: &PointSession) {
        self.online
            .lock()
            .expect("online log poisoned")
            .record(session);
    }

    pub fn online_snapshot(&self) -> Vec<OnlineEntry> {
        self.online
            .lock()
            .expect("online log poisoned")
            .snapshot()
    }

    pub fn stats(&self) -> StatsReply {
        StatsReply {
            uuid: self.uuid.clone(),
            alias: self.cfg.alias.clone(),
            uptime_secs: self.uptime_secs(),
            tenants: self.tenants.values().map(|t| t.snapshot()).collect(),
            points: self.sessions_snapshot(),
        }
    }

    /// Close a session and release everything it holds. Safe to call
    /// more than once.
    pub async fn close_session(&self, session: &Arc<PointSession>) {
        session.close();
        if let Some(tenant) = session.tenant().and_then(|name| self.tenant(&name)) {
            tenant.detach(session).await;
        }
        self.sessions
            .write()
            .expect("session registry poisoned")
            .remove(&session.id());
    }
}

/// The switch: tenants, listener and the session task pairs.
pub struct Switch {
    core: Arc<SwitchCore>,
    hooks: Arc<Vec<Hook>>,
    shutdown: watch::Sender<bool>,
}

impl Switch {
    /// Build tenants and open their bridges.
    pub async fn new(cfg: SwitchConfig, log_ring: Arc<LogRing>) -> Result<Self> {
        let core = SwitchCore::new(cfg, log_ring)?;
        for network in &core.cfg.networks {
            if let Some(tenant) = core.tenant(&network.name) {
                tenant
                    .bridge()
                    .open(network.bridge.address.as_deref())
                    .await?;
                info!(
                    tenant = %network.name,
                    bridge = %network.bridge.name,
                    mtu = network.bridge.mtu,
                    "tenant bridge open"
                );
            }
        }
        let hooks = Arc::new(standard_chain(core.clone()));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            core,
            hooks,
            shutdown,
        })
    }

    pub fn core(&self) -> &Arc<SwitchCore> {
        &self.core
    }

    /// Bind the endpoint listener and the admin surface, then return;
    /// accepting runs on background tasks until `shutdown`.
    pub async fn start(&self) -> Result<()> {
        match self.core.cfg.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(&self.core.cfg.listen).await?;
                info!(listen = %self.core.cfg.listen, "switch listening (tcp)");
                tokio::spawn(tcp_accept_loop(
                    self.core.clone(),
                    self.hooks.clone(),
                    listener,
                    self.shutdown.subscribe(),
                ));
            }
            Protocol::Udp => {
                let socket = Arc::new(UdpSocket::bind(&self.core.cfg.listen).await?);
                info!(listen = %self.core.cfg.listen, "switch listening (udp)");
                tokio::spawn(udp_accept_loop(
                    self.core.clone(),
                    self.hooks.clone(),
                    socket,
                    self.shutdown.subscribe(),
                ));
            }
        }

        tokio::spawn(aging_loop(self.core.clone(), self.shutdown.subscribe()));

        if let Some(admin_cfg) = self.core.cfg.admin.clone() {
            let token = self.core.cfg.load_or_create_token()?;
            let listener = TcpListener::bind(&admin_cfg.listen).await?;
            info!(listen = %admin_cfg.listen, "admin surface listening");
            tokio::spawn(admin::serve(
                listener,
                self.core.clone(),
                token,
                self.shutdown.subscribe(),
            ));
        }
        Ok(())
    }

    /// Drive one already-established stream as an endpoint connection.
    /// The TCP accept loop and the integration tests share this path.
    pub fn attach_stream<S>(&self, stream: S, peer: &str) -> Arc<PointSession>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        serve_stream(
            self.core.clone(),
            self.hooks.clone(),
            stream,
            peer.to_string(),
        )
    }

    /// Drain the listener, close every session, tear down bridges.
    pub async fn shutdown(&self) {
        info!("switch shutting down");
        let _ = self.shutdown.send(true);
        let sessions: Vec<Arc<PointSession>> = self
            .core
            .sessions
            .read()
            .expect("session registry poisoned")
            .values()
            .cloned()
            .collect();
        for session in sessions {
            self.core.close_session(&session).await;
        }
        for tenant in self.core.tenants() {
            tenant.close().await;
        }
    }
}

async fn tcp_accept_loop(
    core: Arc<SwitchCore>,
    hooks: Arc<Vec<Hook>>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    serve_stream(core.clone(), hooks.clone(), stream, peer.to_string());
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => {
                info!("listener drained");
                break;
            }
        }
    }
}

fn serve_stream<S>(
    core: Arc<SwitchCore>,
    hooks: Arc<Vec<Hook>>,
    stream: S,
    peer: String,
) -> Arc<PointSession>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (source, sink) = StreamTransport::new(stream, core.transport_options()).split();
    spawn_session(core, hooks, source, sink, peer)
}

fn spawn_session(
    core: Arc<SwitchCore>,
    hooks: Arc<Vec<Hook>>,
    source: impl FrameSource + 'static,
    sink: impl FrameSink + 'static,
    peer: String,
) -> Arc<PointSession> {
    let (session, outbound_rx) = PointSession::new(peer);
    core.register_session(&session);
    session.on_connect();
    info!(session = %session.id(), remote = %session.remote(), "endpoint connected");

    tokio::spawn(writer_loop(session.clone(), sink, outbound_rx));
    tokio::spawn(reader_loop(core, hooks, session.clone(), source));
    session
}

/// Inbound task: receive, run the chain, forward admitted data frames.
async fn reader_loop(
    core: Arc<SwitchCore>,
    hooks: Arc<Vec<Hook>>,
    session: Arc<PointSession>,
    mut source: impl FrameSource,
) {
    let mut closed = session.closed_watch();
    loop {
        if session.is_closed() {
            break;
        }
        let received = tokio::select! {
            received = source.receive() => received,
            _ = closed.changed() => break,
        };
        match received {
            Ok(payload) => {
                session.counters.add_rx_ok();
                session.touch();
                let msg = FrameMessage::new(payload);
                match run_chain(&hooks, &session, &msg).await {
                    Ok(HookFlow::Continue) => {
                        if !msg.is_control() && session.is_authenticated() {
                            if let Some(tenant) =
                                session.tenant().and_then(|name| core.tenant(&name))
                            {
                                tenant.ingress(&session, msg.data());
                            }
                        }
                    }
                    Ok(HookFlow::Drop) => {}
                    Err(e) => {
                        error!(session = %session.id(), error = %e, "hook chain failed");
                        break;
                    }
                }
            }
            Err(ProtoError::Timeout) => {
                info!(session = %session.id(), "read deadline missed");
                break;
            }
            Err(ProtoError::Closed) => {
                debug!(session = %session.id(), "peer closed");
                break;
            }
            Err(e) => {
                warn!(session = %session.id(), error = %e, "receive failed");
                break;
            }
        }
    }
    core.close_session(&session).await;
    debug!(session = %session.id(), "reader finished");
}

/// Outbound task: drain the session queue into the transport. A write
/// deadline miss drops that frame only; other errors close the session.
async fn writer_loop(
    session: Arc<PointSession>,
    mut sink: impl FrameSink,
    mut outbound: mpsc::Receiver<Vec<u8>>,
) {
    let mut closed = session.closed_watch();
    loop {
        if *closed.borrow() {
            break;
        }
        let next = tokio::select! {
            next = outbound.recv() => next,
            _ = closed.changed() => break,
        };
        let Some(payload) = next else { break };
        match sink.send(&payload).await {
            Ok(_) => session.counters.add_tx_ok(),
            Err(ProtoError::Timeout) => {
                session.counters.add_tx_err();
            }
            Err(e) => {
                session.counters.add_tx_err();
                debug!(session = %session.id(), error = %e, "send failed");
                session.close();
                break;
            }
        }
    }
    // Flush replies the hooks queued right before closing, the login
    // rejection in particular.
    while let Ok(payload) = outbound.try_recv() {
        match sink.send(&payload).await {
            Ok(_) => session.counters.add_tx_ok(),
            Err(_) => {
                session.counters.add_tx_err();
                break;
            }
        }
    }
    debug!(session = %session.id(), "writer finished");
}

/// Datagram listener: demux one socket into per-peer sessions.
///
/// Each datagram is validated and opened once here; per-peer inboxes
/// feed the same reader loop the stream path uses.
async fn udp_accept_loop(
    core: Arc<SwitchCore>,
    hooks: Arc<Vec<Hook>>,
    socket: Arc<UdpSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let opts = core.transport_options();
    let mut peers: HashMap<SocketAddr, (mpsc::Sender<Vec<u8>>, Arc<PointSession>)> =
        HashMap::new();
    let mut buf = vec![0u8; HEADER_SIZE + opts.wire_max()];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = shutdown.changed() => {
                info!("datagram listener drained");
                break;
            }
        };
        let (n, peer) = match received {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "datagram receive failed");
                continue;
            }
        };
        let payload = match transport::open_datagram(&buf[..n], &opts) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(peer = %peer, error = %e, "bad datagram");
                continue;
            }
        };

        let stale = peers
            .get(&peer)
            .is_some_and(|(_, session)| session.is_closed());
        if stale {
            peers.remove(&peer);
        }
        let (inbox_tx, session) = peers.entry(peer).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(INBOX_DEPTH);
            let inbox = DatagramInbox::new(rx, opts.timeout);
            let sender = DatagramSender::new(socket.clone(), peer, opts.clone());
            let session =
                spawn_session(core.clone(), hooks.clone(), inbox, sender, peer.to_string());
            (tx, session)
        });
        if inbox_tx.try_send(payload).is_err() {
            session.counters.add_dropped();
        }
    }
}

/// Periodic neighbor aging across tenants.
async fn aging_loop(core: Arc<SwitchCore>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for tenant in core.tenants() {
                    let aged = tenant.sweep_neighbors();
                    if aged > 0 {
                        debug!(tenant = %tenant.name(), aged, "neighbors aged out");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
