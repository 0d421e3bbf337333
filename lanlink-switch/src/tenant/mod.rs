//! Tenant forwarding plane.
//!
//! A tenant couples its authenticated sessions to one kernel (or
//! in-memory) bridge. Every session gets a TAP slaved to the bridge
//! plus a dedicated reader thread; the bridge fans frames out across
//! TAPs, and each TAP's reader delivers to exactly one session, so a
//! frame reaches every peer at most once and never its own sender.

pub mod lease;
pub mod neighbor;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use lanlink_net::{Bridge, Tap};
use lanlink_proto::control::{LeaseReply, RouteEntry};

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::session::{PointSession, SessionId};

use lease::LeasePool;
use neighbor::{NeighborSnapshot, NeighborTable, MAX_IDLE};

/// Smallest forwardable Ethernet frame: dst, src, ethertype.
pub const ETH_MIN: usize = 14;

#[derive(Debug, Clone, Serialize)]
pub struct TenantSnapshot {
    pub name: String,
    pub bridge: String,
    pub mtu: u32,
    pub sessions: usize,
    pub neighbors: usize,
    pub leases_in_use: usize,
    pub lease_capacity: usize,
}

/// One isolated broadcast domain.
pub struct Tenant {
    name: String,
    mtu: u32,
    routes: Vec<RouteEntry>,
    credentials: HashMap<String, String>,
    bridge: Arc<dyn Bridge>,
    sessions: RwLock<HashMap<SessionId, Arc<PointSession>>>,
    taps: Mutex<HashMap<SessionId, Arc<dyn Tap>>>,
    neighbors: Mutex<NeighborTable>,
    lease: Mutex<LeasePool>,
}

fn parse_addr(text: &str) -> Ipv4Addr {
    text.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

impl Tenant {
    pub fn new(cfg: &NetworkConfig, bridge: Arc<dyn Bridge>) -> Self {
        let lease = LeasePool::new(
            parse_addr(&cfg.subnet.start),
            parse_addr(&cfg.subnet.end),
            parse_addr(&cfg.subnet.netmask),
        );
        Self {
            name: cfg.name.clone(),
            mtu: cfg.bridge.mtu,
            routes: cfg.routes.clone(),
            credentials: cfg.credentials(),
            bridge,
            sessions: RwLock::new(HashMap::new()),
            taps: Mutex::new(HashMap::new()),
            neighbors: Mutex::new(NeighborTable::default()),
            lease: Mutex::new(lease),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    /// Validate credentials against this tenant's table.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.credentials
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    /// The lease response body for an address in this tenant.
    pub fn lease_reply(&self, address: Ipv4Addr) -> LeaseReply {
        LeaseReply {
            address: address.to_string(),
            netmask: self
                .lease
                .lock()
                .expect("lease pool poisoned")
                .netmask()
                .to_string(),
            routes: self.routes.clone(),
        }
    }

    /// Admit a freshly authenticated session: lease an address, create
    /// and attach its TAP, and start the TAP reader thread. Calling
    /// again for an attached session just returns its address.
    pub async fn attach(self: &Arc<Self>, session: &Arc<PointSession>) -> Result<Ipv4Addr> {
        let id = session.id();
        if self.taps.lock().expect("tap table poisoned").contains_key(&id) {
            if let Some(addr) = session.address() {
                return Ok(addr);
            }
        }

        let address = self.lease.lock().expect("lease pool poisoned").allocate(id)?;

        let attach_result: Result<Arc<dyn Tap>> = async {
            let tap = self.bridge.create_tap().map_err(crate::error::SwitchError::Net)?;
            tap.set_mtu(self.mtu)?;
            tap.up()?;
            self.bridge.add_slave(tap.name()).await?;
            Ok(tap)
        }
        .await;

        let tap = match attach_result {
            Ok(tap) => tap,
            Err(e) => {
                self.lease.lock().expect("lease pool poisoned").release(id);
                return Err(e);
            }
        };

        session.set_tenant(&self.name);
        session.set_address(address);
        self.sessions
            .write()
            .expect("session table poisoned")
            .insert(id, session.clone());

        let tenant = Arc::clone(self);
        let reader_tap = tap.clone();
        thread::Builder::new()
            .name(format!("tap-{}", tap.name()))
            .spawn(move || tenant.tap_reader(id, reader_tap))?;

        info!(
            tenant = %self.name,
            session = %id,
            address = %address,
            tap = %tap.name(),
            "endpoint attached"
        );
        self.taps.lock().expect("tap table poisoned").insert(id, tap);
        Ok(address)
    }

    /// Remove a session: detach and destroy its TAP, reclaim the lease,
    /// purge its neighbor entries.
    pub async fn detach(&self, session: &PointSession) {
        let id = session.id();
        let tap = self.taps.lock().expect("tap table poisoned").remove(&id);
        if let Some(tap) = tap {
            if let Err(e) = self.bridge.del_slave(tap.name()).await {
                warn!(tenant = %self.name, tap = %tap.name(), error = %e, "detach failed");
            }
            tap.close();
        }
        self.sessions
            .write()
            .expect("session table poisoned")
            .remove(&id);
        if let Some(addr) = self.lease.lock().expect("lease pool poisoned").release(id) {
            debug!(tenant = %self.name, session = %id, address = %addr, "lease reclaimed");
        }
        self.neighbors
            .lock()
            .expect("neighbor table poisoned")
            .purge_session(id);
    }

    /// Forward a frame from an authenticated session into the bridge.
    pub fn ingress(&self, session: &PointSession, frame: &[u8]) {
        if frame.len() < ETH_MIN || frame.len() > self.mtu as usize {
            session.counters.add_dropped();
            return;
        }
        let tap = self
            .taps
            .lock()
            .expect("tap table poisoned")
            .get(&session.id())
            .cloned();
        match tap {
            Some(tap) => {
                if let Err(e) = tap.write(frame) {
                    debug!(tenant = %self.name, error = %e, "TAP write failed");
                    session.counters.add_dropped();
                }
            }
            None => session.counters.add_dropped(),
        }
    }

    /// Reader loop for one session's TAP. Runs on its own thread until
    /// the device is closed.
    fn tap_reader(&self, owner: SessionId, tap: Arc<dyn Tap>) {
        let mut buf = vec![0u8; self.mtu as usize];
        loop {
            match tap.read(&mut buf) {
                Ok(n) if n >= ETH_MIN => self.egress(owner, &buf[..n]),
                Ok(_) => continue,
                Err(e) => {
                    debug!(tap = %tap.name(), error = %e, "TAP reader finished");
                    break;
                }
            }
        }
    }

    /// Deliver a frame read from `owner`'s TAP.
    ///
    /// A known destination MAC goes straight to its session; everything
    /// else goes to the TAP's owner (the bridge already fanned floods
    /// out, one slave TAP per peer). Source elision by MAC match keeps
    /// a frame from ever returning to its sender.
    pub fn egress(&self, owner: SessionId, frame: &[u8]) {
        if frame.len() < ETH_MIN {
            return;
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[..6]);
        let mut src = [0u8; 6];
        src.copy_from_slice(&frame[6..12]);

        let (target, source) = {
            let neighbors = self.neighbors.lock().expect("neighbor table poisoned");
            let target = if dst[0] & 0x01 == 0 {
                neighbors.session_by_mac(&dst)
            } else {
                None
            };
            (target, neighbors.session_by_mac(&src))
        };

        let deliver_to = match target {
            Some(t) => {
                if source == Some(t) {
                    return;
                }
                t
            }
            None => {
                if source == Some(owner) {
                    return;
                }
                owner
            }
        };

        let session = self
            .sessions
            .read()
            .expect("session table poisoned")
            .get(&deliver_to)
            .cloned();
        if let Some(session) = session {
            if session.is_authenticated() {
                session.send_data(frame);
            }
        }
    }

    pub fn learn_neighbor(&self, address: Ipv4Addr, mac: [u8; 6], session: SessionId) {
        self.neighbors
            .lock()
            .expect("neighbor table poisoned")
            .learn(address, mac, session);
    }

    /// Age out idle neighbor entries; returns how many were dropped.
    pub fn sweep_neighbors(&self) -> usize {
        self.neighbors
            .lock()
            .expect("neighbor table poisoned")
            .sweep(MAX_IDLE)
    }

    pub fn neighbor_snapshot(&self) -> Vec<NeighborSnapshot> {
        self.neighbors
            .lock()
            .expect("neighbor table poisoned")
            .snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("session table poisoned").len()
    }

    pub fn snapshot(&self) -> TenantSnapshot {
        let lease = self.lease.lock().expect("lease pool poisoned");
        TenantSnapshot {
            name: self.name.clone(),
            bridge: self.bridge.name().to_string(),
            mtu: self.mtu,
            sessions: self.session_count(),
            neighbors: self
                .neighbors
                .lock()
                .expect("neighbor table poisoned")
                .len(),
            leases_in_use: lease.in_use(),
            lease_capacity: lease.capacity(),
        }
    }

    /// Tear down every attachment, for shutdown.
    pub async fn close(&self) {
        let taps: Vec<Arc<dyn Tap>> = self
            .taps
            .lock()
            .expect("tap table poisoned")
            .drain()
            .map(|(_, tap)| tap)
            .collect();
        for tap in taps {
            let _ = self.bridge.del_slave(tap.name()).await;
            tap.close();
        }
        self.sessions
            .write()
            .expect("session table poisoned")
            .clear();
        if let Err(e) = self.bridge.close().await {
            warn!(tenant = %self.name, error = %e, "bridge close failed");
        }
    }
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, SubnetConfig};
    use lanlink_net::{new_bridge, BridgeKind};

    fn tenant() -> Arc<Tenant> {
        let cfg = NetworkConfig {
            name: "blue".into(),
            bridge: BridgeConfig {
                name: "br-blue".into(),
                provider: "memory".into(),
                mtu: 1518,
                address: None,
            },
            subnet: SubnetConfig {
                start: "10.9.0.2".into(),
                end: "10.9.0.3".into(),
                netmask: "255.255.255.0".into(),
            },
            routes: vec![],
            password: vec![crate::config::CredentialConfig {
                username: "alice".into(),
                password: "secret".into(),
            }],
        };
        let bridge = new_bridge(BridgeKind::Memory, "br-blue", "blue", 1518);
        Arc::new(Tenant::new(&cfg, bridge))
    }

    #[test]
    fn test_authenticate() {
        let tenant = tenant();
        assert!(tenant.authenticate("alice", "secret"));
        assert!(!tenant.authenticate("alice", "wrong"));
        assert!(!tenant.authenticate("bob", "secret"));
    }

    #[tokio::test]
    async fn test_attach_assigns_address_and_detach_reclaims() {
        let tenant = tenant();
        let (session, _rx) = PointSession::new("peer:1");
        let addr = tenant.attach(&session).await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 9, 0, 2));
        assert_eq!(tenant.session_count(), 1);
        // Second attach is a no-op returning the same lease.
        assert_eq!(tenant.attach(&session).await.unwrap(), addr);

        tenant.detach(&session).await;
        assert_eq!(tenant.session_count(), 0);
        let (next, _rx) = PointSession::new("peer:2");
        assert_eq!(tenant.attach(&next).await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_ingress_polices_size() {
        let tenant = tenant();
        let (session, _rx) = PointSession::new("peer:1");
        tenant.attach(&session).await.unwrap();

        tenant.ingress(&session, &[0u8; 13]);
        assert_eq!(session.counters.snapshot().dropped, 1);
        tenant.ingress(&session, &vec![0u8; 1519]);
        assert_eq!(session.counters.snapshot().dropped, 2);
        tenant.ingress(&session, &[0xffu8; 60]);
        assert_eq!(session.counters.snapshot().dropped, 2);
    }
}
