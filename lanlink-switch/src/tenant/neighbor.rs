//! Per-tenant neighbor table, learned by ARP snooping.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::SessionId;

/// Entries idle this long are purged by the sweep.
pub const MAX_IDLE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub mac: [u8; 6],
    pub session: SessionId,
    pub learned_at: DateTime<Utc>,
    last_seen: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborSnapshot {
    pub address: Ipv4Addr,
    pub mac: String,
    pub session: SessionId,
    pub learned_at: DateTime<Utc>,
    pub idle_secs: u64,
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// IPv4 → MAC → session mapping for one tenant. Guarded by the
/// tenant's lock; critical sections stay short.
#[derive(Debug, Default)]
pub struct NeighborTable {
    entries: HashMap<Ipv4Addr, NeighborEntry>,
}

impl NeighborTable {
    /// Learn or refresh a neighbor.
    pub fn learn(&mut self, address: Ipv4Addr, mac: [u8; 6], session: SessionId) {
        match self.entries.get_mut(&address) {
            Some(entry) if entry.mac == mac && entry.session == session => {
                entry.last_seen = Instant::now();
            }
            _ => {
                self.entries.insert(
                    address,
                    NeighborEntry {
                        mac,
                        session,
                        learned_at: Utc::now(),
                        last_seen: Instant::now(),
                    },
                );
            }
        }
    }

    /// Session owning a MAC, if any entry maps to it.
    pub fn session_by_mac(&self, mac: &[u8; 6]) -> Option<SessionId> {
        self.entries
            .values()
            .find(|e| &e.mac == mac)
            .map(|e| e.session)
    }

    /// Drop every entry pointing at a session; called when it closes so
    /// entries only ever reference live sessions.
    pub fn purge_session(&mut self, session: SessionId) {
        self.entries.retain(|_, e| e.session != session);
    }

    /// Age out idle entries.
    pub fn sweep(&mut self, max_idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_seen.elapsed() < max_idle);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<NeighborSnapshot> {
        let mut entries: Vec<NeighborSnapshot> = self
            .entries
            .iter()
            .map(|(address, e)| NeighborSnapshot {
                address: *address,
                mac: format_mac(&e.mac),
                session: e.session,
                learned_at: e.learned_at,
                idle_secs: e.last_seen.elapsed().as_secs(),
            })
            .collect();
        entries.sort_by_key(|e| e.address);
        entries
    }
}
