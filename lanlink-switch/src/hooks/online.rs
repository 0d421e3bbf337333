//! Last-seen bookkeeping for observability.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use lanlink_proto::codec::FrameMessage;

use crate::error::Result;
use crate::hooks::HookFlow;
use crate::server::SwitchCore;
use crate::session::{PointSession, SessionId};

/// Endpoints the online log remembers; the least recently seen falls
/// out first.
pub const ONLINE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct OnlineEntry {
    pub session: SessionId,
    pub identity: Option<String>,
    pub remote: String,
    pub last_seen: DateTime<Utc>,
}

/// Small LRU of recently active endpoints.
#[derive(Debug, Default)]
pub struct OnlineLog {
    entries: HashMap<SessionId, OnlineEntry>,
    order: VecDeque<SessionId>,
}

impl OnlineLog {
    pub fn record(&mut self, session: &PointSession) {
        let id = session.id();
        self.entries.insert(
            id,
            OnlineEntry {
                session: id,
                identity: session.identity(),
                remote: session.remote().to_string(),
                last_seen: Utc::now(),
            },
        );
        self.order.retain(|other| *other != id);
        self.order.push_back(id);
        while self.order.len() > ONLINE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    /// Most recently seen first.
    pub fn snapshot(&self) -> Vec<OnlineEntry> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct OnlineHook {
    core: Arc<SwitchCore>,
}

impl OnlineHook {
    pub fn new(core: Arc<SwitchCore>) -> Self {
        Self { core }
    }

    pub fn apply(&self, session: &Arc<PointSession>, msg: &FrameMessage) -> Result<HookFlow> {
        if !msg.is_control() {
            self.core.record_online(session);
        }
        Ok(HookFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction() {
        let mut log = OnlineLog::default();
        let mut sessions = Vec::new();
        for i in 0..ONLINE_CAPACITY + 5 {
            let (session, _rx) = PointSession::new(format!("peer:{i}"));
            log.record(&session);
            sessions.push(session);
        }
        assert_eq!(log.len(), ONLINE_CAPACITY);
        let snap = log.snapshot();
        // Newest first; the first five endpoints were evicted.
        assert_eq!(snap[0].remote, format!("peer:{}", ONLINE_CAPACITY + 4));
        assert!(snap.iter().all(|e| e.remote != "peer:0"));
    }

    #[test]
    fn test_reseen_moves_to_front() {
        let mut log = OnlineLog::default();
        let (a, _rxa) = PointSession::new("peer:a");
        let (b, _rxb) = PointSession::new("peer:b");
        log.record(&a);
        log.record(&b);
        log.record(&a);
        let snap = log.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].remote, "peer:a");
    }
}
