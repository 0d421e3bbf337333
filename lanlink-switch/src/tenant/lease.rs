//! Virtual address lease pool.
//!
//! Allocation scans the configured range from the start, skipping
//! occupied entries, so a freed address is handed out again on the very
//! next login. O(range) per allocate and release.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::{Result, SwitchError};
use crate::session::SessionId;

#[derive(Debug)]
pub struct LeasePool {
    start: u32,
    end: u32,
    netmask: Ipv4Addr,
    leases: HashMap<Ipv4Addr, SessionId>,
}

impl LeasePool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            start: u32::from(start),
            end: u32::from(end),
            netmask,
            leases: HashMap::new(),
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    /// Addresses in the configured range.
    pub fn capacity(&self) -> usize {
        (self.end.saturating_sub(self.start) as usize) + 1
    }

    pub fn in_use(&self) -> usize {
        self.leases.len()
    }

    /// Lease an address to `owner`. A session that already holds one
    /// gets the same address back.
    pub fn allocate(&mut self, owner: SessionId) -> Result<Ipv4Addr> {
        if let Some((addr, _)) = self.leases.iter().find(|(_, sid)| **sid == owner) {
            return Ok(*addr);
        }
        if self.start == 0 || self.end < self.start {
            return Err(SwitchError::Resource("no address range configured".into()));
        }
        for raw in self.start..=self.end {
            let addr = Ipv4Addr::from(raw);
            if !self.leases.contains_key(&addr) {
                self.leases.insert(addr, owner);
                return Ok(addr);
            }
        }
        Err(SwitchError::Resource("address pool exhausted".into()))
    }

    /// Return the owner's lease, if any, to the pool.
    pub fn release(&mut self, owner: SessionId) -> Option<Ipv4Addr> {
        let addr = self
            .leases
            .iter()
            .find(|(_, sid)| **sid == owner)
            .map(|(addr, _)| *addr)?;
        self.leases.remove(&addr);
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pool() -> LeasePool {
        LeasePool::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 4),
            Ipv4Addr::new(255, 255, 255, 0),
        )
    }

    #[test]
    fn test_sequential_allocation() {
        let mut pool = pool();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pool.allocate(a).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pool.allocate(b).unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_allocate_is_stable_per_owner() {
        let mut pool = pool();
        let a = Uuid::new_v4();
        assert_eq!(pool.allocate(a).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pool.allocate(a).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = pool();
        assert_eq!(pool.capacity(), 3);
        for _ in 0..3 {
            pool.allocate(Uuid::new_v4()).unwrap();
        }
        assert!(matches!(
            pool.allocate(Uuid::new_v4()),
            Err(SwitchError::Resource(_))
        ));
    }

    #[test]
    fn test_release_makes_first_address_reusable() {
        let mut pool = pool();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        pool.allocate(a).unwrap();
        pool.allocate(b).unwrap();
        assert_eq!(pool.release(a), Some(Ipv4Addr::new(10, 0, 0, 2)));
        // The freed first address is handed out immediately.
        assert_eq!(
            pool.allocate(Uuid::new_v4()).unwrap(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[test]
    fn test_release_unknown_owner() {
        let mut pool = pool();
        assert_eq!(pool.release(Uuid::new_v4()), None);
    }
}
