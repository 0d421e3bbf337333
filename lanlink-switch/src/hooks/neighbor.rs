//! ARP snooping into the tenant neighbor table.

use std::net::Ipv4Addr;
use std::sync::Arc;

use smoltcp::wire::{ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol};
use tracing::debug;

use lanlink_proto::codec::FrameMessage;

use crate::error::Result;
use crate::hooks::HookFlow;
use crate::server::SwitchCore;
use crate::session::PointSession;

pub struct NeighborHook {
    core: Arc<SwitchCore>,
}

impl NeighborHook {
    pub fn new(core: Arc<SwitchCore>) -> Self {
        Self { core }
    }

    pub fn apply(&self, session: &Arc<PointSession>, msg: &FrameMessage) -> Result<HookFlow> {
        if msg.is_control() || !session.is_authenticated() {
            return Ok(HookFlow::Continue);
        }
        if let Some((address, mac)) = snoop_arp(msg.data()) {
            if let Some(tenant) = session.tenant().and_then(|name| self.core.tenant(&name)) {
                debug!(
                    tenant = %tenant.name(),
                    address = %address,
                    session = %session.id(),
                    "neighbor learned"
                );
                tenant.learn_neighbor(address, mac, session.id());
            }
        }
        Ok(HookFlow::Continue)
    }
}

/// Pull the sender binding out of an ARP request or reply.
fn snoop_arp(frame: &[u8]) -> Option<(Ipv4Addr, [u8; 6])> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let packet = ArpPacket::new_checked(eth.payload()).ok()?;
    let repr = ArpRepr::parse(&packet).ok()?;
    match repr {
        ArpRepr::EthernetIpv4 {
            source_hardware_addr,
            source_protocol_addr,
            ..
        } => Some((Ipv4Addr::from(source_protocol_addr.0), source_hardware_addr.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::arp_announcement;

    #[test]
    fn test_snoop_arp_reply() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        let frame = arp_announcement(mac, ip);
        assert_eq!(snoop_arp(&frame), Some((ip, mac)));
    }

    #[test]
    fn test_snoop_ignores_non_arp() {
        let mut frame = vec![0u8; 60];
        frame[..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&[0xaa, 0, 0, 0, 0, 1]);
        frame[12] = 0x08; // IPv4 ethertype
        frame[13] = 0x00;
        assert_eq!(snoop_arp(&frame), None);
    }

    #[test]
    fn test_snoop_ignores_garbage() {
        assert_eq!(snoop_arp(&[0u8; 3]), None);
    }
}
