//! Canned frames for tests.

use std::net::Ipv4Addr;

use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Ipv4Address,
};

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// An IPv4 Ethernet frame with a zeroed payload of `payload_len` bytes.
pub fn eth_frame(dst: [u8; 6], src: [u8; 6], payload_len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; 14 + payload_len];
    frame[..6].copy_from_slice(&dst);
    frame[6..12].copy_from_slice(&src);
    frame[12] = 0x08;
    frame[13] = 0x00;
    frame
}

/// A gratuitous ARP reply announcing `mac` as the owner of `ip`.
pub fn arp_announcement(mac: [u8; 6], ip: Ipv4Addr) -> Vec<u8> {
    let arp = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: EthernetAddress(mac),
        source_protocol_addr: Ipv4Address(ip.octets()),
        target_hardware_addr: EthernetAddress(BROADCAST_MAC),
        target_protocol_addr: Ipv4Address(ip.octets()),
    };
    let eth = EthernetRepr {
        src_addr: EthernetAddress(mac),
        dst_addr: EthernetAddress(BROADCAST_MAC),
        ethertype: EthernetProtocol::Arp,
    };
    let mut buf = vec![0u8; eth.buffer_len() + arp.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp.emit(&mut packet);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arp_announcement_parses() {
        let frame = arp_announcement([0xaa, 0, 0, 0, 0, 1], Ipv4Addr::new(10, 0, 0, 2));
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
        let packet = ArpPacket::new_checked(eth.payload()).unwrap();
        let repr = ArpRepr::parse(&packet).unwrap();
        match repr {
            ArpRepr::EthernetIpv4 {
                operation,
                source_protocol_addr,
                ..
            } => {
                assert_eq!(operation, ArpOperation::Reply);
                assert_eq!(source_protocol_addr, Ipv4Address([10, 0, 0, 2]));
            }
            other => panic!("unexpected ARP repr {other:?}"),
        }
    }
}
