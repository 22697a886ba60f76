//!
//! Ethernet addresses and headers.
//!
use std::fmt;

use rand::{thread_rng, Rng};

use crate::errors::{Error, Result};
use crate::mbuf::Mbuf;

pub const ETHER_ADDR_LEN: usize = 6;

/// Ethernet header length without a VLAN tag.
pub const ETHER_HDR_LEN: usize = 14;
/// Length of an 802.1q tag (TPID + TCI).
pub const VLAN_HDR_LEN: usize = 4;

/// IPv4 Protocol.
pub const ETHER_TYPE_IPV4: u16 = 0x0800;
/// IPv6 Protocol.
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;
/// Arp Protocol.
pub const ETHER_TYPE_ARP: u16 = 0x0806;
/// IEEE 802.1Q VLAN tagging.
pub const ETHER_TYPE_VLAN: u16 = 0x8100;

/// A MAC address as the vif record and the port drivers carry it.
///
/// The registry only ever moves these around whole: the agent supplies one
/// (or leaves it zero to have the NIC address adopted), ports report theirs,
/// and synthetic devices get a generated one.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct EtherAddr([u8; ETHER_ADDR_LEN]);

impl EtherAddr {
    pub const fn new(octets: [u8; ETHER_ADDR_LEN]) -> EtherAddr {
        EtherAddr(octets)
    }

    /// The all-zero address the agent sends when it wants the port's own
    /// MAC adopted.
    pub const fn zeroed() -> EtherAddr {
        EtherAddr([0; ETHER_ADDR_LEN])
    }

    /// Whether the address was left unset.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; ETHER_ADDR_LEN]
    }

    /// A generated address for devices with no port to inherit from, e.g. a
    /// KNI riding on a bond. Unicast, locally administered.
    pub fn random() -> EtherAddr {
        let mut octets = [0u8; ETHER_ADDR_LEN];
        thread_rng().fill(&mut octets);
        octets[0] = (octets[0] | 0x02) & !0x01;

        EtherAddr(octets)
    }
}

impl fmt::Display for EtherAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut sep = "";
        for octet in &self.0 {
            write!(f, "{}{:02x}", sep, octet)?;
            sep = ":";
        }

        Ok(())
    }
}

/// Ethernet header length of a frame: 14, or 18 when the two bytes after the
/// destination/source MACs carry the 802.1q TPID.
pub fn ether_hdr_len(frame: &[u8]) -> usize {
    if frame.len() >= ETHER_HDR_LEN && u16::from_be_bytes([frame[12], frame[13]]) == ETHER_TYPE_VLAN {
        ETHER_HDR_LEN + VLAN_HDR_LEN
    } else {
        ETHER_HDR_LEN
    }
}

pub trait VlanExt {
    /// Insert a VLAN tag into the frame, taking the TCI from the buffer's
    /// `vlan_tci` slot.
    fn vlan_insert(&mut self) -> Result<()>;
}

impl VlanExt for Mbuf {
    fn vlan_insert(&mut self) -> Result<()> {
        if self.data_len() < ETHER_HDR_LEN {
            return Err(Error::InvalidArgument("runt Ethernet frame".into()));
        }

        let tci = self.vlan_tci;
        self.prepend(VLAN_HDR_LEN)?;

        let data = self.data_mut();
        // Move the MACs to the new head; the original EtherType stays put and
        // becomes the tag's inner type.
        data.copy_within(VLAN_HDR_LEN..VLAN_HDR_LEN + 2 * ETHER_ADDR_LEN, 0);
        data[12..14].copy_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
        data[14..16].copy_from_slice(&tci.to_be_bytes());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::MemoryPool;

    #[test]
    fn test_macaddr() {
        // The fabric-port fixture address used across the scenario suite.
        let fabric = EtherAddr::new([0x02, 0, 0, 0, 0, 0x01]);
        assert_eq!(fabric.to_string(), "02:00:00:00:00:01");
        assert!(!fabric.is_zero());

        // An agent-supplied address survives comparison against adoption.
        let agent = EtherAddr::new([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        assert_ne!(agent, fabric);
        assert_eq!(agent, EtherAddr::new([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]));

        // "Adopt the NIC MAC" triggers only on the unset address.
        assert!(EtherAddr::zeroed().is_zero());
        assert_eq!(EtherAddr::default(), EtherAddr::zeroed());

        let generated = EtherAddr::random();
        assert!(!generated.is_zero());
        // Locally administered, not multicast.
        assert_eq!(generated.0[0] & 0x02, 0x02);
        assert_eq!(generated.0[0] & 0x01, 0);
    }

    #[test]
    fn test_ether_hdr_len() {
        let mut frame = [0u8; 64];
        frame[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
        assert_eq!(ether_hdr_len(&frame), 14);

        frame[12..14].copy_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
        assert_eq!(ether_hdr_len(&frame), 18);
    }

    #[test]
    fn test_vlan_insert() {
        let pool = MemoryPool::create("ether_test", 4, 2048);
        let mut m = pool.alloc().unwrap();

        let frame = m.append(64).unwrap();
        for (i, b) in frame.iter_mut().enumerate() {
            *b = i as u8;
        }
        frame[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());

        m.vlan_tci = 100;
        m.vlan_insert().unwrap();

        assert_eq!(m.data_len(), 68);
        let data = m.data();
        // MACs shifted intact.
        assert_eq!(&data[..12], &(0u8..12).collect::<Vec<_>>()[..]);
        assert_eq!(u16::from_be_bytes([data[12], data[13]]), ETHER_TYPE_VLAN);
        assert_eq!(u16::from_be_bytes([data[14], data[15]]), 100);
        assert_eq!(u16::from_be_bytes([data[16], data[17]]), ETHER_TYPE_IPV4);
    }
}
