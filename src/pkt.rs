//!
//! Routed packets.
//!
//! A [`Packet`] is a buffer plus the routing metadata the upper vrouter
//! maintains: the L3/tunnel category, the checksum flag, its own head
//! offset/length, and the precomputed inner-network-header offset for
//! overlay packets. IPv4 fragments deliberately exist only as bare
//! [`Mbuf`](crate::mbuf::Mbuf)s -- code that needs packet metadata cannot be
//! handed a fragment by mistake.
//!
use crate::errors::{Error, Result};
use crate::mbuf::Mbuf;

/// L3/tunnel category of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum VpType {
    Null = 0,
    Arp = 1,
    Ip = 2,
    Ip6 = 3,
    IpOip = 4,
    Ip6Oip = 5,
    Agent = 6,
    Unknown = 7,
}

impl VpType {
    /// An overlay packet carries both inner and outer headers.
    #[inline]
    pub fn is_overlay(self) -> bool {
        matches!(self, VpType::IpOip | VpType::Ip6Oip)
    }
}

bitflags! {
    pub struct VpFlags: u8 {
        /// The inner (or only) checksum still needs to be finished.
        const CSUM_PARTIAL = 1 << 0;
    }
}

/// Why a packet was freed instead of transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(usize)]
pub enum DropReason {
    Discard = 0,
    /// Header parse/pull failure.
    Pull = 1,
    /// No usable queue or device for the interface.
    InterfaceDrop = 2,
    NoMemory = 3,
}

pub const NR_DROP_REASONS: usize = 4;

pub struct Packet {
    mbuf: Mbuf,
    pub vp_type: VpType,
    pub vp_flags: VpFlags,
    vp_data: usize,
    vp_len: usize,
    vp_inner_network_h: usize,
}

impl Packet {
    /// Wrap a buffer, adopting its current head offset and length.
    pub fn from_mbuf(mbuf: Mbuf, vp_type: VpType) -> Packet {
        let vp_data = mbuf.data_off();
        let vp_len = mbuf.data_len();

        Packet {
            mbuf,
            vp_type,
            vp_flags: VpFlags::empty(),
            vp_data,
            vp_len,
            vp_inner_network_h: 0,
        }
    }

    /// Head offset into the underlying buffer.
    #[inline]
    pub fn head_space(&self) -> usize {
        self.vp_data
    }

    /// Head length.
    #[inline]
    pub fn head_len(&self) -> usize {
        self.vp_len
    }

    /// Offset of the inner network header, relative to the buffer start.
    #[inline]
    pub fn inner_network_header_off(&self) -> usize {
        self.vp_inner_network_h
    }

    pub fn set_inner_network_header_off(&mut self, off: usize) {
        self.vp_inner_network_h = off;
    }

    #[inline]
    pub fn mbuf(&self) -> &Mbuf {
        &self.mbuf
    }

    #[inline]
    pub fn mbuf_mut(&mut self) -> &mut Mbuf {
        &mut self.mbuf
    }

    /// Strip the metadata; what remains can only travel the low-level paths.
    #[inline]
    pub fn into_mbuf(self) -> Mbuf {
        self.mbuf
    }

    /// Clone the packet for mirroring: a fresh buffer from the same pool
    /// carrying the same bytes and metadata.
    pub fn pclone(&self) -> Result<Packet> {
        let pool = self
            .mbuf
            .pool()
            .ok_or_else(|| Error::ResourceExhausted("packet without a pool".into()))?;
        let mbuf = pool.clone_mbuf(&self.mbuf)?;

        Ok(Packet {
            mbuf,
            vp_type: self.vp_type,
            vp_flags: self.vp_flags,
            vp_data: self.vp_data,
            vp_len: self.vp_len,
            vp_inner_network_h: self.vp_inner_network_h,
        })
    }
}
