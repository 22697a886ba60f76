//!
//! Single-segment packet buffers.
//!
//! A buffer is a fixed-size byte area with headroom, a head pointer and a
//! head length, plus the offload descriptor the NIC reads (`ol_flags`,
//! `l2_len`, `l3_len`, `vlan_tci`). Buffers are drawn from a
//! [`MemoryPool`](crate::mempool::MemoryPool) and return to it when dropped,
//! so every exit path of the TX pipeline either hands the buffer to a
//! downstream queue or releases it back to its pool.
//!
//! Chained buffers are not supported; `pkt_len` always equals `data_len`.
//!
use crate::errors::{Error, Result};
use crate::mempool::MemoryPool;

// TX offload requests. The flags mirror what a poll-mode NIC consumes: when
// a checksum flag is set the corresponding field in the packet must be
// zeroed (IP) or seeded with the pseudo-header sum (TCP/UDP), and
// l2_len/l3_len must describe the header that carries it.
bitflags! {
    pub struct OffloadFlags: u64 {
        /// Offload the IP header checksum; the field must be zeroed.
        const TX_IP_CKSUM  = 1 << 0;
        /// Packet (or inner packet for tunnels) is IPv4.
        const TX_IPV4      = 1 << 1;
        /// Packet (or inner packet for tunnels) is IPv6.
        const TX_IPV6      = 1 << 2;
        /// Offload the UDP checksum; the field holds the pseudo-header sum.
        const TX_UDP_CKSUM = 1 << 3;
        /// Offload the TCP checksum; the field holds the pseudo-header sum.
        const TX_TCP_CKSUM = 1 << 4;
        /// Insert `vlan_tci` into the frame on transmit.
        const TX_VLAN_PKT  = 1 << 5;
    }
}

/// Default headroom reserved at buffer allocation.
pub const PKTMBUF_HEADROOM: usize = 128;

#[derive(Debug)]
pub struct Mbuf {
    pool: Option<MemoryPool>,
    buf: Box<[u8]>,
    data_off: usize,
    data_len: usize,
    pub ol_flags: OffloadFlags,
    pub l2_len: u16,
    pub l3_len: u16,
    pub vlan_tci: u16,
}

impl Mbuf {
    pub(crate) fn from_pool(pool: MemoryPool, data_room: usize) -> Self {
        Mbuf {
            pool: Some(pool),
            buf: vec![0u8; data_room].into_boxed_slice(),
            data_off: PKTMBUF_HEADROOM.min(data_room),
            data_len: 0,
            ol_flags: OffloadFlags::empty(),
            l2_len: 0,
            l3_len: 0,
            vlan_tci: 0,
        }
    }

    /// Total size of the data area.
    #[inline]
    pub fn buf_len(&self) -> usize {
        self.buf.len()
    }

    /// Headroom in front of the data.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// Tailroom behind the data.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.data_off - self.data_len
    }

    #[inline]
    pub fn data_off(&self) -> usize {
        self.data_off
    }

    /// Length of the segment.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Length of the packet; equals [`data_len`](Self::data_len) for
    /// single-segment buffers.
    #[inline]
    pub fn pkt_len(&self) -> usize {
        self.data_len
    }

    /// Reset head pointer and head length, e.g. from packet metadata.
    pub fn reset(&mut self, data_off: usize, data_len: usize) {
        let data_off = data_off.min(self.buf.len());
        self.data_off = data_off;
        self.data_len = data_len.min(self.buf.len() - data_off);
    }

    /// The packet bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_off..self.data_off + self.data_len]
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_off..self.data_off + self.data_len]
    }

    /// The whole underlying byte area, headroom included. Offsets stored in
    /// packet metadata are relative to this slice.
    #[inline]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Prepend `len` bytes to the data area and return them.
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.data_off {
            return Err(Error::ResourceExhausted("mbuf headroom".into()));
        }

        self.data_off -= len;
        self.data_len += len;
        Ok(&mut self.buf[self.data_off..self.data_off + len])
    }

    /// Append `len` bytes to the data area and return them.
    pub fn append(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.tailroom() {
            return Err(Error::ResourceExhausted("mbuf tailroom".into()));
        }

        let tail = self.data_off + self.data_len;
        self.data_len += len;
        Ok(&mut self.buf[tail..tail + len])
    }

    /// Remove `len` bytes at the beginning of the data area.
    pub fn adj(&mut self, len: usize) -> Result<()> {
        if len > self.data_len {
            return Err(Error::InvalidArgument("adj beyond data length".into()));
        }

        self.data_off += len;
        self.data_len -= len;
        Ok(())
    }

    /// Remove `len` bytes at the end of the data area.
    pub fn trim(&mut self, len: usize) -> Result<()> {
        if len > self.data_len {
            return Err(Error::InvalidArgument("trim beyond data length".into()));
        }

        self.data_len -= len;
        Ok(())
    }

    /// The pool this buffer was drawn from.
    pub fn pool(&self) -> Option<&MemoryPool> {
        self.pool.as_ref()
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.reclaim();
        }
    }
}
