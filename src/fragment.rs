//!
//! Software IPv4 fragmentation for overlay packets that exceed the egress
//! MTU.
//!
//! The outer header is stripped, the inner packet is cut into 8-byte-aligned
//! fragments, and each fragment gets the saved outer header prepended with
//! its length, IP id and UDP length rewritten. Fragments come out as bare
//! buffers: no packet metadata is attached, so only the low-level paths can
//! touch them and only the caller may drop the original.
//!
use crate::errors::{Error, Result};
use crate::ether;
use crate::ip::{
    Ipv4Hdr, UdpHdr, IPPROTO_UDP, IPV4_HDR_DF_FLAG, IPV4_HDR_FO_ALIGN, IPV4_HDR_LEN,
    IPV4_HDR_MF_FLAG, IPV4_HDR_OFFSET_MASK,
};
use crate::mbuf::{Mbuf, OffloadFlags};
use crate::mempool::MemoryPool;
use crate::pkt::Packet;

/// Upper bound on fragments produced from one packet.
pub const FRAG_MAX_IP_FRAGS: usize = 8;

/// Cut the IPv4 packet at the head of `m_in` into fragments of at most
/// `frag_size` bytes each (header included), allocated from `pool`.
///
/// Fragment payload sizes stay multiples of 8 as the fragment-offset field
/// requires; the offload descriptor of the input is carried over so the
/// caller's offload decisions survive fragmentation.
fn ipv4_fragment_packet(
    m_in: &Mbuf,
    nb_max: usize,
    frag_size: usize,
    pool: &MemoryPool,
) -> Result<Vec<Mbuf>> {
    let data = m_in.data();

    if !Ipv4Hdr(data).is_well_formed(data.len()) {
        return Err(Error::InvalidArgument("not an IPv4 packet".into()));
    }

    let hdr = Ipv4Hdr(data);
    let hdr_len = hdr.hdr_len();
    let frag_off = hdr.frag_off();

    if frag_off & IPV4_HDR_DF_FLAG != 0 {
        return Err(Error::InvalidArgument("don't-fragment bit set".into()));
    }
    if frag_size <= hdr_len {
        return Err(Error::InvalidArgument("fragment size below header length".into()));
    }

    let frag_payload = (frag_size - hdr_len) & !(IPV4_HDR_FO_ALIGN - 1);
    if frag_payload == 0 {
        return Err(Error::InvalidArgument("fragment size below alignment".into()));
    }

    let payload = &data[hdr_len..];
    let orig_units = frag_off & IPV4_HDR_OFFSET_MASK;
    let orig_mf = frag_off & IPV4_HDR_MF_FLAG != 0;

    let mut out = Vec::new();
    let mut consumed = 0;

    while consumed < payload.len() {
        if out.len() == nb_max {
            return Err(Error::ResourceExhausted("fragment slots".into()));
        }

        let chunk = frag_payload.min(payload.len() - consumed);
        let last = consumed + chunk == payload.len();

        let mut frag = pool.alloc()?;
        // Keep the input's headroom so the outer header fits in front.
        frag.reset(m_in.data_off(), 0);

        let dst = frag.append(hdr_len + chunk)?;
        dst[..hdr_len].copy_from_slice(&data[..hdr_len]);
        dst[hdr_len..].copy_from_slice(&payload[consumed..consumed + chunk]);

        {
            let mut fh = Ipv4Hdr(frag.data_mut());
            fh.set_total_len((hdr_len + chunk) as u16);

            let mut off = orig_units + (consumed / IPV4_HDR_FO_ALIGN) as u16;
            if !last || orig_mf {
                off |= IPV4_HDR_MF_FLAG;
            }
            fh.set_frag_off(off);
        }

        frag.ol_flags = m_in.ol_flags;
        frag.vlan_tci = m_in.vlan_tci;

        out.push(frag);
        consumed += chunk;
    }

    Ok(out)
}

/// Fragment an overlay packet against the egress MTU; the caller has already
/// decided the packet will not fit.
///
/// On success the input buffer holds only the stripped inner packet and the
/// caller frees it; on failure the caller drops the original. Either way the
/// packet metadata must not be consulted for the fragments.
pub fn fragment_packet(
    pool: &MemoryPool,
    pkt: &mut Packet,
    mtu: u16,
    do_outer_ip_csum: bool,
) -> Result<Vec<Mbuf>> {
    let outer_header_len = pkt
        .inner_network_header_off()
        .checked_sub(pkt.head_space())
        .filter(|&len| len > 0 && len <= pkt.mbuf().data_len())
        .ok_or_else(|| Error::InvalidArgument("inner network header offset out of range".into()))?;

    let original_header = pkt.mbuf().data()[..outer_header_len].to_vec();

    // Get to the inner IP header.
    pkt.mbuf_mut().adj(outer_header_len)?;

    // Leave room for the outer header prepended later, and keep the
    // (size - IP header) a multiple of 8 as fragment offsets require.
    let room = usize::from(mtu)
        .checked_sub(outer_header_len + IPV4_HDR_LEN)
        .ok_or_else(|| Error::InvalidArgument("MTU below outer header size".into()))?;
    let max_frag_size = (room & !(IPV4_HDR_FO_ALIGN - 1)) + IPV4_HDR_LEN;

    let mut frags = ipv4_fragment_packet(pkt.mbuf(), FRAG_MAX_IP_FRAGS, max_frag_size, pool)?;

    let l2_len = pkt.mbuf().l2_len;
    let l3_len = pkt.mbuf().l3_len;

    for m in frags.iter_mut() {
        // Inner header: fresh checksum per fragment.
        Ipv4Hdr(m.data_mut()).fill_cksum();
        let inner_id = Ipv4Hdr(m.data()).id();

        m.prepend(outer_header_len)?.copy_from_slice(&original_header);

        let eth_len = ether::ether_hdr_len(m.data());
        let pkt_len = m.pkt_len();
        let outer_len = (pkt_len - eth_len) as u16;

        {
            let data = m.data_mut();
            let (outer_hl, outer_proto) = {
                let outer = Ipv4Hdr(&data[eth_len..]);
                (outer.hdr_len(), outer.proto())
            };

            {
                let mut outer = Ipv4Hdr(&mut data[eth_len..]);
                outer.set_total_len(outer_len);
                // The agent's diagnostics correlate fragments by the inner
                // id showing up in the outer header.
                outer.set_id(inner_id);
            }

            if outer_proto == IPPROTO_UDP {
                UdpHdr(&mut data[eth_len + outer_hl..]).set_length(outer_len - outer_hl as u16);
            }

            if do_outer_ip_csum {
                Ipv4Hdr(&mut data[eth_len..]).fill_cksum();
            }
        }

        if do_outer_ip_csum {
            m.ol_flags.remove(OffloadFlags::TX_IP_CKSUM);
        }

        m.l2_len = l2_len;
        m.l3_len = l3_len;
    }

    Ok(frags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::cksum;

    fn ipv4_packet(pool: &MemoryPool, payload_len: usize) -> Mbuf {
        let mut m = pool.alloc().unwrap();
        let buf = m.append(IPV4_HDR_LEN + payload_len).unwrap();

        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&((IPV4_HDR_LEN + payload_len) as u16).to_be_bytes());
        buf[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = IPPROTO_UDP;
        buf[12..16].copy_from_slice(&[10, 1, 0, 1]);
        buf[16..20].copy_from_slice(&[10, 1, 0, 2]);
        for (i, b) in buf[IPV4_HDR_LEN..].iter_mut().enumerate() {
            *b = i as u8;
        }

        m
    }

    #[test]
    fn test_aligned_fragments() {
        let pool = MemoryPool::create("frag_basic", 16, 2048);
        let m = ipv4_packet(&pool, 992);

        let frags = ipv4_fragment_packet(&m, FRAG_MAX_IP_FRAGS, 516, &pool).unwrap();
        assert_eq!(frags.len(), 2);

        // 516 - 20 rounded down to a multiple of 8.
        assert_eq!(frags[0].pkt_len(), IPV4_HDR_LEN + 496);
        assert_eq!(frags[1].pkt_len(), IPV4_HDR_LEN + 496);

        let first = Ipv4Hdr(frags[0].data());
        assert_eq!(first.frag_off() & IPV4_HDR_OFFSET_MASK, 0);
        assert_ne!(first.frag_off() & IPV4_HDR_MF_FLAG, 0);

        let second = Ipv4Hdr(frags[1].data());
        assert_eq!(second.frag_off() & IPV4_HDR_OFFSET_MASK, (496 / 8) as u16);
        assert_eq!(second.frag_off() & IPV4_HDR_MF_FLAG, 0);

        // Payload bytes reassemble in order.
        assert_eq!(frags[0].data()[IPV4_HDR_LEN], 0);
        assert_eq!(frags[1].data()[IPV4_HDR_LEN], (496 % 256) as u8);
    }

    #[test]
    fn test_df_refused() {
        let pool = MemoryPool::create("frag_df", 8, 2048);
        let mut m = ipv4_packet(&pool, 512);
        Ipv4Hdr(m.data_mut()).set_frag_off(IPV4_HDR_DF_FLAG);

        assert!(ipv4_fragment_packet(&m, FRAG_MAX_IP_FRAGS, 256, &pool).is_err());
    }

    #[test]
    fn test_too_many_fragments() {
        let pool = MemoryPool::create("frag_many", 32, 2048);
        let m = ipv4_packet(&pool, 1000);

        let err = ipv4_fragment_packet(&m, 2, 116, &pool).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        // Nothing may leak when fragmentation fails halfway.
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_fragments_share_header_fields() {
        let pool = MemoryPool::create("frag_hdr", 16, 2048);
        let m = ipv4_packet(&pool, 992);
        let id = Ipv4Hdr(m.data()).id();

        let frags = ipv4_fragment_packet(&m, FRAG_MAX_IP_FRAGS, 516, &pool).unwrap();
        for f in &frags {
            let hdr = Ipv4Hdr(f.data());
            assert_eq!(hdr.id(), id);
            assert_eq!(hdr.proto(), IPPROTO_UDP);

            // The caller recomputes the checksum per fragment.
            let mut copy = f.data()[..IPV4_HDR_LEN].to_vec();
            Ipv4Hdr(&mut copy[..]).fill_cksum();
            assert_eq!(cksum(&copy), 0);
        }
    }
}
