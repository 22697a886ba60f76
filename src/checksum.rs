//!
//! Checksum negotiation between the TX path and the NIC.
//!
//! Four policies, keyed on packet type and interface capability:
//!
//! 1. overlay + offload, not fragmenting: outer IPv4 in software (the NIC
//!    cannot finish both outer and inner), inner header zeroed and flagged
//!    for hardware, inner transport seeded with the pseudo-header sum;
//! 2. overlay, software: outer IPv4 in software (unless fragmentation will
//!    rewrite it), full inner header and transport in software;
//! 3. overlay + offload, fragmenting: inner in software, outer flagged for
//!    hardware since fragmentation recomputes the outer length;
//! 4. plain IPv4/IPv6: the single header, hardware or software per
//!    capability.
//!
use crate::ether::ETHER_HDR_LEN;
use crate::ip::{self, Ipv4Hdr, Ipv6Hdr, TcpHdr, UdpHdr, IPPROTO_TCP, IPPROTO_UDP, IPV6_HDR_LEN, UDP_HDR_LEN};
use crate::mbuf::OffloadFlags;
use crate::pkt::{Packet, VpType};

// Seed the L4 checksum field with the pseudo-header sum of the header that
// will carry the segment; the NIC finishes the job.
fn seed_l4_phdr(buf: &mut [u8], offset: usize, iph_len: usize, proto: u8, v6: bool) -> OffloadFlags {
    let l4_off = offset + iph_len;
    let phdr = |buf: &[u8]| {
        if v6 {
            ip::ipv6_phdr_cksum(&buf[offset..offset + iph_len])
        } else {
            ip::ipv4_phdr_cksum(&buf[offset..offset + iph_len])
        }
    };

    match proto {
        IPPROTO_UDP if buf.len() >= l4_off + UDP_HDR_LEN => {
            let sum = phdr(buf);
            let mut udph = UdpHdr(&mut buf[l4_off..]);
            udph.set_cksum(0);
            udph.set_cksum(sum);
            OffloadFlags::TX_UDP_CKSUM
        }
        IPPROTO_TCP if buf.len() >= l4_off + ip::TCP_HDR_LEN => {
            let sum = phdr(buf);
            let mut tcph = TcpHdr(&mut buf[l4_off..]);
            tcph.set_cksum(0);
            tcph.set_cksum(sum);
            OffloadFlags::TX_TCP_CKSUM
        }
        _ => OffloadFlags::empty(),
    }
}

/// Prepare the header at `offset` for hardware checksumming: zero the IPv4
/// checksum, request the offloads and fill `l2_len`/`l3_len` for the NIC.
pub fn hw_checksum_at_offset(pkt: &mut Packet, offset: usize) {
    debug_assert!(offset > 0);

    let headroom = pkt.mbuf().data_off();
    let vp_type = pkt.vp_type;

    let mut flags;
    let iph_len;
    {
        let buf = pkt.mbuf_mut().buf_mut();
        match vp_type {
            VpType::Ip | VpType::IpOip => {
                let (len, proto) = {
                    let iph = Ipv4Hdr(&buf[offset..]);
                    (iph.hdr_len(), iph.proto())
                };

                // The NIC wants the checksum field zeroed.
                Ipv4Hdr(&mut buf[offset..]).set_cksum(0);

                flags = OffloadFlags::TX_IP_CKSUM | OffloadFlags::TX_IPV4;
                flags |= seed_l4_phdr(buf, offset, len, proto, false);
                iph_len = len;
            }
            VpType::Ip6 | VpType::Ip6Oip => {
                let proto = Ipv6Hdr(&buf[offset..]).next_header();

                flags = OffloadFlags::TX_IPV6;
                flags |= seed_l4_phdr(buf, offset, IPV6_HDR_LEN, proto, true);
                iph_len = IPV6_HDR_LEN;
            }
            // Nothing to do if the packet is neither IPv4 nor IPv6.
            _ => return,
        }
    }

    let m = pkt.mbuf_mut();
    m.ol_flags |= flags;
    m.l3_len = iph_len as u16;
    m.l2_len = (offset - headroom) as u16;
}

/// Compute the full checksum of the header at `offset` and its transport
/// segment in software.
pub fn sw_checksum_at_offset(pkt: &mut Packet, offset: usize) {
    debug_assert!(offset > 0);

    let vp_type = pkt.vp_type;
    let buf = pkt.mbuf_mut().buf_mut();

    let (iph_len, proto, l4_len, v6) = match vp_type {
        VpType::Ip | VpType::IpOip => {
            Ipv4Hdr(&mut buf[offset..]).fill_cksum();
            let iph = Ipv4Hdr(&buf[offset..]);
            let len = iph.hdr_len();
            (
                len,
                iph.proto(),
                usize::from(iph.total_len()).saturating_sub(len),
                false,
            )
        }
        VpType::Ip6 | VpType::Ip6Oip => {
            let ip6h = Ipv6Hdr(&buf[offset..]);
            (IPV6_HDR_LEN, ip6h.next_header(), usize::from(ip6h.payload_len()), true)
        }
        _ => return,
    };

    let l4_off = offset + iph_len;
    let l4_len = l4_len.min(buf.len().saturating_sub(l4_off));

    match proto {
        IPPROTO_UDP if l4_len >= UDP_HDR_LEN => {
            UdpHdr(&mut buf[l4_off..]).set_cksum(0);
            let sum = if v6 {
                ip::ipv6_udptcp_cksum(&buf[offset..l4_off], &buf[l4_off..l4_off + l4_len])
            } else {
                ip::ipv4_udptcp_cksum(&buf[offset..l4_off], &buf[l4_off..l4_off + l4_len])
            };
            UdpHdr(&mut buf[l4_off..]).set_cksum(sum);
        }
        IPPROTO_TCP if l4_len >= ip::TCP_HDR_LEN => {
            TcpHdr(&mut buf[l4_off..]).set_cksum(0);
            let sum = if v6 {
                ip::ipv6_udptcp_cksum(&buf[offset..l4_off], &buf[l4_off..l4_off + l4_len])
            } else {
                ip::ipv4_udptcp_cksum(&buf[offset..l4_off], &buf[l4_off..l4_off + l4_len])
            };
            TcpHdr(&mut buf[l4_off..]).set_cksum(sum);
        }
        _ => {}
    }
}

/// Software checksum of the IPv4 header at `offset` only.
pub fn ipv4_sw_iphdr_checksum_at_offset(pkt: &mut Packet, offset: usize) {
    debug_assert!(offset > 0);

    Ipv4Hdr(&mut pkt.mbuf_mut().buf_mut()[offset..]).fill_cksum();
}

/// Hand the outer tunnel IPv4 header to the NIC: zero its checksum, flag
/// the offload, describe it via `l2_len`/`l3_len`.
pub fn ipv4_outer_tunnel_hw_checksum(pkt: &mut Packet) {
    let offset = pkt.head_space() + ETHER_HDR_LEN;
    let headroom = pkt.mbuf().data_off();

    let iph_len = {
        let buf = pkt.mbuf_mut().buf_mut();
        let len = Ipv4Hdr(&buf[offset..]).hdr_len();
        Ipv4Hdr(&mut buf[offset..]).set_cksum(0);
        len
    };

    let m = pkt.mbuf_mut();
    m.ol_flags |= OffloadFlags::TX_IP_CKSUM | OffloadFlags::TX_IPV4;
    m.l3_len = iph_len as u16;
    m.l2_len = (offset - headroom) as u16;
}

/// Software checksum of the outer tunnel IPv4 header.
pub fn ipv4_outer_tunnel_sw_checksum(pkt: &mut Packet) {
    let offset = pkt.head_space() + ETHER_HDR_LEN;
    ipv4_sw_iphdr_checksum_at_offset(pkt, offset);
}

/// Hardware-assisted policy: for tunnels the outer header is finished in
/// software and the inner one is prepared for the NIC; plain packets are
/// prepared directly.
pub fn hw_checksum(pkt: &mut Packet) {
    if pkt.vp_type.is_overlay() {
        let outer_off = pkt.head_space() + ETHER_HDR_LEN;
        ipv4_sw_iphdr_checksum_at_offset(pkt, outer_off);

        let inner_off = pkt.inner_network_header_off();
        hw_checksum_at_offset(pkt, inner_off);
    } else if pkt.vp_type == VpType::Ip || pkt.vp_type == VpType::Ip6 {
        let off = pkt.head_space() + ETHER_HDR_LEN;
        hw_checksum_at_offset(pkt, off);
    }
}

/// All-software policy. When the packet is about to be fragmented the outer
/// header is left alone; fragmentation rewrites its length and recomputes
/// the checksum per fragment.
pub fn sw_checksum(pkt: &mut Packet, will_fragment: bool) {
    if pkt.vp_type.is_overlay() {
        if !will_fragment {
            let outer_off = pkt.head_space() + ETHER_HDR_LEN;
            ipv4_sw_iphdr_checksum_at_offset(pkt, outer_off);
        }

        let inner_off = pkt.inner_network_header_off();
        sw_checksum_at_offset(pkt, inner_off);
    } else if pkt.vp_type == VpType::Ip || pkt.vp_type == VpType::Ip6 {
        let off = pkt.head_space() + ETHER_HDR_LEN;
        sw_checksum_at_offset(pkt, off);
    }
}
