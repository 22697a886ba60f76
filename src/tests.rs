use std::sync::{Arc, Mutex};

use crate::datapath::{Config, Datapath};
use crate::errors::{Error, Result};
use crate::ethdev::{EthPortDriver, RingPort, RxOffloadCapa, TxOffloadCapa};
use crate::ether::{EtherAddr, ETHER_HDR_LEN, ETHER_TYPE_ARP, ETHER_TYPE_IPV4, ETHER_TYPE_VLAN};
use crate::interface::HostIfOps;
use crate::ip::{self, Ipv4Hdr, TcpHdr, UdpHdr, IPPROTO_TCP, IPPROTO_UDP, IPV4_HDR_LEN, TCP_HDR_LEN, UDP_HDR_LEN};
use crate::lcore::{self, FWD_LCORE_ID};
use crate::mbuf::{Mbuf, OffloadFlags};
use crate::mempool::MemoryPool;
use crate::pci;
use crate::pkt::{DropReason, Packet, VpFlags, VpType};
use crate::uvhost::UvhostClient;
use crate::vif::{Vif, VifDevice, VifFlags, VifType, VifTransport};

const NB_LCORES: usize = 4;
const FABRIC_DBDF: u32 = 0x0001_0500;

fn init() {
    let _ = pretty_env_logger::try_init();
    lcore::set_current(FWD_LCORE_ID);
}

fn fabric_port(offloads: bool) -> Arc<RingPort> {
    let mut port = RingPort::new(EtherAddr::new([0x02, 0, 0, 0, 0, 0x01]));
    if offloads {
        port.set_offload_capa(TxOffloadCapa::all(), RxOffloadCapa::all());
    }
    port.set_pci_addr(pci::Addr::from_dbdf(FABRIC_DBDF));
    Arc::new(port)
}

fn datapath(port: &Arc<RingPort>, config: Config) -> Datapath {
    Datapath::new(config, vec![port.clone() as Arc<dyn EthPortDriver>])
}

fn fabric_vif(idx: usize, name: &str) -> Arc<Vif> {
    Arc::new(
        Vif::new(idx, name, VifType::Physical, NB_LCORES)
            .with_flags(VifFlags::PMD)
            .with_os_idx(0)
            .with_mtu(1500),
    )
}

/// Everything the port pushed out, across its TX queues.
fn drain_port(port: &RingPort) -> Vec<Mbuf> {
    (0..8).flat_map(|q| port.transmitted(q)).collect()
}

fn test_pool(name: &str) -> MemoryPool {
    MemoryPool::create(name, 64, 2304)
}

/// Ethernet + IPv4 + UDP frame totalling `total_len` bytes.
fn plain_udp_packet(pool: &MemoryPool, total_len: usize) -> Packet {
    let payload_len = total_len - ETHER_HDR_LEN - IPV4_HDR_LEN - UDP_HDR_LEN;

    let mut m = pool.alloc().unwrap();
    let frame = m.append(total_len).unwrap();

    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x10]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x20]);
    frame[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());

    let ip = ETHER_HDR_LEN;
    frame[ip] = 0x45;
    frame[ip + 2..ip + 4]
        .copy_from_slice(&((IPV4_HDR_LEN + UDP_HDR_LEN + payload_len) as u16).to_be_bytes());
    frame[ip + 4..ip + 6].copy_from_slice(&0x1234u16.to_be_bytes());
    frame[ip + 8] = 64;
    frame[ip + 9] = IPPROTO_UDP;
    frame[ip + 12..ip + 16].copy_from_slice(&[10, 0, 0, 1]);
    frame[ip + 16..ip + 20].copy_from_slice(&[10, 0, 0, 2]);

    let udp = ip + IPV4_HDR_LEN;
    frame[udp..udp + 2].copy_from_slice(&4789u16.to_be_bytes());
    frame[udp + 2..udp + 4].copy_from_slice(&53u16.to_be_bytes());
    frame[udp + 4..udp + 6].copy_from_slice(&((UDP_HDR_LEN + payload_len) as u16).to_be_bytes());

    let mut pkt = Packet::from_mbuf(m, VpType::Ip);
    pkt.vp_flags |= VpFlags::CSUM_PARTIAL;
    pkt
}

const INNER_IP_ID: u16 = 0x3344;

/// MPLS-over-UDP overlay frame: 14B Ethernet, 20B outer IPv4, 8B UDP plus
/// `tunnel_pad` tunnel bytes in front of an inner IPv4/TCP packet with
/// `inner_payload` payload bytes.
fn overlay_packet(pool: &MemoryPool, tunnel_pad: usize, inner_payload: usize) -> Packet {
    let outer_len = ETHER_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN + tunnel_pad;
    let inner_len = IPV4_HDR_LEN + TCP_HDR_LEN + inner_payload;
    let total = outer_len + inner_len;

    let mut m = pool.alloc().unwrap();
    let head = m.data_off();
    let frame = m.append(total).unwrap();

    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x30]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x40]);
    frame[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());

    // Outer IPv4 carrying UDP.
    let oip = ETHER_HDR_LEN;
    frame[oip] = 0x45;
    frame[oip + 2..oip + 4].copy_from_slice(&((total - ETHER_HDR_LEN) as u16).to_be_bytes());
    frame[oip + 4..oip + 6].copy_from_slice(&0x0101u16.to_be_bytes());
    frame[oip + 8] = 64;
    frame[oip + 9] = IPPROTO_UDP;
    frame[oip + 12..oip + 16].copy_from_slice(&[172, 16, 0, 1]);
    frame[oip + 16..oip + 20].copy_from_slice(&[172, 16, 0, 2]);

    let udp = oip + IPV4_HDR_LEN;
    frame[udp..udp + 2].copy_from_slice(&51234u16.to_be_bytes());
    frame[udp + 2..udp + 4].copy_from_slice(&6635u16.to_be_bytes());
    frame[udp + 4..udp + 6]
        .copy_from_slice(&((total - ETHER_HDR_LEN - IPV4_HDR_LEN) as u16).to_be_bytes());

    // Inner IPv4/TCP.
    let iip = outer_len;
    frame[iip] = 0x45;
    frame[iip + 2..iip + 4].copy_from_slice(&(inner_len as u16).to_be_bytes());
    frame[iip + 4..iip + 6].copy_from_slice(&INNER_IP_ID.to_be_bytes());
    frame[iip + 8] = 63;
    frame[iip + 9] = IPPROTO_TCP;
    frame[iip + 12..iip + 16].copy_from_slice(&[192, 168, 1, 1]);
    frame[iip + 16..iip + 20].copy_from_slice(&[192, 168, 1, 2]);

    let tcp = iip + IPV4_HDR_LEN;
    frame[tcp + 12] = 5 << 4;

    let mut pkt = Packet::from_mbuf(m, VpType::IpOip);
    pkt.set_inner_network_header_off(head + outer_len);
    pkt
}

fn arp_packet(pool: &MemoryPool, len: usize) -> Packet {
    let mut m = pool.alloc().unwrap();
    let frame = m.append(len).unwrap();

    frame[0..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x50]);
    frame[12..14].copy_from_slice(&ETHER_TYPE_ARP.to_be_bytes());

    Packet::from_mbuf(m, VpType::Arp)
}

// S1: plain IPv4/UDP towards a checksum-offloading NIC.
#[test]
fn s1_plain_ipv4_forward() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "s1_fabric");
    dp.add(&vif).unwrap();

    let pool = test_pool("s1");
    let pkt = plain_udp_packet(&pool, 100);

    dp.tx(&vif, pkt).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    let out = drain_port(&port);
    assert_eq!(out.len(), 1);

    let m = &out[0];
    assert!(m.ol_flags.contains(
        OffloadFlags::TX_IP_CKSUM | OffloadFlags::TX_IPV4 | OffloadFlags::TX_UDP_CKSUM
    ));

    let data = m.data();
    let iph = &data[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN];
    assert_eq!(Ipv4Hdr(iph).cksum(), 0);

    let expect = ip::ipv4_phdr_cksum(iph);
    assert_eq!(UdpHdr(&data[ETHER_HDR_LEN + IPV4_HDR_LEN..]).cksum(), expect);
}

// S2: overlay below the MTU on a checksum-offloading NIC: outer finished in
// software, inner handed to the hardware.
#[test]
fn s2_overlay_hw_offload_no_fragment() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "s2_fabric");
    dp.add(&vif).unwrap();

    let pool = test_pool("s2");
    // 14 + 20 + 8 + 4 = 46 outer bytes, 86 inner bytes, 132 total.
    let mut pkt = overlay_packet(&pool, 4, 46);
    assert_eq!(pkt.head_len(), 132);
    pkt.vp_flags |= VpFlags::CSUM_PARTIAL;

    let outer_len = pkt.inner_network_header_off() - pkt.head_space();

    dp.tx(&vif, pkt).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    let out = drain_port(&port);
    assert_eq!(out.len(), 1);

    let m = &out[0];
    assert!(m.ol_flags.contains(
        OffloadFlags::TX_IP_CKSUM | OffloadFlags::TX_IPV4 | OffloadFlags::TX_TCP_CKSUM
    ));
    assert_eq!(m.l3_len, IPV4_HDR_LEN as u16);
    assert_eq!(m.l2_len, outer_len as u16);

    let data = m.data();
    // Outer checksum was computed in software and verifies.
    assert_eq!(ip::cksum(&data[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN]), 0);

    // Inner IPv4 zeroed for the NIC, inner TCP seeded with the pseudo sum.
    let iip = &data[outer_len..outer_len + IPV4_HDR_LEN];
    assert_eq!(Ipv4Hdr(iip).cksum(), 0);
    let expect = ip::ipv4_phdr_cksum(iip);
    assert_eq!(TcpHdr(&data[outer_len + IPV4_HDR_LEN..]).cksum(), expect);
}

// S3: overlay past the MTU fragments into correlated pieces.
#[test]
fn s3_overlay_will_fragment() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "s3_fabric");
    dp.add(&vif).unwrap();

    let pool = test_pool("s3");
    // Outer header 42 bytes (no tunnel pad beyond UDP), 2000 bytes total.
    let pkt = overlay_packet(&pool, 0, 2000 - 42 - IPV4_HDR_LEN - TCP_HDR_LEN);
    assert_eq!(pkt.head_len(), 2000);

    dp.tx(&vif, pkt).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    let out = drain_port(&port);
    // max_frag_size = (1500 - 42 - 20) / 8 * 8 + 20 = 1452;
    // fragments = ceil((2000 - 42 - 20) / (1452 - 20)) = 2.
    assert_eq!(out.len(), 2);

    for (i, m) in out.iter().enumerate() {
        let data = m.data();
        let outer = Ipv4Hdr(&data[ETHER_HDR_LEN..]);

        // Outer length consistency.
        assert_eq!(usize::from(outer.total_len()), m.pkt_len() - ETHER_HDR_LEN);
        // Fragments share the inner IP id in the outer header.
        assert_eq!(outer.id(), INNER_IP_ID);
        assert_eq!(outer.proto(), IPPROTO_UDP);

        let udp = UdpHdr(&data[ETHER_HDR_LEN + IPV4_HDR_LEN..]);
        assert_eq!(udp.length(), outer.total_len() - IPV4_HDR_LEN as u16);

        // Inner fragment offsets stay 8-byte aligned and the inner header
        // checksum verifies.
        let inner = &data[42..];
        let inner_hdr = Ipv4Hdr(inner);
        assert_eq!(inner_hdr.id(), INNER_IP_ID);
        if i == 0 {
            assert_eq!(inner_hdr.frag_off() & ip::IPV4_HDR_OFFSET_MASK, 0);
            assert_ne!(inner_hdr.frag_off() & ip::IPV4_HDR_MF_FLAG, 0);
            assert_eq!(usize::from(inner_hdr.total_len()) - IPV4_HDR_LEN, 1432);
        } else {
            assert_eq!(inner_hdr.frag_off() & ip::IPV4_HDR_OFFSET_MASK, 1432 / 8);
        }
        assert_eq!(ip::cksum(&inner[..IPV4_HDR_LEN]), 0);

        // NIC finishes the outer header checksum.
        assert!(m.ol_flags.contains(OffloadFlags::TX_IP_CKSUM | OffloadFlags::TX_IPV4));
        assert_eq!(Ipv4Hdr(&data[ETHER_HDR_LEN..]).cksum(), 0);
    }

    // The original buffer went back to its pool after fragmentation.
    assert_eq!(pool.in_use(), 0);
}

// S3 variant: no checksum offload, so every fragment's outer header is
// finished in software.
#[test]
fn s3_fragment_software_outer_checksum() {
    init();

    let port = fabric_port(false);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "s3sw_fabric");
    dp.add(&vif).unwrap();

    let pool = test_pool("s3sw");
    let pkt = overlay_packet(&pool, 0, 2000 - 42 - IPV4_HDR_LEN - TCP_HDR_LEN);

    dp.tx(&vif, pkt).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    let out = drain_port(&port);
    assert_eq!(out.len(), 2);

    for m in &out {
        assert!(!m.ol_flags.contains(OffloadFlags::TX_IP_CKSUM));
        let outer = &m.data()[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN];
        assert_eq!(ip::cksum(outer), 0);
    }
}

// S4: a monitored vif clones every frame to its mirror before transmitting.
#[test]
fn s4_mirror() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());

    let vif_a = fabric_vif(1, "s4_fabric");
    dp.add(&vif_a).unwrap();

    let vif_b = Arc::new(
        Vif::new(2, "s4_mon", VifType::Monitoring, NB_LCORES).with_os_idx(1),
    );
    dp.add(&vif_b).unwrap();

    assert!(vif_a.flags().contains(VifFlags::MONITORED));
    assert!(port.is_promiscuous());

    let pool = test_pool("s4");
    let pkt = arp_packet(&pool, 64);
    dp.tx(&vif_a, pkt).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    // One frame on the fabric...
    let out = drain_port(&port);
    assert_eq!(out.len(), 1);

    // ...and an independent clone on the mirror KNI.
    let kni = match vif_b.device() {
        Some(VifDevice::Kni(kni)) => kni,
        _ => panic!("monitoring vif lost its KNI"),
    };
    let mirrored = kni.tx_ring().dequeue_burst(16);
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].data(), out[0].data());
    assert_eq!(pool.in_use(), 2);
}

// S5: agent TX lands on the global packet ring; a full ring is accounted
// locally and still reported as success.
#[test]
fn s5_agent_tx() {
    init();

    let port = fabric_port(true);
    let mut config = Config::default();
    config.packet_ring_sz = 1;
    let dp = datapath(&port, config);

    let vif = Arc::new(
        Vif::new(3, "s5_agent", VifType::Agent, NB_LCORES).with_transport(VifTransport::Socket),
    );
    dp.add(&vif).unwrap();

    let agent_end = match vif.device() {
        Some(VifDevice::Packet(socket)) => socket.take_agent_end().unwrap(),
        _ => panic!("agent vif lost its packet socket"),
    };

    let pool = test_pool("s5");

    dp.tx(&vif, arp_packet(&pool, 64)).unwrap();
    assert_eq!(vif.stats(FWD_LCORE_ID).queue_opackets.get(), 1);

    // The consumer got its wakeup.
    let mut buf = [0u8; 4];
    assert_eq!(agent_end.recv(&mut buf).unwrap(), 1);

    // Ring full: the drop is counted on the queue counter, not on the
    // interface, and the call still succeeds.
    let drops_before = dp.drop_stats().get(DropReason::InterfaceDrop);
    dp.tx(&vif, arp_packet(&pool, 64)).unwrap();
    assert_eq!(vif.stats(FWD_LCORE_ID).queue_oerrors.get(), 1);
    assert_eq!(dp.drop_stats().get(DropReason::InterfaceDrop), drops_before + 1);
    assert_eq!(pool.in_use(), 1);
}

// S6: software VLAN insertion on a fabric port without VLAN offload.
#[test]
fn s6_vlan_sw_insert() {
    init();

    let mut raw = RingPort::new(EtherAddr::new([0x02, 0, 0, 0, 0, 0x06]));
    // Checksums offloaded, VLAN not.
    raw.set_offload_capa(
        TxOffloadCapa::IPV4_CKSUM | TxOffloadCapa::UDP_CKSUM | TxOffloadCapa::TCP_CKSUM,
        RxOffloadCapa::empty(),
    );
    let port = Arc::new(raw);

    let mut config = Config::default();
    config.vlan_tag = 100;
    let dp = datapath(&port, config);

    let vif = fabric_vif(1, "s6_fabric");
    dp.add(&vif).unwrap();
    assert!(!vif.flags().contains(VifFlags::VLAN_OFFLOAD));

    let pool = test_pool("s6");
    dp.tx(&vif, arp_packet(&pool, 64)).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    let out = drain_port(&port);
    assert_eq!(out.len(), 1);

    let m = &out[0];
    assert_eq!(m.pkt_len(), 68);
    assert_eq!(m.l2_len, 4);

    let data = m.data();
    assert_eq!(u16::from_be_bytes([data[12], data[13]]), ETHER_TYPE_VLAN);
    assert_eq!(u16::from_be_bytes([data[14], data[15]]), 100);
    assert_eq!(u16::from_be_bytes([data[16], data[17]]), ETHER_TYPE_ARP);
}

// VLAN offload variant: the NIC inserts the tag from the descriptor.
#[test]
fn vlan_hw_offload_sets_descriptor() {
    init();

    let port = fabric_port(true);
    let mut config = Config::default();
    config.vlan_tag = 207;
    let dp = datapath(&port, config);

    let vif = fabric_vif(1, "vlanhw_fabric");
    dp.add(&vif).unwrap();
    assert!(vif.flags().contains(VifFlags::VLAN_OFFLOAD));

    let pool = test_pool("vlanhw");
    dp.tx(&vif, arp_packet(&pool, 64)).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    let out = drain_port(&port);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].pkt_len(), 64);
    assert!(out[0].ol_flags.contains(OffloadFlags::TX_VLAN_PKT));
    assert_eq!(out[0].vlan_tci, 207);
}

// Property 1: a packet that cannot be enqueued is freed with a drop reason;
// the pool never leaks.
#[test]
fn tx_without_queue_drops_and_returns_error() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());

    // Never added, so no queues exist for it.
    let vif = fabric_vif(7, "noq_fabric");

    let pool = test_pool("noq");
    let drops = dp.drop_stats().get(DropReason::InterfaceDrop);

    assert!(dp.tx(&vif, arp_packet(&pool, 64)).is_err());
    assert_eq!(dp.drop_stats().get(DropReason::InterfaceDrop), drops + 1);
    assert_eq!(pool.in_use(), 0);
}

// Property 7: monitoring publication order, observed through the table and
// the flag word.
#[test]
fn monitoring_publication_order() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());

    let vif_a = fabric_vif(1, "monord_fabric");
    dp.add(&vif_a).unwrap();

    let vif_b = Arc::new(
        Vif::new(2, "monord_mon", VifType::Monitoring, NB_LCORES).with_os_idx(1),
    );
    dp.add(&vif_b).unwrap();

    assert_eq!(dp.monitoring_of(1), Some(2));
    assert!(vif_a.flags().contains(VifFlags::MONITORED));

    dp.del(&vif_b).unwrap();

    assert_eq!(dp.monitoring_of(1), None);
    assert!(!vif_a.flags().contains(VifFlags::MONITORED));
    assert!(!port.is_promiscuous());

    // No packet is mirrored after the mapping is cleared.
    let pool = test_pool("monord");
    dp.tx(&vif_a, arp_packet(&pool, 64)).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);
    assert_eq!(drain_port(&port).len(), 1);
}

// Property 8: add then del restores the pre-add state.
#[test]
fn add_del_inverse() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "inv_fabric");

    dp.add(&vif).unwrap();
    assert!(dp.ethdevs[0].lock().unwrap().is_some());
    assert!(vif.device().is_some());
    assert!(port.is_started());
    assert!(dp.lcores()[FWD_LCORE_ID].tx_queue_handle(1).is_some());

    dp.del(&vif).unwrap();
    assert!(dp.ethdevs[0].lock().unwrap().is_none());
    assert!(vif.device().is_none());
    assert!(!port.is_started());
    for lcore in dp.lcores() {
        assert!(lcore.tx_queue_handle(1).is_none());
    }

    // Deleting an unbound vif is a conflict.
    assert!(matches!(dp.del(&vif), Err(Error::AlreadyExists(_))));

    // And the port can be claimed again.
    dp.add(&vif).unwrap();
    dp.del(&vif).unwrap();
}

#[test]
fn fabric_add_resolves_dbdf() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());

    // Resolved through the PCI table rather than the PMD index.
    let vif = Arc::new(
        Vif::new(1, "dbdf_fabric", VifType::Physical, NB_LCORES).with_os_idx(FABRIC_DBDF),
    );
    dp.add(&vif).unwrap();
    assert!(vif.ethdev().is_some());
    dp.del(&vif).unwrap();

    // Unknown address: nothing to bind.
    let missing = Arc::new(
        Vif::new(2, "dbdf_missing", VifType::Physical, NB_LCORES).with_os_idx(0x0002_0300),
    );
    assert!(matches!(dp.add(&missing), Err(Error::NotFound(_))));
}

#[test]
fn fabric_attach_probes_capabilities_and_mac() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());

    let vif = fabric_vif(1, "capa_fabric");
    dp.add(&vif).unwrap();

    assert!(vif.flags().contains(VifFlags::TX_CSUM_OFFLOAD | VifFlags::VLAN_OFFLOAD));
    // The null MAC was replaced by the NIC's.
    assert_eq!(vif.mac(), port.macaddr());
    dp.del(&vif).unwrap();

    // An agent-supplied MAC survives the attach.
    let mac = EtherAddr::new([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
    let vif = Arc::new(
        Vif::new(1, "capa_mac", VifType::Physical, NB_LCORES)
            .with_flags(VifFlags::PMD)
            .with_mac(mac),
    );
    dp.add(&vif).unwrap();
    assert_eq!(vif.mac(), mac);
}

#[test]
fn fabric_double_add_conflicts() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());

    let vif_a = fabric_vif(1, "dup_fabric_a");
    dp.add(&vif_a).unwrap();

    let vif_b = fabric_vif(2, "dup_fabric_b");
    assert!(matches!(dp.add(&vif_b), Err(Error::AlreadyExists(_))));
}

#[test]
fn stop_flag_refuses_control_ops() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "stop_fabric");

    dp.stop();
    assert!(matches!(dp.add(&vif), Err(Error::Busy)));
    assert!(matches!(dp.del(&vif), Err(Error::Busy)));
}

#[test]
fn agent_requires_socket_transport_and_is_singleton() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());

    let wrong = Arc::new(
        Vif::new(3, "agent_wrong", VifType::Agent, NB_LCORES).with_transport(VifTransport::Eth),
    );
    assert!(matches!(dp.add(&wrong), Err(Error::InvalidArgument(_))));

    let agent = Arc::new(
        Vif::new(3, "agent_one", VifType::Agent, NB_LCORES).with_transport(VifTransport::Socket),
    );
    dp.add(&agent).unwrap();

    let second = Arc::new(
        Vif::new(4, "agent_two", VifType::Agent, NB_LCORES).with_transport(VifTransport::Socket),
    );
    assert!(matches!(dp.add(&second), Err(Error::AlreadyExists(_))));

    dp.del(&agent).unwrap();
    assert!(dp.packet_ring.read().unwrap().is_none());
}

struct RecordingUvhost {
    adds: Mutex<Vec<(String, usize, u16, u16)>>,
    dels: Mutex<Vec<usize>>,
    fail: bool,
}

impl RecordingUvhost {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(RecordingUvhost {
            adds: Mutex::new(Vec::new()),
            dels: Mutex::new(Vec::new()),
            fail,
        })
    }
}

impl UvhostClient for RecordingUvhost {
    fn vif_add(&self, name: &str, vif_idx: usize, nrxqs: u16, ntxqs: u16) -> Result<()> {
        if self.fail {
            return Err(Error::Internal("vhost agent unreachable".into()));
        }
        self.adds
            .lock()
            .unwrap()
            .push((name.to_owned(), vif_idx, nrxqs, ntxqs));
        Ok(())
    }

    fn vif_del(&self, vif_idx: usize) -> Result<()> {
        self.dels.lock().unwrap().push(vif_idx);
        Ok(())
    }
}

#[test]
fn virtual_add_notifies_vhost_agent() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let uvhost = RecordingUvhost::new(false);
    dp.set_uvhost_client(uvhost.clone());

    let vif = Arc::new(Vif::new(5, "vm_port", VifType::Virtual, NB_LCORES));
    dp.add(&vif).unwrap();

    {
        let adds = uvhost.adds.lock().unwrap();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].0, "vm_port");
        assert_eq!(adds[0].1, 5);
        assert_eq!(adds[0].2, crate::virtio::nrxqs(dp.nb_fwd_lcores()));
        assert_eq!(adds[0].3, lcore::TX_PER_LCORE);
    }

    dp.del(&vif).unwrap();
    assert_eq!(*uvhost.dels.lock().unwrap(), vec![5]);
    assert!(dp.lcores()[FWD_LCORE_ID].tx_queue_handle(5).is_none());
}

#[test]
fn virtual_add_propagates_vhost_failure() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    dp.set_uvhost_client(RecordingUvhost::new(true));

    let vif = Arc::new(Vif::new(5, "vm_fail", VifType::Virtual, NB_LCORES));
    assert!(matches!(dp.add(&vif), Err(Error::Internal(_))));

    // dp-core reacts with a delete, which must clean up the queues.
    dp.del(&vif).unwrap();
    assert!(dp.lcores()[FWD_LCORE_ID].tx_queue_handle(5).is_none());
}

#[test]
fn mss_clamped_on_guest_bound_syn() {
    init();

    let port = fabric_port(true);
    let mut config = Config::default();
    config.to_vm_mss_adj = true;
    let dp = datapath(&port, config);

    let vif = Arc::new(Vif::new(5, "vm_mss", VifType::Virtual, NB_LCORES));
    dp.add(&vif).unwrap();

    // Ethernet + IPv4 + TCP SYN with MSS 1460.
    let pool = test_pool("mss");
    let mut m = pool.alloc().unwrap();
    let total = ETHER_HDR_LEN + IPV4_HDR_LEN + TCP_HDR_LEN + 4;
    let frame = m.append(total).unwrap();
    frame[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
    let iph = ETHER_HDR_LEN;
    frame[iph] = 0x45;
    frame[iph + 2..iph + 4].copy_from_slice(&((total - ETHER_HDR_LEN) as u16).to_be_bytes());
    frame[iph + 9] = IPPROTO_TCP;
    let tcp = iph + IPV4_HDR_LEN;
    frame[tcp + 12] = 6 << 4;
    frame[tcp + 13] = ip::TCP_FLAG_SYN;
    frame[tcp + 20] = 2;
    frame[tcp + 21] = 4;
    frame[tcp + 22..tcp + 24].copy_from_slice(&1460u16.to_be_bytes());

    dp.tx(&vif, Packet::from_mbuf(m, VpType::Ip)).unwrap();

    let virtio = match vif.device() {
        Some(VifDevice::Virtio(dev)) => dev,
        _ => panic!("virtual vif lost its vrings"),
    };
    let out = virtio
        .tx_vring(FWD_LCORE_ID as u16)
        .unwrap()
        .dequeue_burst(4);
    assert_eq!(out.len(), 1);

    let data = out[0].data();
    let mss = u16::from_be_bytes([data[tcp + 22], data[tcp + 23]]);
    assert_eq!(mss, 1500 - 40 - 20 - TCP_HDR_LEN as u16);
}

#[test]
fn mss_parse_failure_drops_with_pull() {
    init();

    let port = fabric_port(true);
    let mut config = Config::default();
    config.to_vm_mss_adj = true;
    let dp = datapath(&port, config);

    let vif = Arc::new(Vif::new(5, "vm_pull", VifType::Virtual, NB_LCORES));
    dp.add(&vif).unwrap();

    let pool = test_pool("pull");
    let mut m = pool.alloc().unwrap();
    // Claims IPv4/TCP but is too short to hold the transport header.
    let frame = m.append(ETHER_HDR_LEN + IPV4_HDR_LEN).unwrap();
    frame[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
    frame[ETHER_HDR_LEN] = 0x45;
    frame[ETHER_HDR_LEN + 9] = IPPROTO_TCP;

    let drops = dp.drop_stats().get(DropReason::Pull);
    assert!(dp.tx(&vif, Packet::from_mbuf(m, VpType::Ip)).is_err());
    assert_eq!(dp.drop_stats().get(DropReason::Pull), drops + 1);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn vhost_kni_binds_first_bond_slave() {
    init();

    let mut bond = RingPort::new(EtherAddr::new([0x02, 0, 0, 0, 0, 0x0b]));
    bond.set_offload_capa(TxOffloadCapa::all(), RxOffloadCapa::all());
    bond.set_slaves(vec![1]);
    let bond = Arc::new(bond);
    let slave = Arc::new(RingPort::new(EtherAddr::new([0x02, 0, 0, 0, 0, 0x0c])));

    let dp = Datapath::new(
        Config::default(),
        vec![
            bond.clone() as Arc<dyn EthPortDriver>,
            slave.clone() as Arc<dyn EthPortDriver>,
        ],
    );

    let fabric = fabric_vif(1, "bond_fabric");
    dp.add(&fabric).unwrap();

    let vhost = Arc::new(Vif::new(2, "vhost_bond0", VifType::Host, NB_LCORES));
    vhost.set_bridge(fabric.clone());
    dp.add(&vhost).unwrap();

    let kni = match vhost.device() {
        Some(VifDevice::Kni(kni)) => kni,
        _ => panic!("vhost vif lost its KNI"),
    };
    // KNI cannot bind the bond itself; the first member backs it.
    assert_eq!(kni.port_id(), 1);
    assert_eq!(kni.macaddr(), slave.macaddr());

    dp.del(&vhost).unwrap();
    dp.del(&fabric).unwrap();
}

#[test]
fn service_core_flushes_immediately() {
    init();
    lcore::set_current(0);

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "svc_fabric");
    dp.add(&vif).unwrap();

    let pool = test_pool("svc");
    dp.tx(&vif, arp_packet(&pool, 64)).unwrap();

    // No explicit flush: service cores may not strand packets.
    assert_eq!(drain_port(&port).len(), 1);
}

#[test]
fn rx_enqueues_without_flush() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "rx_fabric");
    dp.add(&vif).unwrap();

    let pool = test_pool("rx");
    dp.rx(&vif, arp_packet(&pool, 64)).unwrap();

    // rx never flushes; the frame sits in the writer until the poll loop
    // ends.
    assert!(drain_port(&port).is_empty());
    dp.flush_lcore(FWD_LCORE_ID);
    assert_eq!(drain_port(&port).len(), 1);
}

#[test]
fn facade_reports_settings_mtu_encap() {
    init();

    let mut raw = RingPort::new(EtherAddr::new([0x02, 0, 0, 0, 0, 0x07]));
    raw.set_offload_capa(TxOffloadCapa::all(), RxOffloadCapa::all());
    raw.set_mtu(9000);
    let port = Arc::new(raw);
    let dp = datapath(&port, Config::default());

    let fabric = fabric_vif(1, "set_fabric");
    dp.add(&fabric).unwrap();

    let settings = dp.get_settings(&fabric);
    assert_eq!(settings.speed, 10_000);
    assert!(settings.full_duplex);
    assert_eq!(dp.get_mtu(&fabric), 9000);
    assert_eq!(dp.get_encap(&fabric), crate::interface::EncapType::Ether);

    // Anything without a link reports the defaults and its own MTU.
    let guest = Arc::new(Vif::new(5, "set_vm", VifType::Virtual, NB_LCORES).with_mtu(1450));
    dp.add(&guest).unwrap();
    let settings = dp.get_settings(&guest);
    assert_eq!(settings.speed, 1000);
    assert!(settings.full_duplex);
    assert_eq!(dp.get_mtu(&guest), 1450);
}

#[test]
fn stats_update_fills_port_and_dev_buckets() {
    init();

    let port = fabric_port(true);
    let dp = datapath(&port, Config::default());
    let vif = fabric_vif(1, "stats_fabric");
    dp.add(&vif).unwrap();

    let pool = test_pool("stats");
    dp.tx(&vif, arp_packet(&pool, 64)).unwrap();
    dp.flush_lcore(FWD_LCORE_ID);

    dp.stats_update(&vif, None);

    // Ethdev queues land in the port bucket.
    let stats = vif.stats(FWD_LCORE_ID);
    assert_eq!(stats.port_opackets.get(), 1);
    assert_eq!(stats.port_oerrors.get(), 0);

    // The device counter mirrors the per-queue NIC stats for this lcore's
    // TX queue.
    assert_eq!(stats.dev_opackets.get(), 1);

    // Core 0 carries the global device counters.
    assert_eq!(vif.stats(0).dev_oerrors.get(), 0);
    assert_eq!(vif.stats(0).dev_inombufs.get(), 0);

    // Virtio queues land in the queue bucket instead.
    let guest = Arc::new(Vif::new(5, "stats_vm", VifType::Virtual, NB_LCORES));
    dp.add(&guest).unwrap();
    dp.tx(&guest, arp_packet(&pool, 64)).unwrap();
    dp.stats_update(&guest, Some(FWD_LCORE_ID));
    assert_eq!(guest.stats(FWD_LCORE_ID).queue_opackets.get(), 1);
    assert_eq!(guest.stats(FWD_LCORE_ID).port_opackets.get(), 0);
}

#[test]
fn schedule_spreads_rx_queues_over_forwarding_lcores() {
    init();

    let nb_lcores = num_cpus::get().max(NB_LCORES);
    let port = fabric_port(true);
    let mut config = Config::default();
    config.nb_lcores = nb_lcores;
    let dp = Datapath::new(config, vec![port.clone() as Arc<dyn EthPortDriver>]);

    let vif = Arc::new(
        Vif::new(1, "sched_fabric", VifType::Physical, nb_lcores)
            .with_flags(VifFlags::PMD)
            .with_mtu(1500),
    );
    dp.add(&vif).unwrap();

    let nrxqs = vif.ethdev().unwrap().nb_rss_queues;
    let scheduled: usize = dp
        .lcores()
        .iter()
        .filter(|l| l.is_forwarding())
        .map(|l| l.rx_queue_load())
        .sum();
    assert_eq!(scheduled, usize::from(nrxqs));

    // Every lcore can transmit.
    for lcore in dp.lcores() {
        assert!(lcore.tx_queue_handle(1).is_some());
    }

    dp.del(&vif).unwrap();
    assert_eq!(
        dp.lcores().iter().map(|l| l.rx_queue_load()).sum::<usize>(),
        0
    );
}

#[test]
fn vlan_forwarding_intf_comes_up_with_ring() {
    init();

    let port = fabric_port(true);
    let mut config = Config::default();
    config.vlan_tag = 300;
    config.vlan_name = "vlan_fwd0".to_owned();
    let dp = datapath(&port, config);

    dp.add_vlan_forwarding_intf().unwrap();
    assert!(dp.vlan_kni.lock().unwrap().is_some());
    assert!(dp.vlan_ring.lock().unwrap().is_some());
}
