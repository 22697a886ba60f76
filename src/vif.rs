//!
//! Virtual router interfaces.
//!
//! A vif is the per-port record the upper vrouter owns; the host-interface
//! layer fills exactly one slot in it, the bound device, tagged by the vif
//! kind. The flag word is updated with release stores and tested by the
//! datapath with acquire loads -- that pairing is what makes the monitoring
//! table safe to read locklessly.
//!
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::ethdev::EthDev;
use crate::ether::EtherAddr;
use crate::kni::KniDev;
use crate::usocket::PacketSocket;
use crate::virtio::VirtioDev;

/// Dense interface index space; also the "not monitored" sentinel.
pub const MAX_INTERFACES: usize = 256;

/// Interface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum VifType {
    /// Kernel-visible management port.
    Host = 0,
    /// Control-plane daemon port.
    Agent = 1,
    /// Underlay NIC-facing port.
    Physical = 2,
    /// Paravirtualised guest port.
    Virtual = 3,
    /// Passive mirror of another port.
    Monitoring = 4,
}

/// How the interface reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum VifTransport {
    Virtual = 0,
    Eth = 1,
    Pmd = 2,
    Socket = 3,
}

bitflags! {
    pub struct VifFlags: u32 {
        /// NIC finishes IPv4 + UDP + TCP TX checksums.
        const TX_CSUM_OFFLOAD = 0x0000_0020;
        /// The OS index is a PMD port id rather than a PCI DBDF.
        const PMD             = 0x0000_2000;
        /// Another vif mirrors this interface's traffic.
        const MONITORED       = 0x0000_8000;
        /// NIC inserts and strips VLAN tags.
        const VLAN_OFFLOAD    = 0x0002_0000;
    }
}

/// The device bound into a vif's opaque slot. The discriminator always
/// matches the vif kind, so callers dispatch by kind and simply expect the
/// corresponding variant.
#[derive(Clone)]
pub enum VifDevice {
    Ethdev(Arc<EthDev>),
    Kni(Arc<KniDev>),
    Virtio(Arc<VirtioDev>),
    Packet(Arc<PacketSocket>),
}

/// Per-lcore, per-interface counters.
///
/// `queue_*` and `port_*` hold absolute snapshots of the queue-op stats,
/// split by whether the queue is ring-backed; `dev_*` hold NIC counters.
#[derive(Default)]
pub struct VifStats {
    pub queue_ipackets: StatCounter,
    pub queue_ierrors: StatCounter,
    pub queue_opackets: StatCounter,
    pub queue_oerrors: StatCounter,
    pub port_ipackets: StatCounter,
    pub port_ierrors: StatCounter,
    pub port_opackets: StatCounter,
    pub port_oerrors: StatCounter,
    pub dev_ibytes: StatCounter,
    pub dev_ipackets: StatCounter,
    pub dev_ierrors: StatCounter,
    pub dev_inombufs: StatCounter,
    pub dev_obytes: StatCounter,
    pub dev_opackets: StatCounter,
    pub dev_oerrors: StatCounter,
}

pub struct Vif {
    pub idx: usize,
    pub name: String,
    pub vtype: VifType,
    pub transport: VifTransport,
    /// Kind-dependent OS handle: PCI DBDF or PMD port for fabric, the
    /// monitored vif index for monitoring ports.
    pub os_idx: u32,
    flags: AtomicU32,
    mtu: AtomicU32,
    mac: Mutex<EtherAddr>,
    bridge: Mutex<Option<Arc<Vif>>>,
    device: RwLock<Option<VifDevice>>,
    stats: Vec<VifStats>,
}

impl Vif {
    pub fn new<S: AsRef<str>>(idx: usize, name: S, vtype: VifType, nb_lcores: usize) -> Vif {
        Vif {
            idx,
            name: name.as_ref().to_owned(),
            vtype,
            transport: VifTransport::Eth,
            os_idx: 0,
            flags: AtomicU32::new(0),
            mtu: AtomicU32::new(1500),
            mac: Mutex::new(EtherAddr::zeroed()),
            bridge: Mutex::new(None),
            device: RwLock::new(None),
            stats: (0..nb_lcores).map(|_| VifStats::default()).collect(),
        }
    }

    pub fn with_transport(mut self, transport: VifTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_os_idx(mut self, os_idx: u32) -> Self {
        self.os_idx = os_idx;
        self
    }

    pub fn with_mtu(self, mtu: u16) -> Self {
        self.mtu.store(u32::from(mtu), Ordering::Relaxed);
        self
    }

    pub fn with_flags(self, flags: VifFlags) -> Self {
        self.flags.store(flags.bits(), Ordering::Relaxed);
        self
    }

    pub fn with_mac(self, mac: EtherAddr) -> Self {
        *self.mac.lock().unwrap() = mac;
        self
    }

    /// Current flag set, acquire-ordered against control-plane updates.
    #[inline]
    pub fn flags(&self) -> VifFlags {
        VifFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn add_flags(&self, flags: VifFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Release);
    }

    pub fn clear_flags(&self, flags: VifFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Release);
    }

    #[inline]
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed) as u16
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(u32::from(mtu), Ordering::Relaxed);
    }

    pub fn mac(&self) -> EtherAddr {
        *self.mac.lock().unwrap()
    }

    pub fn set_mac(&self, mac: EtherAddr) {
        *self.mac.lock().unwrap() = mac;
    }

    /// The fabric vif this (vhost) interface is cross-connected to.
    pub fn bridge(&self) -> Option<Arc<Vif>> {
        self.bridge.lock().unwrap().clone()
    }

    pub fn set_bridge(&self, bridge: Arc<Vif>) {
        *self.bridge.lock().unwrap() = Some(bridge);
    }

    /// The bound device; a vif is "bound" iff this slot is filled.
    pub fn device(&self) -> Option<VifDevice> {
        self.device.read().unwrap().clone()
    }

    pub(crate) fn set_device(&self, device: VifDevice) {
        *self.device.write().unwrap() = Some(device);
    }

    pub(crate) fn take_device(&self) -> Option<VifDevice> {
        self.device.write().unwrap().take()
    }

    /// The bound ethdev, for fabric vifs.
    pub fn ethdev(&self) -> Option<Arc<EthDev>> {
        match self.device() {
            Some(VifDevice::Ethdev(dev)) => Some(dev),
            _ => None,
        }
    }

    pub fn stats(&self, lcore_id: usize) -> &VifStats {
        &self.stats[lcore_id]
    }

    pub fn nb_stats(&self) -> usize {
        self.stats.len()
    }

    #[inline]
    pub fn is_fabric(&self) -> bool {
        self.vtype == VifType::Physical
    }

    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.vtype == VifType::Virtual
    }

    #[inline]
    pub fn is_vhost(&self) -> bool {
        self.vtype == VifType::Host
    }
}

/// A relaxed 64-bit counter cell.
#[derive(Default)]
pub struct StatCounter(std::sync::atomic::AtomicU64);

impl StatCounter {
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn set(&self, n: u64) {
        self.0.store(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_slot() {
        let vif = Vif::new(4, "eth0", VifType::Physical, 2)
            .with_flags(VifFlags::PMD)
            .with_os_idx(1)
            .with_mtu(9000);

        assert!(vif.flags().contains(VifFlags::PMD));
        assert_eq!(vif.mtu(), 9000);
        assert!(vif.is_fabric());
        assert!(vif.device().is_none());

        vif.add_flags(VifFlags::MONITORED);
        assert!(vif.flags().contains(VifFlags::MONITORED | VifFlags::PMD));
        vif.clear_flags(VifFlags::MONITORED);
        assert!(!vif.flags().contains(VifFlags::MONITORED));
    }
}
