//!
//! The datapath root: configuration, lcores, device slots and the handful of
//! process-wide resources the TX path reads locklessly.
//!
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use num_traits::FromPrimitive;

use crate::errors::{Error, Result};
use crate::ethdev::{EthDev, EthPortDriver, PortId};
use crate::kni::{self, KniDev};
use crate::lcore::Lcore;
use crate::mbuf::Mbuf;
use crate::mempool::MemoryPool;
use crate::pkt::{DropReason, NR_DROP_REASONS};
use crate::ring::Ring;
use crate::usocket::PacketSocket;
use crate::uvhost::{NullUvhost, UvhostClient};
use crate::vif::{Vif, MAX_INTERFACES};

/// "No VLAN" sentinel for the global tag.
pub const VLAN_ID_INVALID: u16 = u16::MAX;

#[derive(Clone)]
pub struct Config {
    /// Total lcore count, service cores included.
    pub nb_lcores: usize,
    /// 802.1q tag inserted on fabric egress, or [`VLAN_ID_INVALID`].
    pub vlan_tag: u16,
    /// Name of the optional VLAN forwarding interface.
    pub vlan_name: String,
    /// Clamp the MSS of TCP SYNs heading to guests.
    pub to_vm_mss_adj: bool,
    /// Overlay overhead assumed by the MSS clamp.
    pub overlay_len: u16,
    pub frag_pool_size: usize,
    pub frag_data_room: usize,
    pub packet_ring_sz: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nb_lcores: 4,
            vlan_tag: VLAN_ID_INVALID,
            vlan_name: "vfw0".to_owned(),
            to_vm_mss_adj: false,
            overlay_len: 40,
            frag_pool_size: 1024,
            frag_data_room: 2048,
            packet_ring_sz: 1024,
        }
    }
}

/// C-style lock/unlock pair for the interface table; the upper vrouter holds
/// it across whole control transactions, so the guard cannot live in the
/// callee.
struct IfLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl IfLock {
    fn new() -> Self {
        IfLock {
            locked: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.cv.wait(locked).unwrap();
        }
        *locked = true;
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap();
        *locked = false;
        self.cv.notify_one();
    }
}

/// Per-reason drop counters.
pub struct DropStats {
    counters: Vec<AtomicU64>,
}

impl DropStats {
    fn new() -> Self {
        DropStats {
            counters: (0..NR_DROP_REASONS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn count(&self, reason: DropReason) {
        self.counters[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.counters[reason as usize].load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> Vec<(DropReason, u64)> {
        (0..NR_DROP_REASONS)
            .filter_map(|i| DropReason::from_usize(i).map(|r| (r, self.get(r))))
            .collect()
    }
}

pub struct Datapath {
    config: Config,
    devices: Vec<Arc<dyn EthPortDriver>>,
    lcores: Vec<Lcore>,
    pub(crate) ethdevs: Vec<Mutex<Option<Arc<EthDev>>>>,
    pub(crate) vifs: RwLock<Vec<Option<Arc<Vif>>>>,
    /// monitored vif index -> monitoring vif index, sentinel
    /// [`MAX_INTERFACES`]. Single writer (control thread), many readers.
    pub(crate) monitorings: Vec<AtomicUsize>,
    pub(crate) packet_ring: RwLock<Option<Arc<Ring>>>,
    pub(crate) packet_socket: RwLock<Option<Arc<PacketSocket>>>,
    pub(crate) vlan_kni: Mutex<Option<Arc<KniDev>>>,
    pub(crate) vlan_ring: Mutex<Option<Arc<Ring>>>,
    frag_pool: MemoryPool,
    uvhost: RwLock<Arc<dyn UvhostClient>>,
    stop_flag: AtomicBool,
    if_lock: IfLock,
    drop_stats: DropStats,
}

impl Datapath {
    /// Bring the datapath up over an already-probed device table.
    pub fn new(config: Config, devices: Vec<Arc<dyn EthPortDriver>>) -> Datapath {
        if let Err(e) = kni::init(MAX_INTERFACES) {
            warn!("KNI subsystem init failed: {}", e);
        }

        let frag_pool = MemoryPool::create(
            "frag_direct",
            config.frag_pool_size,
            config.frag_data_room,
        );
        let nb_ports = devices.len();

        Datapath {
            lcores: (0..config.nb_lcores).map(Lcore::new).collect(),
            ethdevs: (0..nb_ports).map(|_| Mutex::new(None)).collect(),
            vifs: RwLock::new((0..MAX_INTERFACES).map(|_| None).collect()),
            monitorings: (0..MAX_INTERFACES)
                .map(|_| AtomicUsize::new(MAX_INTERFACES))
                .collect(),
            packet_ring: RwLock::new(None),
            packet_socket: RwLock::new(None),
            vlan_kni: Mutex::new(None),
            vlan_ring: Mutex::new(None),
            frag_pool,
            uvhost: RwLock::new(Arc::new(NullUvhost)),
            stop_flag: AtomicBool::new(false),
            if_lock: IfLock::new(),
            drop_stats: DropStats::new(),
            config,
            devices,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lcores(&self) -> &[Lcore] {
        &self.lcores
    }

    pub fn nb_fwd_lcores(&self) -> usize {
        self.lcores.iter().filter(|l| l.is_forwarding()).count()
    }

    /// The probed Ethernet device table.
    pub fn dev_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, port_id: PortId) -> Option<&Arc<dyn EthPortDriver>> {
        self.devices.get(usize::from(port_id))
    }

    pub fn devices(&self) -> &[Arc<dyn EthPortDriver>] {
        &self.devices
    }

    pub fn set_uvhost_client(&self, client: Arc<dyn UvhostClient>) {
        *self.uvhost.write().unwrap() = client;
    }

    pub(crate) fn uvhost(&self) -> Arc<dyn UvhostClient> {
        self.uvhost.read().unwrap().clone()
    }

    pub fn frag_pool(&self) -> &MemoryPool {
        &self.frag_pool
    }

    /// Refuse further add/del; in-flight TX completes.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn is_stop_flag_set(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub(crate) fn if_lock(&self) {
        self.if_lock.lock();
    }

    pub(crate) fn if_unlock(&self) {
        self.if_lock.unlock();
    }

    /// Free a buffer with a categorised drop.
    pub fn pfree(&self, m: Mbuf, reason: DropReason) {
        self.drop_stats.count(reason);
        drop(m);
    }

    pub fn drop_stats(&self) -> &DropStats {
        &self.drop_stats
    }

    /// The vif mirroring `vif_idx`, when monitoring is on.
    pub fn monitoring_of(&self, vif_idx: usize) -> Option<usize> {
        let idx = self.monitorings.get(vif_idx)?.load(Ordering::Acquire);
        if idx < MAX_INTERFACES {
            Some(idx)
        } else {
            None
        }
    }

    pub fn get_vif(&self, vif_idx: usize) -> Option<Arc<Vif>> {
        self.vifs.read().unwrap().get(vif_idx)?.clone()
    }

    pub(crate) fn register_vif(&self, vif: &Arc<Vif>) {
        if vif.idx < MAX_INTERFACES {
            self.vifs.write().unwrap()[vif.idx] = Some(vif.clone());
        }
    }

    pub(crate) fn unregister_vif(&self, vif_idx: usize) {
        if vif_idx < MAX_INTERFACES {
            self.vifs.write().unwrap()[vif_idx] = None;
        }
    }

    pub(crate) fn packet_wakeup(&self) {
        let socket = self.packet_socket.read().unwrap().clone();
        if let Some(socket) = socket {
            socket.wakeup();
        }
    }

    /// Create the VLAN forwarding interface: a KNI on port 0 plus a
    /// multi-producer ring buffering packets for it.
    pub fn add_vlan_forwarding_intf(&self) -> Result<()> {
        info!("adding VLAN forwarding device {}", self.config.vlan_name);

        let mac = self
            .devices
            .first()
            .map(|dev| dev.macaddr())
            .unwrap_or_else(crate::ether::EtherAddr::random);

        let kni = kni::alloc(&self.config.vlan_name, 0, mac, 1500)
            .map_err(|e| Error::Internal(format!("VLAN forwarding KNI: {}", e)))?;
        let ring = Ring::new(&self.config.vlan_name, self.config.packet_ring_sz);

        *self.vlan_kni.lock().unwrap() = Some(kni);
        *self.vlan_ring.lock().unwrap() = Some(ring);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_and_drops() {
        let dp = Datapath::new(Config::default(), Vec::new());

        assert!(!dp.is_stop_flag_set());
        dp.stop();
        assert!(dp.is_stop_flag_set());

        let m = dp.frag_pool().alloc().unwrap();
        dp.pfree(m, DropReason::InterfaceDrop);
        assert_eq!(dp.drop_stats().get(DropReason::InterfaceDrop), 1);
        assert_eq!(dp.frag_pool().in_use(), 0);

        let totals = dp.drop_stats().totals();
        assert_eq!(totals.len(), NR_DROP_REASONS);
    }

    #[test]
    fn test_monitorings_sentinel() {
        let dp = Datapath::new(Config::default(), Vec::new());
        assert_eq!(dp.monitoring_of(0), None);

        dp.monitorings[0].store(9, Ordering::Release);
        assert_eq!(dp.monitoring_of(0), Some(9));
    }
}
