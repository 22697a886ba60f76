//!
//! Kernel network interfaces.
//!
//! A KNI is a synthetic netdev whose packets cross the kernel boundary. The
//! kernel side is a process-wide namespace, so the subsystem is initialised
//! once per process and keeps the live interface names; a device releases
//! its name when dropped.
//!
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};

use crate::ethdev::PortId;
use crate::ether::EtherAddr;
use crate::lcore::{QueueCounters, QueueKind, QueueStats, RxQueueHandle, TxQueueHandle};
use crate::mbuf::Mbuf;
use crate::ring::Ring;

const KNI_RING_SZ: usize = 1024;

struct Subsystem {
    max_ifaces: usize,
    names: HashSet<String>,
}

lazy_static! {
    static ref SUBSYSTEM: Mutex<Option<Subsystem>> = Mutex::new(None);
}

/// Initialize and preallocate the KNI subsystem. Idempotent.
pub fn init(max_kni_ifaces: usize) -> Result<()> {
    let mut subsys = SUBSYSTEM.lock().unwrap();
    if subsys.is_none() {
        *subsys = Some(Subsystem {
            max_ifaces: max_kni_ifaces,
            names: HashSet::new(),
        });
    }

    Ok(())
}

/// Tear the KNI subsystem down.
pub fn close() {
    *SUBSYSTEM.lock().unwrap() = None;
}

/// A kernel-visible interface bound to a backing Ethernet port.
pub struct KniDev {
    name: String,
    port_id: PortId,
    mac: EtherAddr,
    mtu: u16,
    // Packets heading into the kernel.
    tx_ring: Arc<Ring>,
    // Packets the kernel handed to us.
    rx_ring: Arc<Ring>,
}

/// Allocate a KNI bound to `port_id`.
pub fn alloc(name: &str, port_id: PortId, mac: EtherAddr, mtu: u16) -> Result<Arc<KniDev>> {
    let mut subsys = SUBSYSTEM.lock().unwrap();
    let subsys = subsys
        .as_mut()
        .ok_or_else(|| anyhow!("KNI subsystem not initialized"))?;

    if subsys.names.len() >= subsys.max_ifaces {
        bail!("KNI interface limit {} reached", subsys.max_ifaces);
    }
    if !subsys.names.insert(name.to_owned()) {
        bail!("KNI {} already exists", name);
    }

    Ok(Arc::new(KniDev {
        name: name.to_owned(),
        port_id,
        mac,
        mtu,
        tx_ring: Ring::new(format!("kni_{}_tx", name), KNI_RING_SZ),
        rx_ring: Ring::new(format!("kni_{}_rx", name), KNI_RING_SZ),
    }))
}

impl Drop for KniDev {
    fn drop(&mut self) {
        if let Some(subsys) = SUBSYSTEM.lock().unwrap().as_mut() {
            subsys.names.remove(&self.name);
        }
    }
}

impl KniDev {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn macaddr(&self) -> EtherAddr {
        self.mac
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// The ring carrying packets towards the kernel.
    pub fn tx_ring(&self) -> &Arc<Ring> {
        &self.tx_ring
    }

    /// The ring carrying packets from the kernel.
    pub fn rx_ring(&self) -> &Arc<Ring> {
        &self.rx_ring
    }

    /// Send a burst towards the kernel; returns how many were taken.
    pub fn tx_burst(&self, pkts: Vec<Mbuf>) -> usize {
        let offered = pkts.len();
        let rejected = self.tx_ring.enqueue_burst(pkts);
        offered - rejected.len()
    }

    /// Retrieve a burst of packets the kernel sent.
    pub fn rx_burst(&self, max: usize) -> Vec<Mbuf> {
        self.rx_ring.dequeue_burst(max)
    }
}

/// TX queue feeding a KNI. Bulk enqueue is not offered, matching the
/// single-buffer op table of the kernel path.
pub struct KniTxQueue {
    kni: Arc<KniDev>,
    counters: QueueCounters,
}

impl KniTxQueue {
    pub fn new(kni: Arc<KniDev>) -> Arc<Self> {
        Arc::new(KniTxQueue {
            kni,
            counters: QueueCounters::new(),
        })
    }
}

impl TxQueueHandle for KniTxQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Kni
    }

    fn tx(&self, m: Mbuf) {
        self.counters.inc_in(1);
        if self.kni.tx_ring.enqueue(m).is_err() {
            self.counters.inc_drop(1);
        }
    }

    fn stats(&self, clear: bool) -> QueueStats {
        self.counters.snapshot(clear)
    }
}

/// RX queue polling a KNI.
pub struct KniRxQueue {
    kni: Arc<KniDev>,
    counters: QueueCounters,
}

impl KniRxQueue {
    pub fn new(kni: Arc<KniDev>) -> Arc<Self> {
        Arc::new(KniRxQueue {
            kni,
            counters: QueueCounters::new(),
        })
    }
}

impl RxQueueHandle for KniRxQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Kni
    }

    fn rx_burst(&self, max: usize) -> Vec<Mbuf> {
        let pkts = self.kni.rx_burst(max);
        self.counters.inc_in(pkts.len() as u64);
        pkts
    }

    fn stats(&self, clear: bool) -> QueueStats {
        self.counters.snapshot(clear)
    }
}
