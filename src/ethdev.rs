//!
//! Ethernet devices.
//!
//! The poll-mode driver itself is an external collaborator; the datapath
//! talks to it through the [`EthPortDriver`] seam. [`EthDev`] is the
//! per-port record the registry owns: queue counts negotiated against the
//! driver's limits and the bond-slave list (the first slave backs the KNI,
//! since a KNI cannot bind a bond port).
//!
//! [`RingPort`] is a software port in the spirit of the ring PMD, used by
//! the test suite and by demos in place of real hardware.
//!
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::errors::{Error, Result};
use crate::ether::EtherAddr;
use crate::lcore::{QueueCounters, QueueKind, QueueStats, RxQueueHandle, TxQueueHandle};
use crate::mbuf::Mbuf;
use crate::pci;
use crate::ring::Ring;

pub type PortId = u16;
pub type QueueId = u16;

pub const INVALID_PORT_ID: PortId = PortId::MAX;

/// RSS fans out to at most this many RX queues per port.
pub const MAX_NB_RSS_QUEUES: u16 = 4;

/// Per-queue NIC counters exist for this many queues.
pub const QUEUE_STAT_CNTRS: usize = 16;

/// TX writers batch up to this many buffers before pushing to the device.
pub const TX_BURST_SZ: usize = 32;

const PORT_RING_SZ: usize = 512;

bitflags! {
    pub struct TxOffloadCapa: u32 {
        const VLAN_INSERT = 0x0001;
        const IPV4_CKSUM  = 0x0002;
        const UDP_CKSUM   = 0x0004;
        const TCP_CKSUM   = 0x0008;
    }
}

bitflags! {
    pub struct RxOffloadCapa: u32 {
        const VLAN_STRIP = 0x0001;
        const IPV4_CKSUM = 0x0002;
        const UDP_CKSUM  = 0x0004;
        const TCP_CKSUM  = 0x0008;
    }
}

/// Contextual information of an Ethernet port.
#[derive(Debug, Clone)]
pub struct DevInfo {
    pub driver_name: String,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub tx_offload_capa: TxOffloadCapa,
    pub rx_offload_capa: RxOffloadCapa,
}

/// Link-level information of an Ethernet port.
#[derive(Debug, Clone, Copy, Default)]
pub struct EthLink {
    pub speed: u32,
    pub duplex: bool,
    pub autoneg: bool,
    pub up: bool,
}

/// General I/O statistics of an Ethernet port.
#[derive(Debug, Clone)]
pub struct EthStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub ibytes: u64,
    pub obytes: u64,
    pub ierrors: u64,
    pub oerrors: u64,
    pub rx_nombuf: u64,
    pub q_ipackets: [u64; QUEUE_STAT_CNTRS],
    pub q_opackets: [u64; QUEUE_STAT_CNTRS],
    pub q_ibytes: [u64; QUEUE_STAT_CNTRS],
    pub q_obytes: [u64; QUEUE_STAT_CNTRS],
    pub q_errors: [u64; QUEUE_STAT_CNTRS],
}

impl Default for EthStats {
    fn default() -> Self {
        EthStats {
            ipackets: 0,
            opackets: 0,
            ibytes: 0,
            obytes: 0,
            ierrors: 0,
            oerrors: 0,
            rx_nombuf: 0,
            q_ipackets: [0; QUEUE_STAT_CNTRS],
            q_opackets: [0; QUEUE_STAT_CNTRS],
            q_ibytes: [0; QUEUE_STAT_CNTRS],
            q_obytes: [0; QUEUE_STAT_CNTRS],
            q_errors: [0; QUEUE_STAT_CNTRS],
        }
    }
}

/// The contract a poll-mode port driver fulfils towards the datapath.
///
/// `tx_burst` consumes a prefix of `pkts` and returns how many buffers the
/// device accepted; the rest stay with the caller.
pub trait EthPortDriver: Send + Sync {
    fn info(&self) -> DevInfo;

    fn pci_addr(&self) -> Option<pci::Addr> {
        None
    }

    fn macaddr(&self) -> EtherAddr;

    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self);

    fn link(&self) -> EthLink {
        EthLink::default()
    }

    fn stats(&self) -> EthStats;

    fn promiscuous_enable(&self);

    fn promiscuous_disable(&self);

    fn mtu(&self) -> u16 {
        1500
    }

    fn rss_configure(&self, nb_queues: u16) -> Result<()> {
        let _ = nb_queues;
        Ok(())
    }

    /// Bond members, empty for plain ports.
    fn slaves(&self) -> Vec<PortId> {
        Vec::new()
    }

    fn tx_burst(&self, queue_id: QueueId, pkts: &mut Vec<Mbuf>) -> usize;

    fn rx_burst(&self, queue_id: QueueId, max: usize) -> Vec<Mbuf>;
}

/// Locate a port by PCI address in the probed device table.
pub fn find_port_by_pci(devices: &[Arc<dyn EthPortDriver>], addr: &pci::Addr) -> Option<PortId> {
    devices.iter().position(|dev| {
        dev.pci_addr().map_or(false, |a| {
            a.bus == addr.bus
                && a.devid == addr.devid
                && a.domain == addr.domain
                && a.function == addr.function
        })
    }).map(|pos| pos as PortId)
}

/// Per-port record owned by the registry; attached to at most one fabric
/// vif.
pub struct EthDev {
    port_id: PortId,
    driver: Arc<dyn EthPortDriver>,
    pub nb_rss_queues: u16,
    pub nb_tx_queues: u16,
    pub slaves: Vec<PortId>,
}

impl EthDev {
    /// Negotiate queue counts against the driver's limits and configure the
    /// port.
    pub fn init(
        port_id: PortId,
        driver: Arc<dyn EthPortDriver>,
        nb_fwd_lcores: usize,
        nb_lcores: usize,
    ) -> Result<EthDev> {
        let info = driver.info();
        if info.max_rx_queues == 0 || info.max_tx_queues == 0 {
            return Err(Error::Internal(format!(
                "eth device {} reports no usable queues",
                port_id
            )));
        }

        let nb_rss_queues = info
            .max_rx_queues
            .min(nb_fwd_lcores.max(1) as u16)
            .min(MAX_NB_RSS_QUEUES);
        let nb_tx_queues = info.max_tx_queues.min(nb_lcores.max(1) as u16);

        driver.configure(nb_rss_queues, nb_tx_queues)?;

        Ok(EthDev {
            port_id,
            driver: driver.clone(),
            nb_rss_queues,
            nb_tx_queues,
            slaves: driver.slaves(),
        })
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn driver(&self) -> &Arc<dyn EthPortDriver> {
        &self.driver
    }

    /// Distribute RX traffic over the negotiated RSS queues.
    pub fn rss_init(&self) -> Result<()> {
        self.driver.rss_configure(self.nb_rss_queues)
    }
}

/// Buffered TX queue on an Ethernet port: batches up to [`TX_BURST_SZ`]
/// buffers, pushes them on `flush`. Buffers the device refuses are released
/// to their pool and counted as drops.
pub struct EthdevTxQueue {
    driver: Arc<dyn EthPortDriver>,
    queue_id: QueueId,
    buffer: Mutex<Vec<Mbuf>>,
    counters: QueueCounters,
}

impl EthdevTxQueue {
    pub fn new(driver: Arc<dyn EthPortDriver>, queue_id: QueueId) -> Arc<Self> {
        Arc::new(EthdevTxQueue {
            driver,
            queue_id,
            buffer: Mutex::new(Vec::with_capacity(TX_BURST_SZ)),
            counters: QueueCounters::new(),
        })
    }

    fn flush_buffer(&self, buffer: &mut Vec<Mbuf>) {
        if buffer.is_empty() {
            return;
        }

        let mut pkts = std::mem::take(buffer);
        self.driver.tx_burst(self.queue_id, &mut pkts);
        // Whatever the device did not accept is dropped here.
        self.counters.inc_drop(pkts.len() as u64);
    }
}

impl TxQueueHandle for EthdevTxQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Ethdev
    }

    fn tx(&self, m: Mbuf) {
        self.counters.inc_in(1);

        let mut buffer = self.buffer.lock().unwrap();
        buffer.push(m);
        if buffer.len() >= TX_BURST_SZ {
            self.flush_buffer(&mut buffer);
        }
    }

    fn has_tx_bulk(&self) -> bool {
        true
    }

    fn tx_bulk(&self, pkts: Vec<Mbuf>) {
        self.counters.inc_in(pkts.len() as u64);

        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend(pkts);
        if buffer.len() >= TX_BURST_SZ {
            self.flush_buffer(&mut buffer);
        }
    }

    fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap();
        self.flush_buffer(&mut buffer);
    }

    fn stats(&self, clear: bool) -> QueueStats {
        self.counters.snapshot(clear)
    }
}

/// RX queue polling an Ethernet port.
pub struct EthdevRxQueue {
    driver: Arc<dyn EthPortDriver>,
    queue_id: QueueId,
    counters: QueueCounters,
}

impl EthdevRxQueue {
    pub fn new(driver: Arc<dyn EthPortDriver>, queue_id: QueueId) -> Arc<Self> {
        Arc::new(EthdevRxQueue {
            driver,
            queue_id,
            counters: QueueCounters::new(),
        })
    }
}

impl RxQueueHandle for EthdevRxQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Ethdev
    }

    fn rx_burst(&self, max: usize) -> Vec<Mbuf> {
        let pkts = self.driver.rx_burst(self.queue_id, max);
        self.counters.inc_in(pkts.len() as u64);
        pkts
    }

    fn stats(&self, clear: bool) -> QueueStats {
        self.counters.snapshot(clear)
    }
}

struct PortQueueCounters {
    pkts: AtomicU64,
    bytes: AtomicU64,
}

impl PortQueueCounters {
    fn new() -> Self {
        PortQueueCounters {
            pkts: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    fn count(&self, bytes: usize) {
        self.pkts.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Software Ethernet port backed by per-queue rings.
pub struct RingPort {
    mac: EtherAddr,
    pci: Option<pci::Addr>,
    mtu: u16,
    max_rx_queues: u16,
    max_tx_queues: u16,
    tx_offload_capa: TxOffloadCapa,
    rx_offload_capa: RxOffloadCapa,
    slaves: Vec<PortId>,
    started: AtomicBool,
    promisc: AtomicBool,
    txqs: RwLock<Vec<(Arc<Ring>, PortQueueCounters)>>,
    rxqs: RwLock<Vec<(Arc<Ring>, PortQueueCounters)>>,
    oerrors: AtomicU64,
}

impl RingPort {
    pub fn new(mac: EtherAddr) -> RingPort {
        RingPort {
            mac,
            pci: None,
            mtu: 1500,
            max_rx_queues: MAX_NB_RSS_QUEUES,
            max_tx_queues: 8,
            tx_offload_capa: TxOffloadCapa::empty(),
            rx_offload_capa: RxOffloadCapa::empty(),
            slaves: Vec::new(),
            started: AtomicBool::new(false),
            promisc: AtomicBool::new(false),
            txqs: RwLock::new(Vec::new()),
            rxqs: RwLock::new(Vec::new()),
            oerrors: AtomicU64::new(0),
        }
    }

    pub fn set_pci_addr(&mut self, addr: pci::Addr) {
        self.pci = Some(addr);
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    pub fn set_offload_capa(&mut self, tx: TxOffloadCapa, rx: RxOffloadCapa) {
        self.tx_offload_capa = tx;
        self.rx_offload_capa = rx;
    }

    pub fn set_slaves(&mut self, slaves: Vec<PortId>) {
        self.slaves = slaves;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promisc.load(Ordering::Acquire)
    }

    /// Drain what the port has "transmitted" on a queue.
    pub fn transmitted(&self, queue_id: QueueId) -> Vec<Mbuf> {
        let txqs = self.txqs.read().unwrap();
        txqs.get(usize::from(queue_id))
            .map(|(ring, _)| ring.dequeue_burst(usize::MAX))
            .unwrap_or_default()
    }

    /// Make a packet available on an RX queue.
    pub fn feed_rx(&self, queue_id: QueueId, m: Mbuf) {
        let rxqs = self.rxqs.read().unwrap();
        if let Some((ring, _)) = rxqs.get(usize::from(queue_id)) {
            let _ = ring.enqueue(m);
        }
    }
}

impl EthPortDriver for RingPort {
    fn info(&self) -> DevInfo {
        DevInfo {
            driver_name: "net_ring".to_owned(),
            max_rx_queues: self.max_rx_queues,
            max_tx_queues: self.max_tx_queues,
            tx_offload_capa: self.tx_offload_capa,
            rx_offload_capa: self.rx_offload_capa,
        }
    }

    fn pci_addr(&self) -> Option<pci::Addr> {
        self.pci
    }

    fn macaddr(&self) -> EtherAddr {
        self.mac
    }

    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16) -> Result<()> {
        if nb_rx_queues > self.max_rx_queues || nb_tx_queues > self.max_tx_queues {
            return Err(Error::InvalidArgument("queue count beyond device limits".into()));
        }

        *self.rxqs.write().unwrap() = (0..nb_rx_queues)
            .map(|q| {
                (
                    Ring::new(format!("port_rxq{}", q), PORT_RING_SZ),
                    PortQueueCounters::new(),
                )
            })
            .collect();
        *self.txqs.write().unwrap() = (0..nb_tx_queues)
            .map(|q| {
                (
                    Ring::new(format!("port_txq{}", q), PORT_RING_SZ),
                    PortQueueCounters::new(),
                )
            })
            .collect();

        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.txqs.read().unwrap().is_empty() {
            return Err(Error::Internal("port started before configure".into()));
        }

        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    fn link(&self) -> EthLink {
        EthLink {
            speed: 10_000,
            duplex: true,
            autoneg: true,
            up: self.is_started(),
        }
    }

    fn stats(&self) -> EthStats {
        let mut stats = EthStats::default();

        for (q, (_, counters)) in self.rxqs.read().unwrap().iter().enumerate() {
            let pkts = counters.pkts.load(Ordering::Relaxed);
            let bytes = counters.bytes.load(Ordering::Relaxed);
            stats.ipackets += pkts;
            stats.ibytes += bytes;
            if q < QUEUE_STAT_CNTRS {
                stats.q_ipackets[q] = pkts;
                stats.q_ibytes[q] = bytes;
            }
        }
        for (q, (_, counters)) in self.txqs.read().unwrap().iter().enumerate() {
            let pkts = counters.pkts.load(Ordering::Relaxed);
            let bytes = counters.bytes.load(Ordering::Relaxed);
            stats.opackets += pkts;
            stats.obytes += bytes;
            if q < QUEUE_STAT_CNTRS {
                stats.q_opackets[q] = pkts;
                stats.q_obytes[q] = bytes;
            }
        }
        stats.oerrors = self.oerrors.load(Ordering::Relaxed);

        stats
    }

    fn promiscuous_enable(&self) {
        self.promisc.store(true, Ordering::Release);
    }

    fn promiscuous_disable(&self) {
        self.promisc.store(false, Ordering::Release);
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn slaves(&self) -> Vec<PortId> {
        self.slaves.clone()
    }

    fn tx_burst(&self, queue_id: QueueId, pkts: &mut Vec<Mbuf>) -> usize {
        let txqs = self.txqs.read().unwrap();
        let (ring, counters) = match txqs.get(usize::from(queue_id)) {
            Some(q) => q,
            None => {
                self.oerrors.fetch_add(pkts.len() as u64, Ordering::Relaxed);
                return 0;
            }
        };

        let mut sent = 0;
        while !pkts.is_empty() {
            let m = pkts.remove(0);
            let bytes = m.pkt_len();
            match ring.enqueue(m) {
                Ok(()) => {
                    counters.count(bytes);
                    sent += 1;
                }
                Err(m) => {
                    self.oerrors.fetch_add(1, Ordering::Relaxed);
                    pkts.insert(0, m);
                    break;
                }
            }
        }

        sent
    }

    fn rx_burst(&self, queue_id: QueueId, max: usize) -> Vec<Mbuf> {
        let rxqs = self.rxqs.read().unwrap();
        match rxqs.get(usize::from(queue_id)) {
            Some((ring, counters)) => {
                let pkts = ring.dequeue_burst(max);
                for m in &pkts {
                    counters.count(m.pkt_len());
                }
                pkts
            }
            None => Vec::new(),
        }
    }
}
