//!
//! Lcores and their queue tables.
//!
//! An lcore is a thread pinned to one CPU core operating in poll mode.
//! Lcores below [`FWD_LCORE_ID`] are service cores (control plane, packet
//! socket); the rest forward traffic. Each lcore owns a per-interface slot
//! table of RX and TX queues, mutated only by schedule/unschedule under the
//! interface lock and read locklessly enough by the datapath.
//!
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use itertools::Itertools;

use crate::datapath::Datapath;
use crate::errors::Result;
use crate::ethdev::QueueId;
use crate::mbuf::Mbuf;
use crate::vif::{Vif, MAX_INTERFACES};

/// First forwarding lcore; lower ids are service cores.
pub const FWD_LCORE_ID: usize = 2;

/// Sentinel TX queue count: one thread-safe queue per lcore.
pub const TX_PER_LCORE: u16 = u16::MAX;

thread_local! {
    static CURRENT_LCORE: Cell<Option<usize>> = Cell::new(None);
}

/// Register the calling thread as the given lcore.
pub fn set_current(lcore_id: usize) {
    CURRENT_LCORE.with(|c| c.set(Some(lcore_id)));
}

/// The lcore the calling thread runs on, if registered.
pub fn current() -> Option<usize> {
    CURRENT_LCORE.with(|c| c.get())
}

/// Forwarding cores batch their TX and flush at the end of the poll loop;
/// service cores flush right after every enqueue.
#[inline]
pub fn is_forwarding(lcore_id: usize) -> bool {
    lcore_id >= FWD_LCORE_ID
}

/// What kind of port a queue feeds; decides the stats bucket and whether
/// NIC device counters apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Ethdev,
    Ring,
    Kni,
}

impl QueueKind {
    /// Ring-backed queues fill the `queue_*` stats bucket, everything else
    /// the `port_*` bucket.
    #[inline]
    pub fn is_ring(self) -> bool {
        self == QueueKind::Ring
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub n_pkts_in: u64,
    pub n_pkts_drop: u64,
}

/// Lock-free counter pair backing [`QueueStats`].
#[derive(Default)]
pub struct QueueCounters {
    pkts_in: AtomicU64,
    pkts_drop: AtomicU64,
}

impl QueueCounters {
    pub fn new() -> Self {
        Default::default()
    }

    #[inline]
    pub fn inc_in(&self, n: u64) {
        self.pkts_in.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_drop(&self, n: u64) {
        self.pkts_drop.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, clear: bool) -> QueueStats {
        if clear {
            QueueStats {
                n_pkts_in: self.pkts_in.swap(0, Ordering::Relaxed),
                n_pkts_drop: self.pkts_drop.swap(0, Ordering::Relaxed),
            }
        } else {
            QueueStats {
                n_pkts_in: self.pkts_in.load(Ordering::Relaxed),
                n_pkts_drop: self.pkts_drop.load(Ordering::Relaxed),
            }
        }
    }
}

/// Transmit side of a queue: the op vtable a TX slot carries.
///
/// `tx`/`tx_bulk` take ownership of the buffers; a queue that cannot accept
/// a buffer releases it to its pool and counts the drop in its own stats.
pub trait TxQueueHandle: Send + Sync {
    fn kind(&self) -> QueueKind;

    fn tx(&self, m: Mbuf);

    /// Whether the queue supports enqueueing several buffers atomically.
    fn has_tx_bulk(&self) -> bool {
        false
    }

    fn tx_bulk(&self, pkts: Vec<Mbuf>) {
        for m in pkts {
            self.tx(m);
        }
    }

    fn flush(&self) {}

    fn stats(&self, clear: bool) -> QueueStats;
}

/// Receive side of a queue.
pub trait RxQueueHandle: Send + Sync {
    fn kind(&self) -> QueueKind;

    fn rx_burst(&self, max: usize) -> Vec<Mbuf>;

    fn stats(&self, clear: bool) -> QueueStats;
}

pub struct TxQueue {
    pub vif_idx: usize,
    pub queue_id: QueueId,
    pub handle: Arc<dyn TxQueueHandle>,
}

pub struct RxQueue {
    pub vif_idx: usize,
    pub queue_id: QueueId,
    pub handle: Arc<dyn RxQueueHandle>,
}

pub struct Lcore {
    id: usize,
    tx_queues: RwLock<Vec<Option<TxQueue>>>,
    rx_queues: RwLock<Vec<Option<RxQueue>>>,
    nb_rx_queues: AtomicUsize,
}

impl Lcore {
    pub(crate) fn new(id: usize) -> Self {
        Lcore {
            id,
            tx_queues: RwLock::new((0..MAX_INTERFACES).map(|_| None).collect()),
            rx_queues: RwLock::new((0..MAX_INTERFACES).map(|_| None).collect()),
            nb_rx_queues: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_forwarding(&self) -> bool {
        is_forwarding(self.id)
    }

    /// RX queues scheduled here; the load metric for least-used selection.
    pub fn rx_queue_load(&self) -> usize {
        self.nb_rx_queues.load(Ordering::Relaxed)
    }

    /// Clone the TX op handle of the slot, if scheduled.
    pub fn tx_queue_handle(&self, vif_idx: usize) -> Option<Arc<dyn TxQueueHandle>> {
        let queues = self.tx_queues.read().unwrap();
        queues
            .get(vif_idx)
            .and_then(|q| q.as_ref())
            .map(|q| q.handle.clone())
    }

    pub fn with_tx_queue<R>(&self, vif_idx: usize, f: impl FnOnce(&TxQueue) -> R) -> Option<R> {
        let queues = self.tx_queues.read().unwrap();
        queues.get(vif_idx).and_then(|q| q.as_ref()).map(f)
    }

    pub fn with_rx_queue<R>(&self, vif_idx: usize, f: impl FnOnce(&RxQueue) -> R) -> Option<R> {
        let queues = self.rx_queues.read().unwrap();
        queues.get(vif_idx).and_then(|q| q.as_ref()).map(f)
    }

    pub(crate) fn set_tx_queue(&self, vif_idx: usize, queue: TxQueue) {
        self.tx_queues.write().unwrap()[vif_idx] = Some(queue);
    }

    pub(crate) fn take_tx_queue(&self, vif_idx: usize) -> Option<TxQueue> {
        self.tx_queues.write().unwrap()[vif_idx].take()
    }

    pub(crate) fn set_rx_queue(&self, vif_idx: usize, queue: RxQueue) {
        self.rx_queues.write().unwrap()[vif_idx] = Some(queue);
        self.nb_rx_queues.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_rx_queue(&self, vif_idx: usize) -> Option<RxQueue> {
        let taken = self.rx_queues.write().unwrap()[vif_idx].take();
        if taken.is_some() {
            self.nb_rx_queues.fetch_sub(1, Ordering::Relaxed);
        }
        taken
    }

    /// Flush every TX queue scheduled on this lcore; the end-of-poll-loop
    /// step of a forwarding core.
    pub fn flush(&self) {
        let queues = self.tx_queues.read().unwrap();
        for queue in queues.iter().flatten() {
            queue.handle.flush();
        }
    }
}

pub type RxQueueInitFn<'a> = &'a (dyn Fn(usize, QueueId) -> Result<Arc<dyn RxQueueHandle>> + 'a);
pub type TxQueueInitFn<'a> = &'a (dyn Fn(usize, QueueId) -> Result<Arc<dyn TxQueueHandle>> + 'a);

impl Datapath {
    /// The forwarding lcore with the fewest RX queues scheduled.
    pub fn least_used_lcore(&self) -> usize {
        self.lcores()
            .iter()
            .filter(|l| l.is_forwarding())
            .position_min_by_key(|l| l.rx_queue_load())
            .map(|pos| FWD_LCORE_ID + pos)
            .unwrap_or(0)
    }

    /// Schedule `nrxqs` RX queues onto forwarding lcores starting at
    /// `lcore_hint` and TX queues onto every lcore.
    ///
    /// `ntxqs` of [`TX_PER_LCORE`] assigns a distinct (thread-safe) TX queue
    /// id per lcore; otherwise lcores share the `ntxqs` queues round-robin.
    pub fn if_schedule(
        &self,
        vif: &Vif,
        lcore_hint: usize,
        nrxqs: u16,
        rx_init: Option<RxQueueInitFn>,
        ntxqs: u16,
        tx_init: TxQueueInitFn,
    ) -> Result<()> {
        if ntxqs > 0 {
            for (lcore_id, lcore) in self.lcores().iter().enumerate() {
                let queue_id = if ntxqs == TX_PER_LCORE {
                    lcore_id as QueueId
                } else {
                    (lcore_id % usize::from(ntxqs)) as QueueId
                };

                let handle = match tx_init(lcore_id, queue_id) {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.if_unschedule(vif);
                        return Err(e);
                    }
                };
                lcore.set_tx_queue(
                    vif.idx,
                    TxQueue {
                        vif_idx: vif.idx,
                        queue_id,
                        handle,
                    },
                );
            }
        }

        if let Some(rx_init) = rx_init {
            let fwd: Vec<usize> = self
                .lcores()
                .iter()
                .filter(|l| l.is_forwarding())
                .map(Lcore::id)
                .collect();

            if nrxqs > 0 && fwd.is_empty() {
                self.if_unschedule(vif);
                return Err(crate::errors::Error::Internal(
                    "no forwarding lcores to schedule RX queues on".into(),
                ));
            }

            let start = fwd.iter().position(|&id| id == lcore_hint).unwrap_or(0);
            for queue_id in 0..nrxqs {
                let lcore_id = fwd[(start + usize::from(queue_id)) % fwd.len()];
                let handle = match rx_init(lcore_id, queue_id) {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.if_unschedule(vif);
                        return Err(e);
                    }
                };
                self.lcores()[lcore_id].set_rx_queue(
                    vif.idx,
                    RxQueue {
                        vif_idx: vif.idx,
                        queue_id,
                        handle,
                    },
                );
            }
        }

        Ok(())
    }

    /// Remove every queue of the interface from every lcore.
    pub fn if_unschedule(&self, vif: &Vif) {
        for lcore in self.lcores() {
            lcore.take_tx_queue(vif.idx);
            lcore.take_rx_queue(vif.idx);
        }
    }

    /// Flush all TX queues of one lcore.
    pub fn flush_lcore(&self, lcore_id: usize) {
        if let Some(lcore) = self.lcores().get(lcore_id) {
            lcore.flush();
        }
    }
}
