//!
//! Bounded packet rings.
//!
//! Rings buffer packets between producers and a consumer: the agent exception
//! path (multi-producer, single consumer), virtio vrings and the VLAN
//! forwarding interface. Enqueue on a full ring hands the buffer back to the
//! caller so the drop can be accounted where it happened.
//!
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::lcore::{QueueCounters, QueueKind, QueueStats, RxQueueHandle, TxQueueHandle};
use crate::mbuf::Mbuf;

pub struct Ring {
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<Mbuf>>,
}

impl Ring {
    pub fn new<S: AsRef<str>>(name: S, capacity: usize) -> Arc<Ring> {
        Arc::new(Ring {
            name: name.as_ref().to_owned(),
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one buffer; a full ring returns it to the caller.
    pub fn enqueue(&self, m: Mbuf) -> Result<(), Mbuf> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            return Err(m);
        }

        queue.push_back(m);
        Ok(())
    }

    /// Enqueue a burst; buffers that did not fit come back in order.
    pub fn enqueue_burst(&self, pkts: Vec<Mbuf>) -> Vec<Mbuf> {
        let mut queue = self.queue.lock().unwrap();
        let mut rejected = Vec::new();

        for m in pkts {
            if queue.len() >= self.capacity {
                rejected.push(m);
            } else {
                queue.push_back(m);
            }
        }

        rejected
    }

    pub fn dequeue(&self) -> Option<Mbuf> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn dequeue_burst(&self, max: usize) -> Vec<Mbuf> {
        let mut queue = self.queue.lock().unwrap();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }
}

/// TX queue writing into a ring.
pub struct RingTxQueue {
    ring: Arc<Ring>,
    counters: QueueCounters,
}

impl RingTxQueue {
    pub fn new(ring: Arc<Ring>) -> Arc<Self> {
        Arc::new(RingTxQueue {
            ring,
            counters: QueueCounters::new(),
        })
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }
}

impl TxQueueHandle for RingTxQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Ring
    }

    fn tx(&self, m: Mbuf) {
        self.counters.inc_in(1);
        if self.ring.enqueue(m).is_err() {
            self.counters.inc_drop(1);
        }
    }

    fn has_tx_bulk(&self) -> bool {
        true
    }

    fn tx_bulk(&self, pkts: Vec<Mbuf>) {
        self.counters.inc_in(pkts.len() as u64);
        let rejected = self.ring.enqueue_burst(pkts);
        self.counters.inc_drop(rejected.len() as u64);
    }

    fn stats(&self, clear: bool) -> QueueStats {
        self.counters.snapshot(clear)
    }
}

/// RX queue reading from a ring.
pub struct RingRxQueue {
    ring: Arc<Ring>,
    counters: QueueCounters,
}

impl RingRxQueue {
    pub fn new(ring: Arc<Ring>) -> Arc<Self> {
        Arc::new(RingRxQueue {
            ring,
            counters: QueueCounters::new(),
        })
    }
}

impl RxQueueHandle for RingRxQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Ring
    }

    fn rx_burst(&self, max: usize) -> Vec<Mbuf> {
        let pkts = self.ring.dequeue_burst(max);
        self.counters.inc_in(pkts.len() as u64);
        pkts
    }

    fn stats(&self, clear: bool) -> QueueStats {
        self.counters.snapshot(clear)
    }
}
