//!
//! Virtio guest ports.
//!
//! The vhost-user control plane negotiates the vrings; the datapath only
//! needs their queue shape: a configurable number of RX rings and one
//! thread-safe TX ring per lcore.
//!
use std::sync::Arc;

use crate::ring::Ring;

/// Upper bound on RX queues negotiated with a guest.
pub const VIRTIO_MAX_NB_QUEUES: u16 = 4;

const VIRTIO_RING_SZ: usize = 256;

/// RX queue count for a guest port: one per forwarding lcore, capped.
pub fn nrxqs(nb_fwd_lcores: usize) -> u16 {
    (nb_fwd_lcores.max(1) as u16).min(VIRTIO_MAX_NB_QUEUES)
}

/// The vring bundle of one guest port.
pub struct VirtioDev {
    rx_vrings: Vec<Arc<Ring>>,
    tx_vrings: Vec<Arc<Ring>>,
}

impl VirtioDev {
    /// virtio TX is thread safe, so every lcore gets its own TX vring.
    pub fn new(name: &str, nrxqs: u16, nb_lcores: usize) -> Arc<VirtioDev> {
        Arc::new(VirtioDev {
            rx_vrings: (0..nrxqs)
                .map(|q| Ring::new(format!("{}_rxv{}", name, q), VIRTIO_RING_SZ))
                .collect(),
            tx_vrings: (0..nb_lcores)
                .map(|q| Ring::new(format!("{}_txv{}", name, q), VIRTIO_RING_SZ))
                .collect(),
        })
    }

    pub fn nb_rx_vrings(&self) -> u16 {
        self.rx_vrings.len() as u16
    }

    pub fn rx_vring(&self, queue_id: u16) -> Option<&Arc<Ring>> {
        self.rx_vrings.get(usize::from(queue_id))
    }

    pub fn tx_vring(&self, queue_id: u16) -> Option<&Arc<Ring>> {
        self.tx_vrings.get(usize::from(queue_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_shape() {
        assert_eq!(nrxqs(0), 1);
        assert_eq!(nrxqs(2), 2);
        assert_eq!(nrxqs(16), VIRTIO_MAX_NB_QUEUES);

        let dev = VirtioDev::new("vm1", 2, 5);
        assert_eq!(dev.nb_rx_vrings(), 2);
        assert!(dev.tx_vring(4).is_some());
        assert!(dev.tx_vring(5).is_none());
    }
}
