//!
//! Packet-buffer pools.
//!
//! A pool is an allocator of fixed-size packet buffers identified by its
//! name. Allocation and release are lock-free counter operations so pools can
//! be shared by every lcore; the in-use/available counters are exact, which
//! is what the leak-freedom checks of the test suite rely on.
//!
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::mbuf::Mbuf;

#[derive(Debug)]
struct PoolInner {
    name: String,
    capacity: usize,
    data_room: usize,
    available: AtomicUsize,
}

#[derive(Clone, Debug)]
pub struct MemoryPool(Arc<PoolInner>);

impl MemoryPool {
    /// Create a pool of `n` buffers with `data_room` bytes of data area each.
    pub fn create<S: AsRef<str>>(name: S, n: usize, data_room: usize) -> MemoryPool {
        MemoryPool(Arc::new(PoolInner {
            name: name.as_ref().to_owned(),
            capacity: n,
            data_room,
            available: AtomicUsize::new(n),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    pub fn data_room_size(&self) -> usize {
        self.0.data_room
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.0.available.load(Ordering::Acquire)
    }

    /// Buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.0.capacity - self.available()
    }

    /// Allocate a buffer with default headroom and zero data length.
    pub fn alloc(&self) -> Result<Mbuf> {
        let claimed = self
            .0
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match claimed {
            Ok(_) => Ok(Mbuf::from_pool(self.clone(), self.0.data_room)),
            Err(_) => Err(Error::ResourceExhausted(format!("mempool {}", self.0.name))),
        }
    }

    /// Allocate a buffer and copy the packet bytes and offload descriptor of
    /// `m` into it.
    pub fn clone_mbuf(&self, m: &Mbuf) -> Result<Mbuf> {
        let mut c = self.alloc()?;

        if m.data_off() + m.data_len() > c.buf_len() {
            return Err(Error::InvalidArgument(format!(
                "mempool {}: data room too small for clone",
                self.0.name
            )));
        }

        c.reset(m.data_off(), 0);
        c.append(m.data_len())?.copy_from_slice(m.data());
        c.ol_flags = m.ol_flags;
        c.l2_len = m.l2_len;
        c.l3_len = m.l3_len;
        c.vlan_tci = m.vlan_tci;

        Ok(c)
    }

    pub(crate) fn reclaim(&self) {
        self.0.available.fetch_add(1, Ordering::AcqRel);
    }
}
