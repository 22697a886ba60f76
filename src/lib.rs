//!
//! vrhost -- host-interface datapath of a user-space virtual router.
//!
//! The crate terminates overlay tunnels (MPLS-over-UDP / MPLS-over-GRE)
//! between compute nodes and bridges packets between four classes of
//! endpoints: physical NICs (fabric), paravirtualised guest ports (virtual),
//! a kernel-visible management port (vhost) and the control-plane datagram
//! socket (agent). A fifth class, monitoring, passively mirrors the traffic
//! of another port.
//!
//! The datapath runs to completion on poll-mode lcores; control operations
//! go through the [`interface::HostIfOps`] facade.
//!
#[macro_use]
extern crate log;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate num_derive;
extern crate anyhow;
extern crate itertools;
extern crate num_traits;
extern crate rand;
extern crate thiserror;

pub mod errors;

pub mod ether;
pub mod ip;

pub mod mbuf;
pub mod mempool;
pub mod ring;

pub mod ethdev;
pub mod kni;
pub mod pci;
pub mod virtio;

pub mod lcore;

pub mod pkt;

pub mod checksum;
pub mod fragment;

pub mod usocket;
pub mod uvhost;

pub mod datapath;
pub mod interface;
pub mod vif;

pub use self::datapath::{Config, Datapath};
pub use self::errors::{Error, Result};
pub use self::ethdev::{PortId, QueueId};
pub use self::interface::HostIfOps;
pub use self::pkt::Packet;
pub use self::vif::Vif;

#[cfg(test)]
mod tests;
