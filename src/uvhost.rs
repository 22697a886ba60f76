//!
//! Notifications towards the user-space vhost agent.
//!
//! Guest ports are brought up by a separate vhost-user thread; the registry
//! only tells it which vif appeared or disappeared and with how many queues.
//! The trait seam lets tests substitute a recording client.
//!
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use crate::errors::Result;

const MSG_VIF_ADD: u8 = 1;
const MSG_VIF_DEL: u8 = 2;

/// Interface names are carried in a fixed-size field.
pub const UVHOST_IFNAMSIZ: usize = 16;

pub trait UvhostClient: Send + Sync {
    fn vif_add(&self, name: &str, vif_idx: usize, nrxqs: u16, ntxqs: u16) -> Result<()>;

    fn vif_del(&self, vif_idx: usize) -> Result<()>;
}

/// Client used when no vhost agent is around (bare fabric setups, tests
/// that do not care).
pub struct NullUvhost;

impl UvhostClient for NullUvhost {
    fn vif_add(&self, name: &str, vif_idx: usize, nrxqs: u16, ntxqs: u16) -> Result<()> {
        debug!(
            "uvhost: no agent, vif {} ({}) add with {}/{} queues ignored",
            vif_idx, name, nrxqs, ntxqs
        );
        Ok(())
    }

    fn vif_del(&self, vif_idx: usize) -> Result<()> {
        debug!("uvhost: no agent, vif {} del ignored", vif_idx);
        Ok(())
    }
}

/// Datagram client talking to the vhost agent thread over a Unix socket.
pub struct UnixUvhostClient {
    sock: UnixDatagram,
}

impl UnixUvhostClient {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<UnixUvhostClient> {
        let sock = UnixDatagram::unbound()?;
        sock.connect(path)?;

        Ok(UnixUvhostClient { sock })
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        self.sock.send(frame)?;
        Ok(())
    }
}

fn encode(op: u8, vif_idx: usize, nrxqs: u16, ntxqs: u16, name: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + UVHOST_IFNAMSIZ);

    frame.push(op);
    frame.extend_from_slice(&(vif_idx as u16).to_le_bytes());
    frame.extend_from_slice(&nrxqs.to_le_bytes());
    frame.extend_from_slice(&ntxqs.to_le_bytes());

    let mut ifname = [0u8; UVHOST_IFNAMSIZ];
    let n = name.len().min(UVHOST_IFNAMSIZ - 1);
    ifname[..n].copy_from_slice(&name.as_bytes()[..n]);
    frame.extend_from_slice(&ifname);

    frame
}

impl UvhostClient for UnixUvhostClient {
    fn vif_add(&self, name: &str, vif_idx: usize, nrxqs: u16, ntxqs: u16) -> Result<()> {
        self.send(&encode(MSG_VIF_ADD, vif_idx, nrxqs, ntxqs, name))
    }

    fn vif_del(&self, vif_idx: usize) -> Result<()> {
        self.send(&encode(MSG_VIF_DEL, vif_idx, 0, 0, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode(MSG_VIF_ADD, 7, 2, 0xffff, "vm_port_0");

        assert_eq!(frame.len(), 7 + UVHOST_IFNAMSIZ);
        assert_eq!(frame[0], MSG_VIF_ADD);
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), 7);
        assert_eq!(u16::from_le_bytes([frame[3], frame[4]]), 2);
        assert_eq!(u16::from_le_bytes([frame[5], frame[6]]), 0xffff);
        assert_eq!(&frame[7..16], b"vm_port_0");
        // NUL padded to the fixed width.
        assert!(frame[16..].iter().all(|&b| b == 0));
    }
}
