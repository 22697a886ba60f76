//!
//! The agent packet socket.
//!
//! Exception packets for the control-plane daemon are queued on the global
//! packet ring; the socket only carries wakeups to the consumer (and, on the
//! agent side, whatever the daemon sends back). One agent interface exists
//! per process.
//!
use std::os::unix::net::UnixDatagram;
use std::sync::Mutex;

use crate::errors::Result;

pub struct PacketSocket {
    vrouter_end: UnixDatagram,
    agent_end: Mutex<Option<UnixDatagram>>,
    attached_vif: Mutex<Option<usize>>,
}

/// Create the datagram pair backing the agent interface.
pub fn packet_socket_init() -> Result<PacketSocket> {
    let (vrouter_end, agent_end) = UnixDatagram::pair()?;
    vrouter_end.set_nonblocking(true)?;
    agent_end.set_nonblocking(true)?;

    Ok(PacketSocket {
        vrouter_end,
        agent_end: Mutex::new(Some(agent_end)),
        attached_vif: Mutex::new(None),
    })
}

impl PacketSocket {
    /// Bind the transport to the agent vif.
    pub fn attach_vif(&self, vif_idx: usize) {
        *self.attached_vif.lock().unwrap() = Some(vif_idx);
    }

    pub fn attached_vif(&self) -> Option<usize> {
        *self.attached_vif.lock().unwrap()
    }

    /// Nudge the consumer; losing a wakeup is harmless since the consumer
    /// drains the whole ring per wakeup.
    pub fn wakeup(&self) {
        let _ = self.vrouter_end.send(&[1u8]);
    }

    /// Hand the agent-side socket over, e.g. to the daemon glue or a test.
    pub fn take_agent_end(&self) -> Option<UnixDatagram> {
        self.agent_end.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_reaches_agent_end() {
        let sock = packet_socket_init().unwrap();
        sock.attach_vif(3);
        assert_eq!(sock.attached_vif(), Some(3));

        let agent = sock.take_agent_end().unwrap();
        sock.wakeup();

        let mut buf = [0u8; 4];
        let n = agent.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1]);
    }
}
