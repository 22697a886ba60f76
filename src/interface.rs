//!
//! Host-interface callbacks: the registry that binds vifs to devices, the
//! per-packet transmit path and the statistics aggregation, behind the
//! single facade the upper vrouter consumes.
//!
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::checksum;
use crate::datapath::{Datapath, VLAN_ID_INVALID};
use crate::errors::{Error, Result};
use crate::ethdev::{
    self, EthDev, EthdevRxQueue, EthdevTxQueue, PortId, QueueId, RxOffloadCapa, TxOffloadCapa,
    QUEUE_STAT_CNTRS,
};
use crate::ether::{EtherAddr, VlanExt, ETHER_HDR_LEN, VLAN_HDR_LEN};
use crate::fragment;
use crate::ip;
use crate::kni::{self, KniRxQueue, KniTxQueue};
use crate::lcore::{self, QueueKind, RxQueueHandle, TxQueueHandle, TX_PER_LCORE};
use crate::mbuf::OffloadFlags;
use crate::pci;
use crate::pkt::{DropReason, Packet, VpFlags};
use crate::ring::{Ring, RingRxQueue, RingTxQueue};
use crate::usocket::packet_socket_init;
use crate::vif::{Vif, VifDevice, VifFlags, VifType, VifTransport};
use crate::virtio::{self, VirtioDev};

/// Link settings reported to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfSettings {
    pub speed: u32,
    pub full_duplex: bool,
}

/// Encapsulation of the port as seen by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapType {
    Ether,
}

/// The operation table the upper vrouter drives.
pub trait HostIfOps {
    fn lock(&self);

    fn unlock(&self);

    fn add(&self, vif: &Arc<Vif>) -> Result<()>;

    fn del(&self, vif: &Arc<Vif>) -> Result<()>;

    /// Interfaces are tapped as part of `add`.
    fn add_tap(&self, vif: &Arc<Vif>) -> Result<()> {
        let _ = vif;
        Ok(())
    }

    /// Interfaces are untapped as part of `del`.
    fn del_tap(&self, vif: &Arc<Vif>) -> Result<()> {
        let _ = vif;
        Ok(())
    }

    fn tx(&self, vif: &Vif, pkt: Packet) -> Result<()>;

    fn rx(&self, vif: &Vif, pkt: Packet) -> Result<()>;

    fn get_settings(&self, vif: &Vif) -> IfSettings;

    fn get_mtu(&self, vif: &Vif) -> u16;

    fn get_encap(&self, vif: &Vif) -> EncapType;

    fn stats_update(&self, vif: &Vif, core: Option<usize>);
}

impl Datapath {
    /// Probe the port's offload capabilities into the vif flag word, bind
    /// the ethdev into the vif slot and adopt the NIC MAC if the agent sent
    /// none.
    pub fn vif_attach_ethdev(&self, vif: &Vif, ethdev: &Arc<EthDev>) {
        vif.set_device(VifDevice::Ethdev(ethdev.clone()));

        let info = ethdev.driver().info();
        if info.tx_offload_capa.contains(
            TxOffloadCapa::IPV4_CKSUM | TxOffloadCapa::UDP_CKSUM | TxOffloadCapa::TCP_CKSUM,
        ) {
            vif.add_flags(VifFlags::TX_CSUM_OFFLOAD);
        } else {
            vif.clear_flags(VifFlags::TX_CSUM_OFFLOAD);
        }

        if info.tx_offload_capa.contains(TxOffloadCapa::VLAN_INSERT)
            && info.rx_offload_capa.contains(RxOffloadCapa::VLAN_STRIP)
        {
            vif.add_flags(VifFlags::VLAN_OFFLOAD);
        } else {
            vif.clear_flags(VifFlags::VLAN_OFFLOAD);
        }

        // Do not overwrite what the agent had sent; adopt the NIC address
        // only if the vif MAC is still null.
        if vif.mac().is_zero() {
            vif.set_mac(ethdev.driver().macaddr());
        }
    }

    fn fabric_if_add(&self, vif: &Arc<Vif>) -> Result<()> {
        let port_id: PortId = if vif.flags().contains(VifFlags::PMD) {
            if vif.os_idx as usize >= self.dev_count() {
                error!(
                    "invalid PMD device index {} (must be less than {})",
                    vif.os_idx,
                    self.dev_count()
                );
                return Err(Error::NotFound(format!("PMD device index {}", vif.os_idx)));
            }
            vif.os_idx as PortId
        } else {
            let pci_address = pci::Addr::from_dbdf(vif.os_idx);
            match ethdev::find_port_by_pci(self.devices(), &pci_address) {
                Some(port_id) => port_id,
                None => {
                    error!(
                        "error adding vif {} eth device {}: no port ID found for PCI {}",
                        vif.idx, vif.name, pci_address
                    );
                    return Err(Error::NotFound(format!("PCI {}", pci_address)));
                }
            }
        };

        let driver = self
            .device(port_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("eth device {}", port_id)))?;

        info!(
            "adding vif {} eth device {} MAC {}",
            vif.idx,
            port_id,
            driver.macaddr()
        );

        let mut slot = self.ethdevs[usize::from(port_id)].lock().unwrap();
        if slot.is_some() {
            error!("    error adding eth dev {}: already added", vif.name);
            return Err(Error::AlreadyExists(vif.name.clone()));
        }

        let ethdev = Arc::new(EthDev::init(
            port_id,
            driver.clone(),
            self.nb_fwd_lcores(),
            self.config().nb_lcores,
        )?);

        self.vif_attach_ethdev(vif, &ethdev);

        if let Err(e) = driver.start() {
            error!("    error starting eth device {}: {}", port_id, e);
            return Err(e);
        }

        ethdev.rss_init()?;

        let nrxqs = ethdev.nb_rss_queues;
        let ntxqs = ethdev.nb_tx_queues;
        *slot = Some(ethdev);
        drop(slot);

        let rx_driver = driver.clone();
        let rx_init = move |_lcore_id: usize, queue_id: QueueId| -> Result<Arc<dyn RxQueueHandle>> {
            Ok(EthdevRxQueue::new(rx_driver.clone(), queue_id))
        };
        let tx_init = move |_lcore_id: usize, queue_id: QueueId| -> Result<Arc<dyn TxQueueHandle>> {
            Ok(EthdevTxQueue::new(driver.clone(), queue_id))
        };

        self.if_schedule(
            vif,
            self.least_used_lcore(),
            nrxqs,
            Some(&rx_init),
            ntxqs,
            &tx_init,
        )
    }

    fn fabric_if_del(&self, vif: &Arc<Vif>) -> Result<()> {
        info!("deleting vif {}", vif.idx);

        // A failed fabric add may leave the vif without a bound ethdev.
        let ethdev = match vif.ethdev() {
            Some(ethdev) => ethdev,
            None => {
                error!("    error deleting eth dev {}: already removed", vif.name);
                return Err(Error::AlreadyExists(vif.name.clone()));
            }
        };
        let port_id = ethdev.port_id();

        self.if_unschedule(vif);
        ethdev.driver().stop();

        *self.ethdevs[usize::from(port_id)].lock().unwrap() = None;
        vif.take_device();

        Ok(())
    }

    fn virtual_if_add(&self, vif: &Arc<Vif>) -> Result<()> {
        info!("adding vif {} virtual device {}", vif.idx, vif.name);

        let nrxqs = virtio::nrxqs(self.nb_fwd_lcores());
        // virtio TX is thread safe, so we assign a TX queue to each lcore
        let ntxqs = TX_PER_LCORE;

        let dev = VirtioDev::new(&vif.name, nrxqs, self.config().nb_lcores);
        vif.set_device(VifDevice::Virtio(dev.clone()));

        let rx_dev = dev.clone();
        let rx_init = move |_lcore_id: usize, queue_id: QueueId| -> Result<Arc<dyn RxQueueHandle>> {
            match rx_dev.rx_vring(queue_id) {
                Some(vring) => Ok(RingRxQueue::new(vring.clone())),
                None => Err(Error::Internal(format!("no RX vring {}", queue_id))),
            }
        };
        let tx_init = move |_lcore_id: usize, queue_id: QueueId| -> Result<Arc<dyn TxQueueHandle>> {
            match dev.tx_vring(queue_id) {
                Some(vring) => Ok(RingTxQueue::new(vring.clone())),
                None => Err(Error::Internal(format!("no TX vring {}", queue_id))),
            }
        };

        self.if_schedule(
            vif,
            self.least_used_lcore(),
            nrxqs,
            Some(&rx_init),
            ntxqs,
            &tx_init,
        )?;

        // A failing notification is handed back verbatim; the upper layer
        // reacts by deleting the interface again.
        self.uvhost().vif_add(&vif.name, vif.idx, nrxqs, ntxqs)
    }

    fn virtual_if_del(&self, vif: &Arc<Vif>) -> Result<()> {
        info!("deleting vif {} virtual device", vif.idx);

        let ret = self.uvhost().vif_del(vif.idx);

        self.if_unschedule(vif);
        vif.take_device();

        ret
    }

    fn vhost_if_add(&self, vif: &Arc<Vif>) -> Result<()> {
        let port_id: PortId = if vif.flags().contains(VifFlags::PMD) {
            vif.os_idx as PortId
        } else {
            // The agent names the xconnect fabric interface; the upper
            // vrouter resolves it into the bridge slot.
            let bridge = vif.bridge().ok_or_else(|| {
                Error::NotFound(format!("vif {}: no bridge interface", vif.idx))
            })?;
            let ethdev = match bridge.ethdev() {
                Some(ethdev) => ethdev,
                None => {
                    error!(
                        "error adding vif {} KNI device {}: bridge vif {} ethdev is not initialized",
                        vif.idx, vif.name, bridge.idx
                    );
                    return Err(Error::NotFound(format!("bridge vif {} ethdev", bridge.idx)));
                }
            };

            // KNI does not support bond interfaces and generates random
            // MACs, so use a bond member instead.
            match ethdev.slaves.first() {
                Some(&slave_port_id) => {
                    info!("    using bond slave eth device {}", slave_port_id);
                    slave_port_id
                }
                None => ethdev.port_id(),
            }
        };

        let mac = self
            .device(port_id)
            .map(|d| d.macaddr())
            .unwrap_or_else(EtherAddr::random);

        info!(
            "adding vif {} KNI device {} at eth device {} MAC {}",
            vif.idx, vif.name, port_id, mac
        );

        let kni = kni::alloc(&vif.name, port_id, mac, vif.mtu())
            .map_err(|e| Error::Internal(format!("KNI init: {}", e)))?;
        vif.set_device(VifDevice::Kni(kni.clone()));

        let rx_kni = kni.clone();
        let rx_init = move |_lcore_id: usize, _queue_id: QueueId| -> Result<Arc<dyn RxQueueHandle>> {
            Ok(KniRxQueue::new(rx_kni.clone()))
        };
        let tx_init = move |_lcore_id: usize, _queue_id: QueueId| -> Result<Arc<dyn TxQueueHandle>> {
            Ok(KniTxQueue::new(kni.clone()))
        };

        self.if_schedule(vif, self.least_used_lcore(), 1, Some(&rx_init), 1, &tx_init)
    }

    fn vhost_if_del(&self, vif: &Arc<Vif>) -> Result<()> {
        info!("deleting vif {} KNI device {}", vif.idx, vif.name);

        self.if_unschedule(vif);
        // Dropping the device releases the KNI.
        vif.take_device();

        Ok(())
    }

    fn monitoring_start(&self, monitored: &Vif, monitoring: &Vif) {
        // Install the redirection first; the MONITORED flag is the release
        // publication the datapath acquires before reading it.
        self.monitorings[monitored.idx].store(monitoring.idx, Ordering::Relaxed);
        monitored.add_flags(VifFlags::MONITORED);

        if monitored.is_fabric() {
            if let Some(ethdev) = monitored.ethdev() {
                ethdev.driver().promiscuous_enable();
            }
        }
    }

    fn monitoring_stop(&self, monitored: &Vif, monitoring: &Vif) {
        // The monitored vif may have been reused for another mirror.
        if self.monitorings[monitored.idx].load(Ordering::Acquire) != monitoring.idx {
            return;
        }

        // Clear the flag first, then the redirection; a TX that raced the
        // flag sees the sentinel and skips the mirror.
        monitored.clear_flags(VifFlags::MONITORED);
        self.monitorings[monitored.idx].store(crate::vif::MAX_INTERFACES, Ordering::Release);

        if monitored.is_fabric() {
            if let Some(ethdev) = monitored.ethdev() {
                ethdev.driver().promiscuous_disable();
            }
        }
    }

    fn monitoring_if_add(&self, vif: &Arc<Vif>) -> Result<()> {
        let monitored_vif_idx = vif.os_idx as usize;

        info!(
            "adding monitoring vif {} KNI device {} to monitor vif {}",
            vif.idx, vif.name, monitored_vif_idx
        );

        // No vif reference is kept for monitoring; the MONITORED flag routes
        // clones our way, and if the monitored vif goes away we simply stop
        // seeing packets.
        let monitored = match self.get_vif(monitored_vif_idx) {
            Some(monitored) => monitored,
            None => {
                error!(
                    "    error getting vif to monitor: vif {} does not exist",
                    monitored_vif_idx
                );
                return Err(Error::NotFound(format!("vif {}", monitored_vif_idx)));
            }
        };

        // Monitoring KNIs always ride on port 0.
        let mac = self
            .device(0)
            .map(|d| d.macaddr())
            .unwrap_or_else(EtherAddr::random);
        let kni = kni::alloc(&vif.name, 0, mac, vif.mtu())
            .map_err(|e| Error::Internal(format!("KNI init: {}", e)))?;
        vif.set_device(VifDevice::Kni(kni.clone()));

        // Write-only interface.
        let tx_init = move |_lcore_id: usize, _queue_id: QueueId| -> Result<Arc<dyn TxQueueHandle>> {
            Ok(KniTxQueue::new(kni.clone()))
        };
        self.if_schedule(vif, self.least_used_lcore(), 0, None, 1, &tx_init)?;

        self.monitoring_start(&monitored, vif);

        Ok(())
    }

    fn monitoring_if_del(&self, vif: &Arc<Vif>) -> Result<()> {
        let monitored_vif_idx = vif.os_idx as usize;

        info!(
            "deleting monitoring vif {} KNI device to monitor vif {}",
            vif.idx, monitored_vif_idx
        );

        match self.get_vif(monitored_vif_idx) {
            Some(monitored) => self.monitoring_stop(&monitored, vif),
            None => error!(
                "    error getting vif to monitor: vif {} does not exist",
                monitored_vif_idx
            ),
        }

        self.if_unschedule(vif);
        vif.take_device();

        Ok(())
    }

    fn agent_if_add(&self, vif: &Arc<Vif>) -> Result<()> {
        info!("adding vif {} packet device {}", vif.idx, vif.name);

        if self.packet_ring.read().unwrap().is_some() {
            error!("    error adding packet device {}: already exist", vif.name);
            return Err(Error::AlreadyExists(vif.name.clone()));
        }

        let socket = match packet_socket_init() {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("    error initializing packet socket: {}", e);
                return Err(e);
            }
        };

        socket.attach_vif(vif.idx);
        vif.set_device(VifDevice::Packet(socket.clone()));

        *self.packet_ring.write().unwrap() =
            Some(Ring::new("packet_ring", self.config().packet_ring_sz));
        *self.packet_socket.write().unwrap() = Some(socket);

        // No queues to schedule: RX comes from the socket, TX goes to the
        // global packet ring.
        Ok(())
    }

    fn agent_if_del(&self, vif: &Arc<Vif>) -> Result<()> {
        info!("deleting vif {} packet device", vif.idx);

        *self.packet_socket.write().unwrap() = None;
        *self.packet_ring.write().unwrap() = None;
        vif.take_device();

        Ok(())
    }

    fn dev_stats_update(&self, vif: &Vif, lcore_id: usize) {
        if !vif.is_fabric() {
            return;
        }
        let ethdev = match vif.ethdev() {
            Some(ethdev) => ethdev,
            None => return,
        };

        let eth_stats = ethdev.driver().stats();
        let lcore = &self.lcores()[lcore_id];
        let stats = vif.stats(lcore_id);

        lcore.with_rx_queue(vif.idx, |q| {
            if q.handle.kind() == QueueKind::Ethdev {
                let queue_id = usize::from(q.queue_id);
                if queue_id < QUEUE_STAT_CNTRS {
                    stats.dev_ibytes.set(eth_stats.q_ibytes[queue_id]);
                    stats.dev_ipackets.set(eth_stats.q_ipackets[queue_id]);
                    stats.dev_ierrors.set(eth_stats.q_errors[queue_id]);
                }
            }
        });

        lcore.with_tx_queue(vif.idx, |q| {
            if q.handle.kind() == QueueKind::Ethdev {
                let queue_id = usize::from(q.queue_id);
                if queue_id < QUEUE_STAT_CNTRS {
                    stats.dev_obytes.set(eth_stats.q_obytes[queue_id]);
                    stats.dev_opackets.set(eth_stats.q_opackets[queue_id]);
                }
            }
        });

        if lcore_id == 0 {
            // lcore 0 stores the global device counters.
            stats.dev_ierrors.set(eth_stats.ierrors);
            stats.dev_inombufs.set(eth_stats.rx_nombuf);
            stats.dev_oerrors.set(eth_stats.oerrors);
        }
    }

    fn port_stats_update(&self, vif: &Vif, lcore_id: usize) {
        let lcore = &self.lcores()[lcore_id];
        let stats = vif.stats(lcore_id);

        lcore.with_rx_queue(vif.idx, |q| {
            let s = q.handle.stats(false);
            if q.handle.kind().is_ring() {
                stats.queue_ipackets.set(s.n_pkts_in);
                stats.queue_ierrors.set(s.n_pkts_drop);
            } else {
                stats.port_ipackets.set(s.n_pkts_in);
                stats.port_ierrors.set(s.n_pkts_drop);
            }
        });

        lcore.with_tx_queue(vif.idx, |q| {
            let s = q.handle.stats(false);
            if q.handle.kind().is_ring() {
                stats.queue_opackets.set(s.n_pkts_in);
                stats.queue_oerrors.set(s.n_pkts_drop);
            } else {
                stats.port_opackets.set(s.n_pkts_in);
                stats.port_oerrors.set(s.n_pkts_drop);
            }
        });
    }
}

impl HostIfOps for Datapath {
    fn lock(&self) {
        self.if_lock();
    }

    fn unlock(&self) {
        self.if_unlock();
    }

    fn add(&self, vif: &Arc<Vif>) -> Result<()> {
        if self.is_stop_flag_set() {
            return Err(Error::Busy);
        }

        self.register_vif(vif);

        match vif.vtype {
            VifType::Physical => self.fabric_if_add(vif),
            VifType::Virtual => self.virtual_if_add(vif),
            VifType::Host => self.vhost_if_add(vif),
            VifType::Agent => {
                if vif.transport == VifTransport::Socket {
                    self.agent_if_add(vif)
                } else {
                    error!(
                        "error adding vif {} packet device {}: unsupported transport {:?}",
                        vif.idx, vif.name, vif.transport
                    );
                    Err(Error::InvalidArgument(format!(
                        "unsupported transport {:?}",
                        vif.transport
                    )))
                }
            }
            VifType::Monitoring => self.monitoring_if_add(vif),
        }
    }

    fn del(&self, vif: &Arc<Vif>) -> Result<()> {
        if self.is_stop_flag_set() {
            return Err(Error::Busy);
        }

        let ret = match vif.vtype {
            VifType::Physical => self.fabric_if_del(vif),
            VifType::Virtual => self.virtual_if_del(vif),
            VifType::Host => self.vhost_if_del(vif),
            VifType::Agent => {
                if vif.transport == VifTransport::Socket {
                    self.agent_if_del(vif)
                } else {
                    Err(Error::InvalidArgument(format!(
                        "unsupported transport {:?}",
                        vif.transport
                    )))
                }
            }
            VifType::Monitoring => self.monitoring_if_del(vif),
        };

        self.unregister_vif(vif.idx);

        ret
    }

    fn tx(&self, vif: &Vif, mut pkt: Packet) -> Result<()> {
        let lcore_id = match lcore::current() {
            Some(id) if id < self.lcores().len() => id,
            _ => {
                self.pfree(pkt.into_mbuf(), DropReason::InterfaceDrop);
                return Err(Error::Internal("TX from an unregistered lcore".into()));
            }
        };

        debug!("TX packet to interface {}", vif.name);

        let vif_idx = vif.idx;
        let lcore = &self.lcores()[lcore_id];

        // Reset buffer head pointer and length from the packet metadata.
        let (head_space, head_len) = (pkt.head_space(), pkt.head_len());
        pkt.mbuf_mut().reset(head_space, head_len);

        let vif_flags = vif.flags();

        if vif_flags.contains(VifFlags::MONITORED) {
            if let Some(monitoring_idx) = self.monitoring_of(vif_idx) {
                if let Some(handle) = lcore.tx_queue_handle(monitoring_idx) {
                    // Mirror failures never abort the primary path.
                    if let Ok(clone) = pkt.pclone() {
                        handle.tx(clone.into_mbuf());
                    }
                }
            }
        }

        if vif.vtype == VifType::Agent {
            let stats = vif.stats(lcore_id);
            let ring = self.packet_ring.read().unwrap().clone();
            let m = pkt.into_mbuf();

            let enqueued = match ring {
                Some(ring) => ring.enqueue(m),
                None => Err(m),
            };
            match enqueued {
                Ok(()) => {
                    stats.queue_opackets.add(1);
                    self.packet_wakeup();
                }
                Err(m) => {
                    self.pfree(m, DropReason::InterfaceDrop);
                    stats.queue_oerrors.add(1);
                }
            }

            // Success either way, so the caller does not count the drop a
            // second time on the interface.
            return Ok(());
        }

        // Find an inner TCP SYN inside the guest-bound frame and clamp its
        // MSS to what fits once the overlay headers are on.
        if self.config().to_vm_mss_adj && vif.is_virtual() {
            let off = pkt.head_space() + ETHER_HDR_LEN;
            let end = pkt.head_space() + pkt.head_len();

            let parsed = if off <= end && end <= pkt.mbuf().buf_len() {
                ip::mss_adjust_frame(
                    &mut pkt.mbuf_mut().buf_mut()[off..end],
                    self.config().overlay_len,
                )
            } else {
                Err(Error::InvalidArgument("frame shorter than its headers".into()))
            };

            if let Err(e) = parsed {
                self.pfree(pkt.into_mbuf(), DropReason::Pull);
                return Err(e);
            }
        }

        // Whether prepending the outer header pushed the packet past the
        // egress MTU; decided before checksums since it changes the policy.
        let will_fragment =
            pkt.vp_type.is_overlay() && usize::from(vif.mtu()) < pkt.mbuf().pkt_len();

        if pkt.vp_flags.contains(VpFlags::CSUM_PARTIAL) {
            if vif_flags.contains(VifFlags::TX_CSUM_OFFLOAD) && !will_fragment {
                checksum::hw_checksum(&mut pkt);
            } else {
                // No hardware checksums across fragmentation.
                checksum::sw_checksum(&mut pkt, will_fragment);

                // The inner checksums had to be software, but the outer
                // header can still go to the NIC.
                if will_fragment && vif_flags.contains(VifFlags::TX_CSUM_OFFLOAD) {
                    checksum::ipv4_outer_tunnel_hw_checksum(&mut pkt);
                }
            }
        } else if pkt.vp_type.is_overlay() {
            // Inner checksum is already complete; the outer header is ours.
            if vif_flags.contains(VifFlags::TX_CSUM_OFFLOAD) {
                checksum::ipv4_outer_tunnel_hw_checksum(&mut pkt);
            } else if !will_fragment {
                checksum::ipv4_outer_tunnel_sw_checksum(&mut pkt);
            }
        }

        // Tag only frames leaving on the fabric, so compute nodes can talk
        // across the configured VLAN. No tag configured, no tagging.
        if self.config().vlan_tag != VLAN_ID_INVALID && vif.is_fabric() {
            pkt.mbuf_mut().vlan_tci = self.config().vlan_tag;
            if !vif_flags.contains(VifFlags::VLAN_OFFLOAD) {
                // Software VLAN TCI insert.
                pkt.mbuf_mut().l2_len += VLAN_HDR_LEN as u16;
                if let Err(e) = pkt.mbuf_mut().vlan_insert() {
                    debug!("error inserting VLAN tag: {}", e);
                    self.pfree(pkt.into_mbuf(), DropReason::InterfaceDrop);
                    return Err(e);
                }
            } else {
                // Hardware VLAN TCI insert.
                pkt.mbuf_mut().ol_flags |= OffloadFlags::TX_VLAN_PKT;
            }
        }

        let mut frags = Vec::new();
        if will_fragment {
            match fragment::fragment_packet(
                self.frag_pool(),
                &mut pkt,
                vif.mtu(),
                !vif_flags.contains(VifFlags::TX_CSUM_OFFLOAD),
            ) {
                Ok(out) => frags = out,
                Err(e) => {
                    debug!(
                        "error during fragmentation of an IP packet for interface {} on lcore {}: {}",
                        vif.name, lcore_id, e
                    );
                    self.pfree(pkt.into_mbuf(), DropReason::InterfaceDrop);
                    return Err(e);
                }
            }
        }

        // Past this point the packet metadata belongs to the drop path only;
        // the fragments never had any.
        let flush_now = !lcore::is_forwarding(lcore_id);
        let handle = lcore.tx_queue_handle(vif_idx);

        if frags.len() > 1 {
            match handle {
                Some(handle) if handle.has_tx_bulk() => {
                    handle.tx_bulk(frags);
                    if flush_now {
                        handle.flush();
                    }

                    // The original buffer was consumed by fragmentation.
                    drop(pkt.into_mbuf());
                    Ok(())
                }
                _ => {
                    debug!(
                        "error TXing to interface {}: no bulk queue for lcore {}",
                        vif.name, lcore_id
                    );
                    // Fragments only know the low-level free.
                    drop(frags);
                    self.pfree(pkt.into_mbuf(), DropReason::InterfaceDrop);
                    Err(Error::Internal(format!(
                        "no bulk TX queue for vif {} on lcore {}",
                        vif_idx, lcore_id
                    )))
                }
            }
        } else {
            let m = match frags.pop() {
                Some(frag) => {
                    drop(pkt.into_mbuf());
                    frag
                }
                None => pkt.into_mbuf(),
            };

            match handle {
                Some(handle) => {
                    handle.tx(m);
                    if flush_now {
                        handle.flush();
                    }
                    Ok(())
                }
                None => {
                    debug!(
                        "error TXing to interface {}: no queue for lcore {}",
                        vif.name, lcore_id
                    );
                    self.pfree(m, DropReason::InterfaceDrop);
                    Err(Error::Internal(format!(
                        "no TX queue for vif {} on lcore {}",
                        vif_idx, lcore_id
                    )))
                }
            }
        }
    }

    fn rx(&self, vif: &Vif, mut pkt: Packet) -> Result<()> {
        let lcore_id = match lcore::current() {
            Some(id) if id < self.lcores().len() => id,
            _ => {
                self.pfree(pkt.into_mbuf(), DropReason::InterfaceDrop);
                return Err(Error::Internal("RX from an unregistered lcore".into()));
            }
        };

        debug!("RX packet to interface {}", vif.name);

        let lcore = &self.lcores()[lcore_id];

        let (head_space, head_len) = (pkt.head_space(), pkt.head_len());
        pkt.mbuf_mut().reset(head_space, head_len);

        if vif.flags().contains(VifFlags::MONITORED) {
            if let Some(monitoring_idx) = self.monitoring_of(vif.idx) {
                if let Some(handle) = lcore.tx_queue_handle(monitoring_idx) {
                    if let Ok(clone) = pkt.pclone() {
                        handle.tx(clone.into_mbuf());
                    }
                }
            }
        }

        match lcore.tx_queue_handle(vif.idx) {
            Some(handle) => {
                handle.tx(pkt.into_mbuf());
                Ok(())
            }
            None => {
                debug!(
                    "error TXing to interface {}: no queue for lcore {}",
                    vif.name, lcore_id
                );
                self.pfree(pkt.into_mbuf(), DropReason::InterfaceDrop);
                Err(Error::Internal(format!(
                    "no TX queue for vif {} on lcore {}",
                    vif.idx, lcore_id
                )))
            }
        }
    }

    fn get_settings(&self, vif: &Vif) -> IfSettings {
        if let Some(ethdev) = vif.ethdev() {
            let link = ethdev.driver().link();
            if link.speed != 0 {
                return IfSettings {
                    speed: link.speed,
                    full_duplex: link.duplex,
                };
            }
        }

        // Default values.
        IfSettings {
            speed: 1000,
            full_duplex: true,
        }
    }

    fn get_mtu(&self, vif: &Vif) -> u16 {
        if vif.vtype == VifType::Physical {
            if let Some(ethdev) = vif.ethdev() {
                return ethdev.driver().mtu();
            }
        }

        vif.mtu()
    }

    fn get_encap(&self, _vif: &Vif) -> EncapType {
        EncapType::Ether
    }

    fn stats_update(&self, vif: &Vif, core: Option<usize>) {
        let nb_cores = self.lcores().len().min(vif.nb_stats());

        match core {
            None => {
                // Update counters for all cores.
                for lcore_id in 0..nb_cores {
                    self.dev_stats_update(vif, lcore_id);
                    self.port_stats_update(vif, lcore_id);
                }
            }
            Some(lcore_id) if lcore_id < nb_cores => {
                self.dev_stats_update(vif, lcore_id);
                self.port_stats_update(vif, lcore_id);
            }
            // Otherwise there is nothing to update.
            _ => {}
        }
    }
}
