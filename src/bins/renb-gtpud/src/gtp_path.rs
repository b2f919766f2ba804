//! S1-U Endpoint
//!
//! GTP-U rx classification (echo / error indication / G-PDU / End Marker),
//! uplink transmission, and the handover-driven forwarding / buffering /
//! flush sub-protocol of TS 36.300, 10.1.2.2.1, layered over the tunnel
//! registry. All registry access goes through one lock; the lock is never
//! held across a socket or PDCP call.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use bytes::Bytes;
use renb_gtp::header::{Gtp1Header, Gtp1uMessageType};
use renb_gtp::{message, GTPU_PORT};

use crate::context::{
    BearerProps, DownlinkState, PendingPush, RegistryError, TunnelRegistry, RADIO_BEARER_COUNT,
};
use crate::pdcp::Pdcp;

/// Largest datagram accepted on the S1-U / M1-U sockets
pub const MAX_DGRAM_LEN: usize = 9000;

// ============================================================================
// Egress seam
// ============================================================================

/// Datagram egress. The production implementation is a cloned non-blocking
/// UDP socket; tests substitute a recorder.
pub trait Transport: Send + Sync {
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;
}

pub struct UdpTransport(std::net::UdpSocket);

impl UdpTransport {
    pub fn new(socket: std::net::UdpSocket) -> Self {
        Self(socket)
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, dst)
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Per-direction packet counters, read by the periodic stats task.
#[derive(Default)]
pub struct GtpuCounters {
    pub rx_pkts: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_pkts: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_dropped: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl GtpuCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_pkts: self.rx_pkts.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_pkts: self.tx_pkts.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// What a G-PDU lookup decided under the registry lock; the I/O happens
/// after the lock is released.
enum GpduDisposition {
    Deliver { rnti: u16, lcid: u8 },
    Forward { rnti: u16, lcid: u8, teid_out: u32, peer_addr: Ipv4Addr },
    Buffered(usize),
    Dropped,
}

/// The S1-U endpoint: owns the tunnel registry and drives all GTP-U rx/tx.
pub struct GtpuEndpoint {
    registry: RwLock<TunnelRegistry>,
    pdcp: Arc<dyn Pdcp>,
    transport: Arc<dyn Transport>,
    /// Sequence number stamped into outgoing Error Indications
    tx_seq: AtomicU16,
    pub counters: GtpuCounters,
}

impl GtpuEndpoint {
    pub fn new(transport: Arc<dyn Transport>, pdcp: Arc<dyn Pdcp>) -> Self {
        Self {
            registry: RwLock::new(TunnelRegistry::new()),
            pdcp,
            transport,
            tx_seq: AtomicU16::new(0),
            counters: GtpuCounters::default(),
        }
    }

    // ------------------------------------------------------------------
    // Control-plane operations
    // ------------------------------------------------------------------

    /// Create the tunnel pair endpoint for a bearer and interpret the
    /// handover props. Returns the inbound TEID allocated for it.
    pub fn add_bearer(
        &self,
        rnti: u16,
        lcid: u8,
        peer_addr: Ipv4Addr,
        teid_out: u32,
        props: Option<&BearerProps>,
    ) -> Result<u32, RegistryError> {
        let teid_in = self.registry.write().unwrap().insert(rnti, lcid, peer_addr, teid_out)?;

        if let Some(props) = props {
            if let Some(existing) = props.flush_before_teid_in {
                let armed = self.registry.write().unwrap().arm_buffering(existing, teid_in);
                if let Err(e) = armed {
                    log::error!(
                        "Failed to arm path-switch buffering on TEID In={existing:#x}: {e}"
                    );
                    self.rem_tunnel(teid_in);
                    return Err(e);
                }
            }

            if let Some(source) = props.forward_from_teid_in {
                let armed = self.registry.write().unwrap().arm_forwarding(source, teid_in);
                match armed {
                    Ok((src_rnti, src_lcid)) => {
                        log::info!(
                            "Creating forwarding tunnel for rnti={src_rnti:#06x}, lcid={src_lcid}, \
                             TEID In={source:#x} -> out={{{teid_out:#x}, {peer_addr}}}"
                        );
                        // Relay whatever the upper layer still holds for the
                        // bearer, each PDU tagged with its PDCP SN.
                        for (sn, pdu) in self.pdcp.get_buffered_pdus(src_rnti, src_lcid) {
                            self.send_pdu_to_tunnel(
                                src_rnti, src_lcid, &pdu, teid_out, peer_addr, Some(sn),
                            );
                        }
                    }
                    Err(e) => {
                        log::error!(
                            "Failed to create forwarding tunnel from TEID In={source:#x}: {e}"
                        );
                        // rem_tunnel rather than a bare unlink: a tunnel
                        // already armed to buffer for this one must have its
                        // queue released, not dropped on the floor.
                        self.rem_tunnel(teid_in);
                        return Err(e);
                    }
                }
            }
        }

        log::info!(
            "Adding bearer for rnti={rnti:#06x}, lcid={lcid}, addr={peer_addr}, \
             teid_out={teid_out:#x}, teid_in={teid_in:#x}"
        );
        Ok(teid_in)
    }

    /// Remove one tunnel. A forwarding tunnel sends an End Marker to its
    /// target first; unknown TEIDs are an idempotent no-op.
    pub fn rem_tunnel(&self, teid_in: u32) {
        let removed = self.registry.write().unwrap().unlink(teid_in);
        let Some(removed) = removed else {
            log::warn!("Removing unknown GTPU tunnel TEID In={teid_in:#x}");
            return;
        };

        if let DownlinkState::Forwarding { target_teid_in } = removed.tunnel.state {
            self.send_end_marker(target_teid_in);
        }
        for cleared in removed.cleared_forwards {
            log::warn!(
                "Tunnel TEID In={cleared:#x} lost its forwarding target {teid_in:#x}"
            );
        }
        for queue in removed.orphaned_queues {
            log::warn!(
                "Tunnel removal TEID In={teid_in:#x} releases {} buffered packets for \
                 rnti={:#06x}, lcid={}",
                queue.pending.len(),
                queue.rnti,
                queue.lcid
            );
            for pkt in queue.pending {
                self.pdcp.write_sdu(queue.rnti, queue.lcid, pkt, None);
            }
        }
        log::debug!("TEID In={teid_in:#x} erased");
    }

    /// Remove every tunnel of a bearer, newest first, so forwarding
    /// cascades fire in reverse insertion order.
    pub fn rem_bearer(&self, rnti: u16, lcid: u8) {
        if !self.registry.read().unwrap().user_exists(rnti) {
            log::warn!("Removing bearer for unknown rnti={rnti:#06x}, lcid={lcid}");
            return;
        }
        loop {
            // The guard must not live across rem_tunnel, which re-locks.
            let last = {
                let reg = self.registry.read().unwrap();
                reg.bearer_teids(rnti, lcid).last().copied()
            };
            match last {
                Some(teid) => self.rem_tunnel(teid),
                None => break,
            }
        }
        log::info!("Removing bearer for rnti={rnti:#06x}, lcid={lcid}");
    }

    /// Remove every bearer of a user.
    pub fn rem_user(&self, rnti: u16) {
        log::info!("Removing rnti={rnti:#06x}");
        if !self.registry.read().unwrap().user_exists(rnti) {
            log::warn!("Removing unknown rnti={rnti:#06x}");
            return;
        }
        for lcid in 0..RADIO_BEARER_COUNT as u8 {
            loop {
                let last = {
                    let reg = self.registry.read().unwrap();
                    reg.bearer_teids(rnti, lcid).last().copied()
                };
                match last {
                    Some(teid) => self.rem_tunnel(teid),
                    None => break,
                }
            }
        }
    }

    /// Rewrite a user's RNTI during handover. Conflicts leave the registry
    /// unchanged.
    pub fn mod_bearer_rnti(&self, old_rnti: u16, new_rnti: u16) {
        log::info!("Modifying bearer rnti. Old rnti={old_rnti:#06x}, new rnti={new_rnti:#06x}");
        if let Err(e) = self.registry.write().unwrap().rename_user(old_rnti, new_rnti) {
            log::error!("Failed to modify bearer rnti: {e}");
        }
    }

    pub fn user_exists(&self, rnti: u16) -> bool {
        self.registry.read().unwrap().user_exists(rnti)
    }

    /// Ordered inbound TEIDs of a bearer (position 0 is the uplink primary).
    pub fn bearer_teids(&self, rnti: u16, lcid: u8) -> Vec<u32> {
        self.registry.read().unwrap().bearer_teids(rnti, lcid).to_vec()
    }

    pub fn tunnel_count(&self) -> usize {
        self.registry.read().unwrap().tunnel_count()
    }

    // ------------------------------------------------------------------
    // Uplink path
    // ------------------------------------------------------------------

    /// Transmit an uplink IP packet on the bearer's primary tunnel.
    pub fn write_pdu(&self, rnti: u16, lcid: u8, pdu: Bytes) {
        let primary = {
            let reg = self.registry.read().unwrap();
            reg.primary_teid(rnti, lcid)
                .and_then(|teid| reg.lookup(teid))
                .map(|tun| (tun.teid_out, tun.peer_addr))
        };
        let Some((teid_out, peer_addr)) = primary else {
            log::warn!("[DROP] No uplink tunnel for rnti={rnti:#06x}, lcid={lcid}");
            self.counters.tx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.send_pdu_to_tunnel(rnti, lcid, &pdu, teid_out, peer_addr, None);
    }

    /// Validate, encapsulate and transmit one IP packet on a tunnel.
    fn send_pdu_to_tunnel(
        &self,
        rnti: u16,
        lcid: u8,
        pdu: &[u8],
        teid_out: u32,
        peer_addr: Ipv4Addr,
        pdcp_sn: Option<u16>,
    ) {
        log::debug!("[TX] PDU rnti={rnti:#06x}, lcid={lcid}, n_bytes={}", pdu.len());
        if !self.check_ip_packet(pdu) {
            self.counters.tx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let dgram = message::gpdu(teid_out, pdu, pdcp_sn);
        self.send(&dgram, SocketAddr::new(IpAddr::V4(peer_addr), GTPU_PORT));
    }

    /// Accept only IPv4/IPv6 payloads. An IPv4 total-length mismatch is
    /// logged but the packet still goes through, as the original stack did.
    fn check_ip_packet(&self, pdu: &[u8]) -> bool {
        let Some(&first) = pdu.first() else {
            log::warn!("[DROP] Empty IP packet");
            return false;
        };
        match first >> 4 {
            4 => {
                if pdu.len() >= 20 {
                    let tot_len = u16::from_be_bytes([pdu[2], pdu[3]]) as usize;
                    if tot_len != pdu.len() {
                        log::error!(
                            "IP total length {tot_len} and PDU length {} mismatch",
                            pdu.len()
                        );
                    }
                    log::trace!(
                        "IPv4 src={} dst={} length={tot_len}",
                        Ipv4Addr::new(pdu[12], pdu[13], pdu[14], pdu[15]),
                        Ipv4Addr::new(pdu[16], pdu[17], pdu[18], pdu[19]),
                    );
                }
                true
            }
            6 => true,
            v => {
                log::warn!("[DROP] Invalid IP version {v}");
                false
            }
        }
    }

    fn send(&self, buf: &[u8], dst: SocketAddr) {
        match self.transport.send_to(buf, dst) {
            Ok(_) => {
                self.counters.tx_pkts.fetch_add(1, Ordering::Relaxed);
                self.counters.tx_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("[DROP] sendto {dst} failed: {e}");
                self.counters.tx_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ------------------------------------------------------------------
    // Path management tx
    // ------------------------------------------------------------------

    fn echo_response(&self, dst: SocketAddr, seq: u16) {
        log::info!("[TX] GTPU Echo Response, Seq={seq}");
        self.send(&message::echo_response(seq), dst);
    }

    fn error_indication(&self, dst: SocketAddr, err_teid: u32) {
        let seq = self.tx_seq.fetch_add(1, Ordering::SeqCst);
        log::info!("[TX] GTPU Error Indication. Seq={seq}, Error TEID={err_teid:#x}");
        self.send(&message::error_indication(err_teid, seq), dst);
    }

    /// Emit an End Marker on the tunnel identified by `teid_in`. The tunnel
    /// may already be gone during bearer teardown; that is a logged skip.
    fn send_end_marker(&self, teid_in: u32) {
        let target = {
            let reg = self.registry.read().unwrap();
            reg.lookup(teid_in).map(|tun| (tun.teid_out, tun.peer_addr))
        };
        let Some((teid_out, peer_addr)) = target else {
            log::warn!("End Marker target TEID In={teid_in:#x} no longer exists");
            return;
        };
        log::info!("[TX] GTPU End Marker, TEID={teid_out:#x}");
        self.send(
            &message::end_marker(teid_out),
            SocketAddr::new(IpAddr::V4(peer_addr), GTPU_PORT),
        );
    }

    // ------------------------------------------------------------------
    // Downlink rx path
    // ------------------------------------------------------------------

    /// Entry point for every datagram arriving on the S1-U socket.
    pub fn handle_s1u_rx(&self, data: &[u8], from: SocketAddr) {
        self.counters.rx_pkts.fetch_add(1, Ordering::Relaxed);
        self.counters.rx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        log::trace!("Received {} bytes from S1-U interface", data.len());

        let mut bytes = Bytes::copy_from_slice(data);
        let header = match Gtp1Header::decode(&mut bytes) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("[DROP] Cannot decode GTP-U packet from {from}: {e}");
                self.counters.rx_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Non-zero TEID that no tunnel owns: tell the sender, whatever the
        // message was.
        if header.teid != 0 && !self.registry.read().unwrap().contains(header.teid) {
            self.error_indication(from, header.teid);
            self.counters.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match Gtp1uMessageType::try_from(header.message_type) {
            Ok(Gtp1uMessageType::EchoRequest) => {
                log::info!("[RECV] Echo Request from {from}");
                self.echo_response(from, header.sequence_number.unwrap_or(0));
            }
            Ok(Gtp1uMessageType::EchoResponse) => {
                log::debug!("[RECV] Echo Response from {from}");
            }
            Ok(Gtp1uMessageType::ErrorIndication) => {
                log::warn!(
                    "[RECV] Error Indication from {from}, TEID={:#x}, Seq={:?}",
                    header.teid,
                    header.sequence_number
                );
            }
            Ok(Gtp1uMessageType::GPdu) => self.handle_gpdu(&header, bytes, from),
            Ok(Gtp1uMessageType::EndMarker) => self.handle_end_marker(&header),
            Ok(Gtp1uMessageType::SupportedExtensionHeadersNotification) | Err(_) => {
                log::debug!(
                    "Ignoring GTP-U message type {} from {from}",
                    header.message_type
                );
            }
        }
    }

    fn handle_gpdu(&self, header: &Gtp1Header, payload: Bytes, from: SocketAddr) {
        if header.teid == 0 {
            log::warn!("[DROP] G-PDU with zero TEID from {from}");
            self.error_indication(from, 0);
            return;
        }
        if !self.check_ip_packet(&payload) {
            self.counters.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Snapshot of the receiving tunnel's state taken under the lock
        enum StateSnap {
            Normal,
            Forwarding(u32),
            Buffering,
        }

        let disposition = {
            let mut reg = self.registry.write().unwrap();
            let Some(tun) = reg.lookup(header.teid) else {
                // Raced away between the pre-check and here.
                drop(reg);
                self.error_indication(from, header.teid);
                return;
            };
            let (rnti, lcid) = (tun.rnti, tun.lcid);
            let snap = match tun.state {
                DownlinkState::Normal => StateSnap::Normal,
                DownlinkState::Forwarding { target_teid_in } => StateSnap::Forwarding(target_teid_in),
                DownlinkState::Buffering { .. } => StateSnap::Buffering,
            };

            match snap {
                StateSnap::Normal => GpduDisposition::Deliver { rnti, lcid },
                StateSnap::Forwarding(target) => match reg.lookup(target) {
                    Some(out) => GpduDisposition::Forward {
                        rnti,
                        lcid,
                        teid_out: out.teid_out,
                        peer_addr: out.peer_addr,
                    },
                    None => {
                        log::error!(
                            "Forwarding target TEID In={target:#x} missing for {:#x}",
                            header.teid
                        );
                        GpduDisposition::Dropped
                    }
                },
                StateSnap::Buffering => match reg.push_pending(header.teid, payload.clone()) {
                    Ok(PendingPush::Queued(depth)) => GpduDisposition::Buffered(depth),
                    _ => {
                        log::warn!(
                            "[DROP] Pending queue full on TEID In={:#x}",
                            header.teid
                        );
                        GpduDisposition::Dropped
                    }
                },
            }
        };

        match disposition {
            GpduDisposition::Deliver { rnti, lcid } => {
                log::debug!(
                    "[RECV] GTPU PDU rnti={rnti:#06x}, lcid={lcid}, n_bytes={}",
                    payload.len()
                );
                self.pdcp.write_sdu(rnti, lcid, payload, header.pdcp_pdu_number());
            }
            GpduDisposition::Forward { rnti, lcid, teid_out, peer_addr } => {
                log::info!(
                    "Forwarding GTPU PDU rnti={rnti:#06x}, lcid={lcid}, n_bytes={}",
                    payload.len()
                );
                self.send_pdu_to_tunnel(rnti, lcid, &payload, teid_out, peer_addr, None);
            }
            GpduDisposition::Buffered(depth) => {
                log::info!(
                    "Buffering RX GTPU PDU TEID In={:#x}, n_bytes={}, queued={depth}",
                    header.teid,
                    payload.len()
                );
            }
            GpduDisposition::Dropped => {
                self.counters.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_end_marker(&self, header: &Gtp1Header) {
        if header.teid == 0 {
            log::warn!("[DROP] End Marker with zero TEID");
            return;
        }

        let rnti = self
            .registry
            .read()
            .unwrap()
            .lookup(header.teid)
            .map(|tun| tun.rnti);
        let Some(rnti) = rnti else {
            return;
        };
        log::info!("[RECV] GTPU End Marker for rnti={rnti:#06x}");

        // TS 36.300, 10.1.2.2.1 - relay while forwarding is active,
        // otherwise release the streams waiting on this tunnel.
        let forward_target = self.registry.write().unwrap().clear_forwarding(header.teid);
        if let Some(target) = forward_target {
            self.send_end_marker(target);
            return;
        }

        let flushed = self.registry.write().unwrap().take_flushes_for(header.teid);
        for queue in flushed {
            log::info!(
                "Flushing {} buffered packets for rnti={:#06x}, lcid={}",
                queue.pending.len(),
                queue.rnti,
                queue.lcid
            );
            for pkt in queue.pending {
                self.pdcp.write_sdu(queue.rnti, queue.lcid, pkt, None);
            }
        }
    }
}

// ============================================================================
// Socket setup and rx pump
// ============================================================================

/// Bind the S1-U socket with address reuse, matching the original stack's
/// socket options.
pub fn open_s1u_socket(bind_addr: Ipv4Addr) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let bind = SocketAddr::new(IpAddr::V4(bind_addr), GTPU_PORT);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket
        .bind(&bind.into())
        .context(format!("Failed to bind S1-U socket on {bind}"))?;
    Ok(socket.into())
}

/// Receive loop for the S1-U socket; one task for the life of the process.
pub async fn run_s1u_rx(
    endpoint: Arc<GtpuEndpoint>,
    socket: tokio::net::UdpSocket,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DGRAM_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => endpoint.handle_s1u_rx(&buf[..n], from),
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log::error!("S1-U recv failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Transport for RecordingTransport {
        fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push((buf.to_vec(), dst));
            Ok(buf.len())
        }
    }

    struct RecordingPdcp {
        delivered: Mutex<Vec<(u16, u8, Vec<u8>, Option<u16>)>>,
        buffered: Mutex<BTreeMap<u16, Bytes>>,
    }

    impl RecordingPdcp {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                buffered: Mutex::new(BTreeMap::new()),
            })
        }

        fn queue_uplink(&self, sn: u16, pdu: Vec<u8>) {
            self.buffered.lock().unwrap().insert(sn, Bytes::from(pdu));
        }

        fn take(&self) -> Vec<(u16, u8, Vec<u8>, Option<u16>)> {
            std::mem::take(&mut *self.delivered.lock().unwrap())
        }
    }

    impl Pdcp for RecordingPdcp {
        fn write_sdu(&self, rnti: u16, lcid: u8, sdu: Bytes, pdcp_sn: Option<u16>) {
            self.delivered
                .lock()
                .unwrap()
                .push((rnti, lcid, sdu.to_vec(), pdcp_sn));
        }

        fn get_buffered_pdus(&self, _rnti: u16, _lcid: u8) -> BTreeMap<u16, Bytes> {
            std::mem::take(&mut *self.buffered.lock().unwrap())
        }
    }

    fn endpoint() -> (GtpuEndpoint, Arc<RecordingTransport>, Arc<RecordingPdcp>) {
        let transport = RecordingTransport::new();
        let pdcp = RecordingPdcp::new();
        let ep = GtpuEndpoint::new(transport.clone(), pdcp.clone());
        (ep, transport, pdcp)
    }

    /// Minimal well-formed IPv4 packet of the given total length.
    fn ipv4_packet(total_len: usize) -> Vec<u8> {
        assert!(total_len >= 20);
        let mut pkt = vec![0u8; total_len];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        pkt[12..16].copy_from_slice(&[192, 168, 0, 1]);
        pkt[16..20].copy_from_slice(&[10, 45, 0, 2]);
        pkt
    }

    fn sgw() -> SocketAddr {
        "10.0.0.1:2152".parse().unwrap()
    }

    #[test]
    fn test_basic_uplink() {
        let (ep, transport, _) = endpoint();
        let teid_in = ep
            .add_bearer(0x1234, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None)
            .unwrap();
        assert_eq!(teid_in, 1);

        let pkt = ipv4_packet(40);
        ep.write_pdu(0x1234, 3, Bytes::from(pkt.clone()));

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (dgram, dst) = &sent[0];
        assert_eq!(*dst, sgw());
        assert_eq!(&dgram[..8], &[0x30, 0xFF, 0x00, 0x28, 0x00, 0x00, 0x00, 0xAA]);
        assert_eq!(&dgram[8..], &pkt[..]);
    }

    #[test]
    fn test_uplink_without_bearer_drops() {
        let (ep, transport, _) = endpoint();
        ep.write_pdu(0x1234, 3, Bytes::from(ipv4_packet(40)));
        assert!(transport.take().is_empty());
        assert_eq!(ep.counters.tx_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_teid_gets_error_indication() {
        let (ep, transport, pdcp) = endpoint();
        let from: SocketAddr = "192.0.2.5:40000".parse().unwrap();

        ep.handle_s1u_rx(&message::gpdu(0xDEAD, &ipv4_packet(24), None), from);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (dgram, dst) = &sent[0];
        assert_eq!(*dst, from);
        assert_eq!(
            dgram.as_slice(),
            &[0x32, 0x1A, 0x00, 0x04, 0x00, 0x00, 0xDE, 0xAD, 0x00, 0x00, 0x00, 0x00]
        );

        // The tx sequence number is process-wide monotonic.
        ep.handle_s1u_rx(&message::gpdu(0xBEEF, &ipv4_packet(24), None), from);
        let sent = transport.take();
        assert_eq!(&sent[0].0[8..10], &[0x00, 0x01]);
        assert!(pdcp.take().is_empty());
    }

    #[test]
    fn test_gpdu_with_zero_teid_gets_error_indication() {
        let (ep, transport, _) = endpoint();
        let from: SocketAddr = "192.0.2.9:2152".parse().unwrap();

        ep.handle_s1u_rx(&message::gpdu(0, &ipv4_packet(24), None), from);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0[1], 0x1A);
        assert_eq!(&sent[0].0[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_echo_request_response() {
        let (ep, transport, _) = endpoint();
        let from: SocketAddr = "198.51.100.7:32000".parse().unwrap();

        let request = [
            0x32, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A, 0x00, 0x00,
        ];
        ep.handle_s1u_rx(&request, from);

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (dgram, dst) = &sent[0];
        assert_eq!(*dst, from);
        assert_eq!(
            dgram.as_slice(),
            &[0x32, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A, 0x00, 0x00]
        );
    }

    #[test]
    fn test_downlink_delivery_with_pdcp_sn() {
        let (ep, _, pdcp) = endpoint();
        let teid = ep
            .add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None)
            .unwrap();

        let pkt = ipv4_packet(28);
        ep.handle_s1u_rx(&message::gpdu(teid, &pkt, Some(0x0102)), sgw());

        let delivered = pdcp.take();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], (5, 3, pkt, Some(0x0102)));
    }

    #[test]
    fn test_indirect_forwarding() {
        let (ep, transport, pdcp) = endpoint();
        let target_enb = Ipv4Addr::new(10, 0, 0, 2);

        let t1 = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0x11, None).unwrap();
        transport.take();

        // Two uplink PDUs still sit in PDCP when forwarding is armed.
        pdcp.queue_uplink(0, ipv4_packet(20));
        pdcp.queue_uplink(1, ipv4_packet(24));

        let props = BearerProps {
            forward_from_teid_in: Some(t1),
            ..Default::default()
        };
        let t2 = ep.add_bearer(5, 3, target_enb, 0x22, Some(&props)).unwrap();
        assert_eq!(t2, 2);

        // The queued PDUs went out on the new tunnel, tagged with their SNs.
        let sent = transport.take();
        assert_eq!(sent.len(), 2);
        for (i, (dgram, dst)) in sent.iter().enumerate() {
            assert_eq!(dst.ip(), IpAddr::V4(target_enb));
            let mut bytes = Bytes::copy_from_slice(dgram);
            let header = Gtp1Header::decode(&mut bytes).unwrap();
            assert_eq!(header.teid, 0x22);
            assert_eq!(header.pdcp_pdu_number(), Some(i as u16));
        }

        // A G-PDU arriving on t1 is re-sent on t2, payload untouched.
        let pkt = ipv4_packet(32);
        ep.handle_s1u_rx(&message::gpdu(t1, &pkt, None), sgw());
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (dgram, dst) = &sent[0];
        assert_eq!(dst.ip(), IpAddr::V4(target_enb));
        let mut bytes = Bytes::copy_from_slice(dgram);
        let header = Gtp1Header::decode(&mut bytes).unwrap();
        assert_eq!(header.teid, 0x22);
        assert!(header.extensions.is_empty());
        assert_eq!(bytes.as_ref(), &pkt[..]);
        assert!(pdcp.take().is_empty());
    }

    #[test]
    fn test_forwarding_rollback_on_missing_source() {
        let (ep, _, _) = endpoint();
        let props = BearerProps {
            forward_from_teid_in: Some(99),
            ..Default::default()
        };
        let res = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 2), 0x22, Some(&props));
        assert_eq!(res, Err(RegistryError::UnknownTunnel(99)));
        assert_eq!(ep.tunnel_count(), 0);
        assert!(!ep.user_exists(5));
    }

    #[test]
    fn test_failed_add_bearer_rollback_releases_buffering() {
        let (ep, _, pdcp) = endpoint();
        let t1 = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None).unwrap();

        // Buffering is armed on t1, then the forwarding half of the same
        // call fails and rolls the new tunnel back.
        let props = BearerProps {
            flush_before_teid_in: Some(t1),
            forward_from_teid_in: Some(99),
        };
        let res = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 2), 0xBB, Some(&props));
        assert_eq!(res, Err(RegistryError::UnknownTunnel(99)));
        assert_eq!(ep.bearer_teids(5, 3), vec![t1]);

        // t1 must not be left waiting for an End Marker that can never
        // arrive; its traffic flows straight through again.
        let pkt = ipv4_packet(20);
        ep.handle_s1u_rx(&message::gpdu(t1, &pkt, None), sgw());
        let delivered = pdcp.take();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].2, pkt);
    }

    #[test]
    fn test_path_switch_flush() {
        let (ep, _, pdcp) = endpoint();

        // t1 is the bearer's established tunnel; t2 is the forwarding
        // tunnel the source eNB relays into.
        let t1 = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None).unwrap();
        let props = BearerProps {
            flush_before_teid_in: Some(t1),
            ..Default::default()
        };
        let t2 = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 2), 0xBB, Some(&props)).unwrap();

        // Post-path-switch packets on t1 are held back.
        let held_a = ipv4_packet(20);
        let held_b = ipv4_packet(24);
        ep.handle_s1u_rx(&message::gpdu(t1, &held_a, None), sgw());
        ep.handle_s1u_rx(&message::gpdu(t1, &held_b, None), sgw());
        assert!(pdcp.take().is_empty());

        // The relayed stream on t2 flows straight through.
        let relayed = ipv4_packet(28);
        ep.handle_s1u_rx(&message::gpdu(t2, &relayed, None), sgw());
        let delivered = pdcp.take();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].2, relayed);

        // End Marker on the forwarding tunnel releases t1's queue in order.
        ep.handle_s1u_rx(&message::end_marker(t2), sgw());
        let delivered = pdcp.take();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].2, held_a);
        assert_eq!(delivered[1].2, held_b);

        // The flush is one-shot; t1 now delivers directly.
        let after = ipv4_packet(36);
        ep.handle_s1u_rx(&message::gpdu(t1, &after, None), sgw());
        let delivered = pdcp.take();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].2, after);
    }

    #[test]
    fn test_end_marker_relayed_on_forwarding_tunnel() {
        let (ep, transport, _) = endpoint();
        let target_enb = Ipv4Addr::new(10, 0, 0, 2);

        let t1 = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0x11, None).unwrap();
        let props = BearerProps {
            forward_from_teid_in: Some(t1),
            ..Default::default()
        };
        let t2 = ep.add_bearer(5, 3, target_enb, 0x22, Some(&props)).unwrap();
        transport.take();

        ep.handle_s1u_rx(&message::end_marker(t1), sgw());
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (dgram, dst) = &sent[0];
        assert_eq!(*dst, SocketAddr::new(IpAddr::V4(target_enb), GTPU_PORT));
        assert_eq!(dgram.as_slice(), &[0x30, 0xFE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22]);

        // Forwarding is torn down by the relay; t1 delivers again.
        assert_eq!(ep.bearer_teids(5, 3), vec![t1, t2]);
        let pkt = ipv4_packet(20);
        ep.handle_s1u_rx(&message::gpdu(t1, &pkt, None), sgw());
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_rem_tunnel_on_forwarding_emits_end_marker() {
        let (ep, transport, _) = endpoint();
        let target_enb = Ipv4Addr::new(10, 0, 0, 2);

        let t1 = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0x11, None).unwrap();
        let props = BearerProps {
            forward_from_teid_in: Some(t1),
            ..Default::default()
        };
        ep.add_bearer(5, 3, target_enb, 0x22, Some(&props)).unwrap();
        transport.take();

        ep.rem_tunnel(t1);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_slice(), &[0x30, 0xFE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22]);
        assert_eq!(ep.bearer_teids(5, 3).len(), 1);
    }

    #[test]
    fn test_rem_bearer_removes_user_when_empty() {
        let (ep, _, _) = endpoint();
        ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0x11, None).unwrap();
        ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0x12, None).unwrap();
        ep.add_bearer(5, 4, Ipv4Addr::new(10, 0, 0, 1), 0x13, None).unwrap();

        ep.rem_bearer(5, 3);
        assert!(ep.bearer_teids(5, 3).is_empty());
        assert!(ep.user_exists(5));

        ep.rem_bearer(5, 4);
        assert!(!ep.user_exists(5));
        assert_eq!(ep.tunnel_count(), 0);

        // Idempotent on a user that is already gone.
        ep.rem_bearer(5, 3);
        ep.rem_tunnel(1);
        ep.rem_user(5);
    }

    #[test]
    fn test_rem_user_drops_all_bearers() {
        let (ep, _, _) = endpoint();
        ep.add_bearer(7, 3, Ipv4Addr::new(10, 0, 0, 1), 0x11, None).unwrap();
        ep.add_bearer(7, 5, Ipv4Addr::new(10, 0, 0, 1), 0x12, None).unwrap();

        ep.rem_user(7);
        assert!(!ep.user_exists(7));
        assert_eq!(ep.tunnel_count(), 0);
    }

    #[test]
    fn test_handover_rename() {
        let (ep, transport, _) = endpoint();
        ep.add_bearer(0x100, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None).unwrap();
        ep.add_bearer(0x100, 4, Ipv4Addr::new(10, 0, 0, 1), 0xBB, None).unwrap();

        ep.mod_bearer_rnti(0x100, 0x200);
        assert!(!ep.user_exists(0x100));
        assert!(ep.user_exists(0x200));

        // Uplink routes under the new RNTI, not the old one.
        ep.write_pdu(0x200, 3, Bytes::from(ipv4_packet(20)));
        assert_eq!(transport.take().len(), 1);
        ep.write_pdu(0x100, 3, Bytes::from(ipv4_packet(20)));
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_rename_conflict_leaves_state_unchanged() {
        let (ep, _, _) = endpoint();
        ep.add_bearer(0x100, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None).unwrap();
        ep.add_bearer(0x200, 3, Ipv4Addr::new(10, 0, 0, 1), 0xBB, None).unwrap();

        ep.mod_bearer_rnti(0x100, 0x200);
        assert!(ep.user_exists(0x100));
        assert!(ep.user_exists(0x200));
    }

    #[test]
    fn test_invalid_ip_version_dropped() {
        let (ep, transport, pdcp) = endpoint();
        let teid = ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None).unwrap();

        // Uplink: refused before encapsulation.
        ep.write_pdu(5, 3, Bytes::from_static(&[0x05, 0x00, 0x00, 0x00]));
        assert!(transport.take().is_empty());

        // Downlink: refused before delivery.
        ep.handle_s1u_rx(&message::gpdu(teid, &[0x75, 0x00, 0x00, 0x00], None), sgw());
        assert!(pdcp.take().is_empty());
    }

    #[test]
    fn test_ipv4_length_mismatch_still_transmits() {
        let (ep, transport, _) = endpoint();
        ep.add_bearer(5, 3, Ipv4Addr::new(10, 0, 0, 1), 0xAA, None).unwrap();

        let mut pkt = ipv4_packet(40);
        pkt[2..4].copy_from_slice(&100u16.to_be_bytes());
        ep.write_pdu(5, 3, Bytes::from(pkt));
        assert_eq!(transport.take().len(), 1);
    }
}
