//! M1-U Multicast Endpoint
//!
//! Sink for MBSFN broadcast traffic: joins the configured multicast group,
//! strips the GTP-U header and hands every payload to the upper layer on
//! the fixed MBSFN identifiers. There is no per-flow state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use renb_gtp::header::Gtp1Header;
use renb_gtp::M1U_PORT;

use crate::gtp_path::MAX_DGRAM_LEN;
use crate::pdcp::{Pdcp, MCH_LCID, MRNTI};

pub struct M1uHandler {
    pdcp: Arc<dyn Pdcp>,
    pub rx_pkts: AtomicU64,
    pub rx_dropped: AtomicU64,
}

impl M1uHandler {
    pub fn new(pdcp: Arc<dyn Pdcp>) -> Self {
        Self {
            pdcp,
            rx_pkts: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
        }
    }

    /// Entry point for every datagram arriving on the M1-U socket.
    pub fn handle_rx(&self, data: &[u8]) {
        self.rx_pkts.fetch_add(1, Ordering::Relaxed);
        log::trace!("Received {} bytes from M1-U interface", data.len());

        let mut bytes = Bytes::copy_from_slice(data);
        if let Err(e) = Gtp1Header::decode(&mut bytes) {
            log::warn!("[DROP] Cannot decode M1-U packet: {e}");
            self.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Every decoded payload goes up, whatever the message type; the
        // group carries nothing but MBSFN user data.
        self.pdcp.write_sdu(MRNTI, MCH_LCID, bytes, None);
    }
}

/// Bind the M1-U sink socket and join the multicast group on the chosen
/// interface. Multicast reception requires binding INADDR_ANY.
pub fn open_m1u_socket(multiaddr: Ipv4Addr, if_addr: Ipv4Addr) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), M1U_PORT);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&bind.into())
        .context(format!("Failed to bind M1-U socket on {bind}"))?;
    socket
        .join_multicast_v4(&multiaddr, &if_addr)
        .context(format!(
            "Failed to join multicast group {multiaddr} on interface {if_addr}"
        ))?;
    log::info!("M1-U initialized, group {multiaddr} on {if_addr}");
    Ok(socket.into())
}

/// Receive loop for the M1-U socket.
pub async fn run_m1u_rx(
    handler: Arc<M1uHandler>,
    socket: tokio::net::UdpSocket,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DGRAM_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, _from)) => handler.handle_rx(&buf[..n]),
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log::error!("M1-U recv failed: {e}");
            }
        }
    }
}
