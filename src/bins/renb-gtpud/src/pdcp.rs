//! Upper-Layer (PDCP) Interface
//!
//! The GTP-U endpoint never touches radio protocols; it hands downlink IP
//! packets up through this seam and pulls queued uplink PDUs back out of it
//! while setting up handover forwarding.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// RNTI sentinel for MBSFN traffic delivered from the M1-U endpoint
pub const MRNTI: u16 = 0xFFFD;

/// Fixed logical channel all MBSFN payloads are delivered on
pub const MCH_LCID: u8 = 1;

/// Downlink delivery and uplink drain interface offered by the radio stack.
pub trait Pdcp: Send + Sync {
    /// Push a downlink IP packet for (RNTI, LCID), with the PDCP sequence
    /// number when the G-PDU carried one.
    fn write_sdu(&self, rnti: u16, lcid: u8, sdu: Bytes, pdcp_sn: Option<u16>);

    /// Drain the PDUs still queued for an uplink bearer, keyed by PDCP
    /// sequence number in delivery order. Used when a forwarding tunnel is
    /// brought up during handover.
    fn get_buffered_pdus(&self, rnti: u16, lcid: u8) -> BTreeMap<u16, Bytes>;
}

/// Stand-in radio stack for the standalone daemon: counts and logs
/// deliveries, never holds uplink queues.
#[derive(Default)]
pub struct CountingPdcp {
    pub dl_pkts: AtomicU64,
    pub dl_bytes: AtomicU64,
}

impl Pdcp for CountingPdcp {
    fn write_sdu(&self, rnti: u16, lcid: u8, sdu: Bytes, pdcp_sn: Option<u16>) {
        self.dl_pkts.fetch_add(1, Ordering::Relaxed);
        self.dl_bytes.fetch_add(sdu.len() as u64, Ordering::Relaxed);
        log::debug!(
            "DL SDU rnti={:#06x} lcid={} n_bytes={} pdcp_sn={:?}",
            rnti,
            lcid,
            sdu.len(),
            pdcp_sn
        );
    }

    fn get_buffered_pdus(&self, _rnti: u16, _lcid: u8) -> BTreeMap<u16, Bytes> {
        BTreeMap::new()
    }
}
