//! Tunnel Context Management
//!
//! The tunnel table keyed by inbound TEID and the per-UE (RNTI, LCID)
//! bearer index are two views of one relation; every operation here mutates
//! them together so neither can drift. Inter-tunnel references (forwarding
//! targets, buffering predecessors) are held by TEID and re-resolved on each
//! access, never by pointer.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use bytes::Bytes;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Number of signalling radio bearers; LCIDs below this never carry user data
pub const SRB_COUNT: usize = 3;

/// Total radio bearers per UE (SRBs + DRBs); the bearer index arity
pub const RADIO_BEARER_COUNT: usize = 11;

/// Maximum packets a tunnel may hold while waiting for an End Marker;
/// arrivals beyond this are dropped tail-first
pub const PENDING_QUEUE_CAP: usize = 512;

// ============================================================================
// Errors
// ============================================================================

/// Registry operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// TEID not present in the tunnel table
    #[error("Unknown tunnel TEID {0:#x}")]
    UnknownTunnel(u32),

    /// RNTI not present in the bearer index
    #[error("Unknown user RNTI {0:#x}")]
    UnknownUser(u16),

    /// Rename target already taken
    #[error("RNTI {0:#x} already exists")]
    RntiInUse(u16),

    /// LCID outside the data-bearer range
    #[error("LCID {0} outside the data-bearer range")]
    InvalidLcid(u8),
}

// ============================================================================
// Tunnel record
// ============================================================================

/// Handover options interpreted while adding a bearer tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BearerProps {
    /// Put this pre-existing tunnel into buffering state until the tunnel
    /// being created sees its End Marker (path switch).
    pub flush_before_teid_in: Option<u32>,
    /// Forward everything arriving on this pre-existing tunnel out through
    /// the tunnel being created (indirect data forwarding).
    pub forward_from_teid_in: Option<u32>,
}

/// Downlink disposition of a tunnel. Forwarding, buffering and plain
/// delivery are mutually exclusive states, not independent flags.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum DownlinkState {
    /// Deliver arriving G-PDUs to the upper layer
    #[default]
    Normal,
    /// Re-send arriving G-PDUs on another local tunnel (indirect data
    /// forwarding during handover)
    Forwarding { target_teid_in: u32 },
    /// Queue arriving G-PDUs until an End Marker arrives on the named
    /// prior tunnel (path switch)
    Buffering {
        prior_teid_in: u32,
        pending: VecDeque<Bytes>,
    },
}

/// One unidirectional tunnel pair endpoint, keyed by its inbound TEID.
#[derive(Debug)]
pub struct Tunnel {
    pub teid_in: u32,
    pub rnti: u16,
    pub lcid: u8,
    /// Remote endpoint (S-GW or peer eNB) the outbound direction sends to
    pub peer_addr: Ipv4Addr,
    /// TEID written into headers of packets sent on this tunnel
    pub teid_out: u32,
    pub state: DownlinkState,
}

/// Outcome of queueing a packet on a buffering tunnel
#[derive(Debug, PartialEq, Eq)]
pub enum PendingPush {
    Queued(usize),
    /// Queue at capacity; the packet was dropped
    Dropped,
}

/// A flush queue released by an End Marker or an orphaned predecessor,
/// ready for in-order delivery to the upper layer.
#[derive(Debug)]
pub struct FlushedQueue {
    pub rnti: u16,
    pub lcid: u8,
    pub pending: VecDeque<Bytes>,
}

/// What `unlink` removed, plus the cleanup it had to do on tunnels that
/// referenced the removed TEID.
#[derive(Debug)]
pub struct UnlinkedTunnel {
    pub tunnel: Tunnel,
    /// Tunnels whose forwarding target was the removed TEID, reverted to
    /// Normal
    pub cleared_forwards: Vec<u32>,
    /// Queues of tunnels that were buffering for the removed TEID; their
    /// End Marker can never arrive, so they are released for delivery
    pub orphaned_queues: Vec<FlushedQueue>,
}

type BearerLists = [Vec<u32>; RADIO_BEARER_COUNT];

// ============================================================================
// Registry
// ============================================================================

/// Authoritative tunnel state: TEID-keyed table, (RNTI, LCID) index and the
/// monotonic TEID allocator. Callers guard the whole registry with a single
/// lock; no operation here blocks or performs I/O.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: HashMap<u32, Tunnel>,
    users: HashMap<u16, BearerLists>,
    next_teid_in: u32,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next inbound TEID. Pre-incremented; never 0, never a
    /// currently-live TEID, so wrap-around cannot alias in-flight packets.
    fn allocate_teid(&mut self) -> u32 {
        loop {
            self.next_teid_in = self.next_teid_in.wrapping_add(1);
            let teid = self.next_teid_in;
            if teid != 0 && !self.tunnels.contains_key(&teid) {
                return teid;
            }
        }
    }

    /// Insert a new tunnel and append it to its bearer list. Returns the
    /// allocated inbound TEID.
    pub fn insert(
        &mut self,
        rnti: u16,
        lcid: u8,
        peer_addr: Ipv4Addr,
        teid_out: u32,
    ) -> Result<u32, RegistryError> {
        if (lcid as usize) < SRB_COUNT || (lcid as usize) >= RADIO_BEARER_COUNT {
            return Err(RegistryError::InvalidLcid(lcid));
        }

        let teid_in = self.allocate_teid();
        self.tunnels.insert(
            teid_in,
            Tunnel {
                teid_in,
                rnti,
                lcid,
                peer_addr,
                teid_out,
                state: DownlinkState::Normal,
            },
        );
        self.users.entry(rnti).or_default()[lcid as usize].push(teid_in);
        Ok(teid_in)
    }

    /// Put `existing` into buffering state: arriving G-PDUs queue until an
    /// End Marker arrives on `prior_teid_in` (the newly created tunnel).
    pub fn arm_buffering(&mut self, existing: u32, prior_teid_in: u32) -> Result<(), RegistryError> {
        let tun = self
            .tunnels
            .get_mut(&existing)
            .ok_or(RegistryError::UnknownTunnel(existing))?;
        if !matches!(tun.state, DownlinkState::Normal) {
            log::warn!(
                "Tunnel TEID In={:#x} re-armed for buffering while in {:?}",
                existing,
                tun.state
            );
        }
        tun.state = DownlinkState::Buffering {
            prior_teid_in,
            pending: VecDeque::new(),
        };
        Ok(())
    }

    /// Put `source` into forwarding state toward `target_teid_in`. Returns
    /// the source's (RNTI, LCID) so the caller can drain upper-layer queues.
    pub fn arm_forwarding(
        &mut self,
        source: u32,
        target_teid_in: u32,
    ) -> Result<(u16, u8), RegistryError> {
        let tun = self
            .tunnels
            .get_mut(&source)
            .ok_or(RegistryError::UnknownTunnel(source))?;
        if let DownlinkState::Buffering { ref pending, .. } = tun.state {
            log::warn!(
                "Tunnel TEID In={:#x} switched to forwarding, discarding {} buffered packets",
                source,
                pending.len()
            );
        }
        tun.state = DownlinkState::Forwarding { target_teid_in };
        Ok((tun.rnti, tun.lcid))
    }

    /// Queue a packet on a buffering tunnel, drop-tail at capacity.
    pub fn push_pending(&mut self, teid_in: u32, pkt: Bytes) -> Result<PendingPush, RegistryError> {
        let tun = self
            .tunnels
            .get_mut(&teid_in)
            .ok_or(RegistryError::UnknownTunnel(teid_in))?;
        match tun.state {
            DownlinkState::Buffering { ref mut pending, .. } => {
                if pending.len() >= PENDING_QUEUE_CAP {
                    Ok(PendingPush::Dropped)
                } else {
                    pending.push_back(pkt);
                    Ok(PendingPush::Queued(pending.len()))
                }
            }
            _ => Err(RegistryError::UnknownTunnel(teid_in)),
        }
    }

    /// Clear a forwarding state, returning the target TEID it pointed at.
    pub fn clear_forwarding(&mut self, teid_in: u32) -> Option<u32> {
        let tun = self.tunnels.get_mut(&teid_in)?;
        match tun.state {
            DownlinkState::Forwarding { target_teid_in } => {
                tun.state = DownlinkState::Normal;
                Some(target_teid_in)
            }
            _ => None,
        }
    }

    /// Release every same-bearer tunnel buffering for `end_teid_in` (the
    /// tunnel an End Marker just arrived on). Queues come back in bearer
    /// order for FIFO delivery; the tunnels revert to Normal.
    pub fn take_flushes_for(&mut self, end_teid_in: u32) -> Vec<FlushedQueue> {
        let Some(tun) = self.tunnels.get(&end_teid_in) else {
            return Vec::new();
        };
        let (rnti, lcid) = (tun.rnti, tun.lcid);

        let mut flushed = Vec::new();
        let Some(bearers) = self.users.get(&rnti) else {
            return flushed;
        };
        for teid in bearers[lcid as usize].clone() {
            if teid == end_teid_in {
                continue;
            }
            let Some(other) = self.tunnels.get_mut(&teid) else {
                continue;
            };
            if let DownlinkState::Buffering { prior_teid_in, ref mut pending } = other.state {
                if prior_teid_in == end_teid_in {
                    flushed.push(FlushedQueue {
                        rnti: other.rnti,
                        lcid: other.lcid,
                        pending: std::mem::take(pending),
                    });
                    other.state = DownlinkState::Normal;
                }
            }
        }
        flushed
    }

    /// Remove a tunnel from both views and scrub references to it held by
    /// other tunnels. Removing the user's last tunnel drops the user entry.
    pub fn unlink(&mut self, teid_in: u32) -> Option<UnlinkedTunnel> {
        let tunnel = self.tunnels.remove(&teid_in)?;

        if let Some(bearers) = self.users.get_mut(&tunnel.rnti) {
            bearers[tunnel.lcid as usize].retain(|&t| t != teid_in);
            if bearers.iter().all(|list| list.is_empty()) {
                self.users.remove(&tunnel.rnti);
            }
        }

        let mut cleared_forwards = Vec::new();
        let mut orphaned_queues = Vec::new();
        for other in self.tunnels.values_mut() {
            match other.state {
                DownlinkState::Forwarding { target_teid_in } if target_teid_in == teid_in => {
                    other.state = DownlinkState::Normal;
                    cleared_forwards.push(other.teid_in);
                }
                DownlinkState::Buffering { prior_teid_in, ref mut pending }
                    if prior_teid_in == teid_in =>
                {
                    orphaned_queues.push(FlushedQueue {
                        rnti: other.rnti,
                        lcid: other.lcid,
                        pending: std::mem::take(pending),
                    });
                    other.state = DownlinkState::Normal;
                }
                _ => {}
            }
        }

        Some(UnlinkedTunnel {
            tunnel,
            cleared_forwards,
            orphaned_queues,
        })
    }

    /// Move a user's entire bearer map to a new RNTI and rewrite the RNTI
    /// of every tunnel under it.
    pub fn rename_user(&mut self, old_rnti: u16, new_rnti: u16) -> Result<(), RegistryError> {
        if self.users.contains_key(&new_rnti) {
            return Err(RegistryError::RntiInUse(new_rnti));
        }
        let bearers = self
            .users
            .remove(&old_rnti)
            .ok_or(RegistryError::UnknownUser(old_rnti))?;
        for list in bearers.iter() {
            for teid in list {
                if let Some(tun) = self.tunnels.get_mut(teid) {
                    tun.rnti = new_rnti;
                }
            }
        }
        self.users.insert(new_rnti, bearers);
        Ok(())
    }

    pub fn lookup(&self, teid_in: u32) -> Option<&Tunnel> {
        self.tunnels.get(&teid_in)
    }

    pub fn contains(&self, teid_in: u32) -> bool {
        self.tunnels.contains_key(&teid_in)
    }

    pub fn user_exists(&self, rnti: u16) -> bool {
        self.users.contains_key(&rnti)
    }

    /// Ordered inbound TEIDs of a bearer; position 0 is the primary.
    pub fn bearer_teids(&self, rnti: u16, lcid: u8) -> &[u32] {
        self.users
            .get(&rnti)
            .and_then(|bearers| bearers.get(lcid as usize))
            .map_or(&[], |list| list.as_slice())
    }

    pub fn primary_teid(&self, rnti: u16, lcid: u8) -> Option<u32> {
        self.bearer_teids(rnti, lcid).first().copied()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    #[cfg(test)]
    pub fn set_next_teid(&mut self, next: u32) {
        self.next_teid_in = next;
    }

    /// Cross-check the two views of the relation; test support only.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for (teid, tun) in &self.tunnels {
            assert_eq!(*teid, tun.teid_in);
            let list = self.bearer_teids(tun.rnti, tun.lcid);
            assert_eq!(
                list.iter().filter(|&&t| t == *teid).count(),
                1,
                "TEID {teid:#x} not indexed exactly once"
            );
            match tun.state {
                DownlinkState::Forwarding { target_teid_in } => {
                    assert!(self.tunnels.contains_key(&target_teid_in));
                }
                DownlinkState::Buffering { prior_teid_in, .. } => {
                    assert!(self.tunnels.contains_key(&prior_teid_in));
                }
                DownlinkState::Normal => {}
            }
        }
        for (rnti, bearers) in &self.users {
            assert!(bearers.iter().any(|list| !list.is_empty()));
            for list in bearers.iter() {
                for teid in list {
                    let tun = self.tunnels.get(teid).expect("indexed TEID not in table");
                    assert_eq!(tun.rnti, *rnti);
                }
            }
        }
    }
}
