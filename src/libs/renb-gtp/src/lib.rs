//! renb GTP-U Protocol Library
//!
//! This crate provides GTPv1-U header and message building and parsing for
//! the S1-U and M1-U reference points of an LTE base station, as specified
//! in 3GPP TS 29.281.

pub mod error;
pub mod header;
pub mod message;


pub use error::{GtpError, GtpResult};
pub use header::{ExtensionHeader, Gtp1Header, Gtp1uMessageType};

/// GTPv1-U UDP port (2152)
pub const GTPU_PORT: u16 = 2152;

/// M1-U multicast sink UDP port (GTPU_PORT + 1)
pub const M1U_PORT: u16 = GTPU_PORT + 1;

/// GTPv1-U mandatory header length
pub const GTPU_HEADER_LEN: usize = 8;

/// GTPv1-U header length with the optional sequence/N-PDU/next-extension
/// fields present
pub const GTPU_HEADER_LEN_WITH_OPT: usize = 12;
