//! GTPv1-U Datagram Builders
//!
//! Ready-to-send datagrams for the path-management and tunnel-management
//! messages the endpoint emits. G-PDUs are built around a caller-supplied
//! IP payload.

use crate::header::{Gtp1Header, Gtp1uMessageType};
use bytes::{BufMut, BytesMut};

/// Echo Response echoing the request's sequence number. 12 bytes on the
/// wire: mandatory header plus the sequence/N-PDU/next-extension block.
pub fn echo_response(seq: u16) -> BytesMut {
    let mut header = Gtp1Header::new(Gtp1uMessageType::EchoResponse as u8, 0);
    header.sequence_number = Some(seq);
    header.length = header.wire_length(0);

    let mut buf = BytesMut::with_capacity(header.header_len());
    header.encode(&mut buf);
    buf
}

/// Error Indication naming the offending TEID, stamped with the caller's
/// monotonic tx sequence number. 12 bytes on the wire.
pub fn error_indication(err_teid: u32, seq: u16) -> BytesMut {
    let mut header = Gtp1Header::new(Gtp1uMessageType::ErrorIndication as u8, err_teid);
    header.sequence_number = Some(seq);
    header.length = header.wire_length(0);

    let mut buf = BytesMut::with_capacity(header.header_len());
    header.encode(&mut buf);
    buf
}

/// End Marker for an outbound tunnel. Header-only, 8 bytes on the wire.
pub fn end_marker(teid_out: u32) -> BytesMut {
    let header = Gtp1Header::new(Gtp1uMessageType::EndMarker as u8, teid_out);

    let mut buf = BytesMut::with_capacity(header.header_len());
    header.encode(&mut buf);
    buf
}

/// G-PDU carrying a user IP packet, optionally tagged with a PDCP PDU
/// Number extension.
pub fn gpdu(teid_out: u32, payload: &[u8], pdcp_sn: Option<u16>) -> BytesMut {
    let mut header = Gtp1Header::new_gpdu(teid_out);
    if let Some(sn) = pdcp_sn {
        header = header.with_pdcp_pdu_number(sn);
    }
    header.length = header.wire_length(payload.len());

    let mut buf = BytesMut::with_capacity(header.header_len() + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf
}
