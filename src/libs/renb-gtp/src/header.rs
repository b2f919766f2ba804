//! GTPv1-U Header
//!
//! Header structure and extension-header chain as specified in
//! 3GPP TS 29.281, section 5.

use crate::error::{GtpError, GtpResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// GTPv1 Version
pub const GTP1_VERSION_1: u8 = 1;

/// GTPv1-U Flags
pub const GTP1U_FLAGS_V: u8 = 0x20;
pub const GTP1U_FLAGS_PT: u8 = 0x10;
pub const GTP1U_FLAGS_E: u8 = 0x04;
pub const GTP1U_FLAGS_S: u8 = 0x02;
pub const GTP1U_FLAGS_PN: u8 = 0x01;

/// Extension header type: UDP Port (TS 29.281, 5.2.2.1)
pub const EXT_TYPE_UDP_PORT: u8 = 0x40;
/// Extension header type: NR RAN Container (TS 29.281, 5.2.2.6)
pub const EXT_TYPE_NR_RAN_CONTAINER: u8 = 0x84;
/// Extension header type: PDU Session Container (TS 29.281, 5.2.2.7)
pub const EXT_TYPE_PDU_SESSION_CONTAINER: u8 = 0x85;
/// Extension header type: PDCP PDU Number (TS 29.281, 5.2.2.2)
pub const EXT_TYPE_PDCP_PDU_NUMBER: u8 = 0xC0;

/// GTPv1-U Message Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gtp1uMessageType {
    EchoRequest = 1,
    EchoResponse = 2,
    ErrorIndication = 26,
    SupportedExtensionHeadersNotification = 31,
    EndMarker = 254,
    GPdu = 255,
}

impl TryFrom<u8> for Gtp1uMessageType {
    type Error = GtpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Gtp1uMessageType::EchoRequest),
            2 => Ok(Gtp1uMessageType::EchoResponse),
            26 => Ok(Gtp1uMessageType::ErrorIndication),
            31 => Ok(Gtp1uMessageType::SupportedExtensionHeadersNotification),
            254 => Ok(Gtp1uMessageType::EndMarker),
            255 => Ok(Gtp1uMessageType::GPdu),
            _ => Err(GtpError::InvalidMessageType(value)),
        }
    }
}

/// One entry of the extension-header chain.
///
/// On the wire each entry occupies `length * 4` bytes laid out as
/// `[length, content..., next-type]`, so the content is always two bytes
/// short of a multiple of four. The chain is terminated by next-type 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionHeader {
    ext_type: u8,
    content: Vec<u8>,
}

impl ExtensionHeader {
    /// Create an extension header, validating that the content can be
    /// framed in 4-byte units.
    pub fn new(ext_type: u8, content: Vec<u8>) -> GtpResult<Self> {
        if (content.len() + 2) % 4 != 0 || content.len() + 2 > 255 * 4 {
            return Err(GtpError::InvalidExtensionContent { len: content.len() });
        }
        Ok(Self { ext_type, content })
    }

    /// PDCP PDU Number extension carrying a big-endian sequence number.
    pub fn pdcp_pdu_number(sn: u16) -> Self {
        Self {
            ext_type: EXT_TYPE_PDCP_PDU_NUMBER,
            content: sn.to_be_bytes().to_vec(),
        }
    }

    pub fn ext_type(&self) -> u8 {
        self.ext_type
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Bytes this entry occupies on the wire (length byte + content +
    /// next-type byte).
    pub fn encoded_len(&self) -> usize {
        self.content.len() + 2
    }
}

/// GTPv1-U Header
///
/// The S, PN and E flag bits are derived from the optional fields: a header
/// carries a sequence number iff `sequence_number` is `Some`, and the
/// extension bit iff `extensions` is non-empty. Whenever any of the three is
/// present the full 4-byte optional field block is emitted, with absent
/// fields zeroed (TS 29.281, 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gtp1Header {
    /// Version (3 bits) - should be 1 for GTPv1
    pub version: u8,
    /// Protocol Type (1 bit) - 1 for GTP, 0 for GTP'
    pub pt: bool,
    /// Message Type
    pub message_type: u8,
    /// Message Length (bytes following the mandatory 8-byte header)
    pub length: u16,
    /// Tunnel Endpoint Identifier
    pub teid: u32,
    /// Sequence Number (optional)
    pub sequence_number: Option<u16>,
    /// N-PDU Number (optional)
    pub npdu_number: Option<u8>,
    /// Extension-header chain, in wire order
    pub extensions: Vec<ExtensionHeader>,
}

impl Gtp1Header {
    /// Create a new GTPv1-U header
    pub fn new(message_type: u8, teid: u32) -> Self {
        Self {
            version: GTP1_VERSION_1,
            pt: true,
            message_type,
            length: 0,
            teid,
            sequence_number: None,
            npdu_number: None,
            extensions: Vec::new(),
        }
    }

    /// Create a GTPv1-U header for G-PDU
    pub fn new_gpdu(teid: u32) -> Self {
        Self::new(Gtp1uMessageType::GPdu as u8, teid)
    }

    /// Append a PDCP PDU Number extension
    pub fn with_pdcp_pdu_number(mut self, sn: u16) -> Self {
        self.extensions.push(ExtensionHeader::pdcp_pdu_number(sn));
        self
    }

    /// Sequence number carried in a PDCP PDU Number extension, if any.
    /// Read big-endian, matching the writer.
    pub fn pdcp_pdu_number(&self) -> Option<u16> {
        self.extensions
            .iter()
            .find(|e| e.ext_type == EXT_TYPE_PDCP_PDU_NUMBER)
            .and_then(|e| e.content.get(..2))
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
    }

    /// Get the flags byte
    pub fn flags(&self) -> u8 {
        let mut flags = (self.version & 0x07) << 5;
        if self.pt {
            flags |= GTP1U_FLAGS_PT;
        }
        if !self.extensions.is_empty() {
            flags |= GTP1U_FLAGS_E;
        }
        if self.sequence_number.is_some() {
            flags |= GTP1U_FLAGS_S;
        }
        if self.npdu_number.is_some() {
            flags |= GTP1U_FLAGS_PN;
        }
        flags
    }

    /// Check if the optional field block is present
    pub fn has_optional_fields(&self) -> bool {
        self.sequence_number.is_some() || self.npdu_number.is_some() || !self.extensions.is_empty()
    }

    /// Total header length on the wire
    pub fn header_len(&self) -> usize {
        let mut len = crate::GTPU_HEADER_LEN;
        if self.has_optional_fields() {
            len += 4;
            len += self.extensions.iter().map(|e| e.encoded_len()).sum::<usize>();
        }
        len
    }

    /// The value of the length field for a given payload size: everything
    /// after the mandatory 8-byte header.
    pub fn wire_length(&self, payload_len: usize) -> u16 {
        (self.header_len() - crate::GTPU_HEADER_LEN + payload_len) as u16
    }

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags());
        buf.put_u8(self.message_type);
        buf.put_u16(self.length);
        buf.put_u32(self.teid);

        if self.has_optional_fields() {
            buf.put_u16(self.sequence_number.unwrap_or(0));
            buf.put_u8(self.npdu_number.unwrap_or(0));
            buf.put_u8(self.extensions.first().map_or(0, |e| e.ext_type));
            for (i, ext) in self.extensions.iter().enumerate() {
                buf.put_u8((ext.encoded_len() / 4) as u8);
                buf.put_slice(&ext.content);
                buf.put_u8(self.extensions.get(i + 1).map_or(0, |e| e.ext_type));
            }
        }
    }

    /// Decode header from bytes, advancing `buf` past the header so the
    /// remainder is the payload.
    pub fn decode(buf: &mut Bytes) -> GtpResult<Self> {
        if buf.remaining() < crate::GTPU_HEADER_LEN {
            return Err(GtpError::BufferTooShort {
                needed: crate::GTPU_HEADER_LEN,
                available: buf.remaining(),
            });
        }

        let flags = buf.get_u8();
        let version = (flags >> 5) & 0x07;
        if version != GTP1_VERSION_1 {
            return Err(GtpError::InvalidVersion(version));
        }
        let pt = (flags & GTP1U_FLAGS_PT) != 0;
        if !pt {
            return Err(GtpError::InvalidProtocolType);
        }
        let e = (flags & GTP1U_FLAGS_E) != 0;
        let s = (flags & GTP1U_FLAGS_S) != 0;
        let pn = (flags & GTP1U_FLAGS_PN) != 0;

        let message_type = buf.get_u8();
        let length = buf.get_u16();
        let teid = buf.get_u32();

        let mut header = Self {
            version,
            pt,
            message_type,
            length,
            teid,
            sequence_number: None,
            npdu_number: None,
            extensions: Vec::new(),
        };

        if e || s || pn {
            if buf.remaining() < 4 {
                return Err(GtpError::BufferTooShort {
                    needed: 4,
                    available: buf.remaining(),
                });
            }
            let seq = buf.get_u16();
            let npdu = buf.get_u8();
            let mut next = buf.get_u8();
            if s {
                header.sequence_number = Some(seq);
            }
            if pn {
                header.npdu_number = Some(npdu);
            }

            // Walk the chain only when the E flag is set; a stray next-type
            // byte without E is ignored per TS 29.281.
            while e && next != 0 {
                if buf.remaining() < 1 {
                    return Err(GtpError::BufferTooShort {
                        needed: 1,
                        available: 0,
                    });
                }
                let units = buf.get_u8();
                if units == 0 {
                    return Err(GtpError::ZeroExtensionLength(next));
                }
                let content_len = units as usize * 4 - 2;
                if buf.remaining() < content_len + 1 {
                    return Err(GtpError::BufferTooShort {
                        needed: content_len + 1,
                        available: buf.remaining(),
                    });
                }
                let content = buf.copy_to_bytes(content_len).to_vec();
                let ext_type = next;
                next = buf.get_u8();
                header.extensions.push(ExtensionHeader { ext_type, content });
            }
        }

        Ok(header)
    }
}
