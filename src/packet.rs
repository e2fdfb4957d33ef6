//! Two-stage packet header parsing
//!
//! Routing must not depend on a full header parse: the dispatcher first
//! decodes only the version-invariant prefix (header form, destination
//! connection ID, and the version for long headers), looks the destination
//! up, and only then finishes the parse. Fields such as the packet number
//! length can only be interpreted once the registry lookup has established
//! who sent the packet and which version is in effect, so [`PartialDecode`]
//! holds the raw datagram until [`PartialDecode::finish`] is called with
//! that information.

use std::io;

use bytes::BytesMut;
use thiserror::Error;

use crate::coding::{BufExt, UnexpectedEnd};
use crate::{cid::ConnectionId, Side, MAX_CID_SIZE};

const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;

/// A datagram whose invariant prefix has been decoded
///
/// Owns the raw bytes; consumed by [`finish`](Self::finish) once routing has
/// determined the sender's side and the connection's version.
pub struct PartialDecode {
    invariant: InvariantHeader,
    bytes: BytesMut,
    invariant_end: usize,
}

impl PartialDecode {
    /// Decode the invariant prefix of `bytes`
    ///
    /// `local_cid_len` is the fixed length of IDs this endpoint issues, which
    /// short headers do not carry explicitly.
    pub fn new(bytes: BytesMut, local_cid_len: usize) -> Result<Self, PacketDecodeError> {
        let mut buf = io::Cursor::new(&bytes[..]);
        let invariant = InvariantHeader::decode(&mut buf, local_cid_len)?;
        let invariant_end = buf.position() as usize;
        Ok(Self {
            invariant,
            bytes,
            invariant_end,
        })
    }

    /// The destination connection ID, used as the routing key
    pub fn dst_cid(&self) -> ConnectionId {
        self.invariant.dst_cid()
    }

    /// Whether the packet carries a long header
    pub fn is_long_header(&self) -> bool {
        matches!(self.invariant, InvariantHeader::Long { .. })
    }

    /// The wire version, if the header form carries one
    pub fn wire_version(&self) -> Option<u32> {
        match self.invariant {
            InvariantHeader::Long { version, .. } => Some(version),
            InvariantHeader::Short { .. } => None,
        }
    }

    /// The entire datagram, including the already-decoded prefix
    pub fn datagram(&self) -> &[u8] {
        &self.bytes
    }

    /// Complete the parse once the sender's side and version are known
    ///
    /// Returns the full header and the bytes following it. The payload is
    /// not validated against any declared length here; that is the
    /// dispatcher's decision to make.
    pub fn finish(self, side_of_sender: Side, version: u32) -> Result<Packet, PacketDecodeError> {
        let Self {
            invariant,
            mut bytes,
            invariant_end,
        } = self;
        let mut buf = io::Cursor::new(&bytes[..]);
        buf.set_position(invariant_end as u64);
        let header = match invariant {
            InvariantHeader::Long {
                first,
                version: 0,
                dst_cid,
                src_cid,
            } => {
                // Only servers negotiate versions
                if side_of_sender.is_client() {
                    return Err(PacketDecodeError::InvalidHeader(
                        "version negotiation packet from a client",
                    ));
                }
                Header::VersionNegotiate {
                    random: first & !LONG_HEADER_FORM,
                    dst_cid,
                    src_cid,
                }
            }
            InvariantHeader::Long {
                first,
                version,
                dst_cid,
                src_cid,
            } => {
                if first & FIXED_BIT == 0 {
                    return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
                }
                let length = buf.get_var()?;
                let number = PacketNumber::decode(PacketNumber::decode_len(first), &mut buf)?;
                Header::Long {
                    version,
                    dst_cid,
                    src_cid,
                    length,
                    number,
                }
            }
            InvariantHeader::Short { first, dst_cid } => {
                if version == 0 {
                    return Err(PacketDecodeError::InvalidHeader(
                        "short header before version negotiation",
                    ));
                }
                if first & FIXED_BIT == 0 {
                    return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
                }
                let number = PacketNumber::decode(PacketNumber::decode_len(first), &mut buf)?;
                Header::Short {
                    dst_cid,
                    number,
                    key_phase: first & KEY_PHASE_BIT != 0,
                }
            }
        };
        let header_len = buf.position() as usize;
        let payload = bytes.split_off(header_len);
        Ok(Packet { header, payload })
    }
}

/// A fully parsed packet
pub struct Packet {
    /// The decoded header
    pub header: Header,
    /// Everything after the header, including the declared-length region for
    /// long headers
    pub payload: BytesMut,
}

/// Decoded packet header
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Header {
    /// Long header, used before a connection is established
    Long {
        /// Wire version
        version: u32,
        /// Destination connection ID
        dst_cid: ConnectionId,
        /// Source connection ID
        src_cid: ConnectionId,
        /// Declared length of packet number plus payload, in bytes
        length: u64,
        /// Packet number
        number: PacketNumber,
    },
    /// Short header, used once a connection is established
    Short {
        /// Destination connection ID
        dst_cid: ConnectionId,
        /// Packet number
        number: PacketNumber,
        /// Key phase bit
        key_phase: bool,
    },
    /// Version negotiation, sent by a server that does not support the
    /// version the client offered
    VersionNegotiate {
        /// The low bits of the first byte, chosen at random by the sender
        random: u8,
        /// Destination connection ID
        dst_cid: ConnectionId,
        /// Source connection ID
        src_cid: ConnectionId,
    },
}

impl Header {
    /// The destination connection ID
    pub fn dst_cid(&self) -> ConnectionId {
        use Header::*;
        match self {
            Long { dst_cid, .. } => *dst_cid,
            Short { dst_cid, .. } => *dst_cid,
            VersionNegotiate { dst_cid, .. } => *dst_cid,
        }
    }
}

pub(crate) enum InvariantHeader {
    Long {
        first: u8,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        first: u8,
        dst_cid: ConnectionId,
    },
}

impl InvariantHeader {
    fn dst_cid(&self) -> ConnectionId {
        match self {
            Self::Long { dst_cid, .. } => *dst_cid,
            Self::Short { dst_cid, .. } => *dst_cid,
        }
    }

    fn decode<R: bytes::Buf>(buf: &mut R, local_cid_len: usize) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader(
                    "destination connection ID longer than packet",
                ));
            }
            let dst_cid = ConnectionId::from_buf(buf, local_cid_len);
            Ok(Self::Short { first, dst_cid })
        } else {
            let version = buf.get::<u32>()?;
            let ci_lengths = buf.get::<u8>()?;
            let mut dcil = (ci_lengths >> 4) as usize;
            if dcil > 0 {
                dcil += 3
            }
            let mut scil = (ci_lengths & 0xf) as usize;
            if scil > 0 {
                scil += 3
            }
            debug_assert!(dcil <= MAX_CID_SIZE && scil <= MAX_CID_SIZE);
            if buf.remaining() < dcil + scil {
                return Err(PacketDecodeError::InvalidHeader(
                    "connection IDs longer than packet",
                ));
            }
            let dst_cid = ConnectionId::from_buf(buf, dcil);
            let src_cid = ConnectionId::from_buf(buf, scil);
            Ok(Self::Long {
                first,
                version,
                dst_cid,
                src_cid,
            })
        }
    }
}

/// An encoded packet number
///
/// The encoding truncates the full number to the window the sender expects
/// the receiver to be in; expansion is the owning connection's job, not the
/// routing layer's.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    /// 1 byte
    U8(u8),
    /// 2 bytes
    U16(u16),
    /// 3 bytes
    U24(u32),
    /// 4 bytes
    U32(u32),
}

impl PacketNumber {
    /// The length of the encoding in bytes
    pub fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn decode<R: bytes::Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        if r.remaining() < len {
            return Err(UnexpectedEnd.into());
        }
        Ok(match len {
            1 => U8(r.get_u8()),
            2 => U16(r.get_u16()),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get_u32()),
            _ => unreachable!(),
        })
    }

    /// Encoded length as declared by the low bits of the first header byte
    pub(crate) fn decode_len(first: u8) -> usize {
        1 + (first & 0x03) as usize
    }
}

/// Reasons a header failed to decode
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PacketDecodeError {
    /// The packet ended in the middle of a header field
    #[error("packet too short: {0}")]
    UnexpectedEnd(#[from] UnexpectedEnd),
    /// A header field held an impossible value
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}
