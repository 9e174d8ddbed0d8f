use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    shared::ConnectionId,
    MAX_CID_SIZE, VERSION,
};

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    /// Packets protected with handshake keys
    Handshake = 1,
    /// Application data space, for post-handshake packets
    Data = 2,
}

impl SpaceId {
    /// All spaces, in key-schedule order
    pub const VALUES: [Self; 3] = [Self::Initial, Self::Handshake, Self::Data];
}

/// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        // From Appendix A.2: the encoding must distinguish twice the range of
        // packets which might be in flight.
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else if range < 1 << 32 {
            Self::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U24(_) => 3,
            Self::U32(_) => 4,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::U8(_) => 0b00,
            Self::U16(_) => 0b01,
            Self::U24(_) => 0b10,
            Self::U32(_) => 0b11,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        match self {
            Self::U8(x) => w.write(x),
            Self::U16(x) => w.write(x),
            Self::U24(x) => w.put_uint(u64::from(x), 3),
            Self::U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        if r.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("truncated packet number"));
        }
        Ok(match len {
            1 => Self::U8(r.get_u8()),
            2 => Self::U16(r.get_u16()),
            3 => Self::U24(r.get_uint(3) as u32),
            4 => Self::U32(r.get_u32()),
            _ => unreachable!("packet number lengths are two bits long"),
        })
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    /// Recover the full packet number given the largest number processed so far
    pub(crate) fn expand(self, expected: u64) -> u64 {
        // From Appendix A.3
        let truncated = match self {
            Self::U8(x) => u64::from(x),
            Self::U16(x) => u64::from(x),
            Self::U24(x) => u64::from(x),
            Self::U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and less than or equal
        // to expected + hwin
        //
        // This means we can't just strip the trailing bits from expected and add the truncated
        // because that might yield a value outside the window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum LongType {
    Handshake,
    ZeroRtt,
}

/// Decoded form of a packet header
///
/// One variant per wire form; a single finalize routine in the transmission
/// pipeline dispatches on this, so the per-variant differences (retry token,
/// length-prefixed CIDs, missing packet number) live here.
#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
    },
    VersionNegotiate {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    /// Append the header encoding, returning the patch state for `finish`
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use Header::*;
        match *self {
            Initial {
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (0x0 << 4) | number.tag());
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0b01 << 14); // Placeholder for payload length
                let len_pos = w.len() - 2;
                number.encode(w);
                PartialEncode {
                    len_pos: Some(len_pos),
                    pn_len: number.len(),
                }
            }
            Long {
                ty,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                let ty_bits = match ty {
                    LongType::ZeroRtt => 0x1,
                    LongType::Handshake => 0x2,
                };
                w.write(LONG_HEADER_FORM | FIXED_BIT | (ty_bits << 4) | number.tag());
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write::<u16>(0b01 << 14); // Placeholder for payload length
                let len_pos = w.len() - 2;
                number.encode(w);
                PartialEncode {
                    len_pos: Some(len_pos),
                    pn_len: number.len(),
                }
            }
            Short { ref dst_cid, number } => {
                w.write(FIXED_BIT | number.tag());
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    len_pos: None,
                    pn_len: number.len(),
                }
            }
            Retry {
                ref src_cid,
                ref dst_cid,
                ref token,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4));
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.put_slice(token);
                PartialEncode {
                    len_pos: None,
                    pn_len: 0,
                }
            }
            VersionNegotiate {
                ref src_cid,
                ref dst_cid,
            } => {
                w.write(LONG_HEADER_FORM);
                w.write::<u32>(0);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write(VERSION);
                PartialEncode {
                    len_pos: None,
                    pn_len: 0,
                }
            }
        }
    }

    /// Whether this variant carries an encrypted payload
    ///
    /// Version Negotiation and Retry are emitted header-only, with no payload
    /// encryption step.
    pub(crate) fn has_payload(&self) -> bool {
        !matches!(*self, Self::Retry { .. } | Self::VersionNegotiate { .. })
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        match *self {
            Self::Initial { .. } => Some(SpaceId::Initial),
            Self::Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Self::Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Self::Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use Header::*;
        match *self {
            Initial { ref dst_cid, .. } => dst_cid,
            Long { ref dst_cid, .. } => dst_cid,
            Short { ref dst_cid, .. } => dst_cid,
            Retry { ref dst_cid, .. } => dst_cid,
            VersionNegotiate { ref dst_cid, .. } => dst_cid,
        }
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use Header::*;
        match *self {
            Initial { number, .. } => Some(number),
            Long { number, .. } => Some(number),
            Short { number, .. } => Some(number),
            _ => None,
        }
    }
}

/// Conservative bound on the encoded header size for a packet in `space`
///
/// Used by the transmission pipeline's size budgeting before the actual CIDs
/// and packet number width are known.
pub(crate) fn max_header_size(space: SpaceId, token_len: usize) -> usize {
    // first byte + pn
    let common = 1 + 4;
    match space {
        SpaceId::Initial => {
            common
                + 4
                + 2 * (1 + MAX_CID_SIZE)
                + crate::VarInt::try_from(token_len).unwrap().size()
                + token_len
                + 2
        }
        SpaceId::Handshake => common + 4 + 2 * (1 + MAX_CID_SIZE) + 2,
        SpaceId::Data => common + MAX_CID_SIZE,
    }
}

/// State needed to finalize a header once the payload length is known
pub(crate) struct PartialEncode {
    len_pos: Option<usize>,
    pn_len: usize,
}

impl PartialEncode {
    /// Patch the payload length field, which covers the packet number and the AEAD tag
    pub(crate) fn set_payload_length(&self, header: &mut [u8], payload_len: usize, tag_len: usize) {
        let Some(pos) = self.len_pos else {
            return;
        };
        let len = self.pn_len + payload_len + tag_len;
        assert!(len < 1 << 14, "packet payload length overflows length field");
        header[pos..pos + 2].copy_from_slice(&(len as u16 | 0b01 << 14).to_be_bytes());
    }
}

/// A packet parsed out of an incoming datagram, payload still sealed
#[derive(Debug)]
pub(crate) struct ProtoPacket {
    pub(crate) header: Header,
    /// Encoded header bytes, the AEAD associated data
    pub(crate) header_bytes: Bytes,
    pub(crate) payload: Bytes,
}

/// Split a datagram into its coalesced packets and decode their headers
pub(crate) fn decode_datagram(
    mut bytes: Bytes,
    local_cid_len: usize,
) -> Result<Vec<ProtoPacket>, PacketDecodeError> {
    let mut packets = Vec::new();
    while bytes.has_remaining() {
        let total = bytes.len();
        let mut buf = &bytes[..];
        let first = BufExt::get::<u8>(&mut buf)?;
        if first & LONG_HEADER_FORM == 0 {
            // Short header: consumes the remainder of the datagram
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader(
                    "destination connection ID longer than packet",
                ));
            }
            let dst_cid = ConnectionId::from_buf(&mut buf, local_cid_len);
            let number = PacketNumber::decode(PacketNumber::decode_len(first), &mut buf)?;
            let header_len = total - buf.remaining();
            let header_bytes = bytes.split_to(header_len);
            packets.push(ProtoPacket {
                header: Header::Short { dst_cid, number },
                header_bytes,
                payload: std::mem::take(&mut bytes),
            });
            break;
        }

        let version = BufExt::get::<u32>(&mut buf)?;
        let dst_cid = ConnectionId::decode_long(&mut buf)
            .ok_or(PacketDecodeError::InvalidHeader("malformed destination CID"))?;
        let src_cid = ConnectionId::decode_long(&mut buf)
            .ok_or(PacketDecodeError::InvalidHeader("malformed source CID"))?;

        if version == 0 {
            // Version negotiation consumes the remainder of the datagram
            let header_len = total - buf.remaining();
            let header_bytes = bytes.split_to(header_len);
            packets.push(ProtoPacket {
                header: Header::VersionNegotiate { src_cid, dst_cid },
                header_bytes,
                payload: std::mem::take(&mut bytes),
            });
            break;
        }
        if version != VERSION {
            return Err(PacketDecodeError::UnsupportedVersion {
                source: src_cid,
                destination: dst_cid,
            });
        }
        if first & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }

        match (first & 0x30) >> 4 {
            0x3 => {
                // Retry: token is the remainder of the datagram
                let header_len = total - buf.remaining();
                let header_bytes = bytes.split_to(header_len);
                packets.push(ProtoPacket {
                    header: Header::Retry {
                        src_cid,
                        dst_cid,
                        token: std::mem::take(&mut bytes),
                    },
                    header_bytes,
                    payload: Bytes::new(),
                });
                break;
            }
            ty => {
                let token = if ty == 0x0 {
                    let token_len = buf.get_var()?;
                    if token_len > buf.remaining() as u64 {
                        return Err(PacketDecodeError::InvalidHeader("token longer than packet"));
                    }
                    let token_pos = total - buf.remaining();
                    buf.advance(token_len as usize);
                    Some(bytes.slice(token_pos..token_pos + token_len as usize))
                } else {
                    None
                };
                let len = buf.get_var()?;
                if len > buf.remaining() as u64 {
                    return Err(PacketDecodeError::InvalidHeader("payload longer than packet"));
                }
                let pn_len = PacketNumber::decode_len(first);
                let number = PacketNumber::decode(pn_len, &mut buf)?;
                if (len as usize) < pn_len {
                    return Err(PacketDecodeError::InvalidHeader("payload length too small"));
                }
                let header_len = total - buf.remaining();
                let payload_len = len as usize - pn_len;
                let header_bytes = bytes.split_to(header_len);
                let payload = bytes.split_to(payload_len);
                let header = match ty {
                    0x0 => Header::Initial {
                        src_cid,
                        dst_cid,
                        token: token.unwrap(),
                        number,
                    },
                    0x1 => Header::Long {
                        ty: LongType::ZeroRtt,
                        src_cid,
                        dst_cid,
                        number,
                    },
                    0x2 => Header::Long {
                        ty: LongType::Handshake,
                        src_cid,
                        dst_cid,
                        number,
                    },
                    _ => unreachable!("two-bit long packet type"),
                };
                packets.push(ProtoPacket {
                    header,
                    header_bytes,
                    payload,
                });
            }
        }
    }
    Ok(packets)
}

/// Errors encountered while parsing a packet header
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PacketDecodeError {
    /// The packet's version does not match this endpoint's
    #[error("unsupported version")]
    UnsupportedVersion {
        /// Source CID of the offending packet
        source: ConnectionId,
        /// Destination CID of the offending packet
        destination: ConnectionId,
    },
    /// The header was malformed
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

#[cfg(test)]
mod tests {
    use super::*;

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut &buf[..]).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn roundtrip_packet_numbers() {
        check_pn(PacketNumber::U8(0x7f), &[0x7f]);
        check_pn(PacketNumber::U16(0x80), &[0x00, 0x80]);
        check_pn(PacketNumber::U16(0x3fff), &[0x3f, 0xff]);
        check_pn(PacketNumber::U32(0x0000_4000), &[0x00, 0x00, 0x40, 0x00]);
        check_pn(PacketNumber::U32(0xffff_ffff), &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, 0), &[0x10]);
        check_pn(PacketNumber::new(0x100, 0), &[0x01, 0x00]);
        check_pn(PacketNumber::new(0x10000, 0), &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(actual, PacketNumber::new(actual, expected).expand(expected));
            }
        }
    }

    #[test]
    fn header_roundtrip() {
        let src_cid = ConnectionId::new(&[0x11; 8]);
        let dst_cid = ConnectionId::new(&[0x22; 8]);
        let header = Header::Initial {
            src_cid,
            dst_cid,
            token: Bytes::from_static(b"tok"),
            number: PacketNumber::U16(0x42),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let payload = [0xaa; 11];
        partial.set_payload_length(&mut buf, payload.len(), 16);
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&[0; 16]); // stand-in for the AEAD tag

        let packets = decode_datagram(Bytes::from(buf), 8).unwrap();
        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        match packet.header {
            Header::Initial {
                src_cid: s,
                dst_cid: d,
                ref token,
                number,
            } => {
                assert_eq!(s, src_cid);
                assert_eq!(d, dst_cid);
                assert_eq!(&token[..], b"tok");
                assert_eq!(number, PacketNumber::U16(0x42));
            }
            _ => panic!("unexpected header {:?}", packet.header),
        }
        assert_eq!(packet.payload.len(), payload.len() + 16);
    }

    #[test]
    fn coalesced_packets_split() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            let header = Header::Long {
                ty: LongType::Handshake,
                src_cid: ConnectionId::new(&[1; 4]),
                dst_cid: ConnectionId::new(&[2; 4]),
                number: PacketNumber::U8(7),
            };
            let partial = header.encode(&mut buf);
            let start = buf.len();
            buf.extend_from_slice(&[0xbb; 20]);
            let payload_len = buf.len() - start;
            partial.set_payload_length(&mut buf, payload_len, 0);
        }
        let packets = decode_datagram(Bytes::from(buf), 4).unwrap();
        assert_eq!(packets.len(), 2);
        for packet in &packets {
            assert_eq!(packet.payload.len(), 20);
        }
    }

    #[test]
    fn version_negotiation_consumes_datagram() {
        let mut buf = Vec::new();
        let header = Header::VersionNegotiate {
            src_cid: ConnectionId::new(&[1; 4]),
            dst_cid: ConnectionId::new(&[2; 4]),
        };
        header.encode(&mut buf);
        let packets = decode_datagram(Bytes::from(buf), 4).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].header.has_payload());
    }
}
