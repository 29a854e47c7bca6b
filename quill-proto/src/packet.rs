use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    crypto::HeaderKey,
    ConnectionId, VERSION,
};

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// Largest connection ID length permitted on the wire
pub const MAX_CID_SIZE: usize = 20;

/// Packet number space: the acknowledgement numbering domain a packet belongs to
///
/// 0-RTT and 1-RTT packets share the Data space; Initial and Handshake each
/// have their own.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl DoubleEndedIterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].into_iter()
    }
}

/// The keying epoch a packet is protected under
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    Initial,
    EarlyData,
    Handshake,
    AppData,
}

impl EncryptionLevel {
    /// The packet number space packets at this level are numbered in
    pub fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::EarlyData | Self::AppData => SpaceId::Data,
        }
    }
}

/// Long header packet type
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial = 0x0,
    ZeroRtt = 0x1,
    Handshake = 0x2,
    Retry = 0x3,
}

impl LongType {
    fn from_byte(b: u8) -> Self {
        match (b & 0x30) >> 4 {
            0x0 => Self::Initial,
            0x1 => Self::ZeroRtt,
            0x2 => Self::Handshake,
            0x3 => Self::Retry,
            _ => unreachable!(),
        }
    }
}

/// A packet number, encoded truncated relative to the largest acknowledged value
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else {
            Self::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U24(_) => 3,
            Self::U32(_) => 4,
        }
    }

    /// The low bits of the first header byte encoding this number's length
    fn tag(self) -> u8 {
        self.len() as u8 - 1
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        match self {
            Self::U8(x) => w.put_u8(x),
            Self::U16(x) => w.put_u16(x),
            Self::U24(x) => {
                w.put_u8((x >> 16) as u8);
                w.put_u16(x as u16);
            }
            Self::U32(x) => w.put_u32(x),
        }
    }

    pub fn decode<R: Buf>(len: usize, r: &mut R) -> coding::Result<Self> {
        if r.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        Ok(match len {
            1 => Self::U8(r.get_u8()),
            2 => Self::U16(r.get_u16()),
            3 => Self::U24(u32::from(r.get_u8()) << 16 | u32::from(r.get_u16())),
            4 => Self::U32(r.get_u32()),
            _ => unreachable!("packet number lengths are 1-4 bytes"),
        })
    }

    /// Recover the full packet number given the next expected value
    pub fn expand(self, expected: u64) -> u64 {
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() as u64 * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and
        // less than or equal to expected + hwin.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).is_some_and(|x| candidate <= x) && candidate < (1 << 62) - win
        {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Decoded plaintext packet header
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dcid: ConnectionId,
        scid: ConnectionId,
        number: PacketNumber,
    },
    /// Stateless retry; carries no packet number and ends the datagram
    Retry,
    Short {
        dcid: ConnectionId,
        number: PacketNumber,
    },
}

impl Header {
    /// Write the header, including the length field covering `payload_len`
    /// (packet number excluded) and the truncated packet number
    pub fn encode(&self, buf: &mut Vec<u8>, payload_len: usize) -> PartialEncode {
        use Header::*;
        let start = buf.len();
        match *self {
            Initial {
                ref dcid,
                ref scid,
                ref token,
                number,
            } => {
                buf.put_u8(LONG_HEADER_FORM | FIXED_BIT | ((LongType::Initial as u8) << 4) | number.tag());
                buf.put_u32(VERSION);
                Self::encode_cids(buf, dcid, scid);
                buf.write_var(token.len() as u64);
                buf.put_slice(token);
                buf.write_var((number.len() + payload_len) as u64);
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset,
                    header_len: buf.len() - start,
                }
            }
            Long {
                ty,
                ref dcid,
                ref scid,
                number,
            } => {
                debug_assert!(matches!(ty, LongType::ZeroRtt | LongType::Handshake));
                buf.put_u8(LONG_HEADER_FORM | FIXED_BIT | ((ty as u8) << 4) | number.tag());
                buf.put_u32(VERSION);
                Self::encode_cids(buf, dcid, scid);
                buf.write_var((number.len() + payload_len) as u64);
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset,
                    header_len: buf.len() - start,
                }
            }
            Retry => unreachable!("clients never send Retry packets"),
            Short { ref dcid, number } => {
                buf.put_u8(FIXED_BIT | number.tag());
                buf.put_slice(dcid);
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset,
                    header_len: buf.len() - start,
                }
            }
        }
    }

    fn encode_cids(buf: &mut Vec<u8>, dcid: &ConnectionId, scid: &ConnectionId) {
        buf.put_u8(dcid.len() as u8);
        buf.put_slice(dcid);
        buf.put_u8(scid.len() as u8);
        buf.put_slice(scid);
    }
}

/// Position bookkeeping for applying header protection after encryption
pub struct PartialEncode {
    pub pn_offset: usize,
    pub header_len: usize,
}

/// A packet whose invariant header fields have been parsed, pending key
/// material to finish
#[derive(Debug)]
pub struct PartialDecode {
    buf: BytesMut,
    plain: PlainHeader,
    pn_offset: usize,
}

#[derive(Debug)]
enum PlainHeader {
    Initial {
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
    },
    Long {
        ty: LongType,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Retry {
        dcid: ConnectionId,
    },
    Short {
        dcid: ConnectionId,
    },
}

impl PartialDecode {
    /// Parse the length-delimited boundaries of the first packet in `bytes`,
    /// returning it along with any coalesced remainder
    pub fn new(
        mut bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut cursor = &bytes[..];
        if cursor.is_empty() {
            return Err(PacketDecodeError::invalid("empty packet"));
        }
        let first = cursor.get_u8();
        if first & LONG_HEADER_FORM == 0 {
            // Short header: consumes the rest of the datagram
            if cursor.remaining() < local_cid_len {
                return Err(PacketDecodeError::invalid("truncated destination CID"));
            }
            let dcid = ConnectionId::new(&cursor[..local_cid_len]);
            let pn_offset = 1 + local_cid_len;
            return Ok((
                Self {
                    buf: bytes,
                    plain: PlainHeader::Short { dcid },
                    pn_offset,
                },
                None,
            ));
        }

        let version = BufExt::get::<u32>(&mut cursor).map_err(PacketDecodeError::from)?;
        if version != VERSION {
            return Err(PacketDecodeError::UnsupportedVersion { version });
        }
        let dcid = Self::decode_cid(&mut cursor)?;
        let scid = Self::decode_cid(&mut cursor)?;
        let ty = LongType::from_byte(first);

        if let LongType::Retry = ty {
            // Retry packets are not length-delimited; they end the datagram
            return Ok((
                Self {
                    buf: bytes,
                    plain: PlainHeader::Retry { dcid },
                    pn_offset: 0,
                },
                None,
            ));
        }

        let token = if let LongType::Initial = ty {
            let token_len = cursor.get_var().map_err(PacketDecodeError::from)? as usize;
            if cursor.remaining() < token_len {
                return Err(PacketDecodeError::invalid("truncated token"));
            }
            let token = Bytes::copy_from_slice(&cursor[..token_len]);
            cursor.advance(token_len);
            Some(token)
        } else {
            None
        };

        let len = cursor.get_var().map_err(PacketDecodeError::from)? as usize;
        if cursor.remaining() < len {
            return Err(PacketDecodeError::invalid("packet length longer than datagram"));
        }
        let pn_offset = bytes.len() - cursor.remaining();
        let packet_end = pn_offset + len;
        let rest = if packet_end < bytes.len() {
            Some(bytes.split_off(packet_end))
        } else {
            None
        };
        let plain = match ty {
            LongType::Initial => PlainHeader::Initial {
                dcid,
                scid,
                token: token.unwrap_or_else(Bytes::new),
            },
            ty => PlainHeader::Long { ty, dcid, scid },
        };
        Ok((
            Self {
                buf: bytes,
                plain,
                pn_offset,
            },
            rest,
        ))
    }

    fn decode_cid(cursor: &mut &[u8]) -> Result<ConnectionId, PacketDecodeError> {
        let len = BufExt::get::<u8>(cursor).map_err(PacketDecodeError::from)? as usize;
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::invalid("illegal connection ID length"));
        }
        if cursor.remaining() < len {
            return Err(PacketDecodeError::invalid("truncated connection ID"));
        }
        let cid = ConnectionId::new(&cursor[..len]);
        cursor.advance(len);
        Ok(cid)
    }

    /// The keying epoch needed to finish decoding this packet
    pub fn level(&self) -> EncryptionLevel {
        match self.plain {
            PlainHeader::Initial { .. } => EncryptionLevel::Initial,
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                ..
            } => EncryptionLevel::EarlyData,
            PlainHeader::Long { .. } | PlainHeader::Retry { .. } => EncryptionLevel::Handshake,
            PlainHeader::Short { .. } => EncryptionLevel::AppData,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self.plain, PlainHeader::Retry { .. })
    }

    pub fn dcid(&self) -> &ConnectionId {
        match self.plain {
            PlainHeader::Initial { ref dcid, .. }
            | PlainHeader::Long { ref dcid, .. }
            | PlainHeader::Retry { ref dcid, .. }
            | PlainHeader::Short { ref dcid } => dcid,
        }
    }

    /// Remove header protection, decode the packet number, and split the
    /// packet into associated data and ciphertext
    pub fn finish(
        mut self,
        header_key: &dyn HeaderKey,
        expected_pn: u64,
    ) -> Result<Packet, PacketDecodeError> {
        if let PlainHeader::Retry { .. } = self.plain {
            return Ok(Packet {
                header: Header::Retry,
                number: 0,
                header_data: self.buf.freeze(),
                payload: BytesMut::new(),
            });
        }
        if self.buf.len() < self.pn_offset + 4 + header_key.sample_size() {
            return Err(PacketDecodeError::invalid("packet too short to sample"));
        }
        header_key.decrypt(self.pn_offset, &mut self.buf);
        let pn_len = (self.buf[0] & 0x03) as usize + 1;
        let wire_pn = PacketNumber::decode(pn_len, &mut &self.buf[self.pn_offset..])
            .map_err(PacketDecodeError::from)?;
        let number = wire_pn.expand(expected_pn);
        let header_len = self.pn_offset + pn_len;
        let header_data = self.buf.split_to(header_len).freeze();
        let header = match self.plain {
            PlainHeader::Initial { dcid, scid, token } => Header::Initial {
                dcid,
                scid,
                token,
                number: wire_pn,
            },
            PlainHeader::Long { ty, dcid, scid } => Header::Long {
                ty,
                dcid,
                scid,
                number: wire_pn,
            },
            PlainHeader::Short { dcid } => Header::Short {
                dcid,
                number: wire_pn,
            },
            PlainHeader::Retry { .. } => unreachable!(),
        };
        Ok(Packet {
            header,
            number,
            header_data,
            payload: self.buf,
        })
    }
}

/// A decoded packet awaiting payload decryption
pub struct Packet {
    pub header: Header,
    /// Fully expanded packet number
    pub number: u64,
    /// The unprotected header bytes, used as AEAD associated data
    pub header_data: Bytes,
    /// The payload ciphertext, including the authentication tag
    pub payload: BytesMut,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("number", &self.number)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// An inbound packet that could not be interpreted
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PacketDecodeError {
    #[error("unsupported version {version:x}")]
    UnsupportedVersion { version: u32 },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl PacketDecodeError {
    fn invalid(reason: &'static str) -> Self {
        Self::InvalidHeader(reason)
    }
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pn_truncation() {
        assert_eq!(PacketNumber::new(10, 0).len(), 1);
        assert_eq!(PacketNumber::new(300, 0).len(), 2);
        assert_eq!(PacketNumber::new(0xa82f_9b32, 0xa82f_30ea).len(), 2);
    }

    #[test]
    fn pn_expansion() {
        // Example from the recovery draft
        let pn = PacketNumber::new(0xa82f_9b32, 0xa82f_30ea);
        assert_eq!(pn.expand(0xa82f_30eb + 1), 0xa82f_9b32);
        // Wrap upward across a short encoding boundary
        let pn = PacketNumber::U8(0x02);
        assert_eq!(pn.expand(0x101), 0x102);
    }

    #[test]
    fn pn_codec() {
        for (pn, len) in [
            (PacketNumber::U8(0xab), 1),
            (PacketNumber::U16(0xabcd), 2),
            (PacketNumber::U24(0x00ab_cdef), 3),
            (PacketNumber::U32(0xabcd_ef01), 4),
        ] {
            let mut buf = Vec::new();
            pn.encode(&mut buf);
            assert_eq!(buf.len(), len);
            assert_eq!(PacketNumber::decode(len, &mut &buf[..]).unwrap(), pn);
        }
    }

    #[test]
    fn coalesced_split() {
        let dcid = ConnectionId::new(&[0xaa; 8]);
        let scid = ConnectionId::new(&[0xbb; 8]);
        let mut buf = Vec::new();
        let header = Header::Initial {
            dcid,
            scid,
            token: Bytes::new(),
            number: PacketNumber::U8(0),
        };
        header.encode(&mut buf, 32);
        buf.extend_from_slice(&[0; 32]);
        let first_len = buf.len();
        // A second, short-header packet rides in the same datagram
        buf.extend_from_slice(&[0x41; 48]);

        let (partial, rest) = PartialDecode::new(BytesMut::from(&buf[..]), 8).unwrap();
        assert_eq!(partial.level(), EncryptionLevel::Initial);
        assert_eq!(partial.dcid(), &dcid);
        let rest = rest.unwrap();
        assert_eq!(rest.len(), buf.len() - first_len);
        let (partial, more) = PartialDecode::new(rest, 8).unwrap();
        assert_eq!(partial.level(), EncryptionLevel::AppData);
        assert!(more.is_none());
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut buf = vec![LONG_HEADER_FORM | FIXED_BIT];
        buf.extend_from_slice(&0xdead_beef_u32.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        assert_eq!(
            PartialDecode::new(BytesMut::from(&buf[..]), 8).unwrap_err(),
            PacketDecodeError::UnsupportedVersion {
                version: 0xdead_beef
            }
        );
    }
}
