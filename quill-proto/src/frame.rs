use std::{fmt, ops::Range};

use bytes::{Buf, BufMut, Bytes};

use crate::{
    coding::{self, BufExt, BufMutExt, Codec, UnexpectedEnd},
    range_set::RangeSet,
    transport_error::{Code, TransportError},
    Dir, StreamId, VarInt,
};

/// A QUIC frame type identifier
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Type(u64);

impl Type {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl From<Type> for u64 {
    fn from(x: Type) -> Self {
        x.0
    }
}

impl coding::Codec for Type {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl Type {
            $(pub const $name: Type = Type($val);)*
        }

        impl fmt::Debug for Type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
}

const STREAM_TYS: Range<u64> = 0x08..0x10;

/// Bit assignments within the STREAM frame type byte
#[derive(Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

#[derive(Debug)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    Close(Close),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use Frame::*;
        match *self {
            Padding => Type::PADDING,
            Ping => Type::PING,
            Ack(_) => Type::ACK,
            ResetStream(_) => Type::RESET_STREAM,
            StopSending(_) => Type::STOP_SENDING,
            Crypto(_) => Type::CRYPTO,
            NewToken { .. } => Type::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = STREAM_TYS.start;
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                Type(ty)
            }
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => Type::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => Type::MAX_STREAMS_UNI,
            Close(self::Close::Transport(_)) => Type::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => Type::APPLICATION_CLOSE,
        }
    }

    /// Whether this frame obliges the peer to respond with an ACK
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Self::Ack(_) | Self::Padding | Self::Close(_))
    }
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    pub delay: u64,
    pub ranges: RangeSet,
}

impl Ack {
    pub fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        debug_assert!(!ranges.is_empty(), "ACK frames must contain at least one range");
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        buf.write(Type::ACK);
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in rest {
            // Gap is the count of unacked packets between this block and the
            // previous one, less one; block length is similarly offset.
            buf.write_var(prev - block.end - 1);
            buf.write_var(block.end - block.start - 1);
            prev = block.start;
        }
    }

    fn decode<R: Buf>(buf: &mut R) -> coding::Result<Self> {
        let largest = buf.get_var()?;
        let delay = buf.get_var()?;
        let extra_blocks = buf.get_var()?;
        let first_block = buf.get_var()?;
        let mut ranges = RangeSet::new();
        let mut smallest = largest.checked_sub(first_block).ok_or(UnexpectedEnd)?;
        ranges.insert(smallest..largest + 1);
        for _ in 0..extra_blocks {
            let gap = buf.get_var()?;
            let block = buf.get_var()?;
            let end = smallest.checked_sub(gap + 1).ok_or(UnexpectedEnd)?;
            smallest = end.checked_sub(block + 1).ok_or(UnexpectedEnd)?;
            ranges.insert(smallest..end);
        }
        Ok(Self {
            largest,
            delay,
            ranges,
        })
    }
}

/// RESET_STREAM: the peer abandoned sending on a stream
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: VarInt,
    pub final_size: u64,
}

/// STOP_SENDING: the peer is no longer interested in a stream's data
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StopSending {
    pub id: StreamId,
    pub error_code: VarInt,
}

#[derive(Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    /// Bytes of overhead for a CRYPTO frame with a worst-case length encoding
    pub const SIZE_BOUND: usize = 17;

    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(Type::CRYPTO);
        buf.write_var(self.offset);
        buf.write_var(self.data.len() as u64);
        buf.put_slice(&self.data);
    }
}

impl fmt::Debug for Crypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crypto")
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    /// Bytes of overhead for a STREAM frame with worst-case field encodings
    pub const SIZE_BOUND: usize = 25;

    pub fn encode<W: BufMut>(&self, length: bool, buf: &mut W) {
        let mut ty = STREAM_TYS.start;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        buf.write_var(ty);
        buf.write_var(self.id.0);
        if self.offset != 0 {
            buf.write_var(self.offset);
        }
        if length {
            buf.write_var(self.data.len() as u64);
        }
        buf.put_slice(&self.data);
    }
}

/// Metadata from a STREAM frame, retained for ack and loss bookkeeping
///
/// The actual data is stored with the stream state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamMeta {
    pub id: StreamId,
    pub offsets: Range<u64>,
    pub fin: bool,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("fin", &self.fin)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Close {
    Transport(ConnectionClose),
    Application(ApplicationClose),
}

impl Close {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        match *self {
            Self::Transport(ref x) => x.encode(buf, max_len),
            Self::Application(ref x) => x.encode(buf, max_len),
        }
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Transport(x.into())
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    /// Class of error as encoded on the wire
    pub error_code: Code,
    /// Type of frame that caused the close
    pub frame_type: Option<u64>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: x.reason.into(),
        }
    }
}

impl ConnectionClose {
    fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.write(Type::CONNECTION_CLOSE);
        buf.write(self.error_code);
        buf.write_var(self.frame_type.unwrap_or(0));
        let max_reason = max_len.saturating_sub(self.base_size());
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }

    fn base_size(&self) -> usize {
        // Type, code, frame type, and a worst-case reason length
        1 + 8 + 8 + 8
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reason.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
            write!(f, " (code {})", self.error_code)
        } else {
            write!(f, "code {}", self.error_code)
        }
    }
}

impl ApplicationClose {
    fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.write(Type::APPLICATION_CLOSE);
        buf.write(self.error_code);
        let max_reason = max_len.saturating_sub(1 + 8 + 8);
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

/// Decodes frames from the plaintext payload of a packet, in wire order
pub struct Iter {
    bytes: Bytes,
    last_ty: Option<Type>,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Self {
            bytes: payload,
            last_ty: None,
        }
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, UnexpectedEnd> {
        let ty = Type(self.bytes.get_var()?);
        self.last_ty = Some(ty);
        Ok(match ty {
            Type::PADDING => Frame::Padding,
            Type::PING => Frame::Ping,
            Type::ACK | Type::ACK_ECN => {
                let ack = Ack::decode(&mut self.bytes)?;
                if ty == Type::ACK_ECN {
                    // ECN counts are parsed and discarded; congestion feedback
                    // from ECN is not consumed by this client.
                    for _ in 0..3 {
                        self.bytes.get_var()?;
                    }
                }
                Frame::Ack(ack)
            }
            Type::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: StreamId(self.bytes.get_var()?),
                error_code: VarInt::from_u64(self.bytes.get_var()?).map_err(|_| UnexpectedEnd)?,
                final_size: self.bytes.get_var()?,
            }),
            Type::STOP_SENDING => Frame::StopSending(StopSending {
                id: StreamId(self.bytes.get_var()?),
                error_code: VarInt::from_u64(self.bytes.get_var()?).map_err(|_| UnexpectedEnd)?,
            }),
            Type::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            Type::NEW_TOKEN => Frame::NewToken {
                token: self.take_len()?,
            },
            Type::MAX_DATA => Frame::MaxData(VarInt(self.bytes.get_var()?)),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: Dir::Bi,
                count: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: Dir::Uni,
                count: self.bytes.get_var()?,
            },
            Type::CONNECTION_CLOSE => Frame::Close(Close::Transport(ConnectionClose {
                error_code: Code::decode(&mut self.bytes)?,
                frame_type: Some(self.bytes.get_var()?),
                reason: self.take_len()?,
            })),
            Type::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: VarInt::from_u64(self.bytes.get_var()?).map_err(|_| UnexpectedEnd)?,
                reason: self.take_len()?,
            })),
            _ => {
                if let Some(s) = ty.stream() {
                    Frame::Stream(Stream {
                        id: StreamId(self.bytes.get_var()?),
                        offset: if s.off() { self.bytes.get_var()? } else { 0 },
                        fin: s.fin(),
                        data: if s.len() {
                            self.take_len()?
                        } else {
                            self.bytes.split_to(self.bytes.len())
                        },
                    })
                } else {
                    return Err(UnexpectedEnd);
                }
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, IterErr>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(UnexpectedEnd) => {
                // Corrupt frame; skip the rest of the payload
                self.bytes.clear();
                Some(Err(IterErr {
                    ty: self.last_ty,
                }))
            }
        }
    }
}

/// A frame that could not be fully decoded
#[derive(Debug)]
pub struct IterErr {
    ty: Option<Type>,
}

impl From<IterErr> for TransportError {
    fn from(err: IterErr) -> Self {
        let mut e = Self::FRAME_ENCODING_ERROR("malformed frame");
        e.frame = err.ty.map(Into::into);
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frames(payload: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(payload))
            .collect::<Result<Vec<_>, _>>()
            .expect("frames should decode cleanly")
    }

    #[test]
    fn ack_roundtrip() {
        let ranges: RangeSet = [0..3, 5..6, 9..12].into_iter().collect();
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        let ack = match &decoded[0] {
            Frame::Ack(ack) => ack,
            x => panic!("expected ACK, got {x:?}"),
        };
        assert_eq!(ack.largest, 11);
        assert_eq!(ack.delay, 42);
        assert_eq!(ack.ranges.iter().collect::<Vec<_>>(), vec![0..3, 5..6, 9..12]);
    }

    #[test]
    fn stream_variants() {
        let frame = Stream {
            id: StreamId(4),
            offset: 100,
            fin: true,
            data: Bytes::from_static(b"hello"),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        let decoded = frames(buf);
        assert_matches!(
            &decoded[..],
            [Frame::Stream(s)] if s.id == StreamId(4) && s.offset == 100 && s.fin && &s.data[..] == b"hello"
        );

        // Without an explicit length the data runs to the end of the payload
        let mut buf = Vec::new();
        frame.encode(false, &mut buf);
        let decoded = frames(buf);
        assert_matches!(&decoded[..], [Frame::Stream(s)] if &s.data[..] == b"hello");
    }

    #[test]
    fn malformed_frame_is_an_error() {
        // CRYPTO frame claiming more data than the payload carries
        let mut buf = Vec::new();
        buf.write(Type::CRYPTO);
        buf.write_var(0);
        buf.write_var(1000);
        buf.put_slice(b"short");
        let mut iter = Iter::new(Bytes::from(buf));
        assert_matches!(iter.next(), Some(Err(_)));
        assert_matches!(iter.next(), None);
    }

    #[test]
    fn close_reason_truncated_to_budget() {
        let close = ConnectionClose {
            error_code: Code::PROTOCOL_VIOLATION,
            frame_type: None,
            reason: Bytes::from(vec![b'x'; 1000]),
        };
        let mut buf = Vec::new();
        close.encode(&mut buf, 100);
        assert!(buf.len() <= 100);
        let decoded = frames(buf);
        assert_matches!(
            &decoded[..],
            [Frame::Close(Close::Transport(c))] if c.error_code == Code::PROTOCOL_VIOLATION
        );
    }
}
