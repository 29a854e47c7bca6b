//! Minimal per-stream bookkeeping for the dispatch loop
//!
//! Carries enough send-buffer and reassembly state to move application data,
//! retransmit what is lost, and surface inbound frames; the full per-stream
//! flow-control machinery lives with the embedding stream layer.

use std::ops::Range;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::{
    assembler::Assembler,
    frame,
    range_set::RangeSet,
    transport_error::TransportError,
    Dir, Side, StreamId, VarInt,
};

/// An ordered byte buffer tracking which ranges have been sent, lost, and acked
#[derive(Debug, Default)]
pub(crate) struct SendBuffer {
    data: Vec<u8>,
    /// Lowest offset that has never been sent
    next_send: u64,
    /// Previously sent ranges that need retransmission
    retransmit: RangeSet,
    acked: RangeSet,
}

impl SendBuffer {
    pub fn write(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Total bytes written so far
    pub fn offset(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn has_pending(&self) -> bool {
        !self.retransmit.is_empty() || self.next_send < self.data.len() as u64
    }

    pub fn is_fully_acked(&self) -> bool {
        match self.acked.iter().next() {
            None => self.data.is_empty(),
            Some(range) => range.start == 0 && range.end >= self.data.len() as u64,
        }
    }

    /// Take the next chunk to transmit, preferring retransmissions
    pub fn next_chunk(&mut self, max_len: usize) -> Option<(u64, Bytes)> {
        if max_len == 0 {
            return None;
        }
        if let Some(range) = self.retransmit.pop_min() {
            let take = (range.end - range.start).min(max_len as u64);
            if take < range.end - range.start {
                self.retransmit.insert(range.start + take..range.end);
            }
            let start = range.start as usize;
            return Some((
                range.start,
                Bytes::copy_from_slice(&self.data[start..start + take as usize]),
            ));
        }
        let unsent = self.data.len() as u64 - self.next_send;
        if unsent == 0 {
            return None;
        }
        let take = unsent.min(max_len as u64);
        let offset = self.next_send;
        self.next_send += take;
        let start = offset as usize;
        Some((
            offset,
            Bytes::copy_from_slice(&self.data[start..start + take as usize]),
        ))
    }

    pub fn on_ack(&mut self, range: Range<u64>) {
        self.acked.insert(range.clone());
        self.retransmit.remove(range);
    }

    pub fn on_loss(&mut self, range: Range<u64>) {
        let mut lost = RangeSet::new();
        lost.insert(range);
        lost.subtract(&self.acked);
        for r in lost.iter() {
            self.retransmit.insert(r);
        }
    }
}

/// Application-visible changes on a stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamEvent {
    /// Ordered bytes are ready to read
    Readable { id: StreamId },
    /// All data on the stream has been received
    Finished { id: StreamId },
    /// The peer abandoned the stream
    Reset { id: StreamId, error_code: VarInt },
    /// The peer asked us to stop sending on the stream
    Stopped { id: StreamId, error_code: VarInt },
}

#[derive(Debug, Default)]
struct SendStream {
    buf: SendBuffer,
    /// Set once the application called finish
    fin_pending: bool,
    fin_sent: bool,
    stopped: Option<VarInt>,
}

#[derive(Debug, Default)]
struct RecvStream {
    assembler: Assembler,
    /// Every byte range received so far, for completion detection
    received: RangeSet,
    final_size: Option<u64>,
    reset: Option<VarInt>,
    finished_delivered: bool,
}

impl RecvStream {
    fn is_complete(&self) -> bool {
        self.final_size.is_some_and(|sz| {
            sz == 0
                || self
                    .received
                    .iter()
                    .next()
                    .is_some_and(|r| r.start == 0 && r.end >= sz)
        })
    }
}

/// The connection's map from stream ID to stream state
pub(crate) struct Streams {
    send: FxHashMap<StreamId, SendStream>,
    recv: FxHashMap<StreamId, RecvStream>,
    next: [u64; 2],
    /// Stream count limits advertised by the peer, by directionality
    max_streams: [u64; 2],
    /// Connection-level send budget advertised by the peer
    max_data: u64,
    /// Connection-level bytes consumed against `max_data`
    data_sent: u64,
    events: Vec<StreamEvent>,
}

impl Streams {
    pub fn new() -> Self {
        Self {
            send: FxHashMap::default(),
            recv: FxHashMap::default(),
            next: [0, 0],
            max_streams: [0, 0],
            max_data: 0,
            data_sent: 0,
            events: Vec::new(),
        }
    }

    /// Raise connection-level limits from the peer's transport parameters
    pub fn apply_peer_limits(&mut self, max_data: u64, max_bidi: u64, max_uni: u64) {
        self.max_data = self.max_data.max(max_data);
        self.max_streams[Dir::Bi as usize] = self.max_streams[Dir::Bi as usize].max(max_bidi);
        self.max_streams[Dir::Uni as usize] = self.max_streams[Dir::Uni as usize].max(max_uni);
    }

    pub fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.next[dir as usize] >= self.max_streams[dir as usize] {
            return None;
        }
        let id = StreamId::new(Side::Client, dir, self.next[dir as usize]);
        self.next[dir as usize] += 1;
        self.send.insert(id, SendStream::default());
        if dir == Dir::Bi {
            self.recv.insert(id, RecvStream::default());
        }
        Some(id)
    }

    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<u64, TransportError> {
        let budget = self.max_data.saturating_sub(self.data_sent);
        let stream = self
            .send
            .get_mut(&id)
            .ok_or_else(|| TransportError::STREAM_STATE_ERROR("write on unopened stream"))?;
        let len = (data.len() as u64).min(budget);
        stream.buf.write(&data[..len as usize]);
        self.data_sent += len;
        Ok(len)
    }

    pub fn finish(&mut self, id: StreamId) {
        if let Some(stream) = self.send.get_mut(&id) {
            stream.fin_pending = true;
        }
    }

    /// Drain readable bytes from a stream
    pub fn read(&mut self, id: StreamId) -> Option<Bytes> {
        self.recv.get_mut(&id)?.assembler.read()
    }

    pub fn has_pending(&self) -> bool {
        self.send
            .values()
            .any(|s| s.stopped.is_none() && (s.buf.has_pending() || (s.fin_pending && !s.fin_sent)))
    }

    /// Take the next stream chunk for an outgoing packet
    pub fn next_chunk(&mut self, max_len: usize) -> Option<frame::Stream> {
        for (&id, stream) in self.send.iter_mut() {
            if stream.stopped.is_some() {
                continue;
            }
            if let Some((offset, data)) = stream.buf.next_chunk(max_len) {
                let fin = stream.fin_pending && offset + data.len() as u64 == stream.buf.offset();
                if fin {
                    stream.fin_sent = true;
                }
                return Some(frame::Stream {
                    id,
                    offset,
                    fin,
                    data,
                });
            }
            if stream.fin_pending && !stream.fin_sent {
                stream.fin_sent = true;
                return Some(frame::Stream {
                    id,
                    offset: stream.buf.offset(),
                    fin: true,
                    data: Bytes::new(),
                });
            }
        }
        None
    }

    pub fn on_ack(&mut self, meta: &frame::StreamMeta) {
        if let Some(stream) = self.send.get_mut(&meta.id) {
            stream.buf.on_ack(meta.offsets.clone());
        }
    }

    pub fn on_loss(&mut self, meta: &frame::StreamMeta) {
        if let Some(stream) = self.send.get_mut(&meta.id) {
            stream.buf.on_loss(meta.offsets.clone());
            if meta.fin {
                stream.fin_sent = false;
            }
        }
    }

    /// Route an inbound STREAM frame, surfacing a readability event
    pub fn received(&mut self, frame: frame::Stream) -> Result<(), TransportError> {
        let id = frame.id;
        if id.initiator() == Side::Client && id.dir() == Dir::Uni {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STREAM frame on our own unidirectional stream",
            ));
        }
        let end = frame.offset + frame.data.len() as u64;
        let stream = self.recv.entry(id).or_default();
        if let Some(final_size) = stream.final_size {
            if end > final_size || (frame.fin && end != final_size) {
                return Err(TransportError::FINAL_SIZE_ERROR("stream data past final size"));
            }
        }
        if frame.fin {
            stream.final_size = Some(end);
        }
        let readable = !frame.data.is_empty();
        stream.received.insert(frame.offset..end);
        stream.assembler.insert(frame.offset, frame.data);
        if readable {
            self.events.push(StreamEvent::Readable { id });
        }
        if stream.is_complete() && !stream.finished_delivered {
            stream.finished_delivered = true;
            self.events.push(StreamEvent::Finished { id });
        }
        Ok(())
    }

    pub fn received_reset(&mut self, frame: frame::ResetStream) -> Result<(), TransportError> {
        let stream = self.recv.entry(frame.id).or_default();
        if stream
            .final_size
            .is_some_and(|sz| sz != frame.final_size)
        {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "RESET_STREAM final size disagrees with stream data",
            ));
        }
        stream.final_size = Some(frame.final_size);
        if stream.reset.replace(frame.error_code).is_none() {
            self.events.push(StreamEvent::Reset {
                id: frame.id,
                error_code: frame.error_code,
            });
        }
        Ok(())
    }

    pub fn received_stop_sending(&mut self, frame: frame::StopSending) {
        if let Some(stream) = self.send.get_mut(&frame.id) {
            if stream.stopped.replace(frame.error_code).is_none() {
                self.events.push(StreamEvent::Stopped {
                    id: frame.id,
                    error_code: frame.error_code,
                });
            }
        }
    }

    pub fn on_max_data(&mut self, limit: u64) {
        self.max_data = self.max_data.max(limit);
    }

    pub fn on_max_streams(&mut self, dir: Dir, count: u64) {
        self.max_streams[dir as usize] = self.max_streams[dir as usize].max(count);
    }

    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        if self.events.is_empty() {
            None
        } else {
            Some(self.events.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_buffer_retransmit_preference() {
        let mut buf = SendBuffer::default();
        buf.write(b"hello world");
        let (off, data) = buf.next_chunk(5).unwrap();
        assert_eq!((off, &data[..]), (0, &b"hello"[..]));
        let (off, _) = buf.next_chunk(6).unwrap();
        assert_eq!(off, 5);
        assert!(!buf.has_pending());

        buf.on_loss(0..5);
        assert!(buf.has_pending());
        let (off, data) = buf.next_chunk(100).unwrap();
        assert_eq!((off, &data[..]), (0, &b"hello"[..]));

        buf.on_ack(0..11);
        assert!(buf.is_fully_acked());
    }

    #[test]
    fn loss_of_acked_range_is_ignored() {
        let mut buf = SendBuffer::default();
        buf.write(b"abcdef");
        buf.next_chunk(6).unwrap();
        buf.on_ack(0..3);
        buf.on_loss(0..6);
        let (off, data) = buf.next_chunk(100).unwrap();
        assert_eq!((off, &data[..]), (3, &b"def"[..]));
    }

    #[test]
    fn stream_limits_respected() {
        let mut streams = Streams::new();
        assert_eq!(streams.open(Dir::Bi), None);
        streams.apply_peer_limits(100, 1, 0);
        let id = streams.open(Dir::Bi).unwrap();
        assert_eq!(streams.open(Dir::Bi), None);
        assert_eq!(streams.open(Dir::Uni), None);
        // Connection-level flow control caps what write accepts
        assert_eq!(streams.write(id, &[0; 200]).unwrap(), 100);
    }

    #[test]
    fn inbound_stream_readable_event() {
        let mut streams = Streams::new();
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        streams
            .received(frame::Stream {
                id,
                offset: 0,
                fin: false,
                data: Bytes::from_static(b"data"),
            })
            .unwrap();
        assert_eq!(streams.poll_event(), Some(StreamEvent::Readable { id }));
        assert_eq!(streams.read(id).unwrap(), Bytes::from_static(b"data"));
    }
}
