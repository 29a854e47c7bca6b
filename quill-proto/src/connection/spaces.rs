use std::{cmp, collections::BTreeMap, mem, ops::Range, time::Instant};

use crate::{assembler::Assembler, crypto::Keys, frame, range_set::RangeSet};

/// Per packet-number-space state
pub(super) struct PacketSpace {
    /// Keys for reading packets at this space's level
    pub(super) rx_keys: Option<Keys>,
    /// Keys for writing packets at this space's level
    ///
    /// In the Data space these are the 1-RTT keys; 0-RTT write keys are held
    /// by the connection separately because both protect packets numbered in
    /// this space.
    pub(super) tx_keys: Option<Keys>,
    pub(super) dedup: Dedup,
    /// Highest received packet number
    pub(super) rx_packet: u64,
    /// Packet numbers to acknowledge
    pub(super) pending_acks: PendingAcks,
    /// The packet number of the next packet that will be sent, if any
    pub(super) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    /// Transmitted but not acked
    // BTreeMap so ACK ranges and loss scans can query in packet number order
    pub(super) sent_packets: BTreeMap<u64, SentPacket>,
    /// Incoming cryptographic handshake stream
    pub(super) crypto_stream: Assembler,
    /// The time the most recently sent ack-eliciting packet was sent
    pub(super) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// When the earliest outstanding packet will be declared lost by time
    /// threshold, if any acknowledgement has created that possibility
    pub(super) loss_time: Option<Instant>,
    /// Whether a PING should be sent to elicit an ack
    pub(super) ping_pending: bool,
    /// Once discarded, a space accepts and produces nothing
    pub(super) discarded: bool,
}

impl PacketSpace {
    pub(super) fn new() -> Self {
        Self {
            rx_keys: None,
            tx_keys: None,
            dedup: Dedup::new(),
            rx_packet: 0,
            pending_acks: PendingAcks::default(),
            next_packet_number: 0,
            largest_acked_packet: None,
            sent_packets: BTreeMap::new(),
            crypto_stream: Assembler::new(),
            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            ping_pending: false,
            discarded: false,
        }
    }

    pub(super) fn get_tx_number(&mut self) -> u64 {
        debug_assert!(self.next_packet_number < 1 << 62);
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    /// Enroll a sent packet in the outstanding set
    pub(super) fn sent(&mut self, number: u64, packet: SentPacket) {
        self.sent_packets.insert(number, packet);
    }

    /// Drop everything outstanding, returning the in-flight bytes abandoned
    pub(super) fn discard(&mut self) -> u64 {
        self.discarded = true;
        self.rx_keys = None;
        self.tx_keys = None;
        self.pending_acks = PendingAcks::default();
        self.loss_time = None;
        self.ping_pending = false;
        let sent = mem::take(&mut self.sent_packets);
        sent.values().map(|p| u64::from(p.size)).sum()
    }
}

/// Bookkeeping for one transmitted packet until it is acked, lost, or its
/// space is discarded
#[derive(Debug)]
pub(super) struct SentPacket {
    pub(super) time_sent: Instant,
    /// Bytes on the wire, QUIC framing included, UDP/IP overhead excluded
    pub(super) size: u16,
    /// Whether an acknowledgement is expected directly in response
    pub(super) ack_eliciting: bool,
    /// Whether the packet was protected with 0-RTT keys, making it eligible
    /// for wholesale loss if the server rejects early data
    pub(super) is_early_data: bool,
    /// Data to requeue if the packet is declared lost
    pub(super) retransmits: Retransmits,
}

/// Frames in a packet that must be resent if the packet is lost
#[derive(Debug, Default)]
pub(super) struct Retransmits {
    /// Offset ranges in the space's outbound crypto stream
    pub(super) crypto: Vec<Range<u64>>,
    pub(super) streams: Vec<frame::StreamMeta>,
}

impl Retransmits {
    pub(super) fn is_empty(&self) -> bool {
        self.crypto.is_empty() && self.streams.is_empty()
    }
}

/// RFC 4303-style sliding window packet number deduplicator
///
/// A contiguous bitfield, where each bit corresponds to a packet number and
/// the rightmost bit is always set. A set bit represents a packet that has
/// been successfully authenticated. Bits left of the window are assumed set.
///
/// ```text
/// ...xxxxxxxxx 1 0
///     ^        ^ ^
/// window highest next
/// ```
pub(super) struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated
    next: u64,
}

/// Inner bitfield type.
///
/// Because QUIC never reuses packet numbers, this only needs to be large
/// enough to deal with packets that are reordered but still delivered in a
/// timely manner.
type Window = u128;

/// Number of packets tracked by `Dedup`
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    pub(super) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub(super) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}

/// Packet numbers we owe the peer an acknowledgement for
#[derive(Default)]
pub(super) struct PendingAcks {
    /// Whether an ACK frame may be sent even if no other data accompanies it
    permit_ack_only: bool,
    ranges: RangeSet,
}

/// Ensures we can always fit all our ACKs in a single minimum-MTU packet
const MAX_ACK_BLOCKS: usize = 64;

impl PendingAcks {
    pub(super) fn packet_received(&mut self, packet: u64, ack_eliciting: bool) {
        self.ranges.insert_one(packet);
        self.permit_ack_only |= ack_eliciting;
        if self.ranges.len() > MAX_ACK_BLOCKS {
            self.ranges.pop_min();
        }
    }

    pub(super) fn can_send(&self) -> bool {
        self.permit_ack_only && !self.ranges.is_empty()
    }

    /// Suppresses further ACK-only packets until more ack-eliciting data arrives
    pub(super) fn acks_sent(&mut self) {
        self.permit_ack_only = false;
    }

    pub(super) fn ranges(&self) -> &RangeSet {
        &self.ranges
    }
}
