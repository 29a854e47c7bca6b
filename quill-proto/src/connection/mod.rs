//! Client connection state and the read/write dispatch machinery
//!
//! `ClientConnection` is sans-io: the driver feeds it datagrams and timer
//! fires, and drains outbound datagrams and application events from it. All
//! of the coupling between the handshake, the congestion controller, the
//! loss logic, and the stream layer lives here.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    coding::BufMutExt,
    congestion::{ControllerFactory, NewRenoConfig},
    crypto::{CipherKind, CipherSuite, Keys, Session},
    frame::{self, Frame},
    handshake::{ClientHandshake, HandshakeEvent, Phase},
    packet::{
        EncryptionLevel, Header, LongType, PacketNumber, PartialDecode, SpaceId, MAX_CID_SIZE,
    },
    psk::{CachedPsk, PskCache},
    streams::{StreamEvent, Streams},
    transport_error::{Code, LocalError, TransportError},
    transport_parameters::TransportParameters,
    ConnectionId, Dir, Side, StreamId, VarInt,
};

mod paths;
mod spaces;

pub use paths::RttEstimator;

use paths::{PathData, TIMER_GRANULARITY};
use spaces::{PacketSpace, Retransmits, SentPacket};

/// Packets this far below the largest acknowledged are declared lost
const PACKET_THRESHOLD: u64 = 3;
/// Prevents overflow and improves behavior in extreme circumstances
const MAX_BACKOFF_EXPONENT: u32 = 16;
/// Every outgoing datagram must leave room to sample the header ciphertext
const HEADER_SAMPLE_LEN: usize = 4;
/// Client Initial datagrams are padded up to this size
const MIN_INITIAL_SIZE: usize = 1200;
/// Worst-case long header size for budgeting a packet's frames
const MAX_HEADER_SIZE: usize = 48;

/// Configuration for an outgoing connection
pub struct ClientConfig {
    /// Name used to identify the server, both for TLS and the PSK cache
    pub server_name: String,
    /// Parameters to advertise in the ClientHello
    pub transport_params: TransportParameters,
    /// Cache consulted for resumption and updated on new session tickets
    pub psk_cache: Option<Arc<dyn PskCache>>,
    pub congestion: NewRenoConfig,
    /// Payload budget for outgoing datagrams
    pub udp_payload_size: u16,
    pub initial_rtt: Duration,
}

impl ClientConfig {
    pub fn new(server_name: impl Into<String>) -> Self {
        let mut transport_params = TransportParameters::default();
        transport_params.initial_max_data = 1024 * 1024;
        transport_params.initial_max_stream_data_bidi_local = 512 * 1024;
        transport_params.initial_max_stream_data_bidi_remote = 512 * 1024;
        transport_params.initial_max_stream_data_uni = 512 * 1024;
        transport_params.initial_max_streams_bidi = 100;
        transport_params.initial_max_streams_uni = 100;
        transport_params.max_idle_timeout = 30_000;
        Self {
            server_name: server_name.into(),
            transport_params,
            psk_cache: None,
            congestion: NewRenoConfig::default(),
            udp_payload_size: 1200,
            initial_rtt: Duration::from_millis(333),
        }
    }
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// The handshake completed; 1-RTT keys are derived in both directions
    Connected,
    /// The peer demonstrably installed its 1-RTT keys; anything sent from now
    /// on can no longer be replayed against a different connection
    ReplaySafe,
    /// The server accepted the early data sent so far
    EarlyDataAccepted,
    /// The server refused early data; it was retransmitted under 1-RTT keys
    EarlyDataRejected,
    /// Stream events
    Stream(StreamEvent),
    /// The connection is finished, successfully or otherwise
    ///
    /// This is the last event a connection delivers.
    ConnectionLost { reason: ConnectionError },
}

/// Reasons why a connection terminated
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConnectionError {
    /// The transport detected a protocol violation or TLS failure
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),
    /// The peer's transport closed the connection
    #[error("closed by peer: {0}")]
    ConnectionClosed(frame::ConnectionClose),
    /// The peer's application closed the connection
    #[error("closed by peer application: {0}")]
    ApplicationClosed(frame::ApplicationClose),
    /// A client-local failure
    #[error(transparent)]
    Local(#[from] LocalError),
    /// The connection was closed by the local application
    #[error("closed")]
    LocallyClosed,
}

/// Progress of the 0-RTT attempt, if any
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ZeroRttState {
    /// No usable PSK; no early data was offered
    None,
    /// Early keys are installed and early data may have been sent
    Attempted,
    Accepted,
    Rejected,
}

/// An outgoing datagram, ready for the socket
#[derive(Debug)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    /// Cryptographic handshake in progress
    Handshake,
    Established,
    /// Local close sent; lingering to absorb the peer's remaining traffic
    Closed,
    /// Peer close received; we stay silent until the drain period ends
    Draining,
    /// All state may be dropped
    Drained,
}

/// State machine for a single client-side QUIC connection
pub struct ClientConnection {
    config: ClientConfig,
    handshake: ClientHandshake,
    path: PathData,
    spaces: [PacketSpace; 3],
    /// Write keys for early data; packets they protect share the Data space's
    /// packet number sequence
    zero_rtt_tx: Option<Keys>,
    local_cid: ConnectionId,
    rem_cid: ConnectionId,
    /// Whether the peer has replaced our provisional random DCID
    rem_cid_set: bool,
    state: State,
    /// The terminal reason, once one exists
    error: Option<ConnectionError>,
    events: VecDeque<Event>,
    streams: Streams,
    peer_params: Option<TransportParameters>,
    zero_rtt: ZeroRttState,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    pto_count: u32,
    /// When the current run of probe timeouts began; an ack for a packet sent
    /// after this verifies the timeout was genuine
    first_pto: Option<Instant>,
    close_pending: Option<frame::Close>,
    drain_deadline: Option<Instant>,
    replay_safe_notified: bool,
    terminal_queued: bool,
}

impl ClientConnection {
    /// Begin connecting to `remote`
    ///
    /// `session` must already be started for `config.server_name`; when
    /// resuming, `psk` is the cache entry the session was started with.
    pub fn new(
        config: ClientConfig,
        remote: SocketAddr,
        session: Box<dyn Session>,
        psk: Option<CachedPsk>,
        now: Instant,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let local_cid = ConnectionId::random(&mut rng, 8);
        let rem_cid = ConnectionId::random(&mut rng, 8);
        debug!(%local_cid, %rem_cid, %remote, "connecting");

        let congestion = config.congestion.build(u64::from(config.udp_payload_size));
        let mut spaces = [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()];
        let initial = crate::crypto::ring::initial_keys(&rem_cid, Side::Client);
        spaces[SpaceId::Initial as usize].rx_keys = Some(initial.read);
        spaces[SpaceId::Initial as usize].tx_keys = Some(initial.write);

        let mut streams = Streams::new();
        if let Some(psk) = &psk {
            if psk.supports_early_data() {
                // Early data is written under the limits remembered from the
                // previous connection until the new ones arrive.
                streams.apply_peer_limits(
                    psk.server_params.initial_max_data,
                    psk.server_params.initial_max_streams_bidi,
                    psk.server_params.initial_max_streams_uni,
                );
            }
        }

        let idle_timeout = match config.transport_params.max_idle_timeout {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let mut this = Self {
            handshake: ClientHandshake::new(session, psk),
            path: PathData::new(remote, congestion, config.initial_rtt),
            spaces,
            zero_rtt_tx: None,
            local_cid,
            rem_cid,
            rem_cid_set: false,
            state: State::Handshake,
            error: None,
            events: VecDeque::new(),
            streams,
            peer_params: None,
            zero_rtt: ZeroRttState::None,
            idle_timeout,
            idle_deadline: idle_timeout.map(|t| now + t),
            pto_count: 0,
            first_pto: None,
            close_pending: None,
            drain_deadline: None,
            replay_safe_notified: false,
            terminal_queued: false,
            config,
        };
        this.on_handshake_progress(now);
        this
    }

    /// Process an inbound UDP datagram
    pub fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: BytesMut) {
        if matches!(self.state, State::Closed | State::Draining | State::Drained) {
            // Absorb lingering traffic silently
            trace!("datagram ignored in terminal state");
            return;
        }
        if remote != self.path.remote {
            // Migration to an unvalidated peer address is unsupported
            trace!(%remote, "datagram from unexpected address");
            return;
        }
        let mut remaining = Some(data);
        while let Some(chunk) = remaining.take() {
            if matches!(self.state, State::Closed | State::Draining | State::Drained) {
                break;
            }
            match PartialDecode::new(chunk, self.local_cid.len()) {
                Ok((partial, rest)) => {
                    remaining = rest;
                    self.handle_packet(now, partial);
                }
                Err(e) => {
                    trace!(error = %e, "dropping undecodable packet");
                    break;
                }
            }
        }
    }

    fn handle_packet(&mut self, now: Instant, partial: PartialDecode) {
        if partial.is_retry() {
            // Stateless retries would restart the handshake with a new token;
            // unsupported, so the packet is dropped like any other unusable one.
            debug!("ignoring Retry packet");
            return;
        }
        if partial.dcid() != &self.local_cid {
            trace!(dcid = %partial.dcid(), "packet for unknown connection");
            return;
        }
        let level = partial.level();
        if level == EncryptionLevel::EarlyData {
            // The server never protects packets with 0-RTT keys
            trace!("dropping inbound 0-RTT packet");
            return;
        }
        let space_id = level.space();
        if self.spaces[space_id as usize].discarded {
            trace!(?space_id, "dropping packet for discarded space");
            return;
        }
        let Some(keys) = self.spaces[space_id as usize].rx_keys.as_ref() else {
            trace!(?level, "dropping packet without read keys");
            return;
        };

        let expected = self.spaces[space_id as usize].rx_packet + 1;
        let Ok(mut packet) = partial.finish(&*keys.header, expected) else {
            trace!("dropping packet that failed header removal");
            return;
        };
        if keys
            .packet
            .decrypt(packet.number, &packet.header_data, &mut packet.payload)
            .is_err()
        {
            // Undecryptable packets are dropped without reaction
            trace!(number = packet.number, "payload decryption failed");
            return;
        }
        if self.spaces[space_id as usize].dedup.insert(packet.number) {
            trace!(number = packet.number, "dropping duplicate packet");
            return;
        }
        let space = &mut self.spaces[space_id as usize];
        space.rx_packet = space.rx_packet.max(packet.number);
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(now + timeout);
        }

        if !self.rem_cid_set {
            if let Header::Initial { ref scid, .. } | Header::Long { ref scid, .. } = packet.header
            {
                self.rem_cid = *scid;
                self.rem_cid_set = true;
            }
        }

        if level == EncryptionLevel::AppData && self.handshake.phase() == Phase::OneRttKeysDerived {
            // The peer has observably installed its 1-RTT keys
            self.handshake.on_recv_one_rtt_protected_data();
            if !self.replay_safe_notified {
                self.replay_safe_notified = true;
                self.events.push_back(Event::ReplaySafe);
            }
        }

        let number = packet.number;
        let mut ack_eliciting = false;
        for frame in frame::Iter::new(packet.payload.freeze()) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.fail(now, TransportError::from(e).into());
                    return;
                }
            };
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(e) = self.handle_frame(now, level, frame) {
                self.fail(now, e);
                return;
            }
            if matches!(self.state, State::Closed | State::Draining | State::Drained) {
                return;
            }
        }
        if !self.spaces[space_id as usize].discarded {
            self.spaces[space_id as usize]
                .pending_acks
                .packet_received(number, ack_eliciting);
        }

        while let Some(event) = self.streams.poll_event() {
            self.events.push_back(Event::Stream(event));
        }
    }

    fn handle_frame(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        let space_id = level.space();
        trace!(ty = ?frame.ty(), ?level, "frame");
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Crypto(crypto) => {
                self.spaces[space_id as usize]
                    .crypto_stream
                    .insert(crypto.offset, crypto.data);
                while let Some(chunk) = self.spaces[space_id as usize].crypto_stream.read() {
                    self.handshake.on_crypto_data(level, &chunk)?;
                }
                self.on_handshake_progress(now);
            }
            Frame::Ack(ack) => self.on_ack(now, space_id, ack)?,
            Frame::Stream(stream) => {
                if level != EncryptionLevel::AppData {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "STREAM frame outside application data",
                    )
                    .into());
                }
                self.streams.received(stream)?;
            }
            Frame::ResetStream(reset) => {
                if level != EncryptionLevel::AppData {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "RESET_STREAM outside application data",
                    )
                    .into());
                }
                self.streams.received_reset(reset)?;
            }
            Frame::StopSending(stop) => {
                if level != EncryptionLevel::AppData {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "STOP_SENDING outside application data",
                    )
                    .into());
                }
                self.streams.received_stop_sending(stop);
            }
            Frame::MaxData(limit) => self.streams.on_max_data(limit.into_inner()),
            Frame::MaxStreamData { id, offset } => {
                // Per-stream budget raises belong to the stream layer
                trace!(%id, offset, "MAX_STREAM_DATA");
            }
            Frame::MaxStreams { dir, count } => self.streams.on_max_streams(dir, count),
            Frame::NewToken { token } => {
                // Retry tokens for future connections are not retained
                trace!(len = token.len(), "ignoring NEW_TOKEN");
            }
            Frame::Close(close) => {
                debug!(cid = %self.rem_cid, "connection closed by peer");
                let reason = match close {
                    frame::Close::Transport(c) => ConnectionError::ConnectionClosed(c),
                    frame::Close::Application(c) => ConnectionError::ApplicationClosed(c),
                };
                self.state = State::Draining;
                self.drain_deadline = Some(now + 3 * self.pto_interval());
                self.queue_terminal(reason);
            }
        }
        Ok(())
    }

    /// Install freshly derived keys and react to handshake milestones
    fn on_handshake_progress(&mut self, now: Instant) {
        let installs = [
            (CipherKind::HandshakeRead, SpaceId::Handshake, false),
            (CipherKind::HandshakeWrite, SpaceId::Handshake, true),
            (CipherKind::OneRttRead, SpaceId::Data, false),
            (CipherKind::OneRttWrite, SpaceId::Data, true),
        ];
        for (kind, space_id, write) in installs {
            let keys = match self.handshake.take_keys(kind) {
                Ok(keys) => keys,
                Err(e) => {
                    self.fail(now, e);
                    return;
                }
            };
            if let Some(keys) = keys {
                trace!(?kind, "keys installed");
                let space = &mut self.spaces[space_id as usize];
                if write {
                    space.tx_keys = Some(keys);
                } else {
                    space.rx_keys = Some(keys);
                }
                if kind == CipherKind::HandshakeWrite {
                    self.discard_space(SpaceId::Initial);
                }
                if kind == CipherKind::OneRttWrite {
                    // New application data is 1-RTT protected from here on
                    self.zero_rtt_tx = None;
                }
            }
        }
        if let Ok(Some(keys)) = self.handshake.take_keys(CipherKind::ZeroRttWrite) {
            trace!("0-RTT write keys installed");
            self.zero_rtt_tx = Some(keys);
            self.zero_rtt = ZeroRttState::Attempted;
        }

        if self.peer_params.is_none() {
            if let Some(params) = self.handshake.peer_transport_parameters() {
                self.apply_peer_params(now, params);
            }
        }

        while let Some(event) = self.handshake.poll_event() {
            match event {
                HandshakeEvent::Done => {
                    if self.state == State::Handshake {
                        self.state = State::Established;
                        debug!(resumed = self.handshake.is_tls_resumed(), "handshake complete");
                        self.events.push_back(Event::Connected);
                    }
                }
                HandshakeEvent::EarlyDataAccepted => {
                    self.zero_rtt = ZeroRttState::Accepted;
                    self.events.push_back(Event::EarlyDataAccepted);
                }
                HandshakeEvent::EarlyDataRejected => {
                    self.zero_rtt = ZeroRttState::Rejected;
                    self.events.push_back(Event::EarlyDataRejected);
                    self.on_zero_rtt_rejected();
                }
                HandshakeEvent::NewSessionTicket {
                    ticket,
                    max_early_data_size,
                } => self.cache_session_ticket(ticket, max_early_data_size),
            }
        }
    }

    fn apply_peer_params(&mut self, _now: Instant, params: TransportParameters) {
        trace!("peer transport parameters received");
        self.idle_timeout = negotiate_max_idle_timeout(
            self.config.transport_params.max_idle_timeout,
            params.max_idle_timeout,
        );
        self.streams.apply_peer_limits(
            params.initial_max_data,
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
        );
        self.peer_params = Some(params);
    }

    fn cache_session_ticket(&mut self, ticket: Vec<u8>, max_early_data_size: u32) {
        let Some(cache) = self.config.psk_cache.as_ref() else {
            return;
        };
        let Some(server_params) = self.peer_params.clone() else {
            debug!("session ticket before transport parameters; not cached");
            return;
        };
        let psk = CachedPsk {
            ticket,
            server_params,
            alpn: self.handshake.alpn().unwrap_or_default(),
            cipher_suite: self
                .handshake
                .negotiated_suite()
                .unwrap_or(CipherSuite::Aes128GcmSha256),
            max_early_data_size,
            issued: SystemTime::now(),
        };
        debug!(server = %self.config.server_name, "caching session ticket");
        cache.put(&self.config.server_name, psk);
    }

    /// The server refused early data under unchanged parameters: every 0-RTT
    /// protected packet still outstanding is treated as a single loss event
    /// and its stream data queued for retransmission under 1-RTT keys.
    fn on_zero_rtt_rejected(&mut self) {
        let space = &mut self.spaces[SpaceId::Data as usize];
        let early: Vec<u64> = space
            .sent_packets
            .iter()
            .filter(|(_, p)| p.is_early_data)
            .map(|(&pn, _)| pn)
            .collect();
        let mut lost_bytes = 0;
        let mut largest_lost = None;
        for pn in early {
            let packet = space.sent_packets.remove(&pn).expect("packet just listed");
            lost_bytes += u64::from(packet.size);
            largest_lost = Some(pn);
            Self::requeue(&mut self.handshake, &mut self.streams, SpaceId::Data, packet.retransmits);
        }
        if let Some(largest) = largest_lost {
            debug!(lost_bytes, "early data packets marked lost after rejection");
            self.path.congestion.on_packet_loss(largest, lost_bytes);
        }
    }

    fn on_ack(&mut self, now: Instant, space_id: SpaceId, ack: frame::Ack) -> Result<(), ConnectionError> {
        let ack_delay = self.ack_delay(ack.delay);
        let space = &mut self.spaces[space_id as usize];
        if ack.largest >= space.next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("ack of unsent packet").into());
        }
        let mut newly_acked = Vec::new();
        for range in ack.ranges.iter() {
            newly_acked.extend(space.sent_packets.range(range).map(|(&pn, _)| pn));
        }
        if newly_acked.is_empty() {
            // Re-delivered ACK; nothing left to do
            return Ok(());
        }

        let largest_newly_acked = *newly_acked.last().expect("nonempty");
        if largest_newly_acked == ack.largest {
            let packet = &space.sent_packets[&largest_newly_acked];
            if packet.ack_eliciting {
                self.path.rtt.update(ack_delay, now - packet.time_sent);
            }
        }
        space.largest_acked_packet = Some(
            space
                .largest_acked_packet
                .map_or(ack.largest, |prev| prev.max(ack.largest)),
        );

        let mut acked_bytes = 0;
        let mut rto_verified = false;
        for pn in newly_acked {
            let packet = space.sent_packets.remove(&pn).expect("packet just listed");
            acked_bytes += u64::from(packet.size);
            if let Some(first_pto) = self.first_pto {
                if packet.time_sent >= first_pto {
                    rto_verified = true;
                }
            }
            Self::ack_retransmits(&mut self.handshake, &mut self.streams, space_id, packet.retransmits);
        }
        if rto_verified {
            // The collapse only happens once the retransmission is confirmed
            self.path.congestion.on_rto_verified();
        }
        self.pto_count = 0;
        self.first_pto = None;
        self.path.congestion.on_packet_acked(ack.largest, acked_bytes);
        self.detect_lost(now, space_id);
        Ok(())
    }

    fn ack_delay(&self, raw: u64) -> Duration {
        let exponent = self
            .peer_params
            .as_ref()
            .map_or(3, |p| p.ack_delay_exponent);
        Duration::from_micros(raw.checked_shl(exponent as u32).unwrap_or(u64::MAX))
    }

    /// Declare packets lost by packet threshold or time threshold
    fn detect_lost(&mut self, now: Instant, space_id: SpaceId) {
        let space = &mut self.spaces[space_id as usize];
        let Some(largest_acked) = space.largest_acked_packet else {
            return;
        };
        let loss_delay = (self.path.rtt.conservative() * 9 / 8).max(TIMER_GRANULARITY);
        let mut lost = Vec::new();
        let mut loss_time = None;
        for (&pn, packet) in space.sent_packets.range(..largest_acked) {
            if pn + PACKET_THRESHOLD <= largest_acked || packet.time_sent + loss_delay <= now {
                lost.push(pn);
            } else {
                let deadline = packet.time_sent + loss_delay;
                loss_time = Some(loss_time.map_or(deadline, |t: Instant| t.min(deadline)));
            }
        }
        space.loss_time = loss_time;

        let mut lost_bytes = 0;
        let mut largest_lost = None;
        for pn in lost {
            let packet = space.sent_packets.remove(&pn).expect("packet just listed");
            debug!(pn, size = packet.size, "packet lost");
            lost_bytes += u64::from(packet.size);
            largest_lost = Some(pn);
            Self::requeue(&mut self.handshake, &mut self.streams, space_id, packet.retransmits);
        }
        if let Some(largest) = largest_lost {
            self.path.congestion.on_packet_loss(largest, lost_bytes);
        }
    }

    fn requeue(
        handshake: &mut ClientHandshake,
        streams: &mut Streams,
        space_id: SpaceId,
        retransmits: Retransmits,
    ) {
        if let Some(crypto) = handshake.crypto_tx(crypto_level(space_id)) {
            for range in retransmits.crypto {
                crypto.on_loss(range);
            }
        }
        for meta in &retransmits.streams {
            streams.on_loss(meta);
        }
    }

    fn ack_retransmits(
        handshake: &mut ClientHandshake,
        streams: &mut Streams,
        space_id: SpaceId,
        retransmits: Retransmits,
    ) {
        if let Some(crypto) = handshake.crypto_tx(crypto_level(space_id)) {
            for range in retransmits.crypto {
                crypto.on_ack(range);
            }
        }
        for meta in &retransmits.streams {
            streams.on_ack(meta);
        }
    }

    fn discard_space(&mut self, space_id: SpaceId) {
        let space = &mut self.spaces[space_id as usize];
        if space.discarded {
            return;
        }
        debug!(?space_id, "discarding packet number space");
        let abandoned = space.discard();
        if abandoned > 0 {
            self.path
                .congestion
                .on_remove_bytes_from_inflight(abandoned);
        }
    }

    /// Produce the next outgoing datagram, if anything needs sending
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if let Some(close) = self.close_pending.take() {
            let contents = self.build_close_datagram(close)?;
            return Some(Transmit {
                destination: self.path.remote,
                contents,
            });
        }
        if !matches!(self.state, State::Handshake | State::Established) {
            return None;
        }

        let mut datagram = Vec::new();
        let budget = usize::from(self.config.udp_payload_size);
        for space_id in SpaceId::iter() {
            if datagram.len() >= budget {
                break;
            }
            self.build_packet(now, space_id, &mut datagram, budget);
        }
        if datagram.is_empty() {
            return None;
        }
        Some(Transmit {
            destination: self.path.remote,
            contents: datagram,
        })
    }

    /// Append one protected packet for `space_id` to `datagram`, if the space
    /// has keys and something to say
    fn build_packet(&mut self, now: Instant, space_id: SpaceId, datagram: &mut Vec<u8>, budget: usize) {
        let space = &self.spaces[space_id as usize];
        if space.discarded {
            return;
        }
        let zero_rtt = space_id == SpaceId::Data && space.tx_keys.is_none();
        let keys_available = if zero_rtt {
            self.zero_rtt_tx.is_some() && self.zero_rtt == ZeroRttState::Attempted
        } else {
            space.tx_keys.is_some()
        };
        if !keys_available {
            return;
        }

        let level = match (space_id, zero_rtt) {
            (SpaceId::Initial, _) => EncryptionLevel::Initial,
            (SpaceId::Handshake, _) => EncryptionLevel::Handshake,
            (SpaceId::Data, true) => EncryptionLevel::EarlyData,
            (SpaceId::Data, false) => EncryptionLevel::AppData,
        };

        let congestion_blocked = self.path.congestion.writable_bytes() == 0;
        let acks = space.pending_acks.can_send();
        let bundle_acks = !space.pending_acks.ranges().is_empty();
        let probe = space.ping_pending;
        let crypto_pending = self
            .handshake
            .crypto_tx(crypto_level(space_id))
            .is_some_and(|tx| tx.has_pending());
        let stream_pending = space_id == SpaceId::Data && self.streams.has_pending();
        let data_allowed = !congestion_blocked;
        let sendable =
            acks || probe || (data_allowed && (crypto_pending || stream_pending));
        if !sendable {
            return;
        }

        let tag_len = if zero_rtt {
            self.zero_rtt_tx.as_ref().unwrap().packet.tag_len()
        } else {
            self.spaces[space_id as usize]
                .tx_keys
                .as_ref()
                .unwrap()
                .packet
                .tag_len()
        };
        let max_payload = budget
            .saturating_sub(datagram.len() + MAX_HEADER_SIZE + tag_len);
        if max_payload == 0 {
            return;
        }

        // Assemble the plaintext payload
        let mut payload = Vec::new();
        let mut retransmits = Retransmits::default();
        let mut ack_eliciting = false;

        let space = &mut self.spaces[space_id as usize];
        if bundle_acks {
            frame::Ack::encode(0, space.pending_acks.ranges(), &mut payload);
            space.pending_acks.acks_sent();
        }
        if probe {
            payload.write(frame::Type::PING);
            space.ping_pending = false;
            ack_eliciting = true;
        }
        if data_allowed {
            if let Some(crypto) = self.handshake.crypto_tx(crypto_level(space_id)) {
                while payload.len() + frame::Crypto::SIZE_BOUND < max_payload {
                    let room = max_payload - payload.len() - frame::Crypto::SIZE_BOUND;
                    let Some((offset, data)) = crypto.next_chunk(room) else {
                        break;
                    };
                    let end = offset + data.len() as u64;
                    frame::Crypto { offset, data }.encode(&mut payload);
                    retransmits.crypto.push(offset..end);
                    ack_eliciting = true;
                }
            }
            if space_id == SpaceId::Data {
                while payload.len() + frame::Stream::SIZE_BOUND < max_payload {
                    let room = max_payload - payload.len() - frame::Stream::SIZE_BOUND;
                    let Some(stream) = self.streams.next_chunk(room) else {
                        break;
                    };
                    retransmits.streams.push(frame::StreamMeta {
                        id: stream.id,
                        offsets: stream.offset..stream.offset + stream.data.len() as u64,
                        fin: stream.fin,
                    });
                    stream.encode(true, &mut payload);
                    ack_eliciting = true;
                }
            }
        }
        if payload.is_empty() {
            return;
        }

        let space = &mut self.spaces[space_id as usize];
        let pn = space.get_tx_number();
        let number = PacketNumber::new(pn, space.largest_acked_packet.unwrap_or(0));

        // Header protection needs at least four bytes past the packet number
        if payload.len() + number.len() < HEADER_SAMPLE_LEN {
            payload.resize(HEADER_SAMPLE_LEN - number.len(), 0);
        }

        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                dcid: self.rem_cid,
                scid: self.local_cid,
                token: Bytes::new(),
                number,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: LongType::Handshake,
                dcid: self.rem_cid,
                scid: self.local_cid,
                number,
            },
            EncryptionLevel::EarlyData => Header::Long {
                ty: LongType::ZeroRtt,
                dcid: self.rem_cid,
                scid: self.local_cid,
                number,
            },
            EncryptionLevel::AppData => Header::Short {
                dcid: self.rem_cid,
                number,
            },
        };

        // Client Initial flights must fill the datagram to a minimum size.
        // Measure the real header so the padding lands exactly.
        if space_id == SpaceId::Initial && ack_eliciting {
            let mut scratch = Vec::new();
            let header_len = header.encode(&mut scratch, payload.len() + tag_len).header_len;
            let total = datagram.len() + header_len + payload.len() + tag_len;
            if total < MIN_INITIAL_SIZE {
                payload.resize(payload.len() + (MIN_INITIAL_SIZE - total), 0);
            }
        }

        let mut pkt = Vec::with_capacity(MAX_HEADER_SIZE + payload.len() + tag_len);
        let partial = header.encode(&mut pkt, payload.len() + tag_len);
        pkt.extend_from_slice(&payload);
        let keys = if zero_rtt {
            self.zero_rtt_tx.as_ref().unwrap()
        } else {
            self.spaces[space_id as usize].tx_keys.as_ref().unwrap()
        };
        keys.packet.encrypt(pn, &mut pkt, partial.header_len);
        keys.header.encrypt(partial.pn_offset, &mut pkt);

        trace!(
            ?level,
            pn,
            len = pkt.len(),
            ack_eliciting,
            "sending packet"
        );
        let size = pkt.len() as u16;
        datagram.extend_from_slice(&pkt);

        if ack_eliciting {
            let space = &mut self.spaces[space_id as usize];
            space.time_of_last_ack_eliciting_packet = Some(now);
            space.sent(
                pn,
                SentPacket {
                    time_sent: now,
                    size,
                    ack_eliciting,
                    is_early_data: zero_rtt,
                    retransmits,
                },
            );
            self.path.congestion.on_packet_sent(pn, u64::from(size));
        }
    }

    /// Emit a CONNECTION_CLOSE datagram under the best currently-available key
    fn build_close_datagram(&mut self, close: frame::Close) -> Option<Vec<u8>> {
        let candidates = [
            (SpaceId::Data, EncryptionLevel::AppData),
            (SpaceId::Handshake, EncryptionLevel::Handshake),
            (SpaceId::Initial, EncryptionLevel::Initial),
        ];
        let (space_id, level) = candidates.into_iter().find(|(id, _)| {
            let space = &self.spaces[*id as usize];
            !space.discarded && space.tx_keys.is_some()
        })?;

        let space = &mut self.spaces[space_id as usize];
        let pn = space.get_tx_number();
        let number = PacketNumber::new(pn, space.largest_acked_packet.unwrap_or(0));
        let budget = usize::from(self.config.udp_payload_size);

        let mut payload = Vec::new();
        close.encode(&mut payload, budget - MAX_HEADER_SIZE);
        if payload.len() + number.len() < HEADER_SAMPLE_LEN {
            payload.resize(HEADER_SAMPLE_LEN - number.len(), 0);
        }

        let header = match level {
            EncryptionLevel::AppData => Header::Short {
                dcid: self.rem_cid,
                number,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: LongType::Handshake,
                dcid: self.rem_cid,
                scid: self.local_cid,
                number,
            },
            _ => Header::Initial {
                dcid: self.rem_cid,
                scid: self.local_cid,
                token: Bytes::new(),
                number,
            },
        };
        let keys = space.tx_keys.as_ref().unwrap();
        let mut pkt = Vec::with_capacity(MAX_HEADER_SIZE + payload.len() + keys.packet.tag_len());
        let partial = header.encode(&mut pkt, payload.len() + keys.packet.tag_len());
        pkt.extend_from_slice(&payload);
        keys.packet.encrypt(pn, &mut pkt, partial.header_len);
        keys.header.encrypt(partial.pn_offset, &mut pkt);
        debug!(?level, "CONNECTION_CLOSE sent");
        Some(pkt)
    }

    /// The next deadline requiring a call to `handle_timeout`
    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.state {
            State::Drained => None,
            State::Closed | State::Draining => self.drain_deadline,
            State::Handshake | State::Established => {
                let mut deadline = self.idle_deadline;
                for space in &self.spaces {
                    if space.discarded {
                        continue;
                    }
                    if let Some(loss) = space.loss_time {
                        deadline = Some(deadline.map_or(loss, |d| d.min(loss)));
                    }
                }
                if let Some(pto) = self.pto_deadline() {
                    deadline = Some(deadline.map_or(pto, |d| d.min(pto)));
                }
                deadline
            }
        }
    }

    fn pto_interval(&self) -> Duration {
        self.path.rtt.pto_base() * 2u32.pow(self.pto_count.min(MAX_BACKOFF_EXPONENT))
    }

    fn pto_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        for space in &self.spaces {
            if space.discarded || space.sent_packets.is_empty() {
                continue;
            }
            if let Some(base) = space.time_of_last_ack_eliciting_packet {
                let t = base + self.pto_interval();
                deadline = Some(deadline.map_or(t, |d| d.min(t)));
            }
        }
        deadline
    }

    /// Handle the expiry of the deadline from `poll_timeout`
    pub fn handle_timeout(&mut self, now: Instant) {
        match self.state {
            State::Drained => {}
            State::Closed | State::Draining => {
                if self.drain_deadline.is_some_and(|d| d <= now) {
                    debug!("drain period ended");
                    self.state = State::Drained;
                }
            }
            State::Handshake | State::Established => {
                if self.idle_deadline.is_some_and(|d| d <= now) {
                    // Idle closure is silent; no CONNECTION_CLOSE is sent
                    debug!("idle timeout expired");
                    self.state = State::Drained;
                    self.queue_terminal(LocalError::IdleTimeout.into());
                    return;
                }
                let loss_fired = SpaceId::iter().any(|id| {
                    self.spaces[id as usize]
                        .loss_time
                        .is_some_and(|t| t <= now)
                });
                if loss_fired {
                    for id in SpaceId::iter() {
                        if self.spaces[id as usize]
                            .loss_time
                            .is_some_and(|t| t <= now)
                        {
                            self.detect_lost(now, id);
                        }
                    }
                    return;
                }
                if self.pto_deadline().is_some_and(|t| t <= now) {
                    self.on_probe_timeout(now);
                }
            }
        }
    }

    fn on_probe_timeout(&mut self, now: Instant) {
        self.pto_count = (self.pto_count + 1).min(MAX_BACKOFF_EXPONENT);
        self.first_pto.get_or_insert(now);
        // Probe in the latest space that still has something outstanding
        for id in SpaceId::iter().rev() {
            let space = &mut self.spaces[id as usize];
            if space.discarded || space.sent_packets.is_empty() {
                continue;
            }
            warn!(space = ?id, count = self.pto_count, "probe timeout");
            space.ping_pending = true;
            return;
        }
    }

    /// Close the connection, notifying the peer
    pub fn close(&mut self, now: Instant, error_code: VarInt, reason: Bytes) {
        if matches!(self.state, State::Closed | State::Draining | State::Drained) {
            return;
        }
        debug!("closing connection");
        self.close_pending = Some(frame::Close::Application(frame::ApplicationClose {
            error_code,
            reason,
        }));
        self.state = State::Closed;
        self.drain_deadline = Some(now + 3 * self.pto_interval());
        self.queue_terminal(ConnectionError::LocallyClosed);
    }

    /// Terminate with a local failure, sending CONNECTION_CLOSE once
    fn fail(&mut self, now: Instant, error: ConnectionError) {
        if matches!(self.state, State::Closed | State::Draining | State::Drained) {
            return;
        }
        warn!(%error, "connection failed");
        let close = match &error {
            ConnectionError::TransportError(e) => frame::ConnectionClose {
                error_code: e.code,
                frame_type: e.frame,
                reason: e.reason.clone().into(),
            },
            _ => frame::ConnectionClose {
                error_code: Code::INTERNAL_ERROR,
                frame_type: None,
                reason: error.to_string().into(),
            },
        };
        if matches!(
            &error,
            ConnectionError::TransportError(TransportError { code, .. }) if code.tls_alert().is_some()
        ) || matches!(&error, ConnectionError::Local(LocalError::HandshakeFailed))
        {
            // The ticket is tied to handshake state that just failed us
            if let Some(cache) = self.config.psk_cache.as_ref() {
                cache.remove(&self.config.server_name);
            }
        }
        self.close_pending = Some(frame::Close::Transport(close));
        self.state = State::Closed;
        self.drain_deadline = Some(now + 3 * self.pto_interval());
        self.queue_terminal(error);
    }

    fn queue_terminal(&mut self, reason: ConnectionError) {
        if self.terminal_queued {
            return;
        }
        self.terminal_queued = true;
        self.error = Some(reason.clone());
        self.events.push_back(Event::ConnectionLost { reason });
    }

    /// Drain the next application-visible event
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    //
    // Stream operations, forwarded to the stream layer
    //

    pub fn open_stream(&mut self, dir: Dir) -> Option<StreamId> {
        self.streams.open(dir)
    }

    /// Returns how many bytes were accepted under current flow control limits
    pub fn write_stream(&mut self, id: StreamId, data: &[u8]) -> Result<u64, ConnectionError> {
        Ok(self.streams.write(id, data)?)
    }

    pub fn finish_stream(&mut self, id: StreamId) {
        self.streams.finish(id);
    }

    pub fn read_stream(&mut self, id: StreamId) -> Option<Bytes> {
        self.streams.read(id)
    }

    //
    // Accessors
    //

    pub fn remote_address(&self) -> SocketAddr {
        self.path.remote
    }

    /// Adopt the peer address the winning socket of a dual-stack connect race
    /// reached the server at
    ///
    /// Only meaningful before the handshake completes; the loser's address is
    /// never used again.
    pub fn rebind_remote(&mut self, remote: SocketAddr) {
        if self.path.remote != remote {
            debug!(%remote, "peer address adopted from connect race");
            self.path.remote = remote;
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.state == State::Handshake
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed | State::Draining | State::Drained)
    }

    pub fn is_drained(&self) -> bool {
        self.state == State::Drained
    }

    /// Whether the TLS handshake was resumed from a cached PSK
    pub fn is_tls_resumed(&self) -> bool {
        self.handshake.is_tls_resumed()
    }

    pub fn zero_rtt_state(&self) -> ZeroRttState {
        self.zero_rtt
    }

    /// Whether attempted early data was rejected; `None` before the verdict
    /// or when none was attempted
    pub fn zero_rtt_rejected(&self) -> Option<bool> {
        self.handshake.zero_rtt_rejected()
    }

    /// The handshake's current phase
    pub fn phase(&self) -> Phase {
        self.handshake.phase()
    }

    /// The terminal error, once the connection has one
    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    pub fn rtt(&self) -> Duration {
        self.path.rtt.get()
    }

    pub fn congestion_window(&self) -> u64 {
        self.path.congestion.window()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.path.congestion.bytes_in_flight()
    }

    /// The negotiated transport parameters, once the peer's flight arrived
    pub fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }
}

/// The encryption level whose crypto stream backs a packet number space
fn crypto_level(space_id: SpaceId) -> EncryptionLevel {
    match space_id {
        SpaceId::Initial => EncryptionLevel::Initial,
        SpaceId::Handshake => EncryptionLevel::Handshake,
        SpaceId::Data => EncryptionLevel::AppData,
    }
}

/// Compute the effective idle timeout from both endpoints' parameters
///
/// Zero means the endpoint opted out; the timeout is the minimum of the
/// opted-in values.
fn negotiate_max_idle_timeout(local_ms: u64, peer_ms: u64) -> Option<Duration> {
    match (local_ms, peer_ms) {
        (0, 0) => None,
        (0, x) | (x, 0) => Some(Duration::from_millis(x)),
        (x, y) => Some(Duration::from_millis(x.min(y))),
    }
}

impl ConnectionId {
    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        Self::new(&bytes[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_negotiation() {
        assert_eq!(negotiate_max_idle_timeout(0, 0), None);
        assert_eq!(
            negotiate_max_idle_timeout(0, 5000),
            Some(Duration::from_millis(5000))
        );
        assert_eq!(
            negotiate_max_idle_timeout(30_000, 5000),
            Some(Duration::from_millis(5000))
        );
    }
}
