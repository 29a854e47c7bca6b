//! Connection-level scenario tests
//!
//! These drive `ClientConnection` against a scripted record layer and a
//! hand-built peer that derives the server half of every key, so complete
//! datagrams flow in both directions without a real TLS stack.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};

use crate::{
    connection::{ClientConfig, ClientConnection, ConnectionError, Event, ZeroRttState},
    crypto::{
        ring::{initial_keys, keys_from_secret},
        CipherKind, CipherSuite, KeyPair, Keys, Session, SessionEvent,
    },
    frame::{self, Frame},
    handshake::Phase,
    packet::{EncryptionLevel, Header, LongType, PacketNumber, PartialDecode, SpaceId},
    psk::{CachedPsk, InMemoryPskCache, PskCache},
    range_set::RangeSet,
    transport_error::LocalError,
    transport_parameters::TransportParameters,
    ConnectionId, Dir, Side, VarInt,
};

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

const CLIENT_HELLO: &[u8] = b"client-hello----";
const SERVER_HELLO: &[u8] = b"server-hello----";
const SERVER_FINISHED: &[u8] = b"server-finished-";
const CLIENT_FINISHED: &[u8] = b"client-finished-";
const ALERT: &[u8] = b"alert-----------";
const MSG_LEN: usize = 16;

const HS_CLIENT_SECRET: [u8; 32] = [1; 32];
const HS_SERVER_SECRET: [u8; 32] = [2; 32];
const ONE_RTT_CLIENT_SECRET: [u8; 32] = [3; 32];
const ONE_RTT_SERVER_SECRET: [u8; 32] = [4; 32];
const ZERO_RTT_SECRET: [u8; 32] = [5; 32];

const SUITE: CipherSuite = CipherSuite::Aes128GcmSha256;
const ALPN: &[u8] = b"hq";

/// Record layer with fully scripted behavior
///
/// Consumes fixed 16-byte "messages" and plays out the key schedule at the
/// same points a real TLS 1.3 client would.
struct TestSession {
    resumed: bool,
    offer_early_data: bool,
    accept_early_data: bool,
    server_params: TransportParameters,
    read_level: EncryptionLevel,
    events: VecDeque<SessionEvent>,
    handshaking: bool,
    params_revealed: bool,
}

impl TestSession {
    fn start(
        resumed: bool,
        offer_early_data: bool,
        accept_early_data: bool,
        server_params: TransportParameters,
    ) -> Box<dyn Session> {
        let mut events = VecDeque::new();
        events.push_back(SessionEvent::WriteCrypto {
            level: EncryptionLevel::Initial,
            data: CLIENT_HELLO.to_vec(),
        });
        if offer_early_data {
            events.push_back(SessionEvent::SecretReady {
                kind: CipherKind::ZeroRttWrite,
                suite: SUITE,
                secret: ZERO_RTT_SECRET.to_vec(),
            });
        }
        Box::new(Self {
            resumed,
            offer_early_data,
            accept_early_data,
            server_params,
            read_level: EncryptionLevel::Initial,
            events,
            handshaking: true,
            params_revealed: false,
        })
    }
}

impl Session for TestSession {
    fn read_level(&self) -> EncryptionLevel {
        self.read_level
    }

    fn read_handshake(&mut self, buf: &[u8]) -> Result<usize, crate::TransportError> {
        if buf.len() < MSG_LEN {
            return Ok(0);
        }
        let msg = &buf[..MSG_LEN];
        if msg == ALERT {
            return Err(crate::TransportError::crypto(40, "peer sent alert"));
        }
        match self.read_level {
            EncryptionLevel::Initial => {
                assert_eq!(msg, SERVER_HELLO, "unexpected initial message");
                self.params_revealed = true;
                self.events.push_back(SessionEvent::SecretReady {
                    kind: CipherKind::HandshakeRead,
                    suite: SUITE,
                    secret: HS_SERVER_SECRET.to_vec(),
                });
                self.events.push_back(SessionEvent::SecretReady {
                    kind: CipherKind::HandshakeWrite,
                    suite: SUITE,
                    secret: HS_CLIENT_SECRET.to_vec(),
                });
                self.read_level = EncryptionLevel::Handshake;
            }
            EncryptionLevel::Handshake => {
                assert_eq!(msg, SERVER_FINISHED, "unexpected handshake message");
                self.events.push_back(SessionEvent::WriteCrypto {
                    level: EncryptionLevel::Handshake,
                    data: CLIENT_FINISHED.to_vec(),
                });
                self.events.push_back(SessionEvent::SecretReady {
                    kind: CipherKind::OneRttRead,
                    suite: SUITE,
                    secret: ONE_RTT_SERVER_SECRET.to_vec(),
                });
                self.events.push_back(SessionEvent::SecretReady {
                    kind: CipherKind::OneRttWrite,
                    suite: SUITE,
                    secret: ONE_RTT_CLIENT_SECRET.to_vec(),
                });
                self.events.push_back(SessionEvent::HandshakeComplete {
                    early_data_accepted: self
                        .offer_early_data
                        .then_some(self.accept_early_data),
                });
                self.handshaking = false;
                self.read_level = EncryptionLevel::AppData;
            }
            EncryptionLevel::EarlyData | EncryptionLevel::AppData => {
                // Post-handshake: session tickets
                self.events.push_back(SessionEvent::NewSessionTicket {
                    ticket: msg.to_vec(),
                    max_early_data_size: 0xffff,
                });
            }
        }
        Ok(MSG_LEN)
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    fn is_resumed(&self) -> bool {
        self.resumed
    }

    fn alpn(&self) -> Option<Vec<u8>> {
        Some(ALPN.to_vec())
    }

    fn peer_transport_parameters(&self) -> Option<TransportParameters> {
        self.params_revealed.then(|| self.server_params.clone())
    }
}

/// The server half of the wire, implemented directly on the codecs
struct TestPeer {
    server_cid: ConnectionId,
    client_cid: Option<ConnectionId>,
    initial: Option<KeyPair>,
    hs_read: Keys,
    hs_write: Keys,
    zero_rtt_read: Keys,
    one_rtt_read: Keys,
    one_rtt_write: Keys,
    next_pn: [u64; 3],
    rx_packet: [u64; 3],
    received: [RangeSet; 3],
    /// Frames recovered from the client's packets, with their level
    frames: Vec<(EncryptionLevel, Frame)>,
}

impl TestPeer {
    fn new() -> Self {
        Self {
            server_cid: ConnectionId::new(&[0xd0; 8]),
            client_cid: None,
            initial: None,
            hs_read: keys_from_secret(SUITE, &HS_CLIENT_SECRET),
            hs_write: keys_from_secret(SUITE, &HS_SERVER_SECRET),
            zero_rtt_read: keys_from_secret(SUITE, &ZERO_RTT_SECRET),
            one_rtt_read: keys_from_secret(SUITE, &ONE_RTT_CLIENT_SECRET),
            one_rtt_write: keys_from_secret(SUITE, &ONE_RTT_SERVER_SECRET),
            next_pn: [0; 3],
            rx_packet: [0; 3],
            received: [RangeSet::new(), RangeSet::new(), RangeSet::new()],
            frames: Vec::new(),
        }
    }

    /// Decrypt every packet in a client datagram, recording its frames
    fn recv(&mut self, datagram: &[u8]) {
        let mut rest = Some(BytesMut::from(datagram));
        while let Some(chunk) = rest.take() {
            let (partial, more) = PartialDecode::new(chunk, 8).expect("client datagram decodes");
            rest = more;
            let level = partial.level();
            if self.initial.is_none() {
                assert_eq!(level, EncryptionLevel::Initial, "first packet must be Initial");
                self.initial = Some(initial_keys(partial.dcid(), Side::Server));
            }
            let keys = match level {
                EncryptionLevel::Initial => &self.initial.as_ref().unwrap().read,
                EncryptionLevel::Handshake => &self.hs_read,
                EncryptionLevel::EarlyData => &self.zero_rtt_read,
                EncryptionLevel::AppData => &self.one_rtt_read,
            };
            let space = level.space() as usize;
            let mut packet = partial
                .finish(&*keys.header, self.rx_packet[space] + 1)
                .expect("header protection removes");
            keys.packet
                .decrypt(packet.number, &packet.header_data, &mut packet.payload)
                .expect("client packet decrypts");
            self.rx_packet[space] = self.rx_packet[space].max(packet.number);
            self.received[space].insert_one(packet.number);
            if let Header::Initial { ref scid, .. } | Header::Long { ref scid, .. } = packet.header
            {
                self.client_cid = Some(*scid);
            }
            for frame in frame::Iter::new(packet.payload.freeze()) {
                self.frames.push((level, frame.expect("client frames parse")));
            }
        }
    }

    /// Bytes of CRYPTO stream data seen so far at `level`
    fn crypto_received(&self, level: EncryptionLevel) -> Vec<u8> {
        let mut chunks: Vec<_> = self
            .frames
            .iter()
            .filter_map(|(l, f)| match f {
                Frame::Crypto(c) if *l == level => Some((c.offset, c.data.clone())),
                _ => None,
            })
            .collect();
        chunks.sort_by_key(|(off, _)| *off);
        let mut out = Vec::new();
        for (off, data) in chunks {
            if (off as usize) <= out.len() {
                let skip = out.len() - off as usize;
                if skip < data.len() {
                    out.extend_from_slice(&data[skip..]);
                }
            }
        }
        out
    }

    fn stream_frames(&self) -> Vec<(EncryptionLevel, frame::Stream)> {
        self.frames
            .iter()
            .filter_map(|(l, f)| match f {
                Frame::Stream(s) => Some((*l, s.clone())),
                _ => None,
            })
            .collect()
    }

    fn close_frames(&self) -> Vec<(EncryptionLevel, frame::Close)> {
        self.frames
            .iter()
            .filter_map(|(l, f)| match f {
                Frame::Close(c) => Some((*l, c.clone())),
                _ => None,
            })
            .collect()
    }

    fn build_packet(&mut self, level: EncryptionLevel, payload: Vec<u8>) -> Vec<u8> {
        let client_cid = self.client_cid.expect("client CID learned");
        let space = level.space() as usize;
        let pn = self.next_pn[space];
        self.next_pn[space] += 1;
        let number = PacketNumber::new(pn, 0);
        let keys = match level {
            EncryptionLevel::Initial => &self.initial.as_ref().unwrap().write,
            EncryptionLevel::Handshake => &self.hs_write,
            EncryptionLevel::AppData => &self.one_rtt_write,
            EncryptionLevel::EarlyData => panic!("servers do not send 0-RTT"),
        };
        let mut payload = payload;
        if payload.len() + number.len() < 4 {
            payload.resize(4 - number.len(), 0);
        }
        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                dcid: client_cid,
                scid: self.server_cid,
                token: Bytes::new(),
                number,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: LongType::Handshake,
                dcid: client_cid,
                scid: self.server_cid,
                number,
            },
            _ => Header::Short {
                dcid: client_cid,
                number,
            },
        };
        let mut pkt = Vec::new();
        let partial = header.encode(&mut pkt, payload.len() + keys.packet.tag_len());
        pkt.extend_from_slice(&payload);
        keys.packet.encrypt(pn, &mut pkt, partial.header_len);
        keys.header.encrypt(partial.pn_offset, &mut pkt);
        pkt
    }

    fn crypto_frame(&self, data: &[u8], offset: u64) -> Vec<u8> {
        let mut payload = Vec::new();
        frame::Crypto {
            offset,
            data: Bytes::copy_from_slice(data),
        }
        .encode(&mut payload);
        payload
    }

    fn ack_frame(&self, space: SpaceId) -> Vec<u8> {
        let mut payload = Vec::new();
        frame::Ack::encode(0, &self.received[space as usize], &mut payload);
        payload
    }
}

struct Pair {
    client: ClientConnection,
    peer: TestPeer,
    remote: SocketAddr,
    now: Instant,
}

fn server_params() -> TransportParameters {
    TransportParameters {
        initial_max_data: 1 << 20,
        initial_max_stream_data_bidi_local: 1 << 18,
        initial_max_stream_data_bidi_remote: 1 << 18,
        initial_max_stream_data_uni: 1 << 18,
        initial_max_streams_bidi: 16,
        initial_max_streams_uni: 16,
        max_idle_timeout: 60_000,
        ..TransportParameters::default()
    }
}

fn cached_psk() -> CachedPsk {
    CachedPsk {
        ticket: b"ticket-from-last-time".to_vec(),
        server_params: server_params(),
        alpn: ALPN.to_vec(),
        cipher_suite: SUITE,
        max_early_data_size: 0xffff,
        issued: SystemTime::now(),
    }
}

impl Pair {
    fn new(session: Box<dyn Session>, psk: Option<CachedPsk>, cache: Option<Arc<dyn PskCache>>) -> Self {
        let remote: SocketAddr = "[::1]:4433".parse().unwrap();
        let mut config = ClientConfig::new("server.example");
        config.psk_cache = cache;
        let now = Instant::now();
        Self {
            client: ClientConnection::new(config, remote, session, psk, now),
            peer: TestPeer::new(),
            remote,
            now,
        }
    }

    fn fresh() -> Self {
        Self::new(
            TestSession::start(false, false, false, server_params()),
            None,
            None,
        )
    }

    /// Drain the client's outgoing datagrams into the peer
    fn flush_client(&mut self) {
        while let Some(transmit) = self.client.poll_transmit(self.now) {
            assert_eq!(transmit.destination, self.remote);
            self.peer.recv(&transmit.contents);
        }
    }

    fn deliver(&mut self, datagram: Vec<u8>) {
        self.client
            .handle_datagram(self.now, self.remote, BytesMut::from(&datagram[..]));
    }

    fn events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = self.client.poll() {
            out.push(event);
        }
        out
    }

    /// Run the peer's side of a full handshake, stopping before the final
    /// 1-RTT packet that would establish the connection
    fn run_server_flights(&mut self) {
        self.flush_client();
        assert_eq!(
            self.peer.crypto_received(EncryptionLevel::Initial),
            CLIENT_HELLO
        );
        let ack = self.peer.ack_frame(SpaceId::Initial);
        let hello = self.peer.crypto_frame(SERVER_HELLO, 0);
        let dgram = self
            .peer
            .build_packet(EncryptionLevel::Initial, [ack, hello].concat());
        self.deliver(dgram);

        let finished = self.peer.crypto_frame(SERVER_FINISHED, 0);
        let dgram = self.peer.build_packet(EncryptionLevel::Handshake, finished);
        self.deliver(dgram);
        self.flush_client();
        assert_eq!(
            self.peer.crypto_received(EncryptionLevel::Handshake),
            CLIENT_FINISHED
        );
    }

    /// Ack everything outstanding and confirm 1-RTT, establishing the
    /// connection
    fn establish(&mut self) {
        let ack = self.peer.ack_frame(SpaceId::Handshake);
        let dgram = self.peer.build_packet(EncryptionLevel::Handshake, ack);
        self.deliver(dgram);
        let payload = if self.peer.received[SpaceId::Data as usize].is_empty() {
            vec![0x01] // PING
        } else {
            self.peer.ack_frame(SpaceId::Data)
        };
        let dgram = self.peer.build_packet(EncryptionLevel::AppData, payload);
        self.deliver(dgram);
        self.flush_client();
    }
}

#[test]
fn fresh_one_rtt_handshake() {
    let _guard = subscribe();
    let mut pair = Pair::fresh();
    assert_eq!(pair.client.phase(), Phase::Initial);
    assert!(pair.client.is_handshaking());

    pair.flush_client();
    // The client's first flight is a padded Initial
    assert_eq!(pair.peer.crypto_received(EncryptionLevel::Initial), CLIENT_HELLO);

    let ack = pair.peer.ack_frame(SpaceId::Initial);
    let hello = pair.peer.crypto_frame(SERVER_HELLO, 0);
    let dgram = pair
        .peer
        .build_packet(EncryptionLevel::Initial, [ack, hello].concat());
    pair.deliver(dgram);
    assert_eq!(pair.client.phase(), Phase::Handshake);

    let finished = pair.peer.crypto_frame(SERVER_FINISHED, 0);
    let dgram = pair.peer.build_packet(EncryptionLevel::Handshake, finished);
    pair.deliver(dgram);
    assert_eq!(pair.client.phase(), Phase::OneRttKeysDerived);
    assert!(!pair.client.is_handshaking());

    pair.flush_client();
    assert_eq!(
        pair.peer.crypto_received(EncryptionLevel::Handshake),
        CLIENT_FINISHED
    );

    pair.establish();
    assert_eq!(pair.client.phase(), Phase::Established);
    assert!(!pair.client.is_tls_resumed());
    assert_eq!(pair.client.zero_rtt_state(), ZeroRttState::None);

    let events = pair.events();
    let replay_safe = events
        .iter()
        .filter(|e| matches!(e, Event::ReplaySafe))
        .count();
    assert_eq!(replay_safe, 1, "ReplaySafe fires exactly once");
    assert!(events.iter().any(|e| matches!(e, Event::Connected)));

    // Further 1-RTT data does not repeat ReplaySafe
    let dgram = pair.peer.build_packet(EncryptionLevel::AppData, vec![0x01]);
    pair.deliver(dgram);
    assert!(pair.events().iter().all(|e| !matches!(e, Event::ReplaySafe)));
}

#[test]
fn handshake_chunking_is_equivalent() {
    // Deliver the server hello split across two CRYPTO frames in separate
    // datagrams; the result matches the unchunked handshake.
    let mut pair = Pair::fresh();
    pair.flush_client();

    let first = pair.peer.crypto_frame(&SERVER_HELLO[..5], 0);
    let dgram = pair.peer.build_packet(EncryptionLevel::Initial, first);
    pair.deliver(dgram);
    // An incomplete message leaves the record layer waiting
    assert_eq!(pair.client.phase(), Phase::Handshake);

    let rest = pair.peer.crypto_frame(&SERVER_HELLO[5..], 5);
    let dgram = pair.peer.build_packet(EncryptionLevel::Initial, rest);
    pair.deliver(dgram);

    let finished = pair.peer.crypto_frame(SERVER_FINISHED, 0);
    let dgram = pair.peer.build_packet(EncryptionLevel::Handshake, finished);
    pair.deliver(dgram);
    assert_eq!(pair.client.phase(), Phase::OneRttKeysDerived);
}

#[test]
fn resumption_with_accepted_zero_rtt() {
    let _guard = subscribe();
    let session = TestSession::start(true, true, true, server_params());
    let mut pair = Pair::new(session, Some(cached_psk()), None);

    // Early data written before the handshake completes
    let id = pair.client.open_stream(Dir::Bi).expect("cached limits admit a stream");
    assert_eq!(pair.client.write_stream(id, &[0x5a; 100]).unwrap(), 100);

    pair.run_server_flights();
    let zero_rtt: Vec<_> = pair
        .peer
        .stream_frames()
        .into_iter()
        .filter(|(l, _)| *l == EncryptionLevel::EarlyData)
        .collect();
    assert_eq!(zero_rtt.len(), 1, "the 100 bytes travelled as 0-RTT");
    assert_eq!(zero_rtt[0].1.data.len(), 100);

    pair.establish();
    assert_eq!(pair.client.zero_rtt_state(), ZeroRttState::Accepted);
    assert_eq!(pair.client.zero_rtt_rejected(), Some(false));
    assert!(pair.client.is_tls_resumed());
    assert_eq!(pair.client.phase(), Phase::Established);
    // The early bytes were acked in the Data space; nothing is in flight
    assert_eq!(pair.client.bytes_in_flight(), 0);
    let events = pair.events();
    assert!(events.iter().any(|e| matches!(e, Event::EarlyDataAccepted)));
}

#[test]
fn zero_rtt_rejected_with_matching_params_is_resent() {
    let _guard = subscribe();
    let session = TestSession::start(true, true, false, server_params());
    let mut pair = Pair::new(session, Some(cached_psk()), None);

    let id = pair.client.open_stream(Dir::Bi).unwrap();
    pair.client.write_stream(id, &[0x5a; 100]).unwrap();

    pair.run_server_flights();
    assert_eq!(pair.client.zero_rtt_state(), ZeroRttState::Rejected);
    assert_eq!(pair.client.zero_rtt_rejected(), Some(true));
    let events = pair.events();
    assert!(events.iter().any(|e| matches!(e, Event::EarlyDataRejected)));

    // The data is retransmitted under 1-RTT protection
    pair.flush_client();
    let resent: Vec<_> = pair
        .peer
        .stream_frames()
        .into_iter()
        .filter(|(l, _)| *l == EncryptionLevel::AppData)
        .collect();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].1.offset, 0);
    assert_eq!(resent[0].1.data.len(), 100);

    pair.establish();
    assert_eq!(pair.client.phase(), Phase::Established);
    assert!(pair.client.error().is_none());
}

#[test]
fn zero_rtt_rejected_with_changed_params_fails() {
    let mut changed = server_params();
    changed.initial_max_data += 1;
    let session = TestSession::start(true, true, false, changed);
    let mut pair = Pair::new(session, Some(cached_psk()), None);

    let id = pair.client.open_stream(Dir::Bi).unwrap();
    pair.client.write_stream(id, &[0x5a; 100]).unwrap();

    pair.flush_client();
    let ack = pair.peer.ack_frame(SpaceId::Initial);
    let hello = pair.peer.crypto_frame(SERVER_HELLO, 0);
    let dgram = pair
        .peer
        .build_packet(EncryptionLevel::Initial, [ack, hello].concat());
    pair.deliver(dgram);
    let finished = pair.peer.crypto_frame(SERVER_FINISHED, 0);
    let dgram = pair.peer.build_packet(EncryptionLevel::Handshake, finished);
    pair.deliver(dgram);

    let events = pair.events();
    assert!(
        events.iter().all(|e| !matches!(e, Event::ReplaySafe)),
        "no ReplaySafe after a failed connection"
    );
    assert_matches!(
        events.last(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::Local(LocalError::EarlyDataRejected)
        })
    );
    assert!(pair.client.is_closed());

    // The failure is announced to the peer
    pair.flush_client();
    assert!(!pair.peer.close_frames().is_empty());
}

#[test]
fn redelivered_ack_is_idempotent() {
    let mut pair = Pair::fresh();
    pair.run_server_flights();
    pair.establish();
    pair.events();

    let id = pair.client.open_stream(Dir::Bi).unwrap();
    pair.client.write_stream(id, &[0xaa; 500]).unwrap();
    pair.flush_client();
    assert!(pair.client.bytes_in_flight() > 0);

    let ack = pair.peer.ack_frame(SpaceId::Data);
    let dgram = pair.peer.build_packet(EncryptionLevel::AppData, ack.clone());
    pair.deliver(dgram);
    assert_eq!(pair.client.bytes_in_flight(), 0);
    let window = pair.client.congestion_window();

    // The same ACK ranges delivered again change nothing
    let dgram = pair.peer.build_packet(EncryptionLevel::AppData, ack);
    pair.deliver(dgram);
    assert_eq!(pair.client.bytes_in_flight(), 0);
    assert_eq!(pair.client.congestion_window(), window);
    assert!(pair.client.error().is_none());
}

#[test]
fn session_ticket_is_cached() {
    let cache: Arc<InMemoryPskCache> = Arc::new(InMemoryPskCache::new());
    let session = TestSession::start(false, false, false, server_params());
    let mut pair = Pair::new(session, None, Some(cache.clone()));
    pair.run_server_flights();
    pair.establish();

    assert!(cache.get("server.example").is_none());
    let ticket = pair.peer.crypto_frame(b"ticket-number-one", 0);
    let dgram = pair.peer.build_packet(EncryptionLevel::AppData, ticket);
    pair.deliver(dgram);

    let cached = cache.get("server.example").expect("ticket cached");
    assert_eq!(cached.alpn, ALPN);
    assert_eq!(cached.server_params.initial_max_data, 1 << 20);
}

#[test]
fn crypto_alert_fails_connection_and_drops_psk() {
    let cache: Arc<InMemoryPskCache> = Arc::new(InMemoryPskCache::new());
    cache.put("server.example", cached_psk());
    let session = TestSession::start(false, false, false, server_params());
    let mut pair = Pair::new(session, None, Some(cache.clone()));

    pair.flush_client();
    let alert = pair.peer.crypto_frame(ALERT, 0);
    let dgram = pair.peer.build_packet(EncryptionLevel::Initial, alert);
    pair.deliver(dgram);

    let events = pair.events();
    assert_matches!(
        events.last(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::TransportError(e)
        }) if e.code.tls_alert() == Some(40)
    );
    assert!(cache.get("server.example").is_none(), "ticket invalidated");

    // Exactly one terminal event; the transport is inert afterwards
    pair.flush_client();
    let dgram = pair.peer.build_packet(EncryptionLevel::Initial, vec![0x01]);
    pair.deliver(dgram);
    assert!(pair.events().is_empty());
}

#[test]
fn local_close_sends_connection_close_under_best_key() {
    let mut pair = Pair::fresh();
    pair.run_server_flights();
    pair.establish();
    pair.events();

    pair.client
        .close(pair.now, VarInt::from_u32(0), Bytes::from_static(b"done"));
    pair.flush_client();
    let closes = pair.peer.close_frames();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].0, EncryptionLevel::AppData, "1-RTT keys preferred");

    // Closing again is a no-op and produces no second terminal event
    let events = pair.events();
    assert_matches!(
        events.last(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::LocallyClosed
        })
    );
    pair.client
        .close(pair.now, VarInt::from_u32(1), Bytes::from_static(b"again"));
    assert!(pair.events().is_empty());
    assert!(pair.client.poll_transmit(pair.now).is_none());
}

#[test]
fn idle_timeout_terminates_silently() {
    let mut pair = Pair::fresh();
    pair.flush_client();

    assert!(pair.client.poll_timeout().is_some());
    // Well past the 30s idle default, regardless of pending probe timers
    pair.client.handle_timeout(pair.now + Duration::from_secs(31));
    let events = pair.events();
    assert_matches!(
        events.last(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::Local(LocalError::IdleTimeout)
        })
    );
    assert!(pair.client.is_drained());
    // Idle closure sends nothing
    assert!(pair.client.poll_transmit(pair.now).is_none());
}

#[test]
fn lost_initial_flight_is_probed_and_retransmitted() {
    let mut pair = Pair::fresh();
    pair.flush_client();
    let frames_before = pair.peer.frames.len();

    // No response arrives; the probe timer fires
    let deadline = pair.client.poll_timeout().expect("PTO armed");
    pair.client.handle_timeout(deadline);
    pair.flush_client();
    assert!(
        pair.peer.frames.len() > frames_before,
        "probe elicited another packet"
    );
    assert!(pair.client.error().is_none());
}

#[test]
fn stream_data_flows_after_establishment() {
    let mut pair = Pair::fresh();
    pair.run_server_flights();
    pair.establish();
    pair.events();

    // Outbound
    let id = pair.client.open_stream(Dir::Bi).unwrap();
    pair.client.write_stream(id, b"request body").unwrap();
    pair.client.finish_stream(id);
    pair.flush_client();
    let sent = pair.peer.stream_frames();
    let (_, last) = sent.last().expect("stream frame sent");
    assert!(last.fin);

    // Inbound
    let mut payload = Vec::new();
    frame::Stream {
        id,
        offset: 0,
        fin: true,
        data: Bytes::from_static(b"response"),
    }
    .encode(true, &mut payload);
    let dgram = pair.peer.build_packet(EncryptionLevel::AppData, payload);
    pair.deliver(dgram);
    let events = pair.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Stream(crate::StreamEvent::Readable { id: got }) if *got == id)));
    assert_eq!(pair.client.read_stream(id).unwrap(), Bytes::from_static(b"response"));
}
