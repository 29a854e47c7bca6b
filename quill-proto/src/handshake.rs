//! Client-side handshake driver
//!
//! Feeds CRYPTO bytes into the TLS record layer across encryption levels,
//! installs the ciphers the key schedule produces, and reconciles the 0-RTT
//! verdict before declaring the handshake complete.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::{
    connection::ConnectionError,
    crypto::{ring, CipherKind, CipherSuite, Keys, Session, SessionEvent},
    packet::EncryptionLevel,
    psk::CachedPsk,
    streams::SendBuffer,
    transport_error::LocalError,
    transport_parameters::TransportParameters,
};

/// Progress of the cryptographic handshake
///
/// Transitions are strictly monotonic. `Established` is only reached once the
/// peer demonstrably installed 1-RTT keys by sending data under them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Phase {
    Initial,
    Handshake,
    OneRttKeysDerived,
    Established,
}

/// Notable handshake milestones surfaced to the connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum HandshakeEvent {
    /// The TLS handshake completed and 1-RTT keys are derived
    Done,
    EarlyDataAccepted,
    /// Early data was refused but the parameters it was sent under still hold;
    /// the early packets must be retransmitted under 1-RTT keys
    EarlyDataRejected,
    /// The server issued a resumption ticket
    NewSessionTicket {
        ticket: Vec<u8>,
        max_early_data_size: u32,
    },
}

/// Read buffer indices; EarlyData and AppData share a buffer because inbound
/// post-handshake messages arrive 1-RTT protected and the client's own early
/// data never comes back to it
fn read_buf(level: EncryptionLevel) -> usize {
    match level {
        EncryptionLevel::Initial => 0,
        EncryptionLevel::Handshake => 1,
        EncryptionLevel::EarlyData | EncryptionLevel::AppData => 2,
    }
}

pub(crate) struct ClientHandshake {
    session: Box<dyn Session>,
    phase: Phase,
    /// Sticky failure; every accessor reports it instead of yielding state
    error: Option<ConnectionError>,
    read_bufs: [Vec<u8>; 3],
    /// Outbound crypto streams for the Initial and Handshake levels. The
    /// client never writes handshake data at the AppData level.
    crypto_tx: [SendBuffer; 2],

    handshake_read: Option<Keys>,
    handshake_write: Option<Keys>,
    one_rtt_read: Option<Keys>,
    one_rtt_write: Option<Keys>,
    zero_rtt_write: Option<Keys>,

    suite: Option<CipherSuite>,
    psk: Option<CachedPsk>,
    early_data_attempted: bool,
    zero_rtt_rejected: Option<bool>,
    events: VecDeque<HandshakeEvent>,
    wait_for_data: bool,
}

impl ClientHandshake {
    /// Start a handshake over an already-started record layer session
    ///
    /// The session's first flight (and the 0-RTT write secret, when resuming
    /// with early data) is drained immediately.
    pub fn new(session: Box<dyn Session>, psk: Option<CachedPsk>) -> Self {
        let mut this = Self {
            session,
            phase: Phase::Initial,
            error: None,
            read_bufs: Default::default(),
            crypto_tx: Default::default(),
            handshake_read: None,
            handshake_write: None,
            one_rtt_read: None,
            one_rtt_write: None,
            zero_rtt_write: None,
            suite: None,
            psk,
            early_data_attempted: false,
            zero_rtt_rejected: None,
            events: VecDeque::new(),
            wait_for_data: false,
        };
        this.drain_session_events();
        this
    }

    /// Feed CRYPTO bytes received at `level` into the record layer
    pub fn on_crypto_data(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        self.check()?;
        if self.phase == Phase::Initial {
            // This could be an HRR or a cleartext alert; move on eagerly.
            self.phase = Phase::Handshake;
        }
        self.read_bufs[read_buf(level)].extend_from_slice(data);

        self.wait_for_data = false;
        while !self.wait_for_data {
            // Feed whichever buffer the record layer is currently consuming
            let wanted = self.session.read_level();
            let buf = &mut self.read_bufs[read_buf(wanted)];
            if buf.is_empty() {
                break;
            }
            match self.session.read_handshake(buf) {
                Ok(0) => self.wait_for_data = true,
                Ok(n) => {
                    buf.drain(..n);
                }
                Err(e) => {
                    debug!(error = %e, "record layer rejected handshake data");
                    self.error = Some(ConnectionError::TransportError(e));
                }
            }
            self.drain_session_events();
            self.check()?;
        }
        Ok(())
    }

    fn drain_session_events(&mut self) {
        while let Some(event) = self.session.poll_event() {
            match event {
                SessionEvent::WriteCrypto { level, data } => self.write_crypto(level, &data),
                SessionEvent::SecretReady {
                    kind,
                    suite,
                    secret,
                } => self.compute_ciphers(kind, suite, &secret),
                SessionEvent::HandshakeComplete {
                    early_data_accepted,
                } => self.on_handshake_complete(early_data_accepted),
                SessionEvent::NewSessionTicket {
                    ticket,
                    max_early_data_size,
                } => self.events.push_back(HandshakeEvent::NewSessionTicket {
                    ticket,
                    max_early_data_size,
                }),
            }
        }
    }

    fn write_crypto(&mut self, level: EncryptionLevel, data: &[u8]) {
        match level {
            EncryptionLevel::Initial => self.crypto_tx[0].write(data),
            EncryptionLevel::Handshake => self.crypto_tx[1].write(data),
            // Don't write 1-RTT handshake data on the client.
            EncryptionLevel::EarlyData | EncryptionLevel::AppData => {}
        }
    }

    /// Derive an AEAD and packet number cipher from `secret` and install them
    /// into the slot for `kind`
    fn compute_ciphers(&mut self, kind: CipherKind, suite: CipherSuite, secret: &[u8]) {
        trace!(?kind, ?suite, "installing cipher");
        let keys = ring::keys_from_secret(suite, secret);
        let slot = match kind {
            CipherKind::HandshakeRead => &mut self.handshake_read,
            CipherKind::HandshakeWrite => &mut self.handshake_write,
            CipherKind::OneRttRead => &mut self.one_rtt_read,
            CipherKind::OneRttWrite => &mut self.one_rtt_write,
            CipherKind::ZeroRttWrite => {
                self.early_data_attempted = true;
                &mut self.zero_rtt_write
            }
        };
        debug_assert!(slot.is_none(), "cipher slot installed twice");
        *slot = Some(keys);
        if kind == CipherKind::OneRttWrite {
            self.suite = Some(suite);
        }
    }

    fn on_handshake_complete(&mut self, early_data_accepted: Option<bool>) {
        if self.early_data_attempted {
            if early_data_accepted == Some(true) {
                self.zero_rtt_rejected = Some(false);
                self.events.push_back(HandshakeEvent::EarlyDataAccepted);
            } else if self.early_params_match() {
                // The early write failed; the data is treated as lost and
                // retransmitted under the 1-RTT keys.
                self.zero_rtt_rejected = Some(true);
                self.events.push_back(HandshakeEvent::EarlyDataRejected);
            } else {
                // Replaying under changed parameters is not supported.
                self.error = Some(ConnectionError::Local(LocalError::EarlyDataRejected));
                return;
            }
        }
        self.phase = Phase::OneRttKeysDerived;
        self.events.push_back(HandshakeEvent::Done);
    }

    /// Whether the parameters 0-RTT data was sent under survived negotiation
    fn early_params_match(&self) -> bool {
        let Some(psk) = &self.psk else {
            return false;
        };
        let Some(new_params) = self.session.peer_transport_parameters() else {
            return false;
        };
        new_params.resumption_subset_matches(&psk.server_params)
            && self.session.alpn().as_deref() == Some(&psk.alpn[..])
    }

    /// Notify the crypto layer that we received 1-RTT protected data; the
    /// peer has implicitly acked the 1-RTT keys
    pub fn on_recv_one_rtt_protected_data(&mut self) {
        if self.phase != Phase::Established {
            self.phase = Phase::Established;
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_tls_resumed(&self) -> bool {
        self.session.is_resumed()
    }

    /// The reconciled 0-RTT verdict: `None` until the handshake completes or
    /// when no early data was attempted
    pub fn zero_rtt_rejected(&self) -> Option<bool> {
        self.zero_rtt_rejected
    }

    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.session.alpn()
    }

    pub fn negotiated_suite(&self) -> Option<CipherSuite> {
        self.suite
    }

    pub fn peer_transport_parameters(&self) -> Option<TransportParameters> {
        self.session.peer_transport_parameters()
    }

    pub fn poll_event(&mut self) -> Option<HandshakeEvent> {
        self.events.pop_front()
    }

    /// Move derived keys out of their slot; each slot yields at most once
    pub fn take_keys(&mut self, kind: CipherKind) -> Result<Option<Keys>, ConnectionError> {
        self.check()?;
        Ok(match kind {
            CipherKind::HandshakeRead => self.handshake_read.take(),
            CipherKind::HandshakeWrite => self.handshake_write.take(),
            CipherKind::OneRttRead => self.one_rtt_read.take(),
            CipherKind::OneRttWrite => self.one_rtt_write.take(),
            CipherKind::ZeroRttWrite => self.zero_rtt_write.take(),
        })
    }

    /// The outbound crypto stream for `level`, if the client writes there
    pub fn crypto_tx(&mut self, level: EncryptionLevel) -> Option<&mut SendBuffer> {
        match level {
            EncryptionLevel::Initial => Some(&mut self.crypto_tx[0]),
            EncryptionLevel::Handshake => Some(&mut self.crypto_tx[1]),
            EncryptionLevel::EarlyData | EncryptionLevel::AppData => None,
        }
    }

    fn check(&self) -> Result<(), ConnectionError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
