//! Traits abstracting the TLS 1.3 record layer and packet protection keys
//!
//! The transport drives the cryptographic handshake through the [`Session`]
//! trait without knowing which TLS library backs it. Packet protection is
//! expressed through the [`PacketKey`]/[`HeaderKey`] traits; the *ring*-backed
//! key derivation in [`self::ring`] supplies the concrete ciphers from the
//! secrets a session hands out.

use bytes::BytesMut;

use crate::{packet::EncryptionLevel, transport_parameters::TransportParameters, TransportError};

pub mod ring;

/// A TLS 1.3 record layer driven over QUIC CRYPTO frames, client side
///
/// Implementations are constructed already started: the first calls to
/// [`Session::poll_event`] yield the ClientHello bytes (and, when resuming with
/// early data, the 0-RTT write secret) without any input having been fed.
pub trait Session: Send {
    /// The encryption level the record layer is currently reading at
    ///
    /// The handshake feeds the read buffer for this level; the level advances
    /// as the key schedule progresses.
    fn read_level(&self) -> EncryptionLevel;

    /// Feed handshake bytes received at the current read level
    ///
    /// Returns the number of bytes consumed. Zero means the record layer needs
    /// more data before it can make progress. TLS alerts surface as
    /// `TransportError` values with a `crypto` code.
    fn read_handshake(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Drain the next pending output of the record layer
    fn poll_event(&mut self) -> Option<SessionEvent>;

    /// Whether the handshake is still in progress
    fn is_handshaking(&self) -> bool;

    /// Whether the negotiated PSK type is resumption
    fn is_resumed(&self) -> bool;

    /// The application protocol negotiated during (or cached for) the handshake
    fn alpn(&self) -> Option<Vec<u8>>;

    /// The peer's transport parameters, once its first flight has been read
    fn peer_transport_parameters(&self) -> Option<TransportParameters>;
}

/// Output of the record layer, in the order it was produced
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake bytes to carry in CRYPTO frames at the given level
    WriteCrypto {
        level: EncryptionLevel,
        data: Vec<u8>,
    },
    /// The key schedule progressed and a traffic secret is available
    SecretReady {
        kind: CipherKind,
        suite: CipherSuite,
        secret: Vec<u8>,
    },
    /// The TLS handshake completed
    ///
    /// `early_data_accepted` reports the server's 0-RTT verdict and is only
    /// meaningful when early data was offered.
    HandshakeComplete { early_data_accepted: Option<bool> },
    /// The server issued a session ticket usable for resumption
    NewSessionTicket {
        ticket: Vec<u8>,
        max_early_data_size: u32,
    },
}

/// Which cipher slot a derived secret belongs to
///
/// Initial keys are not derived through the record layer and have no kind here.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CipherKind {
    HandshakeRead,
    HandshakeWrite,
    OneRttRead,
    OneRttWrite,
    ZeroRttWrite,
}

/// The AEAD/hash pairing negotiated by the record layer
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    ChaCha20Poly1305Sha256,
}

/// Keys to protect packets in one direction at one encryption level
pub struct Keys {
    /// Protects the packet payload
    pub packet: Box<dyn PacketKey>,
    /// Protects the packet header
    pub header: Box<dyn HeaderKey>,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Keys")
    }
}

/// Directed pair of key sets for a single encryption level
#[derive(Debug)]
pub struct KeyPair {
    pub read: Keys,
    pub write: Keys,
}

/// Keys used to protect packet payloads
pub trait PacketKey: Send {
    /// Encrypt the payload in place and append the authentication tag
    ///
    /// `buf[..header_len]` is the packet header, used as associated data.
    fn encrypt(&self, packet: u64, buf: &mut Vec<u8>, header_len: usize);
    /// Decrypt the payload in place, trimming the tag on success
    fn decrypt(&self, packet: u64, header: &[u8], payload: &mut BytesMut)
        -> Result<(), CryptoError>;
    /// The length of the authentication tag appended on encryption
    fn tag_len(&self) -> usize;
}

/// Keys used to protect packet headers
pub trait HeaderKey: Send {
    /// Remove header protection in place
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Apply header protection in place
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The ciphertext sample size used by this key's algorithm
    fn sample_size(&self) -> usize;
}

/// A pseudo-random key derivation or packet protection operation failed
///
/// Carried without detail: the dispatch loop drops undecryptable packets
/// silently rather than reacting to them.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CryptoError;
