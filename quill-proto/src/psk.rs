//! Cache of pre-shared keys from previous sessions
//!
//! A cached PSK enables TLS resumption and, together with the transport
//! parameters remembered from the previous connection, an attempt at 0-RTT.
//! Persistence is the implementor's concern; the transport only ever calls
//! the cache from its own task.

use std::{
    sync::Mutex,
    time::SystemTime,
};

use rustc_hash::FxHashMap;

use crate::{crypto::CipherSuite, transport_parameters::TransportParameters};

/// A resumption ticket and the connection properties it was issued under
#[derive(Debug, Clone)]
pub struct CachedPsk {
    /// Opaque ticket issued by the server
    pub ticket: Vec<u8>,
    /// The server's transport parameters at issue time
    ///
    /// 0-RTT data is sent under these limits and must be abandoned if the
    /// server no longer agrees to them.
    pub server_params: TransportParameters,
    /// Application protocol negotiated when the ticket was issued
    pub alpn: Vec<u8>,
    /// Cipher suite the ticket is bound to
    pub cipher_suite: CipherSuite,
    /// Maximum number of early data bytes the server will accept, 0 if none
    pub max_early_data_size: u32,
    /// When the server issued the ticket
    pub issued: SystemTime,
}

impl CachedPsk {
    /// Whether this ticket permits sending early data at all
    pub fn supports_early_data(&self) -> bool {
        self.max_early_data_size > 0
    }
}

/// Shared store of cached PSKs, keyed by server identity (typically hostname)
///
/// A single cache may back many transports concurrently.
pub trait PskCache: Send + Sync {
    fn get(&self, server_id: &str) -> Option<CachedPsk>;
    fn put(&self, server_id: &str, psk: CachedPsk);
    fn remove(&self, server_id: &str);
}

/// Process-local PSK cache with no persistence
#[derive(Debug, Default)]
pub struct InMemoryPskCache {
    entries: Mutex<FxHashMap<String, CachedPsk>>,
}

impl InMemoryPskCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PskCache for InMemoryPskCache {
    fn get(&self, server_id: &str) -> Option<CachedPsk> {
        self.entries.lock().unwrap().get(server_id).cloned()
    }

    fn put(&self, server_id: &str, psk: CachedPsk) {
        self.entries
            .lock()
            .unwrap()
            .insert(server_id.to_owned(), psk);
    }

    fn remove(&self, server_id: &str) {
        self.entries.lock().unwrap().remove(server_id);
    }
}
