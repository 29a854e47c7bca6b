use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use proto::{crypto::Session, psk::CachedPsk, ClientConfig, ClientConnection};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::{
    connection::{Connection, Driver},
    ConnectionObserver,
};

/// Builds the TLS record layer for a connection attempt
///
/// Invoked with the connection's configuration, whose transport parameters
/// belong in the ClientHello extension, and with the PSK found in the
/// configured cache, if any, so the session can offer resumption and early
/// data.
pub type SessionFactory =
    Box<dyn FnOnce(&ClientConfig, Option<&CachedPsk>) -> Box<dyn Session> + Send>;

/// An IP address family, used to steer the dual-stack connect race
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv6() {
            Self::V6
        } else {
            Self::V4
        }
    }
}

/// Where and how to connect
pub struct ConnectOptions {
    /// Candidate server addresses; typically one per address family
    pub addrs: Vec<SocketAddr>,
    /// Race the two address families when both are present
    pub happy_eyeballs: bool,
    /// The family that worked last time, tried first when set
    pub cached_family: Option<AddrFamily>,
}

impl ConnectOptions {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addrs: vec![addr],
            happy_eyeballs: true,
            cached_family: None,
        }
    }

    pub fn with_addrs(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            happy_eyeballs: true,
            cached_family: None,
        }
    }
}

/// Client endpoint: owns the registry of live connections
///
/// Connection drivers hold a reference to the registry and remove themselves
/// once their terminal callback has been delivered and the drain period has
/// passed, so a connection outlives the caller's handle exactly long enough
/// to absorb the peer's lingering traffic.
#[derive(Clone, Default)]
pub struct Endpoint {
    registry: Arc<Registry>,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, ()>>,
}

impl Registry {
    pub(crate) fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().unwrap().insert(id, ());
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.live.lock().unwrap().remove(&id);
    }

    fn len(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections whose drivers are still running
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Start a connection to the server described by `config`
    ///
    /// The returned handle is usable immediately; lifecycle progress arrives
    /// through `observer`.
    pub async fn connect(
        &self,
        config: ClientConfig,
        options: ConnectOptions,
        session: SessionFactory,
        observer: Arc<dyn ConnectionObserver>,
    ) -> io::Result<Connection> {
        let (primary, secondary) = choose_addrs(&options)?;
        let socket = bind_for(&primary).await?;
        let psk = config
            .psk_cache
            .as_ref()
            .and_then(|cache| cache.get(&config.server_name));
        let session = session(&config, psk.as_ref());
        debug!(%primary, secondary = ?secondary, resuming = psk.is_some(), "connect");
        let conn = ClientConnection::new(config, primary, session, psk, Instant::now());

        let registry = self.registry.clone();
        let id = registry.register();
        let (handle, driver) = Driver::new(conn, socket, secondary, observer);
        tokio::spawn(async move {
            driver.run().await;
            registry.deregister(id);
        });
        Ok(handle)
    }
}

/// Pick the address to try first and, for a dual-stack race, the fallback
fn choose_addrs(options: &ConnectOptions) -> io::Result<(SocketAddr, Option<SocketAddr>)> {
    let preferred = options.cached_family.unwrap_or_else(|| {
        if options.addrs.iter().any(SocketAddr::is_ipv6) {
            AddrFamily::V6
        } else {
            AddrFamily::V4
        }
    });
    let primary = options
        .addrs
        .iter()
        .find(|a| AddrFamily::of(a) == preferred)
        .or(options.addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no peer addresses"))?;
    let secondary = options
        .happy_eyeballs
        .then(|| {
            options
                .addrs
                .iter()
                .find(|a| AddrFamily::of(a) != AddrFamily::of(&primary))
                .copied()
        })
        .flatten();
    Ok((primary, secondary))
}

pub(crate) async fn bind_for(remote: &SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if remote.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    UdpSocket::bind(local).await
}
