//! QUIC client transport for Tokio
//!
//! This crate drives the runtime-independent state machine from `quill-proto`:
//! it owns the UDP sockets and timers, runs the read/write pump on a single
//! task, races dual-stack connect attempts, and delivers the connection's
//! lifecycle to a [`ConnectionObserver`].
//!
//! The entry point is [`Endpoint::connect`].

mod connection;
mod endpoint;
mod observer;

pub use proto::{
    crypto, psk, ClientConfig, ConnectionError, Dir, EncryptionLevel, LocalError, Phase,
    StreamEvent, StreamId, TransportError, VarInt, ZeroRttState,
};

pub use crate::{
    connection::{Connection, Disconnected, WriteError},
    endpoint::{AddrFamily, ConnectOptions, Endpoint, SessionFactory},
    observer::ConnectionObserver,
};

/// Maximum number of socket operations per pump pass
///
/// This helps ensure we don't starve timers and commands when the CPU is
/// slower than the link.
const IO_LOOP_BOUND: usize = 10;

/// Datagrams written per wakeup before yielding back to the event loop
const DATAGRAMS_PER_WRITE: usize = 5;

/// How long the preferred address family gets a head start in a dual-stack
/// connect race
const CONN_ATTEMPT_DELAY: std::time::Duration = std::time::Duration::from_millis(150);
