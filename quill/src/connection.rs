use std::{net::SocketAddr, sync::Arc, time::Instant};

use bytes::{Bytes, BytesMut};
use proto::{ClientConnection, ConnectionError, Dir, Event, StreamId, VarInt};
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant as TokioInstant},
};
use tracing::{debug, trace, warn};

use crate::{ConnectionObserver, CONN_ATTEMPT_DELAY, DATAGRAMS_PER_WRITE, IO_LOOP_BOUND};

/// Handle to a connection owned by its driver task
///
/// Dropping the handle closes the connection; the driver itself lingers until
/// the drain period ends, so late packets from the peer are absorbed rather
/// than bounced back as ICMP errors.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
}

/// The connection's driver is gone and can take no further requests
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("connection closed")]
pub struct Disconnected;

impl Connection {
    /// Open a new stream, or `None` if the peer's limit is exhausted
    pub async fn open_stream(&self, dir: Dir) -> Result<Option<StreamId>, Disconnected> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::OpenStream { dir, reply })
            .map_err(|_| Disconnected)?;
        rx.await.map_err(|_| Disconnected)
    }

    /// Write data to a stream, returning how much was accepted under current
    /// flow control limits
    pub async fn write(&self, id: StreamId, data: Bytes) -> Result<u64, WriteError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Write { id, data, reply })
            .map_err(|_| WriteError::Disconnected)?;
        rx.await.map_err(|_| WriteError::Disconnected)?
    }

    /// Signal that no further data will be written to the stream
    pub fn finish(&self, id: StreamId) -> Result<(), Disconnected> {
        self.commands
            .send(Command::Finish { id })
            .map_err(|_| Disconnected)
    }

    /// Take the readable bytes currently buffered on a stream
    pub async fn read(&self, id: StreamId) -> Result<Option<Bytes>, Disconnected> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Read { id, reply })
            .map_err(|_| Disconnected)?;
        rx.await.map_err(|_| Disconnected)
    }

    /// Close the connection gracefully
    pub fn close(&self, error_code: VarInt, reason: Bytes) {
        let _ = self.commands.send(Command::Close { error_code, reason });
    }
}

/// Errors from writing to a stream
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("connection closed")]
    Disconnected,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

enum Command {
    OpenStream {
        dir: Dir,
        reply: oneshot::Sender<Option<StreamId>>,
    },
    Write {
        id: StreamId,
        data: Bytes,
        reply: oneshot::Sender<Result<u64, WriteError>>,
    },
    Finish {
        id: StreamId,
    },
    Read {
        id: StreamId,
        reply: oneshot::Sender<Option<Bytes>>,
    },
    Close {
        error_code: VarInt,
        reason: Bytes,
    },
}

/// State of the dual-stack connect race
enum Race {
    /// A fallback address exists; the delay timer is armed
    Pending {
        remote: SocketAddr,
        deadline: TokioInstant,
    },
    /// Both attempts are in flight; first valid response wins
    Racing,
    /// Either there was no fallback or a winner has been chosen
    Decided,
}

struct SecondaryPath {
    socket: UdpSocket,
    remote: SocketAddr,
}

/// Single-owner event loop for one connection
///
/// All protocol state mutation happens on this task; the handle communicates
/// through the command channel.
pub(crate) struct Driver {
    conn: ClientConnection,
    observer: Arc<dyn ConnectionObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    primary: UdpSocket,
    secondary: Option<SecondaryPath>,
    race: Race,
    /// First-flight datagrams, replayed on the fallback path when the race
    /// timer fires
    first_flight: Vec<Vec<u8>>,
    set_up: bool,
    terminal_delivered: bool,
}

/// Upper bound on buffered first-flight datagrams
const FIRST_FLIGHT_LIMIT: usize = 8;

impl Driver {
    pub(crate) fn new(
        conn: ClientConnection,
        primary: UdpSocket,
        secondary_remote: Option<SocketAddr>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> (Connection, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let race = match secondary_remote {
            Some(remote) => Race::Pending {
                remote,
                deadline: TokioInstant::now() + CONN_ATTEMPT_DELAY,
            },
            None => Race::Decided,
        };
        (
            Connection { commands: tx },
            Self {
                conn,
                observer,
                commands: rx,
                commands_open: true,
                primary,
                secondary: None,
                race,
                first_flight: Vec::new(),
                set_up: false,
                terminal_delivered: false,
            },
        )
    }

    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; u16::MAX as usize];
        let mut buf2 = vec![0u8; u16::MAX as usize];
        loop {
            self.write_pump().await;
            self.drive_events();
            if self.terminal_delivered && self.conn.is_drained() {
                trace!("driver finished");
                return;
            }

            let timeout = self.conn.poll_timeout();
            let race_deadline = match self.race {
                Race::Pending { deadline, .. } => Some(deadline),
                _ => None,
            };
            tokio::select! {
                biased;
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // The application dropped its handle
                        self.commands_open = false;
                        self.conn
                            .close(Instant::now(), VarInt::from_u32(0), Bytes::new());
                    }
                },
                received = self.primary.recv_from(&mut buf) => {
                    if let Ok((len, from)) = received {
                        self.on_primary_response();
                        self.conn
                            .handle_datagram(Instant::now(), from, BytesMut::from(&buf[..len]));
                        self.drain_socket(&mut buf);
                    }
                },
                received = async {
                    self.secondary
                        .as_ref()
                        .expect("arm gated on secondary")
                        .socket
                        .recv_from(&mut buf2)
                        .await
                }, if self.secondary.is_some() => {
                    if let Ok((len, from)) = received {
                        self.on_secondary_response(from);
                        self.conn
                            .handle_datagram(Instant::now(), from, BytesMut::from(&buf2[..len]));
                    }
                },
                _ = sleep_until(race_deadline.unwrap_or_else(TokioInstant::now)),
                    if race_deadline.is_some() => self.start_second_attempt().await,
                _ = sleep_until(TokioInstant::from_std(timeout.unwrap_or_else(Instant::now))),
                    if timeout.is_some() => {
                    self.conn.handle_timeout(Instant::now());
                },
            }
        }
    }

    /// Pull any further datagrams already queued on the socket
    fn drain_socket(&mut self, buf: &mut [u8]) {
        for _ in 0..IO_LOOP_BOUND {
            match self.primary.try_recv_from(buf) {
                Ok((len, from)) => {
                    self.conn
                        .handle_datagram(Instant::now(), from, BytesMut::from(&buf[..len]));
                }
                Err(_) => break,
            }
        }
    }

    async fn write_pump(&mut self) {
        for _ in 0..DATAGRAMS_PER_WRITE {
            let Some(transmit) = self.conn.poll_transmit(Instant::now()) else {
                break;
            };
            if let Err(e) = self
                .primary
                .send_to(&transmit.contents, transmit.destination)
                .await
            {
                debug!(error = %e, "send failed");
            }
            match &self.race {
                Race::Pending { .. } => {
                    if self.first_flight.len() < FIRST_FLIGHT_LIMIT {
                        self.first_flight.push(transmit.contents.clone());
                    }
                }
                Race::Racing => {
                    if let Some(secondary) = &self.secondary {
                        let _ = secondary
                            .socket
                            .send_to(&transmit.contents, secondary.remote)
                            .await;
                    }
                }
                Race::Decided => {}
            }
        }
    }

    /// The delay expired without a response; open the fallback path and
    /// replay the first flight there
    async fn start_second_attempt(&mut self) {
        let Race::Pending { remote, .. } = &self.race else {
            return;
        };
        let remote = *remote;
        debug!(%remote, "starting fallback connect attempt");
        match crate::endpoint::bind_for(&remote).await {
            Ok(socket) => {
                for datagram in &self.first_flight {
                    let _ = socket.send_to(datagram, remote).await;
                }
                self.secondary = Some(SecondaryPath { socket, remote });
                self.race = Race::Racing;
            }
            Err(e) => {
                warn!(error = %e, "fallback socket bind failed");
                self.race = Race::Decided;
                self.first_flight.clear();
            }
        }
    }

    /// The preferred path answered first; the fallback is abandoned
    fn on_primary_response(&mut self) {
        if !matches!(self.race, Race::Decided) {
            if matches!(self.race, Race::Racing) {
                debug!("preferred path won the connect race");
            }
            self.race = Race::Decided;
            self.secondary = None;
            self.first_flight.clear();
        }
    }

    /// The fallback path answered first: it becomes the connection's path and
    /// the loser is closed with its state discarded
    fn on_secondary_response(&mut self, from: SocketAddr) {
        let secondary = self.secondary.take().expect("racing");
        debug!(%from, "fallback path won the connect race");
        self.conn.rebind_remote(secondary.remote);
        self.primary = secondary.socket;
        self.race = Race::Decided;
        self.first_flight.clear();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenStream { dir, reply } => {
                let _ = reply.send(self.conn.open_stream(dir));
            }
            Command::Write { id, data, reply } => {
                let result = self
                    .conn
                    .write_stream(id, &data)
                    .map_err(WriteError::Connection);
                let _ = reply.send(result);
            }
            Command::Finish { id } => self.conn.finish_stream(id),
            Command::Read { id, reply } => {
                let _ = reply.send(self.conn.read_stream(id));
            }
            Command::Close { error_code, reason } => {
                self.conn.close(Instant::now(), error_code, reason);
            }
        }
    }

    fn drive_events(&mut self) {
        while let Some(event) = self.conn.poll() {
            match event {
                Event::Connected => {
                    self.set_up = true;
                    // Handshake completion settles the connect race
                    self.on_primary_response();
                    self.observer.on_connection_set_up();
                }
                Event::ReplaySafe => self.observer.on_replay_safe(),
                Event::EarlyDataAccepted => self.observer.on_early_data(true),
                Event::EarlyDataRejected => self.observer.on_early_data(false),
                Event::Stream(stream_event) => self.observer.on_stream_event(&stream_event),
                Event::ConnectionLost { reason } => {
                    if self.terminal_delivered {
                        continue;
                    }
                    self.terminal_delivered = true;
                    match (&reason, self.set_up) {
                        (ConnectionError::LocallyClosed, _) => self.observer.on_connection_end(),
                        (_, false) => self.observer.on_connection_setup_error(&reason),
                        (_, true) => self.observer.on_connection_error(&reason),
                    }
                }
            }
        }
    }
}
