//! Logic for controlling the rate at which data is sent

mod new_reno;

pub use new_reno::{NewReno, NewRenoConfig};

/// Payload size used for the congestion avoidance additive factor
///
/// Kept fixed rather than using the connection's configured payload size to
/// preserve the window growth rate of existing deployments.
pub const DEFAULT_UDP_PAYLOAD_SIZE: u64 = 1252;

/// Common interface for congestion controllers
///
/// The controller owns the in-flight byte accounting: every packet enrolled in
/// the outstanding set is reported through `on_packet_sent` and leaves through
/// exactly one of `on_packet_acked`, `on_packet_loss`, or
/// `on_remove_bytes_from_inflight`.
pub trait Controller: Send {
    /// A packet counted toward the congestion window was sent
    fn on_packet_sent(&mut self, packet_number: u64, bytes: u64);

    /// The peer acknowledged `bytes` of in-flight data
    ///
    /// `largest_acked` is the largest packet number covered by the ACK.
    fn on_packet_acked(&mut self, largest_acked: u64, bytes: u64);

    /// `bytes` of in-flight data were declared lost
    ///
    /// `largest_lost` is the largest packet number in the loss event.
    fn on_packet_loss(&mut self, largest_lost: u64, bytes: u64);

    /// A retransmission timeout was confirmed by a subsequent acknowledgement
    fn on_rto_verified(&mut self);

    /// `bytes` are no longer tracked at all, e.g. because their packet number
    /// space was discarded
    fn on_remove_bytes_from_inflight(&mut self, bytes: u64);

    /// Bytes that may be sent without exceeding the congestion window
    fn writable_bytes(&self) -> u64;

    /// The current congestion window in bytes
    fn window(&self) -> u64;

    /// Bytes currently counted as in flight
    fn bytes_in_flight(&self) -> u64;

    /// Whether the window is still growing by the full size of each ack
    fn in_slow_start(&self) -> bool;

    /// Whether this controller's output may be smoothed by a pacer
    fn can_be_paced(&self) -> bool {
        false
    }
}

/// Constructs controllers on demand
pub trait ControllerFactory {
    fn build(&self, max_datagram_size: u64) -> Box<dyn Controller>;
}

/// Add to an accounting quantity, treating overflow as a fatal accounting bug
#[track_caller]
fn add_and_check_overflow(lhs: &mut u64, rhs: u64) {
    *lhs = lhs
        .checked_add(rhs)
        .expect("congestion accounting overflow");
}

/// Subtract from an accounting quantity, treating underflow as a fatal
/// accounting bug rather than a recoverable protocol condition
#[track_caller]
fn sub_and_check_underflow(lhs: &mut u64, rhs: u64) {
    *lhs = lhs
        .checked_sub(rhs)
        .expect("congestion accounting underflow");
}

/// Clamp a window to the configured packet-count bounds
fn bounded_cwnd(cwnd: u64, max_datagram_size: u64, max_cwnd_in_pkts: u64, min_cwnd_in_pkts: u64) -> u64 {
    cwnd.min(max_cwnd_in_pkts * max_datagram_size)
        .max(min_cwnd_in_pkts * max_datagram_size)
}
