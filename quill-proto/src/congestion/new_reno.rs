use tracing::trace;

use super::{
    add_and_check_overflow, bounded_cwnd, sub_and_check_underflow, Controller, ControllerFactory,
    DEFAULT_UDP_PAYLOAD_SIZE,
};

/// A simple, standard congestion controller
#[derive(Debug, Clone)]
pub struct NewReno {
    config: NewRenoConfig,
    max_datagram_size: u64,
    /// Maximum number of bytes in flight that may be sent.
    cwnd: u64,
    /// Slow start threshold in bytes. When the congestion window is below
    /// ssthresh, the mode is slow start and the window grows by the number of
    /// bytes acknowledged.
    ssthresh: u64,
    bytes_in_flight: u64,
    /// The packet number that ends the current recovery epoch. Losses of
    /// packets numbered below this do not reduce the window again.
    end_of_recovery: u64,
    largest_sent: u64,
}

impl NewReno {
    pub fn new(config: NewRenoConfig, max_datagram_size: u64) -> Self {
        let cwnd = bounded_cwnd(
            config.initial_window_packets * max_datagram_size,
            max_datagram_size,
            config.max_window_packets,
            config.min_window_packets,
        );
        Self {
            config,
            max_datagram_size,
            cwnd,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            end_of_recovery: 0,
            largest_sent: 0,
        }
    }

    fn clamp_cwnd(&mut self) {
        self.cwnd = bounded_cwnd(
            self.cwnd,
            self.max_datagram_size,
            self.config.max_window_packets,
            self.config.min_window_packets,
        );
    }
}

impl Controller for NewReno {
    fn on_packet_sent(&mut self, packet_number: u64, bytes: u64) {
        add_and_check_overflow(&mut self.bytes_in_flight, bytes);
        self.largest_sent = self.largest_sent.max(packet_number);
        trace!(
            pn = packet_number,
            cwnd = self.cwnd,
            in_flight = self.bytes_in_flight,
            "sent"
        );
    }

    fn on_packet_acked(&mut self, largest_acked: u64, bytes: u64) {
        sub_and_check_underflow(&mut self.bytes_in_flight, bytes);
        if largest_acked < self.end_of_recovery {
            // Still inside a recovery epoch; the window has already been
            // reduced for these packets and must not grow on their account.
            return;
        }
        if self.cwnd < self.ssthresh {
            // Slow start
            add_and_check_overflow(&mut self.cwnd, bytes);
        } else {
            // Congestion avoidance
            let addition = (DEFAULT_UDP_PAYLOAD_SIZE * bytes) / self.cwnd;
            add_and_check_overflow(&mut self.cwnd, addition);
        }
        self.clamp_cwnd();
        trace!(
            largest_acked,
            cwnd = self.cwnd,
            in_flight = self.bytes_in_flight,
            "acked"
        );
    }

    fn on_packet_loss(&mut self, largest_lost: u64, bytes: u64) {
        sub_and_check_underflow(&mut self.bytes_in_flight, bytes);
        if self.end_of_recovery < largest_lost {
            self.end_of_recovery = self.largest_sent;
            self.cwnd >>= 1;
            self.clamp_cwnd();
            // This causes us to exit slow start.
            self.ssthresh = self.cwnd;
            trace!(
                largest_lost,
                cwnd = self.cwnd,
                ssthresh = self.ssthresh,
                "entered recovery"
            );
        } else {
            trace!(largest_lost, cwnd = self.cwnd, "loss within recovery epoch");
        }
    }

    fn on_rto_verified(&mut self) {
        self.cwnd = self.config.min_window_packets * self.max_datagram_size;
        trace!(cwnd = self.cwnd, "window collapsed after verified RTO");
    }

    fn on_remove_bytes_from_inflight(&mut self, bytes: u64) {
        sub_and_check_underflow(&mut self.bytes_in_flight, bytes);
    }

    fn writable_bytes(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    fn window(&self) -> u64 {
        self.cwnd
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }
}

/// Configuration for the `NewReno` congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    /// Initial congestion window, in packets
    pub initial_window_packets: u64,
    /// Lower bound on the congestion window, in packets
    pub min_window_packets: u64,
    /// Upper bound on the congestion window, in packets
    pub max_window_packets: u64,
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            initial_window_packets: 10,
            min_window_packets: 2,
            max_window_packets: 2000,
        }
    }
}

impl ControllerFactory for NewRenoConfig {
    fn build(&self, max_datagram_size: u64) -> Box<dyn Controller> {
        Box::new(NewReno::new(self.clone(), max_datagram_size))
    }
}
