use std::{cmp, net::SocketAddr, time::Duration};

use crate::congestion::Controller;

/// Maximum timer inaccuracy we compensate for when arming loss timers
pub(super) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Description of the network path the connection is currently using
///
/// Clients never probe alternative paths; a new `PathData` only ever exists
/// while a dual-stack connect race is still undecided, at which point the
/// loser is dropped wholesale.
pub(super) struct PathData {
    pub(super) remote: SocketAddr,
    pub(super) rtt: RttEstimator,
    /// Congestion controller state
    pub(super) congestion: Box<dyn Controller>,
}

impl PathData {
    pub(super) fn new(remote: SocketAddr, congestion: Box<dyn Controller>, initial_rtt: Duration) -> Self {
        Self {
            remote,
            rtt: RttEstimator::new(initial_rtt),
            congestion,
        }
    }
}

/// RTT estimation for the connection's path
#[derive(Copy, Clone)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a
    /// previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC 6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC 6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay
    min: Duration,
}

impl RttEstimator {
    pub(super) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Conservative estimate of RTT, used for loss deadlines
    pub fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    /// Minimum RTT registered so far
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Base probe timeout interval before backoff
    pub(super) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    pub(super) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        if let Some(smoothed) = self.smoothed {
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}
