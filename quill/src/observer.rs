use proto::{ConnectionError, StreamEvent};

/// Receiver of a connection's lifecycle
///
/// Each connection delivers exactly one of [`on_connection_set_up`] or
/// [`on_connection_setup_error`], then zero or more replay-safe and stream
/// notifications, and finally exactly one of [`on_connection_end`] or
/// [`on_connection_error`]. All callbacks run on the connection's driver
/// task; implementations should hand heavy work elsewhere.
///
/// [`on_connection_set_up`]: ConnectionObserver::on_connection_set_up
/// [`on_connection_setup_error`]: ConnectionObserver::on_connection_setup_error
/// [`on_connection_end`]: ConnectionObserver::on_connection_end
/// [`on_connection_error`]: ConnectionObserver::on_connection_error
pub trait ConnectionObserver: Send + Sync {
    /// The handshake completed and application data may flow
    fn on_connection_set_up(&self) {}

    /// The connection failed before it was ever usable
    fn on_connection_setup_error(&self, _error: &ConnectionError) {}

    /// The peer demonstrably installed 1-RTT keys; data sent from now on
    /// cannot be replayed
    fn on_replay_safe(&self) {}

    /// The server's 0-RTT verdict, when early data was offered
    fn on_early_data(&self, _accepted: bool) {}

    /// A stream changed state or has data to read
    fn on_stream_event(&self, _event: &StreamEvent) {}

    /// The connection ended at the local application's request
    fn on_connection_end(&self) {}

    /// The connection ended for any other reason
    fn on_connection_error(&self, _error: &ConnectionError) {}
}
