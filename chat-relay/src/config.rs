use std::time::Duration;

/// Tunables for a relay server. Defaults suit a local chat room.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Largest accepted frame payload in bytes.
    pub max_frame_len: usize,
    /// Reject a join whose username is already online.
    pub enforce_unique_usernames: bool,
    /// Deliver a sender's own messages back to it.
    pub echo_to_sender: bool,
    /// How long a new connection may take to send its join frame.
    pub handshake_timeout: Duration,
    /// Malformed frames tolerated before the connection is closed.
    pub malformed_frame_threshold: u32,
    /// Frames buffered per recipient before it is considered dead.
    pub send_queue_capacity: usize,
    /// Upper bound on a single socket write.
    pub send_timeout: Duration,
    /// How long sessions may take to flush and close on shutdown.
    pub shutdown_grace: Duration,
    /// Recent history messages replayed to a client after it joins.
    pub history_replay: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 64 * 1024,
            enforce_unique_usernames: false,
            echo_to_sender: false,
            handshake_timeout: Duration::from_secs(10),
            malformed_frame_threshold: 10,
            send_queue_capacity: 64,
            send_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            history_replay: 10,
        }
    }
}

impl RelayConfig {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_frame_len: self.max_frame_len,
            send_queue_capacity: self.send_queue_capacity,
            send_timeout: self.send_timeout,
        }
    }
}

/// The subset of [`RelayConfig`] a single connection needs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_frame_len: usize,
    pub send_queue_capacity: usize,
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        RelayConfig::default().connection()
    }
}
