use std::time::Duration;

/// Configuration for listeners and outbound connections.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use beam_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_frame_size(32 * 1024)
///     .handshake_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum sealed frame size in bytes (ciphertext + tag).
    pub(crate) max_frame_size: usize,
    /// Upper bound for the full handshake, including key confirmation.
    pub(crate) handshake_timeout: Duration,
    /// Channel buffer size for accepted streams.
    pub(crate) accept_backlog: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
            accept_backlog: 16,
        }
    }

    /// Set the maximum sealed frame size (default: 64 KiB).
    ///
    /// Writes larger than a frame are split transparently.
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the handshake timeout (default: 10s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set how many authenticated streams may wait in the accept queue (default: 16).
    pub fn accept_backlog(mut self, capacity: usize) -> Self {
        self.accept_backlog = capacity;
        self
    }
}
