use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Window size for authentication keypairs.
pub const SHORT_DRIFT: Duration = Duration::from_secs(2 * 60);

/// Window size for discovery topics.
pub const LONG_DRIFT: Duration = Duration::from_secs(30 * 60);

/// Source of wall-clock time in milliseconds since the Unix epoch.
///
/// Production uses [`SystemClock`]; tests plug in a [`ManualClock`] to
/// simulate skewed peers.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Configuration for a single pipe.
///
/// ```rust
/// use beam_pipe::BeamConfig;
///
/// let config = BeamConfig::new()
///     .read_chunk_size(16 * 1024)
///     .passphrase_words(6);
/// ```
#[derive(Clone)]
pub struct BeamConfig {
    /// Window size for authentication keypairs.
    pub(crate) short_drift: Duration,
    /// Window size for discovery topics.
    pub(crate) long_drift: Duration,
    /// Largest chunk pulled from the incoming transport per read.
    pub(crate) read_chunk_size: usize,
    /// Buffer size of the event broadcast channel.
    pub(crate) event_capacity: usize,
    /// Number of words in a generated passphrase.
    pub(crate) passphrase_words: usize,
    /// How often a waiting responder checks whether its identity rolled over.
    pub(crate) rekey_interval: Duration,
    pub(crate) clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BeamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeamConfig")
            .field("short_drift", &self.short_drift)
            .field("long_drift", &self.long_drift)
            .field("read_chunk_size", &self.read_chunk_size)
            .field("event_capacity", &self.event_capacity)
            .field("passphrase_words", &self.passphrase_words)
            .field("rekey_interval", &self.rekey_interval)
            .finish_non_exhaustive()
    }
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BeamConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            short_drift: SHORT_DRIFT,
            long_drift: LONG_DRIFT,
            read_chunk_size: 64 * 1024,
            event_capacity: 32,
            passphrase_words: crate::secret::DEFAULT_WORDS,
            rekey_interval: Duration::from_secs(1),
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the authentication window (default: 2 minutes).
    pub fn short_drift(mut self, drift: Duration) -> Self {
        self.short_drift = drift;
        self
    }

    /// Set the discovery window (default: 30 minutes).
    pub fn long_drift(mut self, drift: Duration) -> Self {
        self.long_drift = drift;
        self
    }

    /// Set the maximum size of a single read (default: 64 KiB).
    pub fn read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    /// Set the event channel capacity (default: 32).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the length of generated passphrases (default: 8 words).
    pub fn passphrase_words(mut self, words: usize) -> Self {
        self.passphrase_words = words;
        self
    }

    /// Set how often a waiting responder re-derives its identity (default: 1s).
    pub fn rekey_interval(mut self, interval: Duration) -> Self {
        self.rekey_interval = interval;
        self
    }

    /// Replace the wall clock used for key derivation.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Check the values before a pipe is built from them.
    pub(crate) fn validate(&self) -> Result<(), crate::BeamError> {
        if self.short_drift.as_millis() == 0 || self.long_drift.as_millis() == 0 {
            return Err(crate::BeamError::Config("drift windows must be non-zero".into()));
        }
        if self.rekey_interval.is_zero() {
            return Err(crate::BeamError::Config("rekey interval must be non-zero".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(crate::BeamError::Config("read chunk size must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(crate::BeamError::Config("event capacity must be non-zero".into()));
        }
        if self.passphrase_words < crate::secret::MIN_WORDS {
            return Err(crate::BeamError::Config(format!(
                "generated passphrases need at least {} words",
                crate::secret::MIN_WORDS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        BeamConfig::new().validate().unwrap();
    }

    #[test]
    fn test_zero_drift_rejected() {
        let err = BeamConfig::new()
            .short_drift(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("drift"));
    }

    #[test]
    fn test_short_passphrase_rejected() {
        assert!(BeamConfig::new().passphrase_words(2).validate().is_err());
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(other.now_ms(), 2_000);
        other.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
