//! Time-windowed derivation of identities and rendezvous topics.
//!
//! Everything here is a pure function of the shared secret and a timestamp.
//! Both peers run the same derivation on their own clocks; the candidate
//! sets absorb up to one window of disagreement.
//!
//! Input encoding (version 1):
//!
//! ```text
//! version:u8 || window:u64 BE || (len:u32 BE || field)*
//! ```
use std::fmt;
use std::time::Duration;

use beam_transport::{Keypair, PublicKey};

use crate::config::{LONG_DRIFT, SHORT_DRIFT};
use crate::secret::SharedSecret;

/// Version byte prefixed to every derivation input.
pub const DERIVATION_VERSION: u8 = 1;

/// Key for the outer keyed hash that turns a window seed into a topic.
pub const DISCOVERY_TAG: &[u8] = b"beam/discovery/v1";

/// The two fixed roles of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Originates the secret, listens and announces.
    Responder,
    /// Supplies the secret, looks up and connects.
    Initiator,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Responder => "responder",
            Role::Initiator => "initiator",
        }
    }

    /// The role on the other end of the pipe.
    pub fn peer(&self) -> Role {
        match self {
            Role::Responder => Role::Initiator,
            Role::Initiator => Role::Responder,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A rendezvous identifier. Displayed as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic([u8; 32]);

impl Topic {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}...)", &hex::encode(self.0)[..12])
    }
}

/// Start of the window containing `now_ms`.
pub fn window(now_ms: u64, drift_ms: u64) -> u64 {
    now_ms - now_ms % drift_ms
}

/// Encode a window and a list of fields into the derivation input.
pub fn encode(window: u64, fields: &[&[u8]]) -> Vec<u8> {
    let len = 1 + 8 + fields.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(len);
    buf.push(DERIVATION_VERSION);
    buf.extend_from_slice(&window.to_be_bytes());
    for field in fields {
        buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
        buf.extend_from_slice(field);
    }
    buf
}

/// Acceptance predicate: is `remote` one of the candidate identities?
pub fn accepts(candidates: &[PublicKey], remote: &PublicKey) -> bool {
    candidates.iter().any(|c| c == remote)
}

/// Derives candidate keypairs and topics from a shared secret.
#[derive(Debug, Clone)]
pub struct KeyDerivation {
    secret: SharedSecret,
    short_drift_ms: u64,
    long_drift_ms: u64,
}

impl KeyDerivation {
    /// Derivation with the standard 2 / 30 minute windows.
    pub fn new(secret: SharedSecret) -> Self {
        Self::with_drift(secret, SHORT_DRIFT, LONG_DRIFT)
    }

    pub fn with_drift(secret: SharedSecret, short: Duration, long: Duration) -> Self {
        Self {
            secret,
            short_drift_ms: short.as_millis() as u64,
            long_drift_ms: long.as_millis() as u64,
        }
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    /// Candidate keypairs for `role` at `now_ms`, in ascending window order.
    ///
    /// Index 1 is the identity this process presents; indices 0 and 2 only
    /// widen what the peer will accept.
    pub fn auth_keys(&self, role: Role, now_ms: u64) -> [Keypair; 3] {
        let start = window(now_ms, self.short_drift_ms);
        [0u64, 1, 2].map(|i| {
            let w = start + i * self.short_drift_ms;
            let input = encode(w, &[role.label().as_bytes(), self.secret.as_bytes()]);
            Keypair::from_seed(*blake3::hash(&input).as_bytes())
        })
    }

    /// Public halves of [`auth_keys`](Self::auth_keys).
    pub fn auth_identities(&self, role: Role, now_ms: u64) -> [PublicKey; 3] {
        self.auth_keys(role, now_ms).map(|kp| kp.public())
    }

    /// The current and next discovery topic for a reference timestamp.
    pub fn discovery_ids(&self, reference_ms: u64) -> [Topic; 2] {
        let start = window(reference_ms, self.long_drift_ms);
        [0u64, 1].map(|i| {
            let w = start + i * self.long_drift_ms;
            let inner = blake3::hash(&encode(w, &[self.secret.as_bytes()]));
            Topic(*blake3::keyed_hash(inner.as_bytes(), DISCOVERY_TAG).as_bytes())
        })
    }
}
