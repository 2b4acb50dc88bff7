//! Beam transport layer.
//!
//! Authenticated, encrypted byte streams over TCP. Both ends are identified
//! by X25519 static keys; the initiator must know the responder's key in
//! advance, the responder screens initiators through a [`Firewall`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beam_transport::{Keypair, Listener, TransportConfig};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn example() -> Result<(), beam_transport::TransportError> {
//! let server = Keypair::generate();
//! let client = Keypair::generate();
//! let config = TransportConfig::new();
//!
//! let allowed = client.public();
//! let mut listener = Listener::bind(
//!     "127.0.0.1:0".parse().unwrap(),
//!     server.clone(),
//!     Arc::new(move |remote: &beam_transport::PublicKey| *remote == allowed),
//!     config.clone(),
//! )
//! .await?;
//!
//! let stream = beam_transport::connect(listener.local_addr(), &client, &server.public(), &config).await?;
//! let (_reader, mut writer) = stream.into_split();
//! writer.write_all(b"hello").await?;
//!
//! let accepted = listener.accept().await.expect("listener closed");
//! let (mut reader, _writer) = accepted.into_split();
//! let mut buf = [0u8; 5];
//! reader.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod error;
mod handshake;
mod listener;
mod stream;

pub use codec::{OpenCodec, SealCodec};
pub use config::TransportConfig;
pub use error::TransportError;
pub use listener::{Listener, ListenerIdentity};
pub use stream::{connect, probe, SecureReader, SecureStream, SecureWriter};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chacha20poly1305::aead::rand_core::OsRng;
use x25519_dalek::StaticSecret;

/// Acceptance predicate applied to the static key of every inbound peer.
///
/// Evaluated once per handshake, so it may consult the clock.
pub type Firewall = Arc<dyn Fn(&PublicKey) -> bool + Send + Sync>;

/// Beam network identity, an X25519 public key.
///
/// Displayed and parsed as a hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw 32-byte public key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "PublicKey({}...)", &hex[..12])
    }
}

impl FromStr for PublicKey {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| TransportError::InvalidPublicKey(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// An X25519 static keypair.
///
/// The secret half is zeroized on drop.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Deterministically derive a keypair from a 32-byte seed.
    ///
    /// The seed is clamped into an X25519 scalar, so any 32 bytes work.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(seed))
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            secret,
            public: PublicKey(public.to_bytes()),
        }
    }

    /// This keypair's public identity.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// X25519 Diffie-Hellman with a remote public key.
    pub(crate) fn diffie_hellman(&self, remote: &PublicKey) -> [u8; 32] {
        let remote = x25519_dalek::PublicKey::from(remote.0);
        self.secret.diffie_hellman(&remote).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Protocol magic sent at the start of every handshake message.
pub const BEAM_MAGIC: &[u8; 8] = b"beam/t/1";
